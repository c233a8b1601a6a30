//! Trigger fan-in: timers, UI and platform events feeding the coordinator.

use std::time::Duration;

use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::debug;

use super::coordinator::SyncCoordinator;

const TRIGGER_CAPACITY: usize = 8;

/// Reasons to run (or stop) sync.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SyncTrigger {
    /// Periodic poll
    Timer,
    /// Pull-to-refresh or an explicit sync command
    Manual,
    /// A note was edited; debounced
    LocalEdit,
    Login,
    Logout,
    EntitlementChanged,
    EncryptionReadyChanged,
    Shutdown,
}

/// Owns the periodic timer and a bounded trigger queue. Triggers that find
/// the queue full are dropped: a pass already queued covers them.
pub struct SyncScheduler {
    triggers: mpsc::Sender<SyncTrigger>,
    task: JoinHandle<()>,
}

impl SyncScheduler {
    pub fn spawn(coordinator: SyncCoordinator, poll_interval: Duration) -> Self {
        let (triggers, mut queue) = mpsc::channel(TRIGGER_CAPACITY);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // the first tick completes immediately
            ticker.tick().await;

            loop {
                let trigger = tokio::select! {
                    trigger = queue.recv() => trigger.unwrap_or(SyncTrigger::Shutdown),
                    _ = ticker.tick() => SyncTrigger::Timer,
                };
                if trigger == SyncTrigger::Shutdown {
                    coordinator.dispose();
                    break;
                }

                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.handle_trigger(trigger).await });
            }
            debug!("Sync scheduler stopped");
        });

        Self { triggers, task }
    }

    /// Queue a trigger. Returns `false` when it was coalesced or the
    /// scheduler already stopped.
    pub fn trigger(&self, trigger: SyncTrigger) -> bool {
        match self.triggers.try_send(trigger) {
            Ok(()) => true,
            Err(TrySendError::Full(trigger)) => {
                debug!("Sync trigger {trigger:?} coalesced");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Dispose the coordinator and wait for the scheduler loop to end.
    pub async fn shutdown(self) {
        if self.triggers.send(SyncTrigger::Shutdown).await.is_ok() {
            let _ = self.task.await;
        }
    }
}
