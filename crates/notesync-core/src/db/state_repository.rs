//! Sync state repository implementation

use crate::error::Result;
use libsql::Connection;

/// Trait for persisted sync state key/value operations (async)
#[allow(async_fn_in_trait)]
pub trait StateRepository {
    /// Load a value by key
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Store a value, or remove the key when `value` is `None`
    async fn set(&self, key: &str, value: Option<&str>) -> Result<()>;
}

/// libSQL implementation of `StateRepository`
pub struct LibSqlStateRepository<'a> {
    conn: &'a Connection,
}

impl<'a> LibSqlStateRepository<'a> {
    /// Create a new repository with the given connection
    pub const fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl StateRepository for LibSqlStateRepository<'_> {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query("SELECT value FROM sync_state WHERE key = ?", [key])
            .await?;

        if let Some(row) = rows.next().await? {
            let value: String = row.get(0)?;
            Ok(Some(value))
        } else {
            Ok(None)
        }
    }

    async fn set(&self, key: &str, value: Option<&str>) -> Result<()> {
        match value {
            Some(value) => {
                self.conn
                    .execute(
                        "INSERT OR REPLACE INTO sync_state (key, value) VALUES (?, ?)",
                        [key, value],
                    )
                    .await?;
            }
            None => {
                self.conn
                    .execute("DELETE FROM sync_state WHERE key = ?", [key])
                    .await?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn setup() -> Database {
        Database::open_in_memory().await.unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_missing_key_is_none() {
        let db = setup().await;
        let repo = LibSqlStateRepository::new(db.connection());

        assert_eq!(repo.get("last_user_id").await.unwrap(), None);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_set_overwrite_and_clear() {
        let db = setup().await;
        let repo = LibSqlStateRepository::new(db.connection());

        repo.set("last_user_id", Some("alice")).await.unwrap();
        repo.set("last_user_id", Some("bob")).await.unwrap();
        assert_eq!(
            repo.get("last_user_id").await.unwrap().as_deref(),
            Some("bob")
        );

        repo.set("last_user_id", None).await.unwrap();
        assert_eq!(repo.get("last_user_id").await.unwrap(), None);
    }
}
