//! Passphrase-derived payload encryption for the CLI.

use argon2::Argon2;
use async_trait::async_trait;
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use notesync_core::ports::EncryptionProvider;
use notesync_core::{Error, Result};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::CliError;

const MAGIC: &[u8] = b"NSE1";
const NONCE_SIZE: usize = 12;
const KEY_SIZE: usize = 32;
const SALT_DOMAIN: &[u8] = b"notesync-key-salt";

/// ChaCha20-Poly1305 keyed by Argon2 over the account passphrase.
///
/// Without a passphrase the provider stays not ready, so encrypted remote
/// documents are deferred instead of dropped.
pub struct PassphraseEncryption {
    cipher: Option<ChaCha20Poly1305>,
}

impl PassphraseEncryption {
    pub fn new(passphrase: Option<&str>, user_id: &str) -> std::result::Result<Self, CliError> {
        let Some(passphrase) = passphrase.filter(|value| !value.is_empty()) else {
            return Ok(Self { cipher: None });
        };

        let mut hasher = Sha256::new();
        hasher.update(SALT_DOMAIN);
        hasher.update(user_id.as_bytes());
        let salt = hasher.finalize();

        let mut key = [0u8; KEY_SIZE];
        Argon2::default()
            .hash_password_into(passphrase.as_bytes(), &salt, &mut key)
            .map_err(|error| CliError::KeyDerivation(error.to_string()))?;
        let cipher = ChaCha20Poly1305::new_from_slice(&key)
            .map_err(|error| CliError::KeyDerivation(error.to_string()))?;

        Ok(Self {
            cipher: Some(cipher),
        })
    }

    fn cipher(&self) -> Result<&ChaCha20Poly1305> {
        self.cipher.as_ref().ok_or(Error::EncryptionNotReady)
    }
}

#[async_trait]
impl EncryptionProvider for PassphraseEncryption {
    fn is_ready(&self) -> bool {
        self.cipher.is_some()
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        let mut nonce = [0u8; NONCE_SIZE];
        rand::thread_rng().fill_bytes(&mut nonce);

        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|error| Error::InvalidInput(format!("encryption failed: {error}")))?;

        let mut out = Vec::with_capacity(MAGIC.len() + NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let cipher = self.cipher()?;
        let body = ciphertext
            .strip_prefix(MAGIC)
            .ok_or_else(|| Error::Decryption("missing header".to_string()))?;
        if body.len() < NONCE_SIZE {
            return Err(Error::Decryption("truncated nonce".to_string()));
        }
        let (nonce, sealed) = body.split_at(NONCE_SIZE);

        cipher
            .decrypt(Nonce::from_slice(nonce), sealed)
            .map_err(|error| Error::Decryption(error.to_string()))
    }

    fn looks_encrypted(&self, data: &[u8]) -> bool {
        data.starts_with(MAGIC)
    }
}
