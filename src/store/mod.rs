//! Secure persistent store
//!
//! Keyed get/set/delete contract used for the static Noise keypair, the
//! durable nonce account address and rate-limit records. The file-backed
//! implementation encrypts every value at rest with AES-256-GCM.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

/// Store key for the persisted static Noise keypair
pub const KEY_NOISE_STATIC_KEYPAIR: &str = "noise_static_keypair";

/// Store key for the durable nonce account address
pub const KEY_DURABLE_NONCE_ACCOUNT: &str = "durable_nonce_account";

/// Store key for one identity's rate-limit record
pub fn rate_limit_key(identity: &str) -> String {
    format!("rate_limit_{identity}")
}

const MAGIC_HEADER: &[u8] = b"MNET";
const MAGIC_HEADER_SIZE: usize = 4;
const NONCE_SIZE: usize = 12; // AES-GCM nonce size

/// Store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("no value stored under key")]
    NotFound,

    #[error("stored value is corrupt: {0}")]
    Corrupt(String),

    #[error("store is locked")]
    Locked,

    #[error("IO error: {0}")]
    Io(String),
}

/// Keyed secure storage contract
pub trait SecureStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError>;
    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError>;
    fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// File-backed store, one encrypted file per key
pub struct FileSecureStore {
    storage_dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileSecureStore {
    pub fn new(storage_dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let storage_dir = storage_dir.as_ref().to_path_buf();

        if !storage_dir.exists() {
            fs::create_dir_all(&storage_dir)
                .map_err(|e| StoreError::Io(format!("failed to create storage directory: {e}")))?;
        }

        tracing::info!("initialized secure store at {}", storage_dir.display());

        Ok(Self {
            storage_dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Store rooted at `MURMURNET_STORAGE_DIR`, or `./murmurnet-data`
    pub fn from_env() -> Result<Self, StoreError> {
        let dir = env::var("MURMURNET_STORAGE_DIR").unwrap_or_else(|_| "murmurnet-data".to_string());
        Self::new(dir)
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.storage_dir.join(format!("{safe}.bin"))
    }

    /// Derive the AES key from the passphrase env var
    fn encryption_key() -> Key<Aes256Gcm> {
        let passphrase = env::var("MURMURNET_STORE_KEY")
            .unwrap_or_else(|_| "murmurnet-default-store-key".to_string());
        let digest = Sha256::digest(passphrase.as_bytes());
        *Key::<Aes256Gcm>::from_slice(&digest)
    }

    fn encrypt(plaintext: &[u8]) -> Result<Vec<u8>, StoreError> {
        let cipher = Aes256Gcm::new(&Self::encryption_key());
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| StoreError::Io(format!("encryption failed: {e}")))?;

        // [MAGIC][NONCE][CIPHERTEXT]
        let mut out = Vec::with_capacity(MAGIC_HEADER_SIZE + NONCE_SIZE + ciphertext.len());
        out.extend_from_slice(MAGIC_HEADER);
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn decrypt(data: &[u8]) -> Result<Vec<u8>, StoreError> {
        if data.len() < MAGIC_HEADER_SIZE + NONCE_SIZE {
            return Err(StoreError::Corrupt("entry too short".to_string()));
        }
        if &data[..MAGIC_HEADER_SIZE] != MAGIC_HEADER {
            return Err(StoreError::Corrupt("bad magic header".to_string()));
        }

        let cipher = Aes256Gcm::new(&Self::encryption_key());
        let nonce = Nonce::from_slice(&data[MAGIC_HEADER_SIZE..MAGIC_HEADER_SIZE + NONCE_SIZE]);
        cipher
            .decrypt(nonce, &data[MAGIC_HEADER_SIZE + NONCE_SIZE..])
            .map_err(|e| StoreError::Corrupt(format!("decryption failed: {e}")))
    }
}

impl SecureStore for FileSecureStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        let path = self.entry_path(key);
        if !path.exists() {
            return Err(StoreError::NotFound);
        }
        let data =
            fs::read(&path).map_err(|e| StoreError::Io(format!("failed to read entry: {e}")))?;
        Self::decrypt(&data)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Locked)?;
        let encrypted = Self::encrypt(value)?;
        fs::write(self.entry_path(key), encrypted)
            .map_err(|e| StoreError::Io(format!("failed to write entry: {e}")))?;
        tracing::debug!("stored {} bytes under '{}'", value.len(), key);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Locked)?;
        let path = self.entry_path(key);
        if path.exists() {
            fs::remove_file(&path)
                .map_err(|e| StoreError::Io(format!("failed to delete entry: {e}")))?;
            tracing::debug!("deleted store entry '{}'", key);
        }
        Ok(())
    }
}

/// In-memory store for tests and ephemeral nodes
#[derive(Default)]
pub struct MemorySecureStore {
    entries: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemorySecureStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SecureStore for MemorySecureStore {
    fn get(&self, key: &str) -> Result<Vec<u8>, StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Locked)?
            .get(key)
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    fn set(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Locked)?
            .insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.entries
            .lock()
            .map_err(|_| StoreError::Locked)?
            .remove(key);
        Ok(())
    }
}
