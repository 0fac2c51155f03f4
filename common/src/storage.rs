//! Key-value blob persistence seam.
//!
//! Blobs are addressed by `(namespace, key)`. A stored blob whose size does
//! not match what the caller expects is reported as [`StoreError::NotFound`]
//! so that callers fall back to their defaults.

use std::{collections::HashMap, sync::Mutex};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("blob {namespace}/{key} not found")]
    NotFound { namespace: String, key: String },
    #[error("blob storage i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("blob storage unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn not_found(namespace: &str, key: &str) -> Self {
        Self::NotFound {
            namespace: namespace.to_string(),
            key: key.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

pub trait BlobStore: Send + Sync {
    fn save_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError>;

    fn load_blob(
        &self,
        namespace: &str,
        key: &str,
        expected_size: usize,
    ) -> Result<Vec<u8>, StoreError>;
}

/// In-process store. The controller falls back to it when its data
/// directory cannot be created; nothing survives a restart then.
#[derive(Debug, Default)]
pub struct MemoryStore {
    blobs: Mutex<HashMap<(String, String), Vec<u8>>>,
    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `save_blob` fail until switched back.
    #[cfg(test)]
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::Relaxed);
    }
}

impl BlobStore for MemoryStore {
    fn save_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        #[cfg(test)]
        if self.fail_writes.load(std::sync::atomic::Ordering::Relaxed) {
            return Err(StoreError::Unavailable("writes disabled".to_string()));
        }
        let mut blobs = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))?;
        blobs.insert((namespace.to_string(), key.to_string()), bytes.to_vec());
        Ok(())
    }

    fn load_blob(
        &self,
        namespace: &str,
        key: &str,
        expected_size: usize,
    ) -> Result<Vec<u8>, StoreError> {
        let blobs = self
            .blobs
            .lock()
            .map_err(|_| StoreError::Unavailable("memory store poisoned".to_string()))?;
        match blobs.get(&(namespace.to_string(), key.to_string())) {
            Some(bytes) if bytes.len() == expected_size => Ok(bytes.clone()),
            _ => Err(StoreError::not_found(namespace, key)),
        }
    }
}

pub fn encode_f32s(values: impl IntoIterator<Item = f32>) -> Vec<u8> {
    values.into_iter().flat_map(f32::to_le_bytes).collect()
}

pub fn decode_f32s(bytes: &[u8]) -> impl Iterator<Item = f32> + '_ {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
}

pub fn load_f32(store: &dyn BlobStore, namespace: &str, key: &str) -> Result<f32, StoreError> {
    let bytes = store.load_blob(namespace, key, 4)?;
    let value = decode_f32s(&bytes)
        .next()
        .ok_or_else(|| StoreError::not_found(namespace, key));
    value
}

pub fn save_f32(
    store: &dyn BlobStore,
    namespace: &str,
    key: &str,
    value: f32,
) -> Result<(), StoreError> {
    store.save_blob(namespace, key, &value.to_le_bytes())
}
