use std::{
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use hearth_common::{BlobStore, MemoryStore, StoreError};
use tracing::warn;

/// Blob store backed by one file per blob, laid out as
/// `<root>/<namespace>/<key>.bin`.
#[derive(Debug, Clone)]
pub struct FileBlobStore {
    root: PathBuf,
}

impl FileBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, namespace: &str, key: &str) -> PathBuf {
        self.root.join(namespace).join(format!("{key}.bin"))
    }
}

impl BlobStore for FileBlobStore {
    fn save_blob(&self, namespace: &str, key: &str, bytes: &[u8]) -> Result<(), StoreError> {
        let path = self.path(namespace, key);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Staged write; the rename replaces the blob in one step.
        let staging = path.with_extension("bin.tmp");
        fs::write(&staging, bytes)?;
        fs::rename(&staging, &path)?;
        Ok(())
    }

    fn load_blob(
        &self,
        namespace: &str,
        key: &str,
        expected_size: usize,
    ) -> Result<Vec<u8>, StoreError> {
        match fs::read(self.path(namespace, key)) {
            Ok(bytes) if bytes.len() == expected_size => Ok(bytes),
            Ok(_) => Err(StoreError::not_found(namespace, key)),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StoreError::not_found(namespace, key))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Opens the file store under `root`, or an in-memory store when the
/// directory cannot be created.
pub async fn open_store(root: &Path) -> Arc<dyn BlobStore> {
    let root = root.to_path_buf();
    let created = {
        let root = root.clone();
        tokio::task::spawn_blocking(move || fs::create_dir_all(root)).await
    };
    match created {
        Ok(Ok(())) => Arc::new(FileBlobStore::new(root)),
        Ok(Err(err)) => {
            warn!(
                "blob directory {} unusable ({err}), settings will not survive a restart",
                root.display()
            );
            Arc::new(MemoryStore::new())
        }
        Err(err) => {
            warn!("blob directory check failed ({err}), using in-memory store");
            Arc::new(MemoryStore::new())
        }
    }
}

/// Runs a store operation on the blocking pool.
pub async fn with_store<T, F>(store: &Arc<dyn BlobStore>, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&dyn BlobStore) -> T + Send + 'static,
{
    let store = store.clone();
    tokio::task::spawn_blocking(move || op(store.as_ref()))
        .await
        .map_err(|err| StoreError::Unavailable(format!("blob store task failed: {err}")))
}
