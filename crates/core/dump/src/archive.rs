//! Uploading written files to remote storage.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use common::store::ArchiveStore;
use object_store::{PutPayload, path::Path as ObjectPath};
use tracing::{debug, instrument};

/// Uploads written files to remote storage.
#[async_trait]
pub trait Archiver: Send + Sync + 'static {
    /// Uploads the file at `local_path` under `key` and returns the URI of the stored object.
    ///
    /// Uploading the same key again overwrites the object.
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String, ArchiveError>;
}

/// Archives files into an object store and removes the local copy once the upload succeeded.
#[derive(Debug, Clone)]
pub struct ObjectStoreArchiver {
    store: ArchiveStore,
}

impl ObjectStoreArchiver {
    pub fn new(store: ArchiveStore) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Archiver for ObjectStoreArchiver {
    #[instrument(skip(self), fields(store = %self.store.url()), err)]
    async fn upload(&self, local_path: &Path, key: &str) -> Result<String, ArchiveError> {
        let location = ObjectPath::parse(key)?;
        let contents = Bytes::from(fs_err::tokio::read(local_path).await?);
        let size = contents.len();

        self.store
            .object_store()
            .put(&location, PutPayload::from(contents))
            .await?;
        fs_err::tokio::remove_file(local_path).await?;

        let uri = self
            .store
            .url()
            .join(key)
            .map_or_else(|_| format!("{}{key}", self.store.url()), String::from);
        debug!(%uri, size, "uploaded file");
        Ok(uri)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ArchiveError {
    #[error("invalid object key")]
    InvalidKey(#[from] object_store::path::Error),

    #[error("failed to read or remove local file")]
    Io(#[from] std::io::Error),

    #[error("failed to upload to object store")]
    ObjectStore(#[from] object_store::Error),
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use object_store::{ObjectStore as _, memory::InMemory};
    use url::Url;

    use super::*;

    const KEY: &str = "logs/date=2024-01-01/block_range=000000001_000000500/logs.parquet";

    fn in_memory() -> (Arc<InMemory>, ObjectStoreArchiver) {
        let memory = Arc::new(InMemory::new());
        let store = ArchiveStore::from_store(
            Url::parse("memory:///archive/").unwrap(),
            memory.clone(),
        );
        (memory, ObjectStoreArchiver::new(store))
    }

    #[tokio::test]
    async fn upload_stores_object_and_removes_local_file() {
        //* Given
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let local = dir.path().join("logs.parquet");
        fs_err::write(&local, b"PAR1 data").unwrap();
        let (memory, archiver) = in_memory();

        //* When
        let uri = archiver.upload(&local, KEY).await.expect("upload should succeed");

        //* Then
        assert_eq!(uri, format!("memory:///archive/{KEY}"));
        assert!(!local.exists());
        let stored = memory.get(&ObjectPath::parse(KEY).unwrap()).await.unwrap();
        assert_eq!(stored.bytes().await.unwrap().as_ref(), b"PAR1 data");
    }

    #[tokio::test]
    async fn reupload_of_same_key_overwrites() {
        //* Given
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let local = dir.path().join("logs.parquet");
        let (memory, archiver) = in_memory();
        fs_err::write(&local, b"first").unwrap();
        archiver.upload(&local, KEY).await.unwrap();

        //* When
        fs_err::write(&local, b"second").unwrap();
        archiver.upload(&local, KEY).await.unwrap();

        //* Then
        let listed = memory.list_with_delimiter(None).await.unwrap();
        assert_eq!(listed.common_prefixes.len(), 1);
        let stored = memory.get(&ObjectPath::parse(KEY).unwrap()).await.unwrap();
        assert_eq!(stored.bytes().await.unwrap().as_ref(), b"second");
    }

    #[tokio::test]
    async fn missing_local_file_fails_without_upload() {
        let (memory, archiver) = in_memory();

        let result = archiver
            .upload(Path::new("/nonexistent/logs.parquet"), KEY)
            .await;

        assert!(matches!(result, Err(ArchiveError::Io(_))));
        assert!(memory.get(&ObjectPath::parse(KEY).unwrap()).await.is_err());
    }

    #[tokio::test]
    async fn uploads_into_local_directory() {
        //* Given
        let staging = tempfile::tempdir().expect("Failed to create temp dir");
        let archive_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let local = staging.path().join("blocks.parquet");
        fs_err::write(&local, b"blocks").unwrap();
        let store = ArchiveStore::new(archive_dir.path().to_str().unwrap(), None).unwrap();
        let archiver = ObjectStoreArchiver::new(store);

        //* When
        archiver
            .upload(&local, "blocks/date=2024-01-01/block_range=000000001_000000002/blocks.parquet")
            .await
            .expect("upload should succeed");

        //* Then
        let archived = archive_dir
            .path()
            .join("blocks/date=2024-01-01/block_range=000000001_000000002/blocks.parquet");
        assert_eq!(fs_err::read(archived).unwrap(), b"blocks");
    }
}
