//! Resolution of archive locations into object stores.

use std::{path::PathBuf, sync::Arc};

use fs_err as fs;
use object_store::{
    ObjectStore, aws::AmazonS3Builder, gcp::GoogleCloudStorageBuilder, local::LocalFileSystem,
    prefix::PrefixStore,
};
use url::Url;

/// An object store rooted at an archive location, plus the URL it was created from.
///
/// When constructed with `s3://bucket/subdir/` the `subdir` prefix is preserved on every request,
/// so keys passed to the store are relative to the archive root.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    url: Url,
    store: Arc<dyn ObjectStore>,
}

impl ArchiveStore {
    /// Creates a store for an object store URL or filesystem directory. Examples of valid formats
    /// for `location`:
    /// - Filesystem path: `relative/path/to/archive/`
    /// - GCS: `gs://bucket-name/prefix/`
    /// - S3: `s3://bucket-name/prefix/`
    ///
    /// S3 credentials and custom endpoints (for S3-compatible services) are read from the `AWS_*`
    /// environment variables, GCS credentials from the `GOOGLE_*` ones.
    ///
    /// If `location` is a relative path, `base` is used as its parent directory. Filesystem
    /// directories are created if missing.
    pub fn new(location: &str, base: Option<&std::path::Path>) -> Result<Self, StoreError> {
        let mut location = location.to_string();
        // Make sure there is a trailing slash so it's recognized as a directory.
        if !location.ends_with('/') {
            location.push('/');
        }

        if let Some(rest) = location.strip_prefix("gs://") {
            let (bucket, prefix) = split_bucket(rest)?;
            let store = GoogleCloudStorageBuilder::from_env()
                .with_bucket_name(bucket)
                .build()?;
            Ok(Self::with_prefix(parse_url(&location)?, store, prefix))
        } else if let Some(rest) = location.strip_prefix("s3://") {
            let (bucket, prefix) = split_bucket(rest)?;
            let store = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .build()?;
            Ok(Self::with_prefix(parse_url(&location)?, store, prefix))
        } else {
            let mut path = PathBuf::from(&location);
            if !path.is_absolute()
                && let Some(base) = base
            {
                path = base.join(path);
            }
            fs::create_dir_all(&path)?;
            let path = fs::canonicalize(path)?;

            let store = LocalFileSystem::new_with_prefix(&path)?;
            let url = Url::from_directory_path(&path)
                .map_err(|()| StoreError::InvalidLocation(path.display().to_string()))?;
            Ok(Self {
                url,
                store: Arc::new(store),
            })
        }
    }

    /// Wraps an existing store, mostly useful for tests with an in-memory store.
    pub fn from_store(url: Url, store: Arc<dyn ObjectStore>) -> Self {
        Self { url, store }
    }

    fn with_prefix(url: Url, store: impl ObjectStore, prefix: &str) -> Self {
        let store: Arc<dyn ObjectStore> = if prefix.is_empty() {
            Arc::new(store)
        } else {
            Arc::new(PrefixStore::new(store, prefix))
        };
        Self { url, store }
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    pub fn object_store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }
}

impl std::fmt::Display for ArchiveStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "archive store at {}", self.url)
    }
}

/// Splits `bucket/some/prefix/` into `("bucket", "some/prefix")`.
fn split_bucket(rest: &str) -> Result<(&str, &str), StoreError> {
    let (bucket, prefix) = rest.split_once('/').unwrap_or((rest, ""));
    if bucket.is_empty() {
        return Err(StoreError::InvalidLocation(rest.to_string()));
    }
    Ok((bucket, prefix.trim_end_matches('/')))
}

fn parse_url(location: &str) -> Result<Url, StoreError> {
    Url::parse(location).map_err(|_| StoreError::InvalidLocation(location.to_string()))
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("filesystem error: {0}")]
    Io(#[from] std::io::Error),

    /// The location is neither a supported URL nor a usable directory.
    #[error("invalid archive location: {0}")]
    InvalidLocation(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_bucket_separates_prefix() {
        assert_eq!(
            split_bucket("bucket/a/b/").expect("valid"),
            ("bucket", "a/b")
        );
        assert_eq!(split_bucket("bucket/").expect("valid"), ("bucket", ""));
        assert!(split_bucket("/prefix/").is_err());
    }

    #[test]
    fn relative_directory_resolves_against_base() {
        //* Given
        let base = tempfile::tempdir().expect("Failed to create temp dir");

        //* When
        let store = ArchiveStore::new("archive", Some(base.path())).expect("Failed to create store");

        //* Then
        assert_eq!(store.url().scheme(), "file");
        assert!(base.path().join("archive").is_dir());
    }
}
