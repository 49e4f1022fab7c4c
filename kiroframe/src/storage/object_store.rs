use core::fmt;
use std::{path::Path, sync::Arc};

use ::object_store::{
    GetOptions, ObjectStore, aws::AmazonS3Builder, memory::InMemory, path::Path as ObjectPath,
};
use async_trait::async_trait;
use futures::TryStreamExt;
use tokio_util::io::StreamReader;
use tracing::instrument;

use crate::format::FileMetadata;

use super::{
    Destination, FileInfo, FileProvider, S3_SCHEME, StorageError, StorageErrorKind,
    StorageResult, normalize_etag, parse_bucket_key,
};

/// Objects behind any [`ObjectStore`] implementation, addressed as `{scheme}://bucket/key`.
///
/// When the store is bound to a bucket only that bucket is served and the key is used as the
/// object path. An unbound store (in memory, for instance) uses `bucket/key`.
pub struct ObjectStoreProvider {
    scheme: String,
    store: Arc<dyn ObjectStore>,
    bucket: Option<String>,
}

impl ObjectStoreProvider {
    pub fn new(
        scheme: impl Into<String>,
        store: Arc<dyn ObjectStore>,
        bucket: Option<String>,
    ) -> Self {
        Self { scheme: scheme.into(), store, bucket }
    }

    pub fn new_in_memory() -> Self {
        Self::new(S3_SCHEME, Arc::new(InMemory::new()), None)
    }

    pub fn new_s3_from_env(bucket_name: impl Into<String>) -> StorageResult<Self> {
        let bucket = bucket_name.into();
        let store = AmazonS3Builder::from_env()
            .with_bucket_name(bucket.clone())
            .build()
            .map_err(Box::new)?;
        Ok(Self::new(S3_SCHEME, Arc::new(store), Some(bucket)))
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// The object path `path` resolves to inside this store.
    pub fn object_path(&self, path: &str) -> StorageResult<ObjectPath> {
        let (bucket, key) = parse_bucket_key(&self.scheme, path)?;
        match &self.bucket {
            Some(bound) if bound != bucket => {
                Err(StorageErrorKind::BadLocation(path.to_string()).into())
            }
            Some(_) => Ok(ObjectPath::from(key)),
            None => Ok(ObjectPath::from(format!("{bucket}/{key}"))),
        }
    }

    fn map_error(path: &str, err: ::object_store::Error) -> StorageError {
        match err {
            ::object_store::Error::NotFound { .. } => {
                StorageErrorKind::NotFound(path.to_string()).into()
            }
            err => Box::new(err).into(),
        }
    }
}

impl fmt::Debug for ObjectStoreProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ObjectStoreProvider, scheme={}, bucket={:?}, store={}",
            self.scheme, self.bucket, self.store
        )
    }
}

impl fmt::Display for ObjectStoreProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectStoreProvider({}://, store={})", self.scheme, self.store)
    }
}

#[async_trait]
impl FileProvider for ObjectStoreProvider {
    fn scheme(&self) -> &str {
        &self.scheme
    }

    #[instrument(skip(self))]
    async fn get_file_info(&self, path: &str) -> StorageResult<FileInfo> {
        let location = self.object_path(path)?;
        let meta = self.store.head(&location).await.map_err(|e| Self::map_error(path, e))?;
        let etag = meta.e_tag.ok_or_else(|| {
            StorageErrorKind::Other(format!("object `{path}` has no ETag"))
        })?;
        Ok(FileInfo {
            digest: normalize_etag(&etag),
            size: meta.size,
            metadata: FileMetadata::empty(),
        })
    }

    #[instrument(skip(self))]
    async fn download(
        &self,
        path: &str,
        expected_digest: &str,
        destination_dir: &Path,
        file_name: &str,
    ) -> StorageResult<()> {
        let location = self.object_path(path)?;
        let meta = self.store.head(&location).await.map_err(|e| Self::map_error(path, e))?;
        let raw_etag = meta.e_tag.unwrap_or_default();
        let actual = normalize_etag(&raw_etag);
        if actual != normalize_etag(expected_digest) {
            return Err(StorageErrorKind::Integrity {
                path: path.to_string(),
                expected: expected_digest.to_string(),
                actual,
            }
            .into());
        }

        let options = GetOptions { if_match: Some(raw_etag), ..Default::default() };
        let object = match self.store.get_opts(&location, options).await {
            Ok(object) => object,
            Err(::object_store::Error::Precondition { .. }) => {
                return Err(StorageErrorKind::Integrity {
                    path: path.to_string(),
                    expected: expected_digest.to_string(),
                    actual: "<changed during transfer>".to_string(),
                }
                .into());
            }
            Err(err) => return Err(Self::map_error(path, err)),
        };

        let destination = Destination::prepare(destination_dir, file_name).await?;
        let mut reader = StreamReader::new(object.into_stream().map_err(std::io::Error::from));
        destination.write_from(path, &mut reader).await
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use ::object_store::PutPayload;
    use pretty_assertions::assert_eq;

    use super::*;

    async fn put(provider: &ObjectStoreProvider, path: &str, bytes: &'static [u8]) {
        let location = provider.object_path(path).unwrap();
        provider.store().put(&location, PutPayload::from_static(bytes)).await.unwrap();
    }

    #[kiroframe_macros::test]
    fn test_object_paths() {
        let unbound = ObjectStoreProvider::new_in_memory();
        assert_eq!(unbound.object_path("s3://b/k/x.csv").unwrap().as_ref(), "b/k/x.csv");

        let bound = ObjectStoreProvider::new(S3_SCHEME, Arc::new(InMemory::new()), Some("b".into()));
        assert_eq!(bound.object_path("s3://b/k/x.csv").unwrap().as_ref(), "k/x.csv");
        assert!(matches!(
            bound.object_path("s3://other/k/x.csv"),
            Err(StorageError { kind: StorageErrorKind::BadLocation(_), .. })
        ));
    }

    #[kiroframe_macros::tokio_test]
    async fn test_file_info_uses_etag() -> Result<(), Box<dyn std::error::Error>> {
        let provider = ObjectStoreProvider::new_in_memory();
        put(&provider, "s3://bucket/data/x.csv", b"a,b\n1,2\n").await;

        let info = provider.get_file_info("s3://bucket/data/x.csv").await?;
        assert_eq!(info.size, 8);
        assert!(!info.digest.is_empty());
        assert!(info.metadata.is_empty());

        // a rewrite gets a new tag
        put(&provider, "s3://bucket/data/x.csv", b"a,b\n1,2\n").await;
        let again = provider.get_file_info("s3://bucket/data/x.csv").await?;
        assert_ne!(info.digest, again.digest);
        Ok(())
    }

    #[kiroframe_macros::tokio_test]
    async fn test_missing_object() -> Result<(), Box<dyn std::error::Error>> {
        let provider = ObjectStoreProvider::new_in_memory();
        let res = provider.get_file_info("s3://bucket/nope").await;
        assert!(matches!(res, Err(StorageError { kind: StorageErrorKind::NotFound(_), .. })));

        let dir = tempfile::tempdir()?;
        let res = provider.download("s3://bucket/nope", "abc", dir.path(), "nope").await;
        assert!(matches!(res, Err(StorageError { kind: StorageErrorKind::NotFound(_), .. })));
        Ok(())
    }

    #[kiroframe_macros::tokio_test]
    async fn test_download() -> Result<(), Box<dyn std::error::Error>> {
        let provider = ObjectStoreProvider::new_in_memory();
        put(&provider, "s3://bucket/x.bin", b"object bytes").await;
        let info = provider.get_file_info("s3://bucket/x.bin").await?;

        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("out");
        // quoted tags compare equal to unquoted ones
        let quoted = format!("\"{}\"", info.digest);
        provider.download("s3://bucket/x.bin", &quoted, &destination, "x.bin").await?;
        assert_eq!(std::fs::read(destination.join("x.bin"))?, b"object bytes");
        Ok(())
    }

    #[kiroframe_macros::tokio_test]
    async fn test_changed_object_writes_nothing() -> Result<(), Box<dyn std::error::Error>> {
        let provider = ObjectStoreProvider::new_in_memory();
        put(&provider, "s3://bucket/key", b"new content").await;

        let dir = tempfile::tempdir()?;
        let destination = dir.path().join("out");
        let res = provider.download("s3://bucket/key", "old", &destination, "key").await;
        assert!(matches!(
            res,
            Err(StorageError { kind: StorageErrorKind::Integrity { expected, .. }, .. }) if expected == "old"
        ));
        assert!(!destination.exists());
        Ok(())
    }
}
