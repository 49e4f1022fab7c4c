use std::{
    fmt,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::{
    config::DEFAULT_DIGEST_CHUNK_SIZE,
    format::{FileMetadata, digest_file, sniff_metadata},
};

use super::{
    Destination, FileInfo, FileProvider, LOCAL_SCHEME, StorageError, StorageErrorKind,
    StorageResult, split_scheme,
};

/// Files on the local filesystem, addressed as `file://<path>`.
#[derive(Debug, Clone)]
pub struct LocalFileProvider {
    chunk_size: NonZeroUsize,
}

impl Default for LocalFileProvider {
    fn default() -> Self {
        Self::new(NonZeroUsize::new(DEFAULT_DIGEST_CHUNK_SIZE).unwrap_or(NonZeroUsize::MIN))
    }
}

impl LocalFileProvider {
    pub fn new(chunk_size: NonZeroUsize) -> Self {
        Self { chunk_size }
    }

    fn local_path(path: &str) -> StorageResult<PathBuf> {
        match split_scheme(path) {
            Some((LOCAL_SCHEME, local)) if !local.is_empty() => Ok(PathBuf::from(local)),
            _ => Err(StorageErrorKind::UnsupportedPath(path.to_string()).into()),
        }
    }

    async fn digest(&self, path: &str, local: &Path) -> StorageResult<String> {
        digest_file(local, self.chunk_size.get())
            .await
            .map_err(|err| StorageError::from_io(path, err))
    }
}

impl fmt::Display for LocalFileProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LocalFileProvider(chunk_size={})", self.chunk_size)
    }
}

#[async_trait]
impl FileProvider for LocalFileProvider {
    fn scheme(&self) -> &str {
        LOCAL_SCHEME
    }

    #[instrument(skip(self))]
    async fn get_file_info(&self, path: &str) -> StorageResult<FileInfo> {
        let local = Self::local_path(path)?;
        let stat =
            tokio::fs::metadata(&local).await.map_err(|err| StorageError::from_io(path, err))?;
        if !stat.is_file() {
            return Err(StorageErrorKind::NotFound(path.to_string()).into());
        }

        let digest = self.digest(path, &local).await?;
        let metadata = match sniff_metadata(&local).await {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(error = %err.kind, "no metadata for file");
                FileMetadata::empty()
            }
        };
        Ok(FileInfo { digest, size: stat.len(), metadata })
    }

    #[instrument(skip(self))]
    async fn download(
        &self,
        path: &str,
        expected_digest: &str,
        destination_dir: &Path,
        file_name: &str,
    ) -> StorageResult<()> {
        let local = Self::local_path(path)?;
        let actual = self.digest(path, &local).await?;
        if actual != expected_digest {
            return Err(StorageErrorKind::Integrity {
                path: path.to_string(),
                expected: expected_digest.to_string(),
                actual,
            }
            .into());
        }

        let destination = Destination::prepare(destination_dir, file_name).await?;
        match tokio::fs::copy(&local, &destination.partial).await {
            Ok(bytes) => {
                debug!(bytes, target = %destination.target.display(), "copied file");
                destination.commit().await
            }
            Err(err) => {
                destination.discard().await;
                Err(StorageError::from_io(path, err))
            }
        }
    }
}
