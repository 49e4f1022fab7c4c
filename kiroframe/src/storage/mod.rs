//! Storage providers: where dataset files live and how their content identity is read.
//!
//! A logical path such as `file:///data/x.csv` or `s3://bucket/key.parquet` is routed by
//! its scheme to a [`FileProvider`] registered in a [`ProviderRegistry`]. Providers know two
//! things: how to describe a file (digest, size, advisory metadata) and how to copy it to a
//! local directory after checking its digest has not changed.

use core::fmt;
use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, instrument, warn};

use crate::{config::DatasetConfig, format::FileMetadata};

pub mod errors;
pub mod local;
#[cfg(test)]
pub mod logging;
pub mod object_store;
pub mod s3;

pub use errors::{StorageError, StorageErrorKind, StorageResult};
pub use local::LocalFileProvider;
pub use object_store::ObjectStoreProvider;
pub use s3::S3Provider;

pub const LOCAL_SCHEME: &str = "file";
pub const S3_SCHEME: &str = "s3";
const SCHEME_SEPARATOR: &str = "://";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    pub digest: String,
    pub size: u64,
    pub metadata: FileMetadata,
}

/// Split `scheme://rest` into its two halves.
pub fn split_scheme(path: &str) -> Option<(&str, &str)> {
    let (scheme, rest) = path.split_once(SCHEME_SEPARATOR)?;
    if scheme.is_empty() { None } else { Some((scheme, rest)) }
}

/// The last `/` separated segment of a logical path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Parse `scheme://bucket/key` into bucket and key.
pub fn parse_bucket_key<'a>(scheme: &str, path: &'a str) -> StorageResult<(&'a str, &'a str)> {
    match split_scheme(path) {
        Some((s, rest)) if s == scheme => match rest.split_once('/') {
            Some((bucket, key)) if !bucket.is_empty() && !key.is_empty() => Ok((bucket, key)),
            _ => Err(StorageErrorKind::BadLocation(path.to_string()).into()),
        },
        _ => Err(StorageErrorKind::UnsupportedPath(path.to_string()).into()),
    }
}

/// Object storage tags are often quoted (`"abc"`); digests are compared without the quotes.
pub fn normalize_etag(etag: &str) -> String {
    etag.trim_matches('"').to_string()
}

#[async_trait]
pub trait FileProvider: fmt::Debug + fmt::Display + Send + Sync {
    /// The scheme this provider serves, without `://`
    fn scheme(&self) -> &str;

    /// Digest, size and best-effort metadata of the file at `path`.
    ///
    /// Metadata failures never fail this call; they produce [`FileMetadata::empty`].
    async fn get_file_info(&self, path: &str) -> StorageResult<FileInfo>;

    /// Copy the file at `path` into `destination_dir/file_name`.
    ///
    /// The current digest of the source is compared with `expected_digest` before any byte
    /// is written; a mismatch fails with [`StorageErrorKind::Integrity`] and leaves the
    /// destination untouched. `destination_dir` is created if needed.
    async fn download(
        &self,
        path: &str,
        expected_digest: &str,
        destination_dir: &Path,
        file_name: &str,
    ) -> StorageResult<()>;
}

/// Maps schemes to providers. New backends are added with [`ProviderRegistry::register`].
#[derive(Debug, Clone, Default)]
pub struct ProviderRegistry {
    providers: BTreeMap<String, Arc<dyn FileProvider>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Local files and native S3, configured from `config`.
    pub fn with_defaults(config: &DatasetConfig) -> Self {
        Self::new()
            .with_provider(Arc::new(LocalFileProvider::new(config.digest_chunk_size)))
            .with_provider(Arc::new(S3Provider::new(
                config.s3.clone(),
                config.s3_credentials.clone(),
            )))
    }

    /// Register `provider` for its scheme, returning the provider it replaced.
    pub fn register(
        &mut self,
        provider: Arc<dyn FileProvider>,
    ) -> Option<Arc<dyn FileProvider>> {
        let scheme = provider.scheme().to_string();
        let previous = self.providers.insert(scheme.clone(), provider);
        if previous.is_some() {
            warn!(scheme, "replacing registered storage provider");
        }
        previous
    }

    pub fn with_provider(mut self, provider: Arc<dyn FileProvider>) -> Self {
        self.register(provider);
        self
    }

    pub fn schemes(&self) -> impl Iterator<Item = &str> {
        self.providers.keys().map(String::as_str)
    }

    /// The provider serving `path`. A path without a file name (`file:///data/`) is rejected.
    pub fn provider_for(&self, path: &str) -> StorageResult<Arc<dyn FileProvider>> {
        let provider = split_scheme(path)
            .and_then(|(scheme, _)| self.providers.get(scheme))
            .cloned()
            .ok_or_else(|| StorageErrorKind::UnsupportedPath(path.to_string()))?;
        if file_name(path).is_empty() {
            return Err(StorageErrorKind::BadLocation(path.to_string()).into());
        }
        Ok(provider)
    }

    #[instrument(skip(self))]
    pub async fn get_file_info(&self, path: &str) -> StorageResult<FileInfo> {
        let provider = self.provider_for(path)?;
        debug!(%provider, "describing file");
        provider.get_file_info(path).await
    }

    #[instrument(skip(self))]
    pub async fn download(
        &self,
        path: &str,
        expected_digest: &str,
        destination_dir: &Path,
        file_name: &str,
    ) -> StorageResult<()> {
        let provider = self.provider_for(path)?;
        debug!(%provider, "downloading file");
        provider.download(path, expected_digest, destination_dir, file_name).await
    }
}

/// Where a download is staged and where it ends up.
#[derive(Debug)]
pub(crate) struct Destination {
    pub partial: PathBuf,
    pub target: PathBuf,
}

impl Destination {
    /// Create `destination_dir` if absent. Concurrent creation of the same directory is fine.
    ///
    /// Every call stages into its own file, so units writing the same target never share
    /// a partial file; the last one renamed into place wins.
    pub(crate) async fn prepare(
        destination_dir: &Path,
        file_name: &str,
    ) -> StorageResult<Destination> {
        tokio::fs::create_dir_all(destination_dir).await?;
        Ok(Destination {
            partial: destination_dir
                .join(format!(".{file_name}.{:016x}.part", rand::random::<u64>())),
            target: destination_dir.join(file_name),
        })
    }

    /// Stream `reader` into the staging file, then move it into place. On failure the
    /// staging file is removed and the target is left as it was.
    pub(crate) async fn write_from<R>(self, path: &str, reader: &mut R) -> StorageResult<()>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let written = async {
            let mut file = tokio::fs::File::create(&self.partial).await?;
            let bytes = tokio::io::copy(reader, &mut file).await?;
            file.flush().await?;
            Ok::<_, std::io::Error>(bytes)
        }
        .await;
        match written {
            Ok(bytes) => {
                debug!(bytes, target = %self.target.display(), "transfer complete");
                self.commit().await
            }
            Err(err) => {
                self.discard().await;
                Err(StorageError::from_io(path, err))
            }
        }
    }

    /// Move the fully written staging file into place.
    pub(crate) async fn commit(self) -> StorageResult<()> {
        tokio::fs::rename(&self.partial, &self.target).await?;
        Ok(())
    }

    /// Drop the staging file after a failed transfer.
    pub(crate) async fn discard(self) {
        if let Err(err) = tokio::fs::remove_file(&self.partial).await {
            debug!(path = %self.partial.display(), error = %err, "cannot remove partial download");
        }
    }
}
