//! The tracking service a dataset is logged to, and the shapes exchanged with it.
//!
//! Only two calls are needed by the engine: logging a dataset (the service assigns the next
//! version and an id per file) and fetching the metadata of an existing version. The
//! transport behind [`DatasetBackend`] is not part of this crate; [`InMemoryBackend`]
//! provides the same contract without a service.

use std::{
    collections::BTreeMap,
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, instrument};

use crate::{dataset::DatasetInfo, error::KFError};

/// A file as sent when logging: no backend id yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFile {
    pub path: String,
    pub size: u64,
    pub digest: String,
}

/// Request body of "log dataset version".
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetPayload {
    pub key: String,
    #[serde(flatten)]
    pub info: DatasetInfo,
    pub files: Vec<PayloadFile>,
}

/// A file as confirmed by the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteFile {
    #[serde(rename = "_id")]
    pub id: String,
    pub path: String,
    pub size: u64,
    pub digest: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionBlock {
    pub version: u64,
    #[serde(default)]
    pub files: Vec<RemoteFile>,
}

/// Response of both backend calls: dataset fields plus the nested version block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionResponse {
    pub key: String,
    #[serde(flatten)]
    pub info: DatasetInfo,
    pub version: VersionBlock,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelector {
    Latest,
    Version(u64),
    Alias(String),
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VersionSelector::Latest => f.write_str("latest"),
            VersionSelector::Version(v) => write!(f, "V{v}"),
            VersionSelector::Alias(alias) => write!(f, "alias `{alias}`"),
        }
    }
}

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendErrorKind {
    #[error("dataset `{0}` not found")]
    DatasetNotFound(String),
    #[error("version {selector} of dataset `{key}` not found")]
    VersionNotFound { key: String, selector: VersionSelector },
    #[error("backend error: {0}")]
    Other(String),
}

pub type BackendError = KFError<BackendErrorKind>;

impl<E> From<E> for BackendError
where
    E: Into<BackendErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

pub type BackendResult<T> = Result<T, BackendError>;

#[async_trait]
pub trait DatasetBackend: fmt::Debug + Send + Sync {
    /// Record `dataset` as a new version and return what the backend stored.
    async fn log_dataset(&self, dataset: &DatasetPayload) -> BackendResult<VersionResponse>;

    async fn fetch_version(
        &self,
        key: &str,
        selector: &VersionSelector,
    ) -> BackendResult<VersionResponse>;
}

/// Keeps every logged version in memory.
///
/// Versions start at 1 for each key. A file keeps its id while its path and digest are
/// unchanged, and an alias always points at the newest version that declared it.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    datasets: Mutex<BTreeMap<String, Vec<VersionResponse>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Vec<VersionResponse>>> {
        self.datasets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn versions(&self, key: &str) -> Vec<u64> {
        self.lock()
            .get(key)
            .map(|versions| versions.iter().map(|v| v.version.version).collect())
            .unwrap_or_default()
    }
}

fn new_file_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

#[async_trait]
impl DatasetBackend for InMemoryBackend {
    #[instrument(skip(self, dataset), fields(key = %dataset.key))]
    async fn log_dataset(&self, dataset: &DatasetPayload) -> BackendResult<VersionResponse> {
        let mut datasets = self.lock();
        let versions = datasets.entry(dataset.key.clone()).or_default();

        let previous_files = versions.last().map(|v| v.version.files.as_slice()).unwrap_or(&[]);
        let files = dataset
            .files
            .iter()
            .map(|file| RemoteFile {
                id: previous_files
                    .iter()
                    .find(|prev| prev.path == file.path && prev.digest == file.digest)
                    .map(|prev| prev.id.clone())
                    .unwrap_or_else(new_file_id),
                path: file.path.clone(),
                size: file.size,
                digest: file.digest.clone(),
            })
            .collect();

        for older in versions.iter_mut() {
            older.info.aliases.retain(|alias| !dataset.info.aliases.contains(alias));
        }

        let response = VersionResponse {
            key: dataset.key.clone(),
            info: dataset.info.clone(),
            version: VersionBlock { version: versions.len() as u64 + 1, files },
        };
        versions.push(response.clone());
        debug!(version = response.version.version, "logged dataset version");
        Ok(response)
    }

    #[instrument(skip(self))]
    async fn fetch_version(
        &self,
        key: &str,
        selector: &VersionSelector,
    ) -> BackendResult<VersionResponse> {
        let datasets = self.lock();
        let versions = datasets
            .get(key)
            .ok_or_else(|| BackendErrorKind::DatasetNotFound(key.to_string()))?;
        let found = match selector {
            VersionSelector::Latest => versions.last(),
            VersionSelector::Version(n) => versions.iter().find(|v| v.version.version == *n),
            VersionSelector::Alias(alias) => {
                versions.iter().rev().find(|v| v.info.aliases.contains(alias))
            }
        };
        found.cloned().ok_or_else(|| {
            BackendErrorKind::VersionNotFound { key: key.to_string(), selector: selector.clone() }
                .into()
        })
    }
}
