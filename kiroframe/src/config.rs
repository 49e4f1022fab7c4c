use std::{
    fmt,
    num::{NonZeroU16, NonZeroUsize},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::KFError;

pub const DEFAULT_DOWNLOAD_ROOT: &str = "kiroframe/datasets";
pub const DEFAULT_MAX_CONCURRENT_TASKS: u16 = 16;
pub const DEFAULT_DIGEST_CHUNK_SIZE: usize = 128 * 1024;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigErrorKind {
    #[error("cannot read configuration file `{path}`: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml_ng::Error),
}

pub type ConfigError = KFError<ConfigErrorKind>;

impl<E> From<E> for ConfigError
where
    E: Into<ConfigErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct S3Options {
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
    pub anonymous: bool,
    pub allow_http: bool,
    pub force_path_style: bool,
}

impl fmt::Display for S3Options {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "S3Options(region={}, endpoint_url={}, anonymous={}, allow_http={}, force_path_style={})",
            self.region.as_deref().unwrap_or("None"),
            self.endpoint_url.as_deref().unwrap_or("None"),
            self.anonymous,
            self.allow_http,
            self.force_path_style,
        )
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct S3StaticCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: Option<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize, Default, PartialEq, Eq)]
#[serde(tag = "type")]
pub enum S3Credentials {
    #[default]
    #[serde(rename = "from_env")]
    FromEnv,
    #[serde(rename = "none")]
    Anonymous,
    #[serde(rename = "static")]
    Static(S3StaticCredentials),
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatasetConfig {
    /// Downloaded files land in `{download_root}/{key}:V{version}/`
    pub download_root: PathBuf,
    /// Upper bound on digest and download units running at the same time
    pub max_concurrent_tasks: NonZeroU16,
    /// Read size used when a file cannot be memory mapped
    pub digest_chunk_size: NonZeroUsize,

    // If not set the AWS SDK default chain decides region and endpoint
    pub s3: Option<S3Options>,
    pub s3_credentials: S3Credentials,
}

impl Default for DatasetConfig {
    fn default() -> Self {
        Self {
            download_root: PathBuf::from(DEFAULT_DOWNLOAD_ROOT),
            max_concurrent_tasks: NonZeroU16::new(DEFAULT_MAX_CONCURRENT_TASKS)
                .unwrap_or(NonZeroU16::MIN),
            digest_chunk_size: NonZeroUsize::new(DEFAULT_DIGEST_CHUNK_SIZE)
                .unwrap_or(NonZeroUsize::MIN),
            s3: None,
            s3_credentials: S3Credentials::default(),
        }
    }
}

impl DatasetConfig {
    pub fn from_yaml_str(yaml: &str) -> ConfigResult<Self> {
        Ok(serde_yaml_ng::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path).map_err(|source| {
            ConfigError::new(ConfigErrorKind::Read { path: path.to_path_buf(), source })
        })?;
        Self::from_yaml_str(&yaml)
    }

    pub fn with_download_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.download_root = root.into();
        self
    }

    pub fn with_max_concurrent_tasks(mut self, max: NonZeroU16) -> Self {
        self.max_concurrent_tasks = max;
        self
    }
}
