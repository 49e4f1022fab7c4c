use thiserror::Error;

use crate::error::KFError;

use aws_sdk_s3::{
    config::http::HttpResponse,
    error::SdkError,
    operation::{get_object::GetObjectError, head_object::HeadObjectError},
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StorageErrorKind {
    #[error("unsupported path `{0}`, expected one of the registered schemes")]
    UnsupportedPath(String),
    #[error("file not found `{0}`")]
    NotFound(String),
    #[error(
        "cannot download dataset file `{path}`, source has changed: expected digest `{expected}`, found `{actual}`"
    )]
    Integrity { path: String, expected: String, actual: String },
    #[error("unsupported file format: `{0}`")]
    UnsupportedFormat(String),
    #[error("invalid object storage location `{0}`")]
    BadLocation(String),
    #[error("object store error {0}")]
    ObjectStore(#[from] Box<::object_store::Error>),
    #[error("error getting object metadata from object store {0}")]
    S3HeadObjectError(#[from] Box<SdkError<HeadObjectError, HttpResponse>>),
    #[error("error getting object from object store {0}")]
    S3GetObjectError(#[from] Box<SdkError<GetObjectError, HttpResponse>>),
    #[error("error reading csv header {0}")]
    Csv(#[from] csv::Error),
    #[error("error reading parquet schema {0}")]
    Parquet(#[from] parquet::errors::ParquetError),
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("storage error: {0}")]
    Other(String),
}

pub type StorageError = KFError<StorageErrorKind>;

// it would be great to define this impl in error.rs, but it conflicts with the blanket
// `impl From<T> for T`
impl<E> From<E> for StorageError
where
    E: Into<StorageErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

pub type StorageResult<A> = Result<A, StorageError>;

impl StorageError {
    /// Wrap an I/O error for `path`, turning a missing file into [`StorageErrorKind::NotFound`].
    pub fn from_io(path: &str, err: std::io::Error) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::new(StorageErrorKind::NotFound(path.to_string()))
        } else {
            Self::new(StorageErrorKind::IOError(err))
        }
    }
}
