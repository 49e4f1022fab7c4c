//! Versioned datasets of files spread over several storage backends.
//!
//! - A [`Dataset`] owns a set of logical paths (`file://…`, `s3://…`) with their content
//!   digests and sizes. Adding a file only records a placeholder; the digest is computed by
//!   a background unit and observed through [`Dataset::wait_ready`].
//! - Paths are routed by scheme to a [`storage::FileProvider`] registered in a
//!   [`ProviderRegistry`]. Providers describe files and copy them locally after checking
//!   the digest has not changed since it was recorded.
//! - Background units run on a bounded [`tasks::TaskRunner`]; a batch fails with its first
//!   error, but only after every unit finished.
//! - A [`backend::DatasetBackend`] assigns versions. Logging is the only way a dataset gets
//!   a version, and any later change to its file set drops it again.
//! - Downloaded files can be read as tables through a [`materialize::Materializer`].
pub mod backend;
pub mod config;
pub mod dataset;
pub mod error;
pub mod format;
pub mod materialize;
pub mod storage;
pub mod tasks;

pub use backend::{DatasetBackend, InMemoryBackend, VersionSelector};
pub use config::DatasetConfig;
pub use dataset::{Dataset, DatasetError, DatasetErrorKind, DatasetInfo, FileEntry, FileRecord};
pub use materialize::{ArrowMaterializer, Materializer, TableHandle};
pub use storage::{FileProvider, ProviderRegistry, StorageError, StorageErrorKind};

/// Install a global subscriber: filter from `KIROFRAME_LOG` (default `warn`), formatted
/// output, and the layer that fills the span traces attached to errors.
#[cfg(feature = "logs")]
pub fn initialize_tracing() -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_error::ErrorLayer;
    use tracing_subscriber::{
        EnvFilter, Layer, Registry, layer::SubscriberExt, util::SubscriberInitExt,
    };

    let filter =
        EnvFilter::try_from_env("KIROFRAME_LOG").unwrap_or_else(|_| EnvFilter::new("warn"));
    let stdout_layer = tracing_subscriber::fmt::layer().pretty().with_filter(filter);
    Registry::default().with(stdout_layer).with(ErrorLayer::default()).try_init()
}
