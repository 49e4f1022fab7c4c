//! The dataset aggregate: a keyed, versioned set of files plus descriptive metadata.
//!
//! A [`Dataset`] is either reconciled with the tracking backend (it has a version and every
//! file carries a backend id) or dirty. Adding or removing a file moves it to the dirty
//! state right away; digesting the added file happens in the background and is only
//! observed through [`Dataset::wait_ready`]. Logging is the only way back to the
//! reconciled state.

use std::{
    collections::{BTreeMap, BTreeSet},
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{Instrument, debug, info, instrument, warn};

use crate::{
    backend::{
        BackendError, BackendErrorKind, DatasetBackend, DatasetPayload, PayloadFile, RemoteFile,
        VersionResponse, VersionSelector,
    },
    config::DatasetConfig,
    error::KFError,
    format::FileMetadata,
    materialize::{
        ArrowMaterializer, MaterializeError, MaterializeErrorKind, Materializer, TableHandle,
    },
    storage::{self, FileInfo, ProviderRegistry, StorageError, StorageErrorKind},
    tasks::TaskRunner,
};

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DatasetErrorKind {
    #[error(transparent)]
    Storage(StorageErrorKind),
    #[error(transparent)]
    Backend(BackendErrorKind),
    #[error(transparent)]
    Materialize(MaterializeErrorKind),

    #[error("dataset `{0}` is not logged, log it before downloading")]
    DatasetNotLogged(String),
    #[error("file `{0}` is not part of the dataset")]
    NotAMember(String),
    #[error("file `{0}` is not logged")]
    FileNotLogged(String),
    #[error("file `{path}` is not downloaded to `{}`, download the dataset first", local_path.display())]
    FileNotDownloaded { path: String, local_path: PathBuf },
    #[error("file `{0}` is still being added, wait for the dataset to be ready")]
    FilePending(String),
    #[error("dataset `{0}` was modified while it was being logged")]
    ModifiedDuringLog(String),
    #[error("a concurrent task failed")]
    ConcurrencyError(#[from] JoinError),
}

pub type DatasetError = KFError<DatasetErrorKind>;

// it would be great to define this impl in error.rs, but it conflicts with the blanket
// `impl From<T> for T`
impl<E> From<E> for DatasetError
where
    E: Into<DatasetErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

impl From<StorageError> for DatasetError {
    fn from(value: StorageError) -> Self {
        value.map_kind(DatasetErrorKind::Storage)
    }
}

impl From<BackendError> for DatasetError {
    fn from(value: BackendError) -> Self {
        value.map_kind(DatasetErrorKind::Backend)
    }
}

impl From<MaterializeError> for DatasetError {
    fn from(value: MaterializeError) -> Self {
        value.map_kind(DatasetErrorKind::Materialize)
    }
}

impl DatasetError {
    /// The operation was called in the wrong lifecycle state of the dataset.
    pub fn is_state_error(&self) -> bool {
        matches!(
            self.kind,
            DatasetErrorKind::DatasetNotLogged(_)
                | DatasetErrorKind::FileNotLogged(_)
                | DatasetErrorKind::FileNotDownloaded { .. }
                | DatasetErrorKind::FilePending(_)
                | DatasetErrorKind::ModifiedDuringLog(_)
        )
    }
}

pub type DatasetResult<T> = Result<T, DatasetError>;

fn is_blank(value: &Option<String>) -> bool {
    value.as_deref().is_none_or(str::is_empty)
}

/// Descriptive fields of a dataset. Editing them never changes the file set.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatasetInfo {
    #[serde(default, skip_serializing_if = "is_blank")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "is_blank")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub labels: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timespan_from: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timespan_to: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    pub digest: String,
    /// Assigned by the backend when the dataset is logged.
    pub remote_id: Option<String>,
    pub metadata: FileMetadata,
}

impl FileRecord {
    fn described(path: String, info: FileInfo) -> Self {
        Self { path, size: info.size, digest: info.digest, remote_id: None, metadata: info.metadata }
    }

    fn to_payload(&self) -> PayloadFile {
        PayloadFile { path: self.path.clone(), size: self.size, digest: self.digest.clone() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileEntry {
    /// Added, digest not known yet. `ticket` identifies the unit that will fill it in.
    Pending { ticket: u64 },
    Ready(FileRecord),
}

impl FileEntry {
    pub fn record(&self) -> Option<&FileRecord> {
        match self {
            FileEntry::Pending { .. } => None,
            FileEntry::Ready(record) => Some(record),
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, FileEntry::Pending { .. })
    }
}

/// Where the dataset stands with respect to the backend.
///
/// Placeholders only exist in the dirty state, so a reconciled dataset is always complete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Revision {
    Dirty { files: BTreeMap<String, FileEntry> },
    Reconciled { version: u64, files: BTreeMap<String, FileRecord> },
}

impl Default for Revision {
    fn default() -> Self {
        Revision::Dirty { files: BTreeMap::new() }
    }
}

impl Revision {
    pub fn version(&self) -> Option<u64> {
        match self {
            Revision::Dirty { .. } => None,
            Revision::Reconciled { version, .. } => Some(*version),
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        match self {
            Revision::Dirty { files } => files.contains_key(path),
            Revision::Reconciled { files, .. } => files.contains_key(path),
        }
    }

    pub fn entry(&self, path: &str) -> Option<FileEntry> {
        match self {
            Revision::Dirty { files } => files.get(path).cloned(),
            Revision::Reconciled { files, .. } => files.get(path).cloned().map(FileEntry::Ready),
        }
    }

    pub fn entries(&self) -> BTreeMap<String, FileEntry> {
        match self {
            Revision::Dirty { files } => files.clone(),
            Revision::Reconciled { files, .. } => {
                files.iter().map(|(p, r)| (p.clone(), FileEntry::Ready(r.clone()))).collect()
            }
        }
    }

    /// Records whose digest is known, in path order.
    pub fn records(&self) -> Vec<&FileRecord> {
        match self {
            Revision::Dirty { files } => files.values().filter_map(FileEntry::record).collect(),
            Revision::Reconciled { files, .. } => files.values().collect(),
        }
    }

    fn pending_path(&self) -> Option<&str> {
        match self {
            Revision::Dirty { files } => {
                files.iter().find(|(_, e)| e.is_pending()).map(|(p, _)| p.as_str())
            }
            Revision::Reconciled { .. } => None,
        }
    }

    /// Apply a structural change; the result is always dirty.
    fn mutate<R>(&mut self, f: impl FnOnce(&mut BTreeMap<String, FileEntry>) -> R) -> R {
        let mut files = match std::mem::take(self) {
            Revision::Dirty { files } => files,
            Revision::Reconciled { files, .. } => {
                files.into_iter().map(|(p, r)| (p, FileEntry::Ready(r))).collect()
            }
        };
        let res = f(&mut files);
        *self = Revision::Dirty { files };
        res
    }
}

#[derive(Debug, Default)]
struct DatasetState {
    info: DatasetInfo,
    revision: Revision,
    next_ticket: u64,
    /// Bumped by every structural change, used to detect changes while logging.
    generation: u64,
}

fn lock_state(state: &Mutex<DatasetState>) -> MutexGuard<'_, DatasetState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// `{key}:V{version}`
pub fn dataset_name(key: &str, version: u64) -> String {
    format!("{key}:V{version}")
}

/// A shared handle to one dataset. Clones observe and modify the same state.
///
/// Operations that dispatch background work must be called inside a tokio runtime.
#[derive(Debug, Clone)]
pub struct Dataset {
    key: String,
    state: Arc<Mutex<DatasetState>>,
    providers: Arc<ProviderRegistry>,
    config: Arc<DatasetConfig>,
    /// Units describing added files; downloads run in their own batches under the same bound.
    tasks: Arc<TaskRunner<DatasetError>>,
    materializer: Arc<dyn Materializer>,
}

impl Dataset {
    /// An empty, dirty dataset using the default providers for `config`.
    pub fn new(key: impl Into<String>, config: DatasetConfig) -> Self {
        let providers = Arc::new(ProviderRegistry::with_defaults(&config));
        Self::with_registry(key, providers, Arc::new(config))
    }

    pub fn with_registry(
        key: impl Into<String>,
        providers: Arc<ProviderRegistry>,
        config: Arc<DatasetConfig>,
    ) -> Self {
        let tasks = Arc::new(TaskRunner::new(config.max_concurrent_tasks));
        Self {
            key: key.into(),
            state: Arc::new(Mutex::new(DatasetState::default())),
            providers,
            config,
            tasks,
            materializer: Arc::new(ArrowMaterializer::default()),
        }
    }

    /// Rebuild a reconciled dataset from what the backend returned.
    pub fn from_response(
        response: VersionResponse,
        providers: Arc<ProviderRegistry>,
        config: Arc<DatasetConfig>,
    ) -> Self {
        let VersionResponse { key, info, version } = response;
        let dataset = Self::with_registry(key, providers, config).with_info(info);
        dataset.replace_files(version.version, version.files);
        dataset
    }

    pub fn with_info(self, info: DatasetInfo) -> Self {
        self.lock().info = info;
        self
    }

    pub fn with_materializer(mut self, materializer: Arc<dyn Materializer>) -> Self {
        self.materializer = materializer;
        self
    }

    fn lock(&self) -> MutexGuard<'_, DatasetState> {
        lock_state(&self.state)
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &DatasetConfig {
        &self.config
    }

    pub fn info(&self) -> DatasetInfo {
        self.lock().info.clone()
    }

    /// Edit the descriptive fields. The version is kept.
    pub fn update_info<R>(&self, f: impl FnOnce(&mut DatasetInfo) -> R) -> R {
        f(&mut self.lock().info)
    }

    /// `None` while the dataset has changes the backend has not confirmed.
    pub fn version(&self) -> Option<u64> {
        self.lock().revision.version()
    }

    pub fn revision(&self) -> Revision {
        self.lock().revision.clone()
    }

    pub fn files(&self) -> BTreeMap<String, FileEntry> {
        self.lock().revision.entries()
    }

    pub fn file(&self, path: &str) -> Option<FileEntry> {
        self.lock().revision.entry(path)
    }

    /// Add the file at the logical `path` and start describing it in the background.
    ///
    /// Returns as soon as the placeholder is in place. Re-adding a file of a reconciled
    /// dataset does nothing; re-adding a file that is still pending fails with
    /// [`DatasetErrorKind::FilePending`]. Provider failures, including an unsupported
    /// scheme, are reported by the next [`Dataset::wait_ready`].
    #[instrument(skip(self), fields(key = %self.key))]
    pub fn add_file(&self, path: &str) -> DatasetResult<()> {
        let ticket = {
            let mut state = self.lock();
            match &state.revision {
                Revision::Reconciled { files, .. } if files.contains_key(path) => {
                    debug!("file already logged");
                    return Ok(());
                }
                Revision::Dirty { files } if files.get(path).is_some_and(FileEntry::is_pending) => {
                    return Err(DatasetErrorKind::FilePending(path.to_string()).into());
                }
                _ => {}
            }
            let ticket = state.next_ticket;
            state.next_ticket += 1;
            state.generation += 1;
            state.revision.mutate(|files| {
                files.insert(path.to_string(), FileEntry::Pending { ticket })
            });
            ticket
        };
        debug!(ticket, "file pending");

        let state = Arc::clone(&self.state);
        let providers = Arc::clone(&self.providers);
        let path = path.to_string();
        self.tasks.spawn(describe_file(state, providers, path, ticket).in_current_span());
        Ok(())
    }

    /// Drop `path` from the dataset. Does not cancel a unit still describing it.
    #[instrument(skip(self), fields(key = %self.key))]
    pub fn remove_file(&self, path: &str) {
        let mut state = self.lock();
        if !state.revision.contains(path) {
            return;
        }
        state.generation += 1;
        state.revision.mutate(|files| files.remove(path));
        debug!("file removed");
    }

    /// Wait for every file being added, then report the first failure.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn wait_ready(&self) -> DatasetResult<()> {
        self.tasks.join().await
    }

    pub fn dataset_name(&self) -> DatasetResult<String> {
        let version =
            self.version().ok_or_else(|| DatasetErrorKind::DatasetNotLogged(self.key.clone()))?;
        Ok(dataset_name(&self.key, version))
    }

    fn destination_dir(&self, version: u64) -> PathBuf {
        self.config.download_root.join(dataset_name(&self.key, version))
    }

    /// The local file `path` is downloaded to for the current version.
    pub fn download_path(&self, path: &str) -> DatasetResult<PathBuf> {
        let version =
            self.version().ok_or_else(|| DatasetErrorKind::DatasetNotLogged(self.key.clone()))?;
        Ok(self.destination_dir(version).join(storage::file_name(path)))
    }

    /// Copy every file of the logged version under the download root.
    ///
    /// Each source is checked against its recorded digest before any byte is written. With
    /// `overwrite` unset, files already at their destination are kept as they are.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn download(&self, overwrite: bool) -> DatasetResult<BTreeMap<String, PathBuf>> {
        let (version, records) = {
            let state = self.lock();
            match &state.revision {
                Revision::Reconciled { version, files } => {
                    (*version, files.values().cloned().collect::<Vec<_>>())
                }
                Revision::Dirty { .. } => {
                    return Err(DatasetErrorKind::DatasetNotLogged(self.key.clone()).into());
                }
            }
        };
        let name = dataset_name(&self.key, version);
        let destination = self.destination_dir(version);
        info!(dataset = %name, "downloading");

        let batch = self.tasks.batch();
        let mut download_map = BTreeMap::new();
        let mut dispatched = 0usize;
        for record in records {
            let file_name = storage::file_name(&record.path).to_string();
            let target = destination.join(&file_name);
            download_map.insert(record.path.clone(), target.clone());
            if !overwrite && tokio::fs::metadata(&target).await.is_ok_and(|m| m.is_file()) {
                debug!(path = record.path, "already downloaded");
                continue;
            }

            let providers = Arc::clone(&self.providers);
            let destination = destination.clone();
            batch.spawn(async move {
                providers
                    .download(&record.path, &record.digest, &destination, &file_name)
                    .await
                    .map_err(DatasetError::from)
            }
            .in_current_span());
            dispatched += 1;
        }

        batch.join().await?;
        info!(dataset = %name, dispatched, "download completed");
        Ok(download_map)
    }

    /// A table built from the downloaded copy of `path`.
    #[instrument(skip(self), fields(key = %self.key))]
    pub async fn dataframe(&self, path: &str) -> DatasetResult<TableHandle> {
        let remote_id = {
            let state = self.lock();
            let entry = state
                .revision
                .entry(path)
                .ok_or_else(|| DatasetErrorKind::NotAMember(path.to_string()))?;
            entry
                .record()
                .and_then(|record| record.remote_id.clone())
                .ok_or_else(|| DatasetErrorKind::FileNotLogged(path.to_string()))?
        };
        let local_path = self.download_path(path)?;
        if !tokio::fs::metadata(&local_path).await.is_ok_and(|m| m.is_file()) {
            return Err(
                DatasetErrorKind::FileNotDownloaded { path: path.to_string(), local_path }.into()
            );
        }
        Ok(self.materializer.materialize(&remote_id, &local_path).await?)
    }

    /// The request body used to log this dataset. Pending files are left out.
    pub fn to_payload(&self) -> DatasetPayload {
        self.to_payload_locked(&self.lock())
    }

    fn to_payload_locked(&self, state: &DatasetState) -> DatasetPayload {
        DatasetPayload {
            key: self.key.clone(),
            info: state.info.clone(),
            files: state.revision.records().into_iter().map(FileRecord::to_payload).collect(),
        }
    }

    /// Replace the whole file set with the backend's view of `version`.
    ///
    /// Metadata sniffed locally is kept for files whose digest did not change.
    pub fn replace_files(&self, version: u64, files: Vec<RemoteFile>) {
        replace_files_locked(&mut self.lock(), version, files);
    }

    /// Record the dataset as a new backend version and reconcile with the answer.
    #[instrument(skip(self, backend), fields(key = %self.key))]
    pub async fn log(&self, backend: &dyn DatasetBackend) -> DatasetResult<u64> {
        self.wait_ready().await?;
        let (payload, generation) = {
            let state = self.lock();
            if let Some(path) = state.revision.pending_path() {
                return Err(DatasetErrorKind::FilePending(path.to_string()).into());
            }
            (self.to_payload_locked(&state), state.generation)
        };

        let response = backend.log_dataset(&payload).await?;
        let version = response.version.version;
        {
            let mut state = self.lock();
            if state.generation != generation {
                warn!(version, "dataset changed while logging, keeping local changes");
                return Err(DatasetErrorKind::ModifiedDuringLog(self.key.clone()).into());
            }
            replace_files_locked(&mut state, version, response.version.files);
        }
        info!(version, "dataset logged");
        Ok(version)
    }

    /// Load an existing version from the backend.
    #[instrument(skip(backend, providers, config))]
    pub async fn fetch(
        backend: &dyn DatasetBackend,
        key: &str,
        selector: &VersionSelector,
        providers: Arc<ProviderRegistry>,
        config: Arc<DatasetConfig>,
    ) -> DatasetResult<Self> {
        let response = backend.fetch_version(key, selector).await?;
        debug!(version = response.version.version, "fetched dataset version");
        Ok(Self::from_response(response, providers, config))
    }
}

fn replace_files_locked(state: &mut DatasetState, version: u64, files: Vec<RemoteFile>) {
    let previous = state.revision.entries();
    let files = files
        .into_iter()
        .map(|file| {
            let metadata = previous
                .get(&file.path)
                .and_then(FileEntry::record)
                .filter(|record| record.digest == file.digest)
                .map(|record| record.metadata.clone())
                .unwrap_or_default();
            let record = FileRecord {
                path: file.path.clone(),
                size: file.size,
                digest: file.digest,
                remote_id: Some(file.id),
                metadata,
            };
            (file.path, record)
        })
        .collect();
    state.generation += 1;
    state.revision = Revision::Reconciled { version, files };
}

/// Background unit for one added file. Fills or drops the placeholder holding `ticket`.
async fn describe_file(
    state: Arc<Mutex<DatasetState>>,
    providers: Arc<ProviderRegistry>,
    path: String,
    ticket: u64,
) -> DatasetResult<()> {
    let outcome = providers.get_file_info(&path).await;

    let mut state = lock_state(&state);
    let Revision::Dirty { files } = &mut state.revision else {
        debug!(path, ticket, "dataset replaced since dispatch, dropping result");
        return Ok(());
    };
    if !files.get(&path).is_some_and(|entry| *entry == FileEntry::Pending { ticket }) {
        debug!(path, ticket, "placeholder gone since dispatch, dropping result");
        return Ok(());
    }
    match outcome {
        Ok(info) => {
            debug!(path, digest = info.digest, size = info.size, "file ready");
            files.insert(path.clone(), FileEntry::Ready(FileRecord::described(path, info)));
            Ok(())
        }
        Err(err) => {
            files.remove(&path);
            Err(err.into())
        }
    }
}
