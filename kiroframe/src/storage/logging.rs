use std::{
    fmt,
    path::Path,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;

use super::{FileInfo, FileProvider, StorageResult};

/// Records every call before forwarding it to `backend`.
#[derive(Debug)]
pub struct LoggingProvider {
    backend: Arc<dyn FileProvider>,
    call_log: Mutex<Vec<(String, String)>>,
}

impl LoggingProvider {
    pub fn new(backend: Arc<dyn FileProvider>) -> Self {
        Self { backend, call_log: Mutex::new(Vec::new()) }
    }

    #[allow(clippy::expect_used)] // this implementation is intended for tests only
    pub fn operations(&self) -> Vec<(String, String)> {
        self.call_log.lock().expect("poison lock").clone()
    }

    #[allow(clippy::expect_used)] // this implementation is intended for tests only
    pub fn clear(&self) {
        self.call_log.lock().expect("poison lock").clear();
    }

    #[allow(clippy::expect_used)] // this implementation is intended for tests only
    fn record(&self, operation: &str, path: &str) {
        self.call_log
            .lock()
            .expect("poison lock")
            .push((operation.to_string(), path.to_string()));
    }
}

impl fmt::Display for LoggingProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LoggingProvider(backend={})", self.backend)
    }
}

#[async_trait]
impl FileProvider for LoggingProvider {
    fn scheme(&self) -> &str {
        self.backend.scheme()
    }

    async fn get_file_info(&self, path: &str) -> StorageResult<FileInfo> {
        self.record("get_file_info", path);
        self.backend.get_file_info(path).await
    }

    async fn download(
        &self,
        path: &str,
        expected_digest: &str,
        destination_dir: &Path,
        file_name: &str,
    ) -> StorageResult<()> {
        self.record("download", path);
        self.backend.download(path, expected_digest, destination_dir, file_name).await
    }
}
