//! Best-effort structural metadata: only the header row of delimited text and only the
//! schema and row count of columnar files are ever read.

use std::{fs::File, path::Path};

use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::instrument;

use crate::storage::{StorageErrorKind, StorageResult};

use super::{FileFormat, FileMetadata};

#[instrument]
pub async fn sniff_metadata(path: &Path) -> StorageResult<FileMetadata> {
    match FileFormat::from_path(path) {
        Some(FileFormat::Csv) => sniff_csv(path).await,
        Some(FileFormat::Parquet) => sniff_parquet(path).await,
        _ => Err(StorageErrorKind::UnsupportedFormat(
            path.extension().map(|ext| ext.to_string_lossy().into_owned()).unwrap_or_default(),
        )
        .into()),
    }
}

async fn sniff_csv(path: &Path) -> StorageResult<FileMetadata> {
    let file = tokio::fs::File::open(path).await?;
    let mut header_line = String::new();
    BufReader::new(file).read_line(&mut header_line).await?;

    let mut reader =
        csv::ReaderBuilder::new().has_headers(false).from_reader(header_line.as_bytes());
    let headers = match reader.records().next() {
        Some(record) => record?.iter().map(str::to_string).collect(),
        None => Vec::new(),
    };
    Ok(FileMetadata { format: Some(FileFormat::Csv), headers, rows: None })
}

async fn sniff_parquet(path: &Path) -> StorageResult<FileMetadata> {
    let path = path.to_path_buf();
    // the parquet reader is synchronous, keep it off the runtime threads
    tokio::task::spawn_blocking(move || -> StorageResult<FileMetadata> {
        let builder = ParquetRecordBatchReaderBuilder::try_new(File::open(&path)?)?;
        let headers = builder.schema().fields().iter().map(|f| f.name().clone()).collect();
        let rows = builder.metadata().file_metadata().num_rows().max(0) as u64;
        Ok(FileMetadata { format: Some(FileFormat::Parquet), headers, rows: Some(rows) })
    })
    .await
    .map_err(|err| StorageErrorKind::Other(err.to_string()))?
}
