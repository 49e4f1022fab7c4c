//! Turning a downloaded dataset file into an in-memory table.
//!
//! The engine only needs the [`Materializer`] contract; [`ArrowMaterializer`] is the default
//! and reads the whole file into Arrow record batches.

use std::{
    fmt,
    fs::File,
    io::{Seek, SeekFrom},
    path::{Path, PathBuf},
    sync::Arc,
};

use arrow::{
    array::{ArrayRef, StringArray},
    csv::{ReaderBuilder, reader::Format},
    datatypes::{DataType, Field, Schema, SchemaRef},
    error::ArrowError,
    record_batch::RecordBatch,
};
use async_trait::async_trait;
use calamine::{Data, Reader, open_workbook_auto};
use parquet::{arrow::arrow_reader::ParquetRecordBatchReaderBuilder, errors::ParquetError};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, instrument};

use crate::{error::KFError, format::FileFormat};

const DEFAULT_BATCH_SIZE: usize = 8192;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum MaterializeErrorKind {
    #[error("cannot build a table from `{0}`, unsupported file format")]
    UnsupportedFormat(String),
    #[error("workbook `{0}` has no worksheets")]
    EmptyWorkbook(String),
    #[error("arrow error {0}")]
    Arrow(#[from] ArrowError),
    #[error("parquet error {0}")]
    Parquet(#[from] ParquetError),
    #[error("spreadsheet error {0}")]
    Spreadsheet(#[from] calamine::Error),
    #[error("I/O error: {0}")]
    IOError(#[from] std::io::Error),
    #[error("a concurrent task failed")]
    ConcurrencyError(#[from] JoinError),
}

pub type MaterializeError = KFError<MaterializeErrorKind>;

impl<E> From<E> for MaterializeError
where
    E: Into<MaterializeErrorKind>,
{
    fn from(value: E) -> Self {
        Self::new(value.into())
    }
}

pub type MaterializeResult<T> = Result<T, MaterializeError>;

/// A table read from one dataset file, tagged with the backend id of that file.
#[derive(Debug, Clone)]
pub struct TableHandle {
    file_id: String,
    schema: SchemaRef,
    batches: Vec<RecordBatch>,
}

impl TableHandle {
    pub fn new(file_id: impl Into<String>, schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        Self { file_id: file_id.into(), schema, batches }
    }

    pub fn file_id(&self) -> &str {
        &self.file_id
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    /// `(rows, columns)`
    pub fn shape(&self) -> (usize, usize) {
        let rows = self.batches.iter().map(RecordBatch::num_rows).sum();
        (rows, self.schema.fields().len())
    }

    /// Column names with their Arrow type names, in schema order.
    pub fn dtypes(&self) -> Vec<(String, String)> {
        self.schema
            .fields()
            .iter()
            .map(|field| (field.name().clone(), field.data_type().to_string()))
            .collect()
    }

    /// Estimated bytes held by the table's buffers.
    pub fn memory_size(&self) -> usize {
        self.batches.iter().map(RecordBatch::get_array_memory_size).sum()
    }

    pub fn batches(&self) -> &[RecordBatch] {
        &self.batches
    }
}

#[async_trait]
pub trait Materializer: fmt::Debug + Send + Sync {
    async fn materialize(&self, remote_id: &str, local_path: &Path)
    -> MaterializeResult<TableHandle>;
}

/// Reads CSV, Parquet and spreadsheet files into Arrow record batches.
#[derive(Debug, Clone, Copy)]
pub struct ArrowMaterializer {
    batch_size: usize,
}

impl Default for ArrowMaterializer {
    fn default() -> Self {
        Self { batch_size: DEFAULT_BATCH_SIZE }
    }
}

impl ArrowMaterializer {
    pub fn new(batch_size: usize) -> Self {
        Self { batch_size: batch_size.max(1) }
    }

    fn read(&self, path: &Path) -> MaterializeResult<(SchemaRef, Vec<RecordBatch>)> {
        match FileFormat::from_path(path) {
            Some(FileFormat::Csv) => read_csv(path, self.batch_size),
            Some(FileFormat::Parquet) => read_parquet(path, self.batch_size),
            Some(FileFormat::Spreadsheet) => read_spreadsheet(path),
            None => Err(MaterializeErrorKind::UnsupportedFormat(path.display().to_string()).into()),
        }
    }
}

#[async_trait]
impl Materializer for ArrowMaterializer {
    #[instrument(skip(self))]
    async fn materialize(
        &self,
        remote_id: &str,
        local_path: &Path,
    ) -> MaterializeResult<TableHandle> {
        let this = *self;
        let path: PathBuf = local_path.to_path_buf();
        let (schema, batches) = tokio::task::spawn_blocking(move || this.read(&path)).await??;
        let table = TableHandle::new(remote_id, schema, batches);
        debug!(shape = ?table.shape(), "table materialized");
        Ok(table)
    }
}

fn read_csv(path: &Path, batch_size: usize) -> MaterializeResult<(SchemaRef, Vec<RecordBatch>)> {
    let mut file = File::open(path)?;
    let (schema, _) = Format::default().with_header(true).infer_schema(&mut file, None)?;
    file.seek(SeekFrom::Start(0))?;
    let schema = Arc::new(schema);
    let reader = ReaderBuilder::new(Arc::clone(&schema))
        .with_header(true)
        .with_batch_size(batch_size)
        .build(file)?;
    let batches = reader.collect::<Result<Vec<_>, _>>()?;
    Ok((schema, batches))
}

fn read_parquet(
    path: &Path,
    batch_size: usize,
) -> MaterializeResult<(SchemaRef, Vec<RecordBatch>)> {
    let builder =
        ParquetRecordBatchReaderBuilder::try_new(File::open(path)?)?.with_batch_size(batch_size);
    let schema = Arc::clone(builder.schema());
    let batches = builder.build()?.collect::<Result<Vec<_>, _>>()?;
    Ok((schema, batches))
}

/// First worksheet only; the first row names the columns and every cell is read as text.
fn read_spreadsheet(path: &Path) -> MaterializeResult<(SchemaRef, Vec<RecordBatch>)> {
    let mut workbook = open_workbook_auto(path)?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| MaterializeErrorKind::EmptyWorkbook(path.display().to_string()))??;

    let mut rows = range.rows();
    let Some(header) = rows.next() else {
        return Ok((Arc::new(Schema::empty()), Vec::new()));
    };
    let fields: Vec<Field> = header
        .iter()
        .enumerate()
        .map(|(i, cell)| match cell {
            Data::Empty => Field::new(format!("column_{i}"), DataType::Utf8, true),
            cell => Field::new(cell.to_string(), DataType::Utf8, true),
        })
        .collect();

    let mut columns: Vec<Vec<Option<String>>> = vec![Vec::new(); fields.len()];
    for row in rows {
        for (i, column) in columns.iter_mut().enumerate() {
            let value = match row.get(i) {
                None | Some(Data::Empty) => None,
                Some(cell) => Some(cell.to_string()),
            };
            column.push(value);
        }
    }

    let schema = Arc::new(Schema::new(fields));
    let arrays: Vec<ArrayRef> =
        columns.into_iter().map(|c| Arc::new(StringArray::from(c)) as ArrayRef).collect();
    let batch = RecordBatch::try_new(Arc::clone(&schema), arrays)?;
    Ok((schema, vec![batch]))
}
