//! Content identity and lightweight structure of local files.

use std::{fmt, path::Path};

use serde::{Deserialize, Serialize};

pub mod digest;
pub mod sniff;

pub use digest::{digest_bytes, digest_file};
pub use sniff::sniff_metadata;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileFormat {
    Csv,
    Parquet,
    Spreadsheet,
}

impl FileFormat {
    /// Detect the format from the lowercase file extension.
    pub fn from_path(path: &Path) -> Option<Self> {
        let ext = path.extension()?.to_str()?.to_ascii_lowercase();
        match ext.as_str() {
            "csv" => Some(FileFormat::Csv),
            "parquet" => Some(FileFormat::Parquet),
            "xls" | "xlsx" => Some(FileFormat::Spreadsheet),
            _ => None,
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::Csv => f.write_str("csv"),
            FileFormat::Parquet => f.write_str("parquet"),
            FileFormat::Spreadsheet => f.write_str("spreadsheet"),
        }
    }
}

/// Advisory structure of a file. An empty value means nothing could be sniffed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<FileFormat>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub headers: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows: Option<u64>,
}

impl FileMetadata {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.format.is_none() && self.headers.is_empty() && self.rows.is_none()
    }
}
