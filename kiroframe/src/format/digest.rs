//! MD5 content digests used for change detection.
//!
//! The digest is not a security boundary. Files are memory mapped when possible and read
//! in fixed-size chunks otherwise; both strategies produce the same hex string.

use std::{
    fs::File,
    io::{self, Read},
    path::Path,
};

use memmap2::Mmap;
use tracing::{debug, instrument};

pub fn digest_bytes(bytes: &[u8]) -> String {
    format!("{:x}", md5::compute(bytes))
}

pub fn digest_reader<R: Read>(mut reader: R, chunk_size: usize) -> io::Result<String> {
    let mut context = md5::Context::new();
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => context.consume(&buf[..n]),
            Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(format!("{:x}", context.compute()))
}

/// Blocking digest of a local file. Call from a blocking context.
pub fn digest_file_blocking(path: &Path, chunk_size: usize) -> io::Result<String> {
    let file = File::open(path)?;
    // empty files cannot be mapped
    if file.metadata()?.len() > 0 {
        // SAFETY: the mapping is read-only and dropped before returning. A concurrent writer
        // can only make the digest stale, which download verification reports.
        match unsafe { Mmap::map(&file) } {
            Ok(map) => return Ok(digest_bytes(&map)),
            Err(err) => {
                debug!(path = %path.display(), error = %err, "cannot map file, reading in chunks")
            }
        }
    }
    digest_reader(file, chunk_size)
}

#[instrument]
pub async fn digest_file(path: &Path, chunk_size: usize) -> io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || digest_file_blocking(&path, chunk_size))
        .await
        .map_err(io::Error::other)?
}
