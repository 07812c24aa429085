//! Archive engine
//!
//! Builds and extracts zip and tar-family archives across backends. The
//! container itself always lives in a local staging file (zip needs to seek
//! backwards and no adapter has to support that); file contents flow between
//! the adapter and the blocking codec thread in fixed-size chunks over a
//! bounded channel, so no entry is ever held whole in memory.
//!
//! ```text
//! compress:   adapter.read ─► chunks ─► codec thread ─► staging file ─► adapter.write
//! decompress: adapter.read ─► staging file ─► codec thread ─► chunks ─► adapter.write
//! ```

pub mod compress;
pub mod extract;
pub mod format;

use std::io::Read;
use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::debug;

use crate::adapter::StorageAdapter;
use crate::error::{StorageError, StorageResult};
use crate::registry::StorageRegistry;

pub use format::ArchiveFormat;

/// Prefix of staging files in the system temp directory
const STAGING_PREFIX: &str = ".polystore-archive-";

/// Request to build an archive from entries of one backend
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompressRequest {
    pub source_backend: String,
    pub sources: Vec<String>,
    pub dest_backend: String,
    pub output_path: String,
    /// Detected from `output_path` when absent
    #[serde(default)]
    pub format: Option<ArchiveFormat>,
}

/// Request to unpack an archive into a backend directory
#[derive(Debug, Clone, Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecompressRequest {
    pub source_backend: String,
    pub archive_path: String,
    pub dest_backend: String,
    pub output_path: String,
    /// Extract into `<output>/<archive name without extension>`
    #[serde(default)]
    pub create_subfolder: bool,
}

/// Result of a finished compress or decompress
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSummary {
    pub format: ArchiveFormat,
    /// Archive written, or directory extracted into
    pub output_path: String,
    pub files: usize,
    pub directories: usize,
    /// Uncompressed bytes
    pub bytes: u64,
}

/// One entry of an archive listing
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveEntry {
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveListing {
    pub format: ArchiveFormat,
    pub entries: Vec<ArchiveEntry>,
    pub total_files: usize,
    pub total_dirs: usize,
    pub total_size: u64,
}

impl ArchiveListing {
    fn new(format: ArchiveFormat, mut entries: Vec<ArchiveEntry>) -> Self {
        // Directories first, then by path
        entries.sort_by(|a, b| b.is_dir.cmp(&a.is_dir).then_with(|| a.path.cmp(&b.path)));
        let total_dirs = entries.iter().filter(|e| e.is_dir).count();
        let total_size = entries.iter().filter(|e| !e.is_dir).map(|e| e.size).sum();
        Self {
            format,
            total_files: entries.len() - total_dirs,
            total_dirs,
            total_size,
            entries,
        }
    }
}

/// Compress/decompress/list over registry backends
pub struct ArchiveEngine {
    registry: Arc<StorageRegistry>,
}

impl ArchiveEngine {
    pub fn new(registry: Arc<StorageRegistry>) -> Self {
        Self { registry }
    }

    /// List the entries of an archive stored on `backend_id`.
    pub async fn list_archive(&self, backend_id: &str, path: &str) -> StorageResult<ArchiveListing> {
        let adapter = self.registry.get(backend_id)?;
        let format = ArchiveFormat::from_path(path)?;
        let staging = download_to_staging(adapter.as_ref(), path).await?;
        let staged = staging.to_path_buf();

        let entries =
            tokio::task::spawn_blocking(move || extract::scan_entries(&staged, format)).await??;
        close_staging(staging);
        Ok(ArchiveListing::new(format, entries))
    }
}

/// Create an empty staging file.
fn new_staging() -> StorageResult<(std::fs::File, tempfile::TempPath)> {
    let file = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempfile()
        .map_err(|e| StorageError::Transient(format!("cannot create staging file: {}", e)))?;
    Ok(file.into_parts())
}

/// Remove a staging file, logging failures.
fn close_staging(path: tempfile::TempPath) {
    let shown = path.to_path_buf();
    if let Err(e) = path.close() {
        tracing::warn!("Failed to remove staging file {:?}: {}", shown, e);
    }
}

/// Copy a remote file into a fresh staging file.
async fn download_to_staging(
    adapter: &dyn StorageAdapter,
    path: &str,
) -> StorageResult<tempfile::TempPath> {
    let (file, staging) = new_staging()?;
    let mut reader = adapter.read(path).await?;
    let mut file = tokio::fs::File::from_std(file);
    let bytes = tokio::io::copy(&mut reader, &mut file)
        .await
        .map_err(|e| StorageError::from_io(e, path))?;
    file.flush().await.map_err(|e| StorageError::from_io(e, path))?;
    debug!("Staged {} ({} bytes) at {:?}", path, bytes, staging);
    Ok(staging)
}

/// Blocking `Read` over chunks arriving on a channel. A closed channel is EOF.
pub(crate) struct ChannelReader {
    rx: mpsc::Receiver<Bytes>,
    buf: Bytes,
}

impl ChannelReader {
    pub(crate) fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self {
            rx,
            buf: Bytes::new(),
        }
    }
}

impl Read for ChannelReader {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        while self.buf.is_empty() {
            match self.rx.blocking_recv() {
                Some(chunk) => self.buf = chunk,
                None => return Ok(0),
            }
        }
        let n = self.buf.len().min(out.len());
        out[..n].copy_from_slice(&self.buf.split_to(n));
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listing_totals_and_order() {
        let listing = ArchiveListing::new(
            ArchiveFormat::Zip,
            vec![
                ArchiveEntry { path: "b.txt".into(), is_dir: false, size: 3 },
                ArchiveEntry { path: "dir".into(), is_dir: true, size: 0 },
                ArchiveEntry { path: "a.txt".into(), is_dir: false, size: 4 },
            ],
        );
        assert_eq!(listing.entries[0].path, "dir");
        assert_eq!(listing.entries[1].path, "a.txt");
        assert_eq!(listing.total_files, 2);
        assert_eq!(listing.total_dirs, 1);
        assert_eq!(listing.total_size, 7);
    }

    #[test]
    fn test_channel_reader() {
        let (tx, rx) = mpsc::channel(4);
        tx.try_send(Bytes::from_static(b"hello ")).unwrap();
        tx.try_send(Bytes::from_static(b"world")).unwrap();
        drop(tx);

        let mut out = String::new();
        ChannelReader::new(rx).read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }
}
