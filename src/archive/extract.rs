//! Archive extraction and listing

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use futures_util::stream;
use tokio::sync::mpsc;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use super::{
    close_staging, download_to_staging, ArchiveEngine, ArchiveEntry, ArchiveFormat,
    ArchiveSummary, DecompressRequest,
};
use crate::adapter::{ByteReader, StorageAdapter};
use crate::error::{StorageError, StorageResult};
use crate::path_utils::{file_name, join, normalize, sanitize_archive_entry};
use crate::progress::ProgressReporter;
use crate::transfer::stream::MeteredReader;
use crate::types::constants::{ARCHIVE_CHUNK_SIZE, ARCHIVE_PIPE_DEPTH, STREAM_BUFFER_SIZE};

/// Entry produced by the codec thread
enum Extracted {
    Directory(String),
    File {
        name: String,
        data: mpsc::Receiver<io::Result<Bytes>>,
    },
}

impl ArchiveEngine {
    /// Unpack an archive into a directory of the destination backend.
    pub async fn decompress(
        &self,
        request: &DecompressRequest,
        reporter: Option<Arc<ProgressReporter>>,
        cancel: &CancellationToken,
    ) -> StorageResult<ArchiveSummary> {
        let format = ArchiveFormat::from_path(&request.archive_path)?;
        let src = self.registry.get(&request.source_backend)?;
        let dst = self.registry.get(&request.dest_backend)?;

        let staging = download_to_staging(src.as_ref(), &request.archive_path).await?;
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let staged = staging.to_path_buf();
        let entries = tokio::task::spawn_blocking(move || scan_entries(&staged, format)).await??;
        let total: u64 = entries.iter().filter(|e| !e.is_dir).map(|e| e.size).sum();
        if let Some(reporter) = &reporter {
            reporter.set_total(Some(total));
        }

        let base = if request.create_subfolder {
            let name = file_name(&request.archive_path);
            join(&normalize(&request.output_path)?, format.strip_extension(name))
        } else {
            normalize(&request.output_path)?
        };
        dst.make_container(&base).await?;
        info!(
            "Extracting {} ({} entries, {} bytes) into {}",
            request.archive_path,
            entries.len(),
            total,
            base
        );

        let staged = staging.to_path_buf();
        let (item_tx, mut item_rx) = mpsc::channel(1);
        let reader = tokio::task::spawn_blocking(move || read_archive(&staged, format, item_tx));

        let consumed = consume(dst.as_ref(), &base, &mut item_rx, reporter, cancel).await;
        drop(item_rx);
        let read = reader.await.map_err(StorageError::from).and_then(|r| r);
        let (files, directories, bytes) = consumed?;
        read?;
        close_staging(staging);

        Ok(ArchiveSummary {
            format,
            output_path: base,
            files,
            directories,
            bytes,
        })
    }
}

/// Write every extracted entry to the destination.
async fn consume(
    dst: &dyn StorageAdapter,
    base: &str,
    items: &mut mpsc::Receiver<Extracted>,
    reporter: Option<Arc<ProgressReporter>>,
    cancel: &CancellationToken,
) -> StorageResult<(usize, usize, u64)> {
    let (mut files, mut directories, mut bytes) = (0, 0, 0);

    while let Some(item) = items.recv().await {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }
        match item {
            Extracted::Directory(name) => {
                dst.make_container(&join(base, &name)).await?;
                directories += 1;
            }
            Extracted::File { name, data } => {
                let chunks = stream::unfold(data, |mut rx| async move {
                    rx.recv().await.map(|chunk| (chunk, rx))
                });
                let mut reader = MeteredReader::new(StreamReader::new(Box::pin(chunks)))
                    .with_cancel(cancel.clone());
                if let Some(reporter) = &reporter {
                    reader = reader.with_progress(reporter.callback());
                }
                let reader: ByteReader = Box::new(reader);
                let path = join(base, &name);
                debug!("Extracting {}", path);
                bytes += dst.write(&path, reader).await?;
                files += 1;
            }
        }
    }
    Ok((files, directories, bytes))
}

/// Codec thread: walk the staged archive and hand out entries in order.
/// Stops quietly once the consumer is gone.
fn read_archive(
    path: &Path,
    format: ArchiveFormat,
    items: mpsc::Sender<Extracted>,
) -> StorageResult<()> {
    let file = open_staged(path)?;
    if format == ArchiveFormat::Zip {
        let mut archive = ZipArchive::new(BufReader::with_capacity(STREAM_BUFFER_SIZE, file))?;
        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            let Some(name) = safe_name(entry.name()) else {
                continue;
            };
            if entry.is_dir() {
                if items.blocking_send(Extracted::Directory(name)).is_err() {
                    return Ok(());
                }
            } else if !send_file(&items, name, &mut entry)? {
                return Ok(());
            }
        }
        return Ok(());
    }

    let mut archive = tar::Archive::new(tar_reader(file, format)?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        let raw = entry.path()?.to_string_lossy().to_string();
        let Some(name) = safe_name(&raw) else {
            continue;
        };
        let kind = entry.header().entry_type();
        if kind.is_dir() {
            if items.blocking_send(Extracted::Directory(name)).is_err() {
                return Ok(());
            }
        } else if kind.is_file() {
            if !send_file(&items, name, &mut entry)? {
                return Ok(());
            }
        } else {
            debug!("Skipping tar entry {} of type {:?}", raw, kind);
        }
    }
    Ok(())
}

/// Stream one entry's bytes in fixed-size chunks. Returns `false` when the
/// consumer has gone away.
fn send_file(
    items: &mpsc::Sender<Extracted>,
    name: String,
    entry: &mut dyn Read,
) -> StorageResult<bool> {
    let (data_tx, data_rx) = mpsc::channel(ARCHIVE_PIPE_DEPTH);
    if items
        .blocking_send(Extracted::File { name, data: data_rx })
        .is_err()
    {
        return Ok(false);
    }

    let mut buf = vec![0u8; ARCHIVE_CHUNK_SIZE];
    loop {
        match entry.read(&mut buf) {
            Ok(0) => return Ok(true),
            Ok(n) => {
                if data_tx
                    .blocking_send(Ok(Bytes::copy_from_slice(&buf[..n])))
                    .is_err()
                {
                    return Ok(false);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                // Fail the destination write as well as this thread
                let _ = data_tx.blocking_send(Err(io::Error::new(e.kind(), e.to_string())));
                return Err(StorageError::Transient(format!("corrupt archive entry: {}", e)));
            }
        }
    }
}

/// Enumerate entries without extracting anything.
pub(crate) fn scan_entries(path: &Path, format: ArchiveFormat) -> StorageResult<Vec<ArchiveEntry>> {
    let file = open_staged(path)?;
    let mut entries = Vec::new();

    if format == ArchiveFormat::Zip {
        let mut archive = ZipArchive::new(BufReader::new(file))?;
        for i in 0..archive.len() {
            let entry = archive.by_index(i)?;
            if let Some(name) = safe_name(entry.name()) {
                entries.push(ArchiveEntry {
                    path: name,
                    is_dir: entry.is_dir(),
                    size: if entry.is_dir() { 0 } else { entry.size() },
                });
            }
        }
        return Ok(entries);
    }

    let mut archive = tar::Archive::new(tar_reader(file, format)?);
    for entry in archive.entries()? {
        let entry = entry?;
        let raw = entry.path()?.to_string_lossy().to_string();
        let kind = entry.header().entry_type();
        if !(kind.is_dir() || kind.is_file()) {
            continue;
        }
        if let Some(name) = safe_name(&raw) {
            entries.push(ArchiveEntry {
                path: name,
                is_dir: kind.is_dir(),
                size: if kind.is_dir() { 0 } else { entry.size() },
            });
        }
    }
    Ok(entries)
}

fn open_staged(path: &Path) -> StorageResult<File> {
    File::open(path)
        .map_err(|e| StorageError::Transient(format!("cannot open staging file: {}", e)))
}

/// Decoder chain for a tar-family archive.
fn tar_reader(file: File, format: ArchiveFormat) -> StorageResult<Box<dyn Read + Send>> {
    let buffered = BufReader::with_capacity(STREAM_BUFFER_SIZE, file);
    Ok(match format {
        ArchiveFormat::Tar => Box::new(buffered),
        ArchiveFormat::TarGz => Box::new(flate2::read::GzDecoder::new(buffered)),
        ArchiveFormat::TarZst => Box::new(zstd::Decoder::with_buffer(buffered)?),
        ArchiveFormat::Zip => {
            return Err(StorageError::Unsupported("zip is not a tar format".to_string()))
        }
    })
}

fn safe_name(raw: &str) -> Option<String> {
    let name = sanitize_archive_entry(raw);
    if name.is_none() && !matches!(raw.trim_matches('/'), "" | ".") {
        warn!("Skipping unsafe archive entry '{}'", raw);
    }
    name
}
