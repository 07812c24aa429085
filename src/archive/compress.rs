//! Archive building

use std::io::{self, Read, Seek, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::write::GzEncoder;
use tokio::io::{AsyncReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zip::write::SimpleFileOptions;
use zip::ZipWriter;

use super::{close_staging, new_staging, ArchiveEngine, ArchiveFormat, ArchiveSummary, ChannelReader, CompressRequest};
use crate::adapter::{BoxFuture, ByteReader, StorageAdapter};
use crate::error::{StorageError, StorageResult};
use crate::path_utils::file_name;
use crate::progress::ProgressReporter;
use crate::transfer::stream::MeteredReader;
use crate::types::constants::{ARCHIVE_CHUNK_SIZE, ARCHIVE_PIPE_DEPTH, STREAM_BUFFER_SIZE};
use crate::types::{EntryDescriptor, EntryKind};

/// Entry scheduled for the archive
#[derive(Debug)]
struct PlannedEntry {
    source_path: String,
    name: String,
    is_dir: bool,
    size: u64,
    modified_at: i64,
}

/// Work item handed to the codec thread
enum Item {
    Directory {
        name: String,
        modified_at: i64,
    },
    File {
        name: String,
        size: u64,
        modified_at: i64,
        data: mpsc::Receiver<Bytes>,
    },
}

impl ArchiveEngine {
    /// Build an archive of `sources` and upload it to the destination.
    pub async fn compress(
        &self,
        request: &CompressRequest,
        reporter: Option<Arc<ProgressReporter>>,
        cancel: &CancellationToken,
    ) -> StorageResult<ArchiveSummary> {
        let format = match request.format {
            Some(format) => format,
            None => ArchiveFormat::from_path(&request.output_path)?,
        };
        if request.sources.is_empty() {
            return Err(StorageError::InvalidConfig("nothing to compress".to_string()));
        }
        let src = self.registry.get(&request.source_backend)?;
        let dst = self.registry.get(&request.dest_backend)?;

        let plan = plan_entries(src.as_ref(), &request.sources).await?;
        let total: u64 = plan.iter().map(|e| e.size).sum();
        if let Some(reporter) = &reporter {
            reporter.set_total(Some(total));
        }
        info!(
            "Compressing {} entries ({} bytes) into {} as {}",
            plan.len(),
            total,
            request.output_path,
            format
        );

        let (file, staging) = new_staging()?;
        let (item_tx, item_rx) = mpsc::channel(1);
        let writer = tokio::task::spawn_blocking(move || write_archive(file, format, item_rx));

        let fed = feed(src.as_ref(), &plan, item_tx, reporter.clone(), cancel).await;
        let written = writer.await.map_err(StorageError::from).and_then(|r| r);
        fed?;
        written?;

        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        let staged = tokio::fs::File::open(&staging)
            .await
            .map_err(|e| StorageError::Transient(format!("cannot reopen staging file: {}", e)))?;
        let upload: ByteReader = Box::new(
            MeteredReader::new(BufReader::with_capacity(STREAM_BUFFER_SIZE, staged))
                .with_cancel(cancel.clone()),
        );
        let archive_size = dst.write(&request.output_path, upload).await?;
        close_staging(staging);
        debug!("Uploaded {} ({} bytes)", request.output_path, archive_size);

        Ok(ArchiveSummary {
            format,
            output_path: request.output_path.clone(),
            files: plan.iter().filter(|e| !e.is_dir).count(),
            directories: plan.iter().filter(|e| e.is_dir).count(),
            bytes: total,
        })
    }
}

/// Expand every source into archive entries, parents before children.
/// Entry names start at each source's own name.
async fn plan_entries(src: &dyn StorageAdapter, sources: &[String]) -> StorageResult<Vec<PlannedEntry>> {
    let mut plan = Vec::new();
    for source in sources {
        let entry = src.stat(source).await?;
        let base = file_name(&entry.path).to_string();
        walk(src, entry, base, &mut plan).await?;
    }

    let mut names = std::collections::HashSet::new();
    for entry in &plan {
        if !names.insert(entry.name.as_str()) {
            return Err(StorageError::Conflict(format!(
                "two sources produce the archive entry '{}'",
                entry.name
            )));
        }
    }
    Ok(plan)
}

fn walk<'a>(
    src: &'a dyn StorageAdapter,
    entry: EntryDescriptor,
    name: String,
    plan: &'a mut Vec<PlannedEntry>,
) -> BoxFuture<'a, StorageResult<()>> {
    Box::pin(async move {
        match entry.kind {
            EntryKind::Symlink => {
                warn!("Skipping symlink {} while archiving", entry.path);
            }
            EntryKind::File => plan.push(PlannedEntry {
                source_path: entry.path,
                name,
                is_dir: false,
                size: entry.size,
                modified_at: entry.modified_at,
            }),
            EntryKind::Directory => {
                let children = src.list(&entry.path).await?;
                // The root of a backend contributes its children only
                if !name.is_empty() {
                    plan.push(PlannedEntry {
                        source_path: entry.path.clone(),
                        name: name.clone(),
                        is_dir: true,
                        size: 0,
                        modified_at: entry.modified_at,
                    });
                }
                for child in children {
                    let child_name = if name.is_empty() {
                        child.name.clone()
                    } else {
                        format!("{}/{}", name, child.name)
                    };
                    walk(src, child, child_name, plan).await?;
                }
            }
        }
        Ok(())
    })
}

/// Stream every planned entry to the codec thread. Returns early without
/// error if the codec thread has stopped; its own result carries the cause.
async fn feed(
    src: &dyn StorageAdapter,
    plan: &[PlannedEntry],
    items: mpsc::Sender<Item>,
    reporter: Option<Arc<ProgressReporter>>,
    cancel: &CancellationToken,
) -> StorageResult<()> {
    let mut buf = vec![0u8; ARCHIVE_CHUNK_SIZE];

    for entry in plan {
        if cancel.is_cancelled() {
            return Err(StorageError::Cancelled);
        }

        if entry.is_dir {
            let item = Item::Directory {
                name: entry.name.clone(),
                modified_at: entry.modified_at,
            };
            if items.send(item).await.is_err() {
                return Ok(());
            }
            continue;
        }

        let reader = src.read(&entry.source_path).await?;
        let mut reader = MeteredReader::new(reader).with_cancel(cancel.clone());
        if let Some(reporter) = &reporter {
            reader = reader.with_progress(reporter.callback());
        }

        let (data_tx, data_rx) = mpsc::channel(ARCHIVE_PIPE_DEPTH);
        let item = Item::File {
            name: entry.name.clone(),
            size: entry.size,
            modified_at: entry.modified_at,
            data: data_rx,
        };
        if items.send(item).await.is_err() {
            return Ok(());
        }

        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| StorageError::from_io(e, &entry.source_path))?;
            if n == 0 {
                break;
            }
            if data_tx.send(Bytes::copy_from_slice(&buf[..n])).await.is_err() {
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Codec thread: write items into the staging file in `format`.
fn write_archive(
    file: std::fs::File,
    format: ArchiveFormat,
    items: mpsc::Receiver<Item>,
) -> StorageResult<()> {
    let writer = io::BufWriter::with_capacity(STREAM_BUFFER_SIZE, file);
    match format {
        ArchiveFormat::Zip => {
            let mut writer = write_zip(writer, items)?;
            writer.flush()?;
        }
        ArchiveFormat::Tar => {
            let mut writer = write_tar(writer, items)?;
            writer.flush()?;
        }
        ArchiveFormat::TarGz => {
            let gz = GzEncoder::new(writer, flate2::Compression::default());
            let gz = write_tar(gz, items)?;
            gz.finish()?.flush()?;
        }
        ArchiveFormat::TarZst => {
            let zst = zstd::Encoder::new(writer, 3)?;
            let zst = write_tar(zst, items)?;
            zst.finish()?.flush()?;
        }
    }
    Ok(())
}

fn write_zip<W: Write + Seek>(writer: W, mut items: mpsc::Receiver<Item>) -> StorageResult<W> {
    let mut zip = ZipWriter::new(writer);

    while let Some(item) = items.blocking_recv() {
        match item {
            Item::Directory { name, modified_at } => {
                zip.add_directory(format!("{}/", name), zip_options(0o755, modified_at))?;
            }
            Item::File {
                name,
                size,
                modified_at,
                data,
            } => {
                let options = zip_options(0o644, modified_at).large_file(size >= u32::MAX as u64);
                zip.start_file(name.as_str(), options)?;
                let mut reader = ChannelReader::new(data);
                let copied = io::copy(&mut reader, &mut zip)?;
                check_size(&name, size, copied)?;
            }
        }
    }
    Ok(zip.finish()?)
}

fn zip_options(mode: u32, modified_at: i64) -> SimpleFileOptions {
    use chrono::{Datelike, Timelike};

    let options = SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated)
        .unix_permissions(mode);

    let Some(dt) = chrono::DateTime::from_timestamp(modified_at, 0) else {
        return options;
    };
    match zip::DateTime::from_date_and_time(
        dt.year() as u16,
        dt.month() as u8,
        dt.day() as u8,
        dt.hour() as u8,
        dt.minute() as u8,
        dt.second() as u8,
    ) {
        Ok(mtime) if modified_at > 0 => options.last_modified_time(mtime),
        _ => options,
    }
}

fn write_tar<W: Write>(writer: W, mut items: mpsc::Receiver<Item>) -> StorageResult<W> {
    let mut builder = tar::Builder::new(writer);

    while let Some(item) = items.blocking_recv() {
        match item {
            Item::Directory { name, modified_at } => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Directory);
                header.set_size(0);
                header.set_mode(0o755);
                header.set_mtime(modified_at.max(0) as u64);
                builder.append_data(&mut header, &name, io::empty())?;
            }
            Item::File {
                name,
                size,
                modified_at,
                data,
            } => {
                let mut header = tar::Header::new_gnu();
                header.set_entry_type(tar::EntryType::Regular);
                header.set_size(size);
                header.set_mode(0o644);
                header.set_mtime(modified_at.max(0) as u64);

                // The header size is fixed up front: stop at `size`, then
                // drain anything extra so the producer never blocks.
                let mut counter = CountingReader::new(ChannelReader::new(data));
                builder.append_data(&mut header, &name, (&mut counter).take(size))?;
                io::copy(&mut counter, &mut io::sink())?;
                check_size(&name, size, counter.count)?;
            }
        }
    }
    Ok(builder.into_inner()?)
}

fn check_size(name: &str, expected: u64, actual: u64) -> StorageResult<()> {
    if expected != actual {
        return Err(StorageError::Conflict(format!(
            "{} changed size while being archived ({} -> {} bytes)",
            name, expected, actual
        )));
    }
    Ok(())
}

struct CountingReader<R> {
    inner: R,
    count: u64,
}

impl<R> CountingReader<R> {
    fn new(inner: R) -> Self {
        Self { inner, count: 0 }
    }
}

impl<R: io::Read> io::Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.count += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{write_bytes, LocalAdapter};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_plan_names_and_order() {
        let temp = tempdir().unwrap();
        let disk = LocalAdapter::open(temp.path()).await.unwrap();
        write_bytes(&disk, "/docs/a.txt", "aa").await.unwrap();
        write_bytes(&disk, "/docs/sub/b.txt", "bbb").await.unwrap();
        write_bytes(&disk, "/single.txt", "s").await.unwrap();

        let plan = plan_entries(&disk, &["/docs".to_string(), "/single.txt".to_string()])
            .await
            .unwrap();
        let mut names: Vec<_> = plan.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names[0], "docs");
        names.sort();
        assert_eq!(names, vec!["docs", "docs/a.txt", "docs/sub", "docs/sub/b.txt", "single.txt"]);
        assert_eq!(plan.iter().map(|e| e.size).sum::<u64>(), 6);

        let sub = plan.iter().position(|e| e.name == "docs/sub").unwrap();
        let nested = plan.iter().position(|e| e.name == "docs/sub/b.txt").unwrap();
        assert!(sub < nested);
    }

    #[tokio::test]
    async fn test_duplicate_entry_names_conflict() {
        let temp = tempdir().unwrap();
        let disk = LocalAdapter::open(temp.path()).await.unwrap();
        write_bytes(&disk, "/x/same.txt", "1").await.unwrap();
        write_bytes(&disk, "/y/same.txt", "2").await.unwrap();

        let result = plan_entries(&disk, &["/x/same.txt".to_string(), "/y/same.txt".to_string()]).await;
        assert!(matches!(result, Err(StorageError::Conflict(_))));
    }

    #[test]
    fn test_check_size() {
        assert!(check_size("a", 3, 3).is_ok());
        assert!(matches!(check_size("a", 3, 2), Err(StorageError::Conflict(_))));
    }
}
