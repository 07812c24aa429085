//! Object storage adapter (S3-compatible)
//!
//! Directories are emulated over key prefixes: a directory exists when any
//! key lives beneath it, and `make_container` drops a hidden marker object
//! so empty directories survive. The marker name is reserved: user entries
//! may not take it, so every other name lists normally.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::buffered::BufWriter;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectMeta, ObjectStore, PutPayload};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info, warn};

use super::{copy_within, ByteReader, ProgressFn, StorageAdapter};
use crate::error::{StorageError, StorageResult};
use crate::path_utils::{file_name, is_root, is_within, join, normalize, relative_to};
use crate::types::{BackendKind, EntryDescriptor};

/// Marker object keeping empty directories alive
const DIR_MARKER: &str = ".polystore-dir";

impl From<object_store::Error> for StorageError {
    fn from(err: object_store::Error) -> Self {
        use object_store::Error as E;
        let message = err.to_string();
        match err {
            E::NotFound { path, .. } => StorageError::NotFound(path),
            E::AlreadyExists { .. } | E::Precondition { .. } => StorageError::Conflict(message),
            E::NotImplemented | E::NotSupported { .. } => StorageError::Unsupported(message),
            _ => StorageError::Transient(message),
        }
    }
}

/// S3 connection parameters
#[derive(Debug, Clone, Default)]
pub struct S3Settings {
    pub bucket: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint: Option<String>,
    pub allow_http: bool,
}

/// Adapter over any [`ObjectStore`]
pub struct ObjectAdapter {
    store: Arc<dyn ObjectStore>,
    /// Key prefix acting as the root, without slashes at either end
    prefix: String,
    label: String,
}

impl ObjectAdapter {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str, label: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.trim_matches('/').to_string(),
            label: label.into(),
        }
    }

    /// Connect to an S3-compatible bucket
    pub fn s3(settings: &S3Settings, prefix: &str) -> StorageResult<Self> {
        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&settings.bucket)
            .with_region(&settings.region)
            .with_access_key_id(&settings.access_key_id)
            .with_secret_access_key(&settings.secret_access_key)
            .with_allow_http(settings.allow_http);
        if let Some(endpoint) = &settings.endpoint {
            builder = builder.with_endpoint(endpoint);
        }
        let store = builder
            .build()
            .map_err(|e| StorageError::InvalidConfig(format!("s3: {}", e)))?;

        info!("S3 adapter for bucket {} (prefix '{}')", settings.bucket, prefix);
        Ok(Self::new(Arc::new(store), prefix, format!("s3://{}", settings.bucket)))
    }

    /// In-process object store
    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemory::new()), "", "memory://")
    }

    /// Object key for a backend path
    fn key(&self, path: &str) -> ObjectPath {
        let relative = path.trim_start_matches('/');
        let full = match (self.prefix.is_empty(), relative.is_empty()) {
            (true, _) => relative.to_string(),
            (false, true) => self.prefix.clone(),
            (false, false) => format!("{}/{}", self.prefix, relative),
        };
        ObjectPath::from_iter(full.split('/').filter(|s| !s.is_empty()))
    }

    /// Listing prefix for a directory path, `None` for an unprefixed root
    fn dir_prefix(&self, path: &str) -> Option<ObjectPath> {
        let key = self.key(path);
        if key.as_ref().is_empty() {
            None
        } else {
            Some(key)
        }
    }

    fn reject_reserved(path: &str) -> StorageResult<()> {
        if file_name(path) == DIR_MARKER {
            return Err(StorageError::PermissionDenied(format!(
                "{} is reserved for directory markers",
                DIR_MARKER
            )));
        }
        Ok(())
    }

    fn marker_key(&self, path: &str) -> ObjectPath {
        self.key(&join(path, DIR_MARKER))
    }

    /// Backend path for an object key
    fn backend_path(&self, key: &ObjectPath) -> String {
        let key = key.as_ref();
        let relative = if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(self.prefix.as_str())
                .map(|r| r.trim_start_matches('/'))
                .unwrap_or(key)
        };
        format!("/{}", relative)
    }

    fn file_descriptor(&self, meta: &ObjectMeta) -> EntryDescriptor {
        EntryDescriptor::file(
            &self.backend_path(&meta.location),
            meta.size as u64,
            meta.last_modified.timestamp(),
        )
    }

    /// Every object key at or beneath a directory, markers included
    async fn objects_under(&self, path: &str) -> StorageResult<Vec<ObjectMeta>> {
        let prefix = self.dir_prefix(path);
        Ok(self.store.list(prefix.as_ref()).try_collect().await?)
    }

    /// True when any key lives beneath `path`
    async fn dir_exists(&self, path: &str) -> StorageResult<bool> {
        if is_root(path) {
            return Ok(true);
        }
        let prefix = self.dir_prefix(path);
        let mut stream = self.store.list(prefix.as_ref());
        Ok(stream.next().await.transpose()?.is_some())
    }

    async fn head_file(&self, path: &str) -> StorageResult<Option<ObjectMeta>> {
        if is_root(path) {
            return Ok(None);
        }
        match self.store.head(&self.key(path)).await {
            Ok(meta) => Ok(Some(meta)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Server-side copy of every object beneath `src` to `dst`
    async fn copy_objects(&self, src: &str, dst: &str, progress: Option<ProgressFn>) -> StorageResult<u64> {
        let mut total = 0;
        for meta in self.objects_under(src).await? {
            let from_path = self.backend_path(&meta.location);
            let Some(relative) = relative_to(src, &from_path) else {
                continue;
            };
            let to = self.key(&join(dst, relative));
            self.store.copy(&meta.location, &to).await?;

            if file_name(&from_path) != DIR_MARKER {
                total += meta.size as u64;
                if let Some(cb) = &progress {
                    cb(meta.size as u64);
                }
            }
        }
        Ok(total)
    }
}

#[async_trait]
impl StorageAdapter for ObjectAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    fn root_path(&self) -> String {
        if self.prefix.is_empty() {
            self.label.clone()
        } else {
            format!("{}/{}", self.label.trim_end_matches('/'), self.prefix)
        }
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<EntryDescriptor>> {
        let path = normalize(path)?;
        let prefix = self.dir_prefix(&path);
        let listing = self.store.list_with_delimiter(prefix.as_ref()).await?;

        let mut entries = Vec::new();
        for dir in &listing.common_prefixes {
            entries.push(EntryDescriptor::directory(&self.backend_path(dir), 0));
        }
        let mut saw_marker = false;
        for meta in &listing.objects {
            if meta.location.filename() == Some(DIR_MARKER) {
                saw_marker = true;
                continue;
            }
            entries.push(self.file_descriptor(meta));
        }

        if entries.is_empty() && !saw_marker && !is_root(&path) {
            return match self.head_file(&path).await? {
                Some(_) => Err(StorageError::Conflict(format!("not a directory: {}", path))),
                None => Err(StorageError::not_found(path)),
            };
        }
        debug!("Listed {} entries under {}", entries.len(), path);
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> StorageResult<EntryDescriptor> {
        let path = normalize(path)?;
        if let Some(meta) = self.head_file(&path).await? {
            return Ok(self.file_descriptor(&meta));
        }
        if self.dir_exists(&path).await? {
            return Ok(EntryDescriptor::directory(&path, 0));
        }
        Err(StorageError::not_found(path))
    }

    async fn read(&self, path: &str) -> StorageResult<ByteReader> {
        let path = normalize(path)?;
        if is_root(&path) {
            return Err(StorageError::Unsupported("cannot read a directory: /".into()));
        }
        let result = self.store.get(&self.key(&path)).await?;
        let stream = result
            .into_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn write(&self, path: &str, mut data: ByteReader) -> StorageResult<u64> {
        let path = normalize(path)?;
        if is_root(&path) {
            return Err(StorageError::Conflict("cannot overwrite the root".into()));
        }
        Self::reject_reserved(&path)?;
        if self.head_file(&path).await?.is_none() && self.dir_exists(&path).await? {
            return Err(StorageError::Conflict(format!(
                "a directory exists at {}",
                path
            )));
        }

        // Multipart upload once the buffer fills, a single PUT otherwise
        let mut writer = BufWriter::new(self.store.clone(), self.key(&path));
        let uploaded = match tokio::io::copy(&mut data, &mut writer).await {
            Ok(written) => writer.shutdown().await.map(|()| written),
            Err(e) => Err(e),
        };
        let written = match uploaded {
            Ok(written) => written,
            Err(e) => {
                // Release any multipart upload already started
                if let Err(abort) = writer.abort().await {
                    warn!("Failed to abort upload of {}: {}", path, abort);
                }
                return Err(StorageError::from_io(e, &path));
            }
        };

        debug!("Uploaded {} bytes to {}", written, path);
        Ok(written)
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let path = normalize(path)?;
        if is_root(&path) {
            return Err(StorageError::PermissionDenied(
                "refusing to delete the storage root".into(),
            ));
        }

        if self.head_file(&path).await?.is_some() {
            self.store.delete(&self.key(&path)).await?;
            return Ok(());
        }

        let objects = self.objects_under(&path).await?;
        if objects.is_empty() {
            return Err(StorageError::not_found(path));
        }
        for meta in &objects {
            self.store.delete(&meta.location).await?;
        }
        info!("Deleted {} object(s) under {}", objects.len(), path);
        Ok(())
    }

    async fn make_container(&self, path: &str) -> StorageResult<()> {
        let path = normalize(path)?;
        if is_root(&path) {
            return Ok(());
        }
        if self.head_file(&path).await?.is_some() {
            return Err(StorageError::Conflict(format!("a file exists at {}", path)));
        }
        self.store
            .put(&self.marker_key(&path), PutPayload::from(Vec::<u8>::new()))
            .await?;
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> StorageResult<()> {
        let src = normalize(src)?;
        let dst = normalize(dst)?;
        Self::reject_reserved(&dst)?;
        if let Some(_meta) = self.head_file(&src).await? {
            self.store.rename(&self.key(&src), &self.key(&dst)).await?;
            return Ok(());
        }
        if is_within(&src, &dst) {
            return Err(StorageError::Conflict(format!("cannot move {} into itself", src)));
        }
        self.copy_objects(&src, &dst, None).await?;
        self.delete(&src).await
    }

    async fn copy(&self, src: &str, dst: &str, progress: Option<ProgressFn>) -> StorageResult<u64> {
        let src = normalize(src)?;
        let dst = normalize(dst)?;
        Self::reject_reserved(&dst)?;
        if let Some(meta) = self.head_file(&src).await? {
            self.store.copy(&meta.location, &self.key(&dst)).await?;
            if let Some(cb) = &progress {
                cb(meta.size as u64);
            }
            return Ok(meta.size as u64);
        }
        if !self.dir_exists(&src).await? {
            return Err(StorageError::not_found(src));
        }
        if is_within(&src, &dst) {
            // Falls through to the generic walker, which reports the conflict
            return copy_within(self, &src, &dst, progress).await;
        }
        self.copy_objects(&src, &dst, progress).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{read_to_vec, write_bytes};

    #[tokio::test]
    async fn test_write_read_stat() {
        let store = ObjectAdapter::in_memory();
        write_bytes(&store, "/photos/cat.jpg", vec![9u8; 2048]).await.unwrap();

        assert_eq!(read_to_vec(&store, "/photos/cat.jpg").await.unwrap(), vec![9u8; 2048]);
        let entry = store.stat("/photos/cat.jpg").await.unwrap();
        assert_eq!(entry.size, 2048);
        assert_eq!(entry.content_type.as_deref(), Some("image/jpeg"));
        assert!(store.stat("/photos").await.unwrap().is_dir());
    }

    #[tokio::test]
    async fn test_prefix_root() {
        let inner: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let store = ObjectAdapter::new(inner.clone(), "/tenant-a/", "memory://");
        write_bytes(&store, "/a.txt", b"a".to_vec()).await.unwrap();

        inner
            .head(&ObjectPath::from("tenant-a/a.txt"))
            .await
            .unwrap();
        let entries = store.list("/").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].path, "/a.txt");
    }

    #[tokio::test]
    async fn test_empty_directory_marker_hidden() {
        let store = ObjectAdapter::in_memory();
        store.make_container("/empty").await.unwrap();

        assert!(store.stat("/empty").await.unwrap().is_dir());
        assert!(store.list("/empty").await.unwrap().is_empty());
        let root = store.list("/").await.unwrap();
        assert_eq!(root.len(), 1);
        assert_eq!(root[0].name, "empty");
    }

    #[tokio::test]
    async fn test_user_keep_files_are_listed() {
        let store = ObjectAdapter::in_memory();
        store.make_container("/docs").await.unwrap();
        write_bytes(&store, "/docs/.keep", Vec::new()).await.unwrap();

        let entries = store.list("/docs").await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, ".keep");

        let err = write_bytes(&store, "/docs/.polystore-dir", b"x".to_vec()).await.unwrap_err();
        assert!(matches!(err, StorageError::PermissionDenied(_)));
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_object() {
        let store = ObjectAdapter::in_memory();
        write_bytes(&store, "/f.bin", vec![1u8; 4096]).await.unwrap();

        let failing = tokio::io::AsyncReadExt::chain(
            &b"partial"[..],
            tokio_util::io::StreamReader::new(futures_util::stream::iter(vec![Err::<
                bytes::Bytes,
                io::Error,
            >(
                io::Error::new(io::ErrorKind::ConnectionReset, "reset"),
            )])),
        );
        let err = store.write("/f.bin", Box::new(failing)).await.unwrap_err();
        assert!(matches!(err, StorageError::Transient(_)));
        assert_eq!(read_to_vec(&store, "/f.bin").await.unwrap(), vec![1u8; 4096]);
    }

    #[tokio::test]
    async fn test_list_missing_is_not_found() {
        let store = ObjectAdapter::in_memory();
        assert!(matches!(store.list("/nope").await, Err(StorageError::NotFound(_))));
        assert!(matches!(store.read("/nope").await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_directory_copy_and_rename() {
        let store = ObjectAdapter::in_memory();
        write_bytes(&store, "/d/a.txt", b"aa".to_vec()).await.unwrap();
        write_bytes(&store, "/d/sub/b.txt", b"bbb".to_vec()).await.unwrap();

        let copied = store.copy("/d", "/e", None).await.unwrap();
        assert_eq!(copied, 5);
        assert_eq!(read_to_vec(&store, "/e/sub/b.txt").await.unwrap(), b"bbb");

        store.rename("/e", "/f").await.unwrap();
        assert!(store.stat("/e").await.is_err());
        assert_eq!(read_to_vec(&store, "/f/a.txt").await.unwrap(), b"aa");
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let store = ObjectAdapter::in_memory();
        write_bytes(&store, "/d/a.txt", b"a".to_vec()).await.unwrap();
        write_bytes(&store, "/d/b/c.txt", b"c".to_vec()).await.unwrap();
        store.delete("/d").await.unwrap();
        assert!(matches!(store.stat("/d").await, Err(StorageError::NotFound(_))));
        assert!(matches!(store.delete("/d").await, Err(StorageError::NotFound(_))));
    }
}
