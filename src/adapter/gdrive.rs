//! Google Drive adapter (Drive v3 REST)
//!
//! Drive addresses everything by opaque file id and allows duplicate names,
//! so backend paths are resolved one segment at a time (first match wins)
//! and cached. Access tokens come from the OAuth refresh-token flow and are
//! renewed shortly before they expire.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::TryStreamExt;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tokio::sync::Mutex;
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::{debug, info};

use super::{copy_within, ByteReader, ProgressFn, StorageAdapter};
use crate::error::{StorageError, StorageResult};
use crate::path_utils::{ancestors, file_name, is_root, is_within, join, normalize, parent};
use crate::transfer::stream::MeteredReader;
use crate::types::{BackendKind, EntryDescriptor, SpaceInfo};

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const API_BASE: &str = "https://www.googleapis.com/drive/v3";
const UPLOAD_BASE: &str = "https://www.googleapis.com/upload/drive/v3";
const FOLDER_MIME: &str = "application/vnd.google-apps.folder";
const FILE_FIELDS: &str = "id,name,mimeType,size,modifiedTime";

/// Renew the access token this long before it expires
const TOKEN_SLACK: Duration = Duration::from_secs(60);

/// OAuth client credentials plus a long-lived refresh token
#[derive(Debug, Clone)]
pub struct DriveCredentials {
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default = "default_expiry")]
    expires_in: u64,
}

fn default_expiry() -> u64 {
    3600
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DriveFile {
    id: String,
    name: String,
    mime_type: String,
    /// Sizes arrive as decimal strings; folders and Docs have none
    #[serde(default)]
    size: Option<String>,
    #[serde(default)]
    modified_time: Option<String>,
}

impl DriveFile {
    fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }

    fn descriptor(&self, path: &str) -> EntryDescriptor {
        let modified = self
            .modified_time
            .as_deref()
            .and_then(|t| chrono::DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.timestamp())
            .unwrap_or(0);
        if self.is_folder() {
            EntryDescriptor::directory(path, modified)
        } else {
            let size = self.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
            let mut entry = EntryDescriptor::file(path, size, modified);
            entry.content_type = Some(self.mime_type.clone());
            entry
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileListResponse {
    #[serde(default)]
    files: Vec<DriveFile>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StorageQuota {
    limit: Option<String>,
    usage: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AboutResponse {
    storage_quota: StorageQuota,
}

impl StorageQuota {
    fn space(&self) -> SpaceInfo {
        let limit = self.limit.as_deref().and_then(|s| s.parse::<u64>().ok());
        let usage = self.usage.as_deref().and_then(|s| s.parse::<u64>().ok());
        match (limit, usage) {
            (Some(limit), Some(usage)) => SpaceInfo::known(limit.saturating_sub(usage), limit),
            // No limit: unlimited/pooled storage
            _ => SpaceInfo::UNKNOWN,
        }
    }
}

impl From<reqwest::Error> for StorageError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => status_error(status, &err.to_string()),
            None => StorageError::Transient(err.to_string()),
        }
    }
}

/// Map an HTTP failure status onto the taxonomy
fn status_error(status: StatusCode, context: &str) -> StorageError {
    match status {
        StatusCode::NOT_FOUND => StorageError::NotFound(context.to_string()),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            StorageError::PermissionDenied(format!("{} ({})", context, status))
        }
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            StorageError::Conflict(format!("{} ({})", context, status))
        }
        StatusCode::NOT_IMPLEMENTED => StorageError::Unsupported(context.to_string()),
        _ => StorageError::Transient(format!("{} ({})", context, status)),
    }
}

/// Quote a name for a Drive `q` expression
fn escape_query(name: &str) -> String {
    name.replace('\\', "\\\\").replace('\'', "\\'")
}

/// Session URI returned when a resumable upload is opened
fn upload_location(headers: &reqwest::header::HeaderMap, path: &str) -> StorageResult<String> {
    headers
        .get(reqwest::header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| StorageError::Transient(format!("{}: upload session has no location", path)))
}

/// Decide what an existing destination means for a copy or move: `None`
/// when nothing is replaced, the id to remove afterwards when a file is
/// overwritten.
fn replacement(
    src: &DriveFile,
    existing: Option<&DriveFile>,
    dst: &str,
) -> StorageResult<Option<String>> {
    match existing {
        None => Ok(None),
        Some(existing) if existing.id == src.id => Ok(None),
        Some(existing) if existing.is_folder() || src.is_folder() => Err(StorageError::Conflict(
            format!("{} already exists and cannot be replaced", dst),
        )),
        Some(existing) => Ok(Some(existing.id.clone())),
    }
}

struct CachedToken {
    value: String,
    expires_at: Instant,
}

/// Google Drive adapter
pub struct DriveAdapter {
    client: Client,
    credentials: DriveCredentials,
    root_id: String,
    token: Mutex<Option<CachedToken>>,
    /// Resolved path -> file id
    ids: DashMap<String, String>,
}

impl DriveAdapter {
    /// Build the adapter and fetch a first access token to prove the
    /// credentials work.
    pub async fn connect(credentials: DriveCredentials, root_folder_id: Option<String>) -> StorageResult<Self> {
        let adapter = Self {
            client: Client::new(),
            credentials,
            root_id: root_folder_id.unwrap_or_else(|| "root".to_string()),
            token: Mutex::new(None),
            ids: DashMap::new(),
        };
        adapter.access_token().await?;
        info!("Google Drive adapter ready (root folder {})", adapter.root_id);
        Ok(adapter)
    }

    async fn access_token(&self) -> StorageResult<String> {
        let mut guard = self.token.lock().await;
        if let Some(token) = guard.as_ref() {
            if token.expires_at > Instant::now() + TOKEN_SLACK {
                return Ok(token.value.clone());
            }
        }

        debug!("Refreshing Google Drive access token");
        let resp = self
            .client
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.credentials.client_id.as_str()),
                ("client_secret", self.credentials.client_secret.as_str()),
                ("refresh_token", self.credentials.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(match status {
                StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                    StorageError::PermissionDenied(format!("token refresh rejected: {}", body))
                }
                _ => status_error(status, "token refresh"),
            });
        }
        let token: TokenResponse = resp.json().await?;
        let value = token.access_token.clone();
        *guard = Some(CachedToken {
            value: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in),
        });
        Ok(value)
    }

    async fn request(&self, method: Method, url: &str) -> StorageResult<RequestBuilder> {
        let token = self.access_token().await?;
        Ok(self.client.request(method, url).bearer_auth(token))
    }

    /// Send and turn non-2xx statuses into errors.
    async fn send(builder: RequestBuilder, context: &str) -> StorageResult<Response> {
        let resp = builder.send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        debug!("Drive request for {} failed: {} {}", context, status, body);
        Err(status_error(status, context))
    }

    /// Every non-trashed child of a folder, following pagination
    async fn children(&self, folder_id: &str) -> StorageResult<Vec<DriveFile>> {
        let query = format!("'{}' in parents and trashed = false", escape_query(folder_id));
        self.query(&query).await
    }

    async fn query(&self, query: &str) -> StorageResult<Vec<DriveFile>> {
        let fields = format!("nextPageToken,files({})", FILE_FIELDS);
        let mut files = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let mut params = vec![
                ("q", query.to_string()),
                ("fields", fields.clone()),
                ("pageSize", "1000".to_string()),
                ("supportsAllDrives", "true".to_string()),
                ("includeItemsFromAllDrives", "true".to_string()),
            ];
            if let Some(token) = &page_token {
                params.push(("pageToken", token.clone()));
            }
            let builder = self
                .request(Method::GET, &format!("{}/files", API_BASE))
                .await?
                .query(&params);
            let page: FileListResponse = Self::send(builder, "list").await?.json().await?;
            files.extend(page.files);
            match page.next_page_token {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }
        Ok(files)
    }

    async fn child_named(&self, folder_id: &str, name: &str) -> StorageResult<Option<DriveFile>> {
        let query = format!(
            "'{}' in parents and name = '{}' and trashed = false",
            escape_query(folder_id),
            escape_query(name)
        );
        Ok(self.query(&query).await?.into_iter().next())
    }

    async fn get_file(&self, id: &str) -> StorageResult<DriveFile> {
        let builder = self
            .request(Method::GET, &format!("{}/files/{}", API_BASE, id))
            .await?
            .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")]);
        Ok(Self::send(builder, id).await?.json().await?)
    }

    /// Resolve a normalized path to its Drive file, `None` when absent.
    async fn lookup(&self, path: &str) -> StorageResult<Option<DriveFile>> {
        if is_root(path) {
            return self.get_file(&self.root_id).await.map(Some);
        }
        if let Some(id) = self.ids.get(path).map(|e| e.value().clone()) {
            match self.get_file(&id).await {
                Ok(file) => return Ok(Some(file)),
                Err(StorageError::NotFound(_)) => {
                    self.ids.remove(path);
                }
                Err(e) => return Err(e),
            }
        }

        let mut current_id = self.root_id.clone();
        let mut current_path = "/".to_string();
        let mut found = None;
        for segment in path.trim_start_matches('/').split('/') {
            current_path = join(&current_path, segment);
            match self.child_named(&current_id, segment).await? {
                Some(file) => {
                    self.ids.insert(current_path.clone(), file.id.clone());
                    current_id = file.id.clone();
                    found = Some(file);
                }
                None => return Ok(None),
            }
        }
        Ok(found)
    }

    async fn require(&self, path: &str) -> StorageResult<DriveFile> {
        self.lookup(path)
            .await?
            .ok_or_else(|| StorageError::not_found(path))
    }

    /// Folder id for `path`, creating missing folders along the way.
    async fn ensure_folder(&self, path: &str) -> StorageResult<String> {
        if is_root(path) {
            return Ok(self.root_id.clone());
        }
        let mut chain = ancestors(path);
        chain.push(path.to_string());

        let mut parent_id = self.root_id.clone();
        for folder in chain {
            parent_id = match self.lookup(&folder).await? {
                Some(existing) if existing.is_folder() => existing.id,
                Some(_) => {
                    return Err(StorageError::Conflict(format!("a file exists at {}", folder)));
                }
                None => {
                    let created = self
                        .create_metadata(file_name(&folder), &parent_id, Some(FOLDER_MIME))
                        .await?;
                    self.ids.insert(folder.clone(), created.id.clone());
                    debug!("Created Drive folder {}", folder);
                    created.id
                }
            };
        }
        Ok(parent_id)
    }

    async fn create_metadata(&self, name: &str, parent_id: &str, mime: Option<&str>) -> StorageResult<DriveFile> {
        let mut body = json!({ "name": name, "parents": [parent_id] });
        if let Some(mime) = mime {
            body["mimeType"] = json!(mime);
        }
        let builder = self
            .request(Method::POST, &format!("{}/files", API_BASE))
            .await?
            .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
            .json(&body);
        Ok(Self::send(builder, name).await?.json().await?)
    }

    /// Create a file in one resumable upload. Drive only materializes the
    /// file when the last byte arrives, so a failed upload leaves nothing.
    async fn upload_new(
        &self,
        path: &str,
        parent_id: &str,
        body: reqwest::Body,
    ) -> StorageResult<DriveFile> {
        let builder = self
            .request(Method::POST, &format!("{}/files", UPLOAD_BASE))
            .await?
            .query(&[
                ("uploadType", "resumable"),
                ("fields", FILE_FIELDS),
                ("supportsAllDrives", "true"),
            ])
            .json(&json!({ "name": file_name(path), "parents": [parent_id] }));
        let session = Self::send(builder, path).await?;
        let location = upload_location(session.headers(), path)?;

        let builder = self.request(Method::PUT, &location).await?.body(body);
        Ok(Self::send(builder, path).await?.json().await?)
    }

    /// Permanently remove a file by id.
    async fn remove_id(&self, id: &str, path: &str) -> StorageResult<()> {
        let builder = self
            .request(Method::DELETE, &format!("{}/files/{}", API_BASE, id))
            .await?
            .query(&[("supportsAllDrives", "true")]);
        Self::send(builder, path).await?;
        Ok(())
    }

    /// Id of the entry a copy or move onto `dst` replaces, if any.
    async fn displaced(&self, src: &DriveFile, dst: &str) -> StorageResult<Option<String>> {
        let existing = self.lookup(dst).await?;
        replacement(src, existing.as_ref(), dst)
    }

    /// Forget cached ids at or beneath `path`
    fn invalidate(&self, path: &str) {
        self.ids.retain(|cached, _| !is_within(path, cached));
    }
}

#[async_trait]
impl StorageAdapter for DriveAdapter {
    fn kind(&self) -> BackendKind {
        BackendKind::Gdrive
    }

    fn root_path(&self) -> String {
        format!("gdrive://{}", self.root_id)
    }

    async fn list(&self, path: &str) -> StorageResult<Vec<EntryDescriptor>> {
        let path = normalize(path)?;
        let folder = self.require(&path).await?;
        if !folder.is_folder() {
            return Err(StorageError::Conflict(format!("not a directory: {}", path)));
        }
        let entries = self
            .children(&folder.id)
            .await?
            .into_iter()
            .map(|file| {
                let child = join(&path, &file.name);
                self.ids.insert(child.clone(), file.id.clone());
                file.descriptor(&child)
            })
            .collect();
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> StorageResult<EntryDescriptor> {
        let path = normalize(path)?;
        let file = self.require(&path).await?;
        Ok(file.descriptor(&path))
    }

    async fn read(&self, path: &str) -> StorageResult<ByteReader> {
        let path = normalize(path)?;
        let file = self.require(&path).await?;
        if file.is_folder() {
            return Err(StorageError::Unsupported(format!("cannot read a directory: {}", path)));
        }
        let builder = self
            .request(Method::GET, &format!("{}/files/{}", API_BASE, file.id))
            .await?
            .query(&[("alt", "media"), ("supportsAllDrives", "true")]);
        let resp = Self::send(builder, &path).await?;
        let stream = resp
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn write(&self, path: &str, data: ByteReader) -> StorageResult<u64> {
        let path = normalize(path)?;
        if is_root(&path) {
            return Err(StorageError::Conflict("cannot overwrite the root".into()));
        }

        // Ok(file id) to replace content, Err(parent id) to create
        let target = match self.lookup(&path).await? {
            Some(existing) if existing.is_folder() => {
                return Err(StorageError::Conflict(format!("a directory exists at {}", path)));
            }
            Some(existing) => Ok(existing.id),
            None => {
                let parent_path = parent(&path).unwrap_or_else(|| "/".to_string());
                Err(self.ensure_folder(&parent_path).await?)
            }
        };

        let counter = Arc::new(AtomicU64::new(0));
        let counted: ProgressFn = {
            let counter = counter.clone();
            Arc::new(move |n| {
                counter.fetch_add(n, Ordering::Relaxed);
            })
        };
        let body = reqwest::Body::wrap_stream(ReaderStream::new(
            MeteredReader::new(data).with_progress(counted),
        ));
        match target {
            // Content replacement is atomic: a failed PATCH keeps the old revision
            Ok(file_id) => {
                let builder = self
                    .request(Method::PATCH, &format!("{}/files/{}", UPLOAD_BASE, file_id))
                    .await?
                    .query(&[("uploadType", "media"), ("supportsAllDrives", "true")])
                    .body(body);
                Self::send(builder, &path).await?;
            }
            Err(parent_id) => {
                let created = self.upload_new(&path, &parent_id, body).await?;
                self.ids.insert(path.clone(), created.id);
            }
        }

        let written = counter.load(Ordering::Relaxed);
        debug!("Uploaded {} bytes to Drive {}", written, path);
        Ok(written)
    }

    async fn delete(&self, path: &str) -> StorageResult<()> {
        let path = normalize(path)?;
        if is_root(&path) {
            return Err(StorageError::PermissionDenied(
                "refusing to delete the storage root".into(),
            ));
        }
        let file = self.require(&path).await?;
        // Deleting a folder removes its descendants too
        let builder = self
            .request(Method::DELETE, &format!("{}/files/{}", API_BASE, file.id))
            .await?
            .query(&[("supportsAllDrives", "true")]);
        Self::send(builder, &path).await?;
        self.invalidate(&path);
        info!("Deleted Drive entry {}", path);
        Ok(())
    }

    async fn make_container(&self, path: &str) -> StorageResult<()> {
        let path = normalize(path)?;
        self.ensure_folder(&path).await.map(|_| ())
    }

    async fn rename(&self, src: &str, dst: &str) -> StorageResult<()> {
        let src = normalize(src)?;
        let dst = normalize(dst)?;
        if is_within(&src, &dst) {
            return Err(StorageError::Conflict(format!("cannot move {} into itself", src)));
        }
        let file = self.require(&src).await?;
        let displaced = self.displaced(&file, &dst).await?;
        let old_parent = parent(&src).unwrap_or_else(|| "/".to_string());
        let new_parent = parent(&dst).unwrap_or_else(|| "/".to_string());
        let old_parent_id = self.ensure_folder(&old_parent).await?;
        let new_parent_id = self.ensure_folder(&new_parent).await?;

        let mut builder = self
            .request(Method::PATCH, &format!("{}/files/{}", API_BASE, file.id))
            .await?
            .query(&[("supportsAllDrives", "true")])
            .json(&json!({ "name": file_name(&dst) }));
        if old_parent_id != new_parent_id {
            builder = builder.query(&[
                ("addParents", new_parent_id.as_str()),
                ("removeParents", old_parent_id.as_str()),
            ]);
        }
        Self::send(builder, &src).await?;
        if let Some(id) = displaced {
            self.remove_id(&id, &dst).await?;
        }

        self.invalidate(&src);
        self.ids.insert(dst, file.id);
        Ok(())
    }

    async fn copy(&self, src: &str, dst: &str, progress: Option<ProgressFn>) -> StorageResult<u64> {
        let src = normalize(src)?;
        let dst = normalize(dst)?;
        let file = self.require(&src).await?;
        if file.is_folder() {
            // Drive cannot copy folders server-side
            return copy_within(self, &src, &dst, progress).await;
        }

        let existing = self.lookup(&dst).await?;
        if existing.as_ref().is_some_and(|e| e.id == file.id) {
            return Ok(0);
        }
        let displaced = replacement(&file, existing.as_ref(), &dst)?;
        let parent_path = parent(&dst).unwrap_or_else(|| "/".to_string());
        let parent_id = self.ensure_folder(&parent_path).await?;
        let builder = self
            .request(Method::POST, &format!("{}/files/{}/copy", API_BASE, file.id))
            .await?
            .query(&[("fields", FILE_FIELDS), ("supportsAllDrives", "true")])
            .json(&json!({ "name": file_name(&dst), "parents": [parent_id] }));
        let copied: DriveFile = Self::send(builder, &src).await?.json().await?;
        if let Some(id) = displaced {
            self.remove_id(&id, &dst).await?;
        }
        self.ids.insert(dst, copied.id.clone());

        let size = file.size.as_deref().and_then(|s| s.parse().ok()).unwrap_or(0);
        if let Some(cb) = &progress {
            cb(size);
        }
        Ok(size)
    }

    async fn space(&self) -> StorageResult<SpaceInfo> {
        let builder = self
            .request(Method::GET, &format!("{}/about", API_BASE))
            .await?
            .query(&[("fields", "storageQuota")]);
        let about: AboutResponse = Self::send(builder, "about").await?.json().await?;
        Ok(about.storage_quota.space())
    }
}
