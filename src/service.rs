//! Storage service facade
//!
//! Bundles the registry, transfer orchestrator, archive engine, operation
//! manager and progress hub behind the operation surface consumed by the
//! HTTP and real-time transport layers. Short operations return their result
//! directly; compress, decompress and background transfers return an
//! operation id and report through the hub.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::adapter::{ByteReader, StorageAdapter};
use crate::archive::{ArchiveEngine, ArchiveListing, CompressRequest, DecompressRequest};
use crate::config::{
    security_file, storages_file, BackendConfig, ConfigStorage, PolicyStorage, SECURITY_FILE,
    STORAGES_FILE,
};
use crate::error::{StorageError, StorageResult};
use crate::progress::{OperationKind, ProgressHub, ProgressReporter, Subscription};
use crate::registry::{BackendStatus, LoadReport, StorageRegistry};
use crate::security::{EndpointReport, EndpointValidator, SecurityPolicy};
use crate::transfer::{OperationInfo, OperationManager, TransferOrchestrator, TransferOutcome};
use crate::types::{EntryDescriptor, SpaceInfo};

/// Copy or move
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Copy,
    Move,
}

/// Cross-backend transfer request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    pub src_backend: String,
    pub src_path: String,
    pub dst_backend: String,
    pub dst_path: String,
    pub mode: TransferMode,
}

impl TransferRequest {
    pub fn copy(src_backend: &str, src_path: &str, dst_backend: &str, dst_path: &str) -> Self {
        Self {
            src_backend: src_backend.to_string(),
            src_path: src_path.to_string(),
            dst_backend: dst_backend.to_string(),
            dst_path: dst_path.to_string(),
            mode: TransferMode::Copy,
        }
    }

    pub fn moving(src_backend: &str, src_path: &str, dst_backend: &str, dst_path: &str) -> Self {
        Self {
            mode: TransferMode::Move,
            ..Self::copy(src_backend, src_path, dst_backend, dst_path)
        }
    }

    fn kind(&self) -> OperationKind {
        match self.mode {
            TransferMode::Copy => OperationKind::Copy,
            TransferMode::Move => OperationKind::Move,
        }
    }
}

pub struct StorageService {
    registry: Arc<StorageRegistry>,
    orchestrator: Arc<TransferOrchestrator>,
    archive: Arc<ArchiveEngine>,
    hub: Arc<ProgressHub>,
    operations: Arc<OperationManager>,
    policy: RwLock<SecurityPolicy>,
    policy_store: Option<PolicyStorage>,
    cancel_listener: JoinHandle<()>,
}

impl Drop for StorageService {
    fn drop(&mut self) {
        self.cancel_listener.abort();
    }
}

impl StorageService {
    /// Open the service over a configuration directory (default
    /// `~/.polystore`), loading the policy first and then every backend.
    pub async fn open(config_dir: Option<PathBuf>) -> StorageResult<(Self, LoadReport)> {
        let (storages, security) = match config_dir {
            Some(dir) => (dir.join(STORAGES_FILE), dir.join(SECURITY_FILE)),
            None => (storages_file()?, security_file()?),
        };

        let policy_store = PolicyStorage::with_path(security);
        let policy = policy_store.load().await?;
        info!(
            "Loaded security policy (allow local addresses: {})",
            policy.allow_local_addresses
        );

        let registry = StorageRegistry::with_storage(ConfigStorage::with_path(storages))
            .with_validator(EndpointValidator::from_policy(&policy));
        let report = registry.load_from_storage().await?;

        let service = Self::new(Arc::new(registry), policy, Some(policy_store));
        Ok((service, report))
    }

    /// Assemble a service around an existing registry. Must be called from
    /// within a Tokio runtime.
    pub fn new(
        registry: Arc<StorageRegistry>,
        policy: SecurityPolicy,
        policy_store: Option<PolicyStorage>,
    ) -> Self {
        registry.set_validator(EndpointValidator::from_policy(&policy));
        let hub = Arc::new(ProgressHub::new());
        let operations = Arc::new(OperationManager::default());
        let cancel_listener = operations.listen_for_cancels(hub.cancel_requests());

        Self {
            orchestrator: Arc::new(TransferOrchestrator::new(registry.clone())),
            archive: Arc::new(ArchiveEngine::new(registry.clone())),
            registry,
            hub,
            operations,
            policy: RwLock::new(policy),
            policy_store,
            cancel_listener,
        }
    }

    /// In-memory service without persistence.
    pub fn ephemeral(registry: Arc<StorageRegistry>) -> Self {
        Self::new(registry, SecurityPolicy::default(), None)
    }

    pub fn registry(&self) -> &Arc<StorageRegistry> {
        &self.registry
    }

    pub fn hub(&self) -> &Arc<ProgressHub> {
        &self.hub
    }

    fn adapter(&self, backend_id: &str) -> StorageResult<Arc<dyn StorageAdapter>> {
        self.registry.get(backend_id)
    }

    // ------------------------------------------------------------------
    // File operations
    // ------------------------------------------------------------------

    pub async fn list(&self, backend_id: &str, path: &str) -> StorageResult<Vec<EntryDescriptor>> {
        self.adapter(backend_id)?.list(path).await
    }

    pub async fn stat(&self, backend_id: &str, path: &str) -> StorageResult<EntryDescriptor> {
        self.adapter(backend_id)?.stat(path).await
    }

    pub async fn read(&self, backend_id: &str, path: &str) -> StorageResult<ByteReader> {
        self.adapter(backend_id)?.read(path).await
    }

    pub async fn write(&self, backend_id: &str, path: &str, data: ByteReader) -> StorageResult<u64> {
        self.adapter(backend_id)?.write(path, data).await
    }

    pub async fn delete(&self, backend_id: &str, path: &str) -> StorageResult<()> {
        self.adapter(backend_id)?.delete(path).await
    }

    pub async fn make_container(&self, backend_id: &str, path: &str) -> StorageResult<()> {
        self.adapter(backend_id)?.make_container(path).await
    }

    pub async fn rename(&self, backend_id: &str, src: &str, dst: &str) -> StorageResult<()> {
        self.adapter(backend_id)?.rename(src, dst).await
    }

    pub async fn copy(&self, backend_id: &str, src: &str, dst: &str) -> StorageResult<u64> {
        self.adapter(backend_id)?.copy(src, dst, None).await
    }

    pub async fn space(&self, backend_id: &str) -> StorageResult<SpaceInfo> {
        self.adapter(backend_id)?.space().await
    }

    // ------------------------------------------------------------------
    // Backend configuration
    // ------------------------------------------------------------------

    pub fn list_backends(&self) -> Vec<BackendStatus> {
        self.registry.list_all()
    }

    pub fn default_backend(&self) -> Option<String> {
        self.registry.default_id()
    }

    pub async fn add_backend(&self, config: BackendConfig) -> StorageResult<()> {
        self.registry.add_configuration(config).await?;
        self.registry.persist().await
    }

    pub async fn remove_backend(&self, backend_id: &str) -> StorageResult<()> {
        self.registry.remove_configuration(backend_id).await?;
        self.registry.persist().await
    }

    pub async fn set_default_backend(&self, backend_id: &str) -> StorageResult<()> {
        self.registry.set_default(backend_id)?;
        self.registry.persist().await
    }

    // ------------------------------------------------------------------
    // Transfers and archives
    // ------------------------------------------------------------------

    /// Run a transfer to completion without progress events.
    pub async fn transfer(&self, request: &TransferRequest) -> StorageResult<TransferOutcome> {
        let token = CancellationToken::new();
        run_transfer(&self.orchestrator, request, None, &token).await
    }

    /// Start a transfer in the background; returns its operation id.
    pub fn start_transfer(&self, request: TransferRequest) -> String {
        let orchestrator = self.orchestrator.clone();
        let description = format!(
            "{:?} {}:{} -> {}:{}",
            request.mode, request.src_backend, request.src_path, request.dst_backend, request.dst_path
        );
        self.launch(request.kind(), description, move |reporter, token| async move {
            let total = orchestrator
                .total_bytes(&request.src_backend, &request.src_path)
                .await?;
            reporter.set_total(Some(total));
            let outcome =
                run_transfer(&orchestrator, &request, Some(reporter.clone()), &token).await?;
            for warning in &outcome.warnings {
                warn!("Operation {}: {}", reporter.operation_id(), warning);
            }
            Ok(format!(
                "{:?} of {} finished ({} bytes)",
                request.mode, request.src_path, outcome.bytes
            ))
        })
    }

    /// Start building an archive; returns its operation id.
    pub fn start_compress(&self, request: CompressRequest) -> String {
        let archive = self.archive.clone();
        let description = format!("compress {} source(s) -> {}", request.sources.len(), request.output_path);
        self.launch(OperationKind::Compress, description, move |reporter, token| async move {
            let summary = archive.compress(&request, Some(reporter), &token).await?;
            Ok(format!(
                "Created {} ({} files, {} bytes)",
                summary.output_path, summary.files, summary.bytes
            ))
        })
    }

    /// Start extracting an archive; returns its operation id.
    pub fn start_decompress(&self, request: DecompressRequest) -> String {
        let archive = self.archive.clone();
        let description = format!("decompress {} -> {}", request.archive_path, request.output_path);
        self.launch(OperationKind::Decompress, description, move |reporter, token| async move {
            let summary = archive.decompress(&request, Some(reporter), &token).await?;
            Ok(format!(
                "Extracted {} files into {}",
                summary.files, summary.output_path
            ))
        })
    }

    pub async fn list_archive(&self, backend_id: &str, path: &str) -> StorageResult<ArchiveListing> {
        self.archive.list_archive(backend_id, path).await
    }

    pub fn operations(&self) -> Vec<OperationInfo> {
        self.operations.list()
    }

    pub fn cancel_operation(&self, operation_id: &str) -> bool {
        self.operations.cancel(operation_id)
    }

    /// Spawn tracked work that reports through a fresh [`ProgressReporter`]
    /// and ends with a terminal sample plus a notification or error event.
    fn launch<F, Fut>(&self, kind: OperationKind, description: String, work: F) -> String
    where
        F: FnOnce(Arc<ProgressReporter>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = StorageResult<String>> + Send + 'static,
    {
        let hub = self.hub.clone();
        let (operation_id, _handle) = self.operations.spawn(kind, description, move |id, token| async move {
            let reporter = ProgressReporter::new(hub.clone(), id.clone(), kind, None);
            reporter.start();

            let result = work(reporter.clone(), token).await;
            reporter.finish(&result);
            match result {
                Ok(message) => {
                    info!("Operation {} finished: {}", id, message);
                    hub.notify(Some(&id), message);
                }
                Err(StorageError::Cancelled) => {
                    info!("Operation {} cancelled", id);
                }
                Err(e) => {
                    warn!("Operation {} failed: {}", id, e);
                    hub.error(Some(&id), e.to_string());
                }
            }
        });
        operation_id
    }

    // ------------------------------------------------------------------
    // Security policy
    // ------------------------------------------------------------------

    pub fn policy(&self) -> SecurityPolicy {
        *self.policy.read()
    }

    /// Update and persist the policy. Applies to adapters constructed from
    /// now on; live adapters are not re-validated.
    pub async fn set_policy(&self, allow_local_addresses: bool) -> StorageResult<SecurityPolicy> {
        let policy = SecurityPolicy { allow_local_addresses };
        if let Some(store) = &self.policy_store {
            store.save(&policy).await?;
        }
        *self.policy.write() = policy;
        self.registry.set_validator(EndpointValidator::from_policy(&policy));
        Ok(policy)
    }

    /// Diagnostic validation of an arbitrary endpoint under the current policy.
    pub async fn validate_endpoint(&self, endpoint: &str) -> StorageResult<EndpointReport> {
        self.registry.validator().report(endpoint).await
    }

    // ------------------------------------------------------------------
    // Broadcast
    // ------------------------------------------------------------------

    pub fn subscribe(&self) -> Subscription {
        self.hub.subscribe()
    }

    /// Cancel running operations and release every adapter.
    pub async fn shutdown(&self) {
        self.operations.cancel_all();
        self.registry.close_all().await;
    }
}

async fn run_transfer(
    orchestrator: &TransferOrchestrator,
    request: &TransferRequest,
    reporter: Option<Arc<ProgressReporter>>,
    cancel: &CancellationToken,
) -> StorageResult<TransferOutcome> {
    let progress = reporter.as_ref().map(|r| r.callback());
    match request.mode {
        TransferMode::Copy => {
            orchestrator
                .copy(
                    &request.src_backend,
                    &request.src_path,
                    &request.dst_backend,
                    &request.dst_path,
                    progress,
                    cancel,
                )
                .await
        }
        TransferMode::Move => {
            orchestrator
                .move_entry(
                    &request.src_backend,
                    &request.src_path,
                    &request.dst_backend,
                    &request.dst_path,
                    progress,
                    cancel,
                )
                .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{read_to_vec, write_bytes, LocalAdapter, ObjectAdapter};
    use crate::progress::{EventKind, ProgressStatus};
    use tempfile::tempdir;

    async fn service(temp: &std::path::Path) -> StorageService {
        let registry = Arc::new(StorageRegistry::new());
        registry
            .register("disk", Arc::new(LocalAdapter::open(temp).await.unwrap()))
            .unwrap();
        registry.register("bucket", Arc::new(ObjectAdapter::in_memory())).unwrap();
        StorageService::ephemeral(registry)
    }

    #[tokio::test]
    async fn test_open_generates_default_backend() {
        let temp = tempdir().unwrap();
        let (service, report) = StorageService::open(Some(temp.path().to_path_buf()))
            .await
            .unwrap();

        assert!(temp.path().join(STORAGES_FILE).exists());
        assert_eq!(report.loaded, vec!["local"]);
        assert_eq!(service.default_backend().as_deref(), Some("local"));
        assert!(!service.policy().allow_local_addresses);
    }

    #[tokio::test]
    async fn test_policy_round_trip() {
        let temp = tempdir().unwrap();
        let (service, _) = StorageService::open(Some(temp.path().to_path_buf()))
            .await
            .unwrap();

        let blocked = service.validate_endpoint("10.0.0.5:9000").await.unwrap();
        assert!(!blocked.allowed);

        service.set_policy(true).await.unwrap();
        assert!(service.validate_endpoint("10.0.0.5:9000").await.unwrap().allowed);

        let reloaded = PolicyStorage::with_path(temp.path().join(SECURITY_FILE))
            .load()
            .await
            .unwrap();
        assert!(reloaded.allow_local_addresses);
    }

    #[tokio::test]
    async fn test_background_transfer_reports_completion() {
        let temp = tempdir().unwrap();
        let service = service(temp.path()).await;
        write_bytes(service.registry().get("disk").unwrap().as_ref(), "/f.bin", vec![9u8; 4096])
            .await
            .unwrap();

        let mut sub = service.subscribe();
        let id = service.start_transfer(TransferRequest::copy("disk", "/f.bin", "bucket", "/f.bin"));

        let mut last = None;
        while let Some(event) = sub.recv().await {
            assert_eq!(event.operation_id.as_deref(), Some(id.as_str()));
            if event.kind == EventKind::Notification {
                break;
            }
            last = event.sample();
        }
        let last = last.unwrap();
        assert_eq!(last.status, ProgressStatus::Completed);
        assert_eq!(last.bytes_done, 4096);
        assert_eq!(last.bytes_total, Some(4096));

        let bucket = service.registry().get("bucket").unwrap();
        assert_eq!(read_to_vec(bucket.as_ref(), "/f.bin").await.unwrap().len(), 4096);
    }

    #[tokio::test]
    async fn test_failed_operation_emits_error() {
        let temp = tempdir().unwrap();
        let service = service(temp.path()).await;
        let mut sub = service.subscribe();
        service.start_transfer(TransferRequest::copy("disk", "/missing", "bucket", "/x"));

        let mut saw_errored = false;
        while let Some(event) = sub.recv().await {
            if let Some(sample) = event.sample() {
                saw_errored |= sample.status == ProgressStatus::Errored;
            }
            if event.kind == EventKind::Error {
                break;
            }
        }
        assert!(saw_errored);
    }
}
