//! Background operation tracking
//!
//! Every long-running operation (cross-backend transfer, archive build or
//! extraction) is registered here under a fresh id with its own
//! cancellation token, and runs under a concurrency permit.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::types::constants::MAX_CONCURRENT_OPERATIONS;

pub use crate::progress::OperationKind;

/// Snapshot of one registered operation
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationInfo {
    pub id: String,
    pub kind: OperationKind,
    pub description: String,
    /// Milliseconds since the Unix epoch
    pub started_at: i64,
    #[serde(skip)]
    cancel: CancellationToken,
}

impl OperationInfo {
    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// RAII permit that decrements the active count on drop.
pub struct OperationPermit {
    _permit: OwnedSemaphorePermit,
    active_count: Arc<AtomicUsize>,
}

impl Drop for OperationPermit {
    fn drop(&mut self) {
        let result = self
            .active_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match result {
            Ok(prev) => debug!("OperationPermit dropped, active count: {}", prev - 1),
            Err(_) => warn!("OperationPermit dropped with active_count already 0"),
        }
    }
}

/// RAII guard that unregisters an operation on drop, on every exit path.
pub struct OperationGuard {
    manager: Arc<OperationManager>,
    operation_id: String,
}

impl OperationGuard {
    pub fn new(manager: &Arc<OperationManager>, operation_id: impl Into<String>) -> Self {
        Self {
            manager: manager.clone(),
            operation_id: operation_id.into(),
        }
    }
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        self.manager.unregister(&self.operation_id);
    }
}

pub struct OperationManager {
    semaphore: Arc<Semaphore>,
    operations: RwLock<HashMap<String, OperationInfo>>,
    active_count: Arc<AtomicUsize>,
    max_concurrent: usize,
}

impl Default for OperationManager {
    fn default() -> Self {
        Self::new(MAX_CONCURRENT_OPERATIONS)
    }
}

impl OperationManager {
    pub fn new(max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            operations: RwLock::new(HashMap::new()),
            active_count: Arc::new(AtomicUsize::new(0)),
            max_concurrent,
        }
    }

    /// Register an operation and hand back its cancellation token.
    pub fn register(
        &self,
        operation_id: &str,
        kind: OperationKind,
        description: impl Into<String>,
    ) -> CancellationToken {
        let info = OperationInfo {
            id: operation_id.to_string(),
            kind,
            description: description.into(),
            started_at: chrono::Utc::now().timestamp_millis(),
            cancel: CancellationToken::new(),
        };
        let token = info.token();
        self.operations.write().insert(operation_id.to_string(), info);
        info!("Registered {} operation: {}", kind, operation_id);
        token
    }

    pub fn unregister(&self, operation_id: &str) {
        self.operations.write().remove(operation_id);
        debug!("Unregistered operation: {}", operation_id);
    }

    pub fn get(&self, operation_id: &str) -> Option<OperationInfo> {
        self.operations.read().get(operation_id).cloned()
    }

    /// Point-in-time snapshot of every registered operation.
    pub fn list(&self) -> Vec<OperationInfo> {
        let mut all: Vec<_> = self.operations.read().values().cloned().collect();
        all.sort_by_key(|op| op.started_at);
        all
    }

    pub fn registered_count(&self) -> usize {
        self.operations.read().len()
    }

    pub fn active_count(&self) -> usize {
        self.active_count.load(Ordering::Acquire)
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Fire the cancellation token of an operation.
    pub fn cancel(&self, operation_id: &str) -> bool {
        if let Some(op) = self.operations.read().get(operation_id) {
            op.cancel.cancel();
            info!("Cancelled operation: {}", operation_id);
            true
        } else {
            warn!("Operation not found for cancel: {}", operation_id);
            false
        }
    }

    pub fn cancel_all(&self) {
        let operations = self.operations.read();
        for (id, op) in operations.iter() {
            op.cancel.cancel();
            info!("Cancelled operation: {}", id);
        }
    }

    /// Wait for a concurrency slot.
    pub async fn acquire_permit(&self) -> Option<OperationPermit> {
        let permit = match self.semaphore.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                warn!("Operation semaphore closed");
                return None;
            }
        };
        let new_count = self.active_count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(
            "Acquired operation permit, active count: {}/{}",
            new_count, self.max_concurrent
        );
        Some(OperationPermit {
            _permit: permit,
            active_count: self.active_count.clone(),
        })
    }

    /// Register and run an operation in the background, returning its id
    /// immediately. The task waits for a permit (or cancellation) first and
    /// is unregistered when it finishes.
    pub fn spawn<F, Fut>(
        self: &Arc<Self>,
        kind: OperationKind,
        description: impl Into<String>,
        task: F,
    ) -> (String, JoinHandle<()>)
    where
        F: FnOnce(String, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let operation_id = uuid::Uuid::new_v4().to_string();
        let token = self.register(&operation_id, kind, description);
        let manager = self.clone();
        let id = operation_id.clone();

        let handle = tokio::spawn(async move {
            let _guard = OperationGuard::new(&manager, id.clone());
            let _permit = tokio::select! {
                permit = manager.acquire_permit() => permit,
                _ = token.cancelled() => {
                    debug!("Operation {} cancelled while queued", id);
                    None
                }
            };
            task(id, token).await;
        });

        (operation_id, handle)
    }

    /// Forward cancel intents (operation ids) into [`OperationManager::cancel`].
    pub fn listen_for_cancels(
        self: &Arc<Self>,
        mut requests: broadcast::Receiver<String>,
    ) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                match requests.recv().await {
                    Ok(id) => match manager.upgrade() {
                        Some(manager) => {
                            manager.cancel(&id);
                        }
                        None => break,
                    },
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Dropped {} cancel requests", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Cancel listener stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_register_cancel_unregister() {
        let manager = OperationManager::default();
        let token = manager.register("op-1", OperationKind::Copy, "copy a -> b");

        assert_eq!(manager.registered_count(), 1);
        assert!(manager.cancel("op-1"));
        assert!(token.is_cancelled());
        assert!(manager.get("op-1").unwrap().is_cancelled());

        manager.unregister("op-1");
        assert!(!manager.cancel("op-1"));
        assert!(manager.list().is_empty());
    }

    #[test]
    fn test_guard_unregisters() {
        let manager = Arc::new(OperationManager::default());
        manager.register("op", OperationKind::Compress, "zip");
        {
            let _guard = OperationGuard::new(&manager, "op");
        }
        assert_eq!(manager.registered_count(), 0);
    }

    #[tokio::test]
    async fn test_spawn_runs_and_cleans_up() {
        let manager = Arc::new(OperationManager::default());
        let (tx, rx) = tokio::sync::oneshot::channel();
        let (id, handle) = manager.spawn(OperationKind::Move, "move", move |id, _token| async move {
            let _ = tx.send(id);
        });

        handle.await.unwrap();
        assert_eq!(rx.await.unwrap(), id);
        assert_eq!(manager.registered_count(), 0);
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_concurrency_limit() {
        let manager = Arc::new(OperationManager::new(1));
        let release = CancellationToken::new();

        let blocker = release.clone();
        let (_, first) = manager.spawn(OperationKind::Copy, "first", move |_, _| async move {
            blocker.cancelled().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(manager.active_count(), 1);

        let (_, second) = manager.spawn(OperationKind::Copy, "second", |_, _| async {});
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished());

        release.cancel();
        first.await.unwrap();
        second.await.unwrap();
        assert_eq!(manager.active_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_requests_forwarded() {
        let manager = Arc::new(OperationManager::default());
        let (tx, rx) = broadcast::channel(8);
        let listener = manager.listen_for_cancels(rx);
        let token = manager.register("op-9", OperationKind::Decompress, "unzip");

        tx.send("op-9".to_string()).unwrap();
        tokio::time::timeout(Duration::from_secs(1), token.cancelled())
            .await
            .unwrap();

        drop(tx);
        listener.await.unwrap();
    }
}
