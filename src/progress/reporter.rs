//! Per-operation progress reporter

use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;

use super::hub::ProgressHub;
use super::types::{OperationKind, ProgressSample, ProgressStatus};
use crate::adapter::ProgressFn;

struct ReporterState {
    done: u64,
    total: Option<u64>,
    finished: bool,
}

/// Accumulates byte counts for one operation and publishes samples.
///
/// Samples are built and published under one lock, so `bytes_done` is
/// non-decreasing in publication order. Once a terminal sample has been
/// published, later calls are ignored.
pub struct ProgressReporter {
    hub: Arc<ProgressHub>,
    operation_id: String,
    kind: OperationKind,
    started: Instant,
    state: Mutex<ReporterState>,
}

impl ProgressReporter {
    pub fn new(
        hub: Arc<ProgressHub>,
        operation_id: impl Into<String>,
        kind: OperationKind,
        total: Option<u64>,
    ) -> Arc<Self> {
        Arc::new(Self {
            hub,
            operation_id: operation_id.into(),
            kind,
            started: Instant::now(),
            state: Mutex::new(ReporterState {
                done: 0,
                total,
                finished: false,
            }),
        })
    }

    pub fn operation_id(&self) -> &str {
        &self.operation_id
    }

    pub fn bytes_done(&self) -> u64 {
        self.state.lock().done
    }

    /// Publish the initial sample.
    pub fn start(&self) {
        let state = self.state.lock();
        self.publish(&state, ProgressStatus::Running, None);
    }

    /// Set or replace the expected total once it becomes known.
    pub fn set_total(&self, total: Option<u64>) {
        self.state.lock().total = total;
    }

    /// Record `n` more bytes moved.
    pub fn advance(&self, n: u64) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.done += n;
        self.publish(&state, ProgressStatus::Running, None);
    }

    /// Callback form of [`ProgressReporter::advance`] for adapters and streams.
    pub fn callback(self: &Arc<Self>) -> ProgressFn {
        let reporter = self.clone();
        Arc::new(move |n| reporter.advance(n))
    }

    /// Terminal success with the counters as reported. A total that was
    /// never learned is settled to the bytes actually moved.
    pub fn complete(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        if state.total.is_none() {
            state.total = Some(state.done);
        }
        self.publish(&state, ProgressStatus::Completed, None);
    }

    /// Terminal failure carrying the last known offset.
    pub fn fail(&self, reason: impl Into<String>) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        self.publish(&state, ProgressStatus::Errored, Some(reason.into()));
    }

    pub fn cancelled(&self) {
        let mut state = self.state.lock();
        if state.finished {
            return;
        }
        state.finished = true;
        self.publish(&state, ProgressStatus::Cancelled, None);
    }

    /// Route an operation result to the matching terminal sample.
    pub fn finish<T>(&self, result: &crate::error::StorageResult<T>) {
        match result {
            Ok(_) => self.complete(),
            Err(crate::error::StorageError::Cancelled) => self.cancelled(),
            Err(e) => self.fail(e.to_string()),
        }
    }

    fn publish(&self, state: &ReporterState, status: ProgressStatus, error: Option<String>) {
        let mut sample = ProgressSample::new(
            self.operation_id.clone(),
            self.kind,
            state.done,
            state.total,
            status,
            self.started.elapsed().as_secs_f64(),
        );
        if let Some(error) = error {
            sample = sample.with_error(error);
        }
        self.hub.publish(&sample);
    }
}
