//! Progress sample and broadcast event types

use serde::{Deserialize, Serialize};

/// Kind of long-running operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Copy,
    Move,
    Compress,
    Decompress,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Copy => "copy",
            OperationKind::Move => "move",
            OperationKind::Compress => "compress",
            OperationKind::Decompress => "decompress",
        }
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operation status carried by a sample
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProgressStatus {
    Running,
    Completed,
    Errored,
    Cancelled,
}

impl ProgressStatus {
    /// Terminal statuses end an operation's sample sequence
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ProgressStatus::Running)
    }
}

/// One point-in-time measurement of a long-running operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSample {
    pub operation_id: String,
    pub operation_kind: OperationKind,
    pub bytes_done: u64,
    /// `None` while the total is unknown
    pub bytes_total: Option<u64>,
    pub status: ProgressStatus,
    /// 0-100, `None` when the total is unknown
    pub percentage: Option<f64>,
    /// Bytes per second since the operation started
    pub throughput: u64,
    /// Estimated seconds remaining
    pub eta_seconds: Option<u64>,
    /// Failure reason for `errored`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProgressSample {
    /// Build a sample, deriving percentage/throughput/eta.
    pub fn new(
        operation_id: impl Into<String>,
        operation_kind: OperationKind,
        bytes_done: u64,
        bytes_total: Option<u64>,
        status: ProgressStatus,
        elapsed_secs: f64,
    ) -> Self {
        let percentage = bytes_total.map(|total| {
            if total == 0 {
                100.0
            } else {
                (bytes_done as f64 / total as f64 * 100.0).min(100.0)
            }
        });
        let elapsed = elapsed_secs.max(0.001);
        let throughput = (bytes_done as f64 / elapsed) as u64;
        let eta_seconds = match (bytes_total, status) {
            (Some(total), ProgressStatus::Running) if throughput > 0 => {
                Some(total.saturating_sub(bytes_done) / throughput)
            }
            _ => None,
        };

        Self {
            operation_id: operation_id.into(),
            operation_kind,
            bytes_done,
            bytes_total,
            status,
            percentage,
            throughput,
            eta_seconds,
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

/// Broadcast event kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Progress,
    Notification,
    Error,
}

/// Event delivered to subscribers, forwarded verbatim by the transport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastEvent {
    pub kind: EventKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation_id: Option<String>,
    pub payload: serde_json::Value,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
}

impl BroadcastEvent {
    fn now(kind: EventKind, operation_id: Option<String>, payload: serde_json::Value) -> Self {
        Self {
            kind,
            operation_id,
            payload,
            timestamp: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn progress(sample: &ProgressSample) -> Self {
        let payload = serde_json::to_value(sample).unwrap_or(serde_json::Value::Null);
        Self::now(EventKind::Progress, Some(sample.operation_id.clone()), payload)
    }

    pub fn notification(operation_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::now(
            EventKind::Notification,
            operation_id.map(str::to_string),
            serde_json::json!({ "message": message.into() }),
        )
    }

    pub fn error(operation_id: Option<&str>, message: impl Into<String>) -> Self {
        Self::now(
            EventKind::Error,
            operation_id.map(str::to_string),
            serde_json::json!({ "message": message.into() }),
        )
    }

    /// Decode the payload of a progress event
    pub fn sample(&self) -> Option<ProgressSample> {
        if self.kind != EventKind::Progress {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}
