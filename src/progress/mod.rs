//! Progress broadcast subsystem
//!
//! Long-running operations publish [`ProgressSample`]s through a
//! [`ProgressReporter`]; the [`ProgressHub`] fans them out to subscribers
//! together with notifications and error events. Subscribers may send cancel
//! intents back, which the operation manager picks up.

pub mod hub;
pub mod reporter;
pub mod types;

pub use hub::{ProgressHub, Subscription};
pub use reporter::ProgressReporter;
pub use types::{BroadcastEvent, EventKind, OperationKind, ProgressSample, ProgressStatus};
