//! Transfer subsystem
//!
//! Cross-backend copy/move, background operation tracking, retry policy and
//! the metered stream that carries progress and cancellation.

pub mod operations;
pub mod orchestrator;
pub mod retry;
pub mod stream;

pub use operations::{OperationGuard, OperationInfo, OperationKind, OperationManager};
pub use orchestrator::{TransferOrchestrator, TransferOutcome};
pub use retry::RetryConfig;
pub use stream::MeteredReader;
