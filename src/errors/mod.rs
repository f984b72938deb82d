//! Error classification, bounded error log, and retry coordination

pub mod classifier;
pub mod retry;

pub use classifier::{classify, ErrorContext, ErrorDetails, ErrorKind, ErrorLog, Severity};
pub use retry::{RetryCoordinator, RetryPolicy};
