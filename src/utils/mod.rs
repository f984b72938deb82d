//! Generic async utilities: batched loading, debouncing, TTL memoization

pub mod batch;
pub mod debounce;
pub mod memo;

pub use batch::{load_in_batches, BatchOptions, Page};
pub use debounce::Debouncer;
pub use memo::MemoCache;
