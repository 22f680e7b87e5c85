//! The asynchronous job execution core: the job store with per-id pub/sub,
//! the algorithm runner, and the queue-backed worker pool.
//!
//! These are process-wide components with an explicit lifecycle. They are
//! constructed at startup and passed around as dependencies rather than
//! reached for as ambient state, so tests can stand up isolated instances.

pub mod config;
pub mod pool;
pub mod runner;
pub mod store;

pub use config::Config;
pub use pool::WorkerPool;
pub use runner::AlgorithmRunner;
pub use runner::CancelHandle;
pub use runner::JobRunner;
pub use store::JobEvent;
pub use store::JobStore;
pub use store::StoreError;
