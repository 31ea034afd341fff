//! tick-core: storage engine for the `tick` task tracker.
//!
//! `tasks.jsonl` is the source of truth. `cache.db` is a SQLite projection
//! validated by a SHA-256 of the file bytes. An advisory lock on `lock`
//! serializes writers against readers across processes.
//!
//! # Conventions
//!
//! - **Errors**: one `thiserror` enum per module, each with a `code()`
//!   mapping to [`error::ErrorCode`]. Caller closures use `anyhow::Result`.
//! - **Logging**: `tracing` macros with structured fields. The library never
//!   installs a subscriber.

pub mod cache;
pub mod config;
pub mod error;
pub mod jsonl;
pub mod lock;
pub mod model;
pub mod store;

pub use cache::{MemoryCache, SqliteCache, TaskCache};
pub use error::ErrorCode;
pub use lock::{AdvisoryLock, FileLock, LOCK_TIMEOUT_MESSAGE, MemoryLock};
pub use model::{Status, Task};
pub use store::{Store, StoreError, StoreOptions};
