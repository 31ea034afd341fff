//! The task record persisted in `tasks.jsonl` and projected into the cache.

pub mod task;

pub use task::{Status, Task};
