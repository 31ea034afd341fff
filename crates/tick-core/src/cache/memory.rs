use std::collections::HashSet;

use super::{CacheError, TaskCache, content_hash};
use crate::model::Task;

/// In-process projection with the same semantics as the SQLite cache.
///
/// Nothing survives the process, so a store built on it rebuilds on first
/// use. Useful for tests and for callers that only need the lock and
/// atomic-write guarantees.
#[derive(Debug, Default, Clone)]
pub struct MemoryCache {
    tasks: Vec<Task>,
    dependencies: Vec<(String, String)>,
    hash: Option<String>,
}

impl MemoryCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Projected tasks in file order.
    #[must_use]
    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Blocking edges as `(task_id, blocked_by)` pairs.
    #[must_use]
    pub fn dependencies(&self) -> &[(String, String)] {
        &self.dependencies
    }

    #[must_use]
    pub fn recorded_hash(&self) -> Option<&str> {
        self.hash.as_deref()
    }

    /// Look up one projected task by exact id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&Task> {
        self.tasks.iter().find(|task| task.id == id)
    }
}

impl TaskCache for MemoryCache {
    fn is_fresh(&self, content: &[u8]) -> Result<bool, CacheError> {
        Ok(self
            .hash
            .as_deref()
            .is_some_and(|hash| hash == content_hash(content)))
    }

    fn rebuild(&mut self, tasks: &[Task], content: &[u8]) -> Result<(), CacheError> {
        let mut ids = HashSet::with_capacity(tasks.len());
        let mut edges = HashSet::new();
        let mut dependencies = Vec::new();

        for task in tasks {
            if !ids.insert(task.id.as_str()) {
                return Err(CacheError::DuplicateId(task.id.clone()));
            }
            for blocker in &task.blocked_by {
                if edges.insert((task.id.as_str(), blocker.as_str())) {
                    dependencies.push((task.id.clone(), blocker.clone()));
                }
            }
        }

        self.tasks = tasks.to_vec();
        self.dependencies = dependencies;
        self.hash = Some(content_hash(content));
        Ok(())
    }

    fn reset(&mut self) -> Result<(), CacheError> {
        *self = Self::default();
        Ok(())
    }
}
