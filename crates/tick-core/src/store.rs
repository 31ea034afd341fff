//! The task store: one directory, one source of truth, one lock.
//!
//! ```text
//! <dir>/
//!   tasks.jsonl   source of truth, rewritten atomically
//!   cache.db      disposable SQLite projection (+ -wal / -shm)
//!   lock          zero-byte advisory lock target
//!   config.toml   optional settings
//! ```
//!
//! Every operation follows the same path:
//!
//! ```text
//! acquire lock -> read tasks.jsonl -> parse -> ensure cache fresh
//!   -> run caller closure -> (mutate only) rewrite + rebuild -> release
//! ```
//!
//! Freshness is re-derived from the file bytes on every call, so a cache
//! left stale by a crash or an external edit is repaired by the next reader.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::{CacheError, SqliteCache, TaskCache};
use crate::config::{LockConfig, StoreConfig, load_store_config};
use crate::error::ErrorCode;
use crate::jsonl::{self, JsonlError};
use crate::lock::{
    AdvisoryLock, DEFAULT_LOCK_TIMEOUT, DEFAULT_POLL_INTERVAL, FileLock, LockError,
};
use crate::model::Task;

pub const TASKS_FILE: &str = "tasks.jsonl";
pub const CACHE_FILE: &str = "cache.db";
pub const LOCK_FILE: &str = "lock";

/// Minimum number of id characters accepted by [`Store::resolve_id`].
pub const MIN_PARTIAL_ID_LEN: usize = 3;

const ID_PREFIX: &str = "tick-";
const FULL_ID_HEX_LEN: usize = 6;

/// Knobs for lock acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreOptions {
    pub lock_timeout: Duration,
    pub lock_poll_interval: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

impl StoreOptions {
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }
}

impl From<&LockConfig> for StoreOptions {
    fn from(config: &LockConfig) -> Self {
        Self {
            lock_timeout: config.timeout(),
            lock_poll_interval: config.poll_interval(),
        }
    }
}

/// Errors surfaced by [`Store`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("tick directory not found: {}", path.display())]
    MissingDir { path: PathBuf },

    #[error("not a directory: {}", path.display())]
    NotADirectory { path: PathBuf },

    #[error("tasks file not found: {}", path.display())]
    MissingTasksFile { path: PathBuf },

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Jsonl(#[from] JsonlError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The mutation closure refused the change. Nothing was written.
    #[error(transparent)]
    Rejected(anyhow::Error),

    /// The query closure failed.
    #[error(transparent)]
    Query(anyhow::Error),

    #[error("partial ID must be at least 3 hex characters")]
    InvalidPartialId(String),

    #[error("task '{0}' not found")]
    TaskNotFound(String),

    #[error("ambiguous prefix '{prefix}' matches: {}", matches.join(", "))]
    AmbiguousId {
        prefix: String,
        matches: Vec<String>,
    },
}

impl StoreError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::MissingDir { .. } | Self::NotADirectory { .. } | Self::MissingTasksFile { .. } => {
                ErrorCode::NotInitialized
            }
            Self::Lock(err) => err.code(),
            Self::Jsonl(err) => err.code(),
            Self::Cache(err) => err.code(),
            Self::Rejected(_) => ErrorCode::MutationRejected,
            Self::Query(_) => ErrorCode::InternalUnexpected,
            Self::InvalidPartialId(_) => ErrorCode::InvalidPartialId,
            Self::TaskNotFound(_) => ErrorCode::TaskNotFound,
            Self::AmbiguousId { .. } => ErrorCode::AmbiguousId,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// A `.tick` directory opened for reading and writing.
///
/// `C` is the query cache and `L` the advisory lock. The defaults are the
/// on-disk `cache.db` and the `lock` file; [`Store::with_parts`] accepts any
/// other pair (for example [`crate::cache::MemoryCache`] with
/// [`crate::lock::MemoryLock`]).
#[derive(Debug)]
pub struct Store<C: TaskCache = SqliteCache, L: AdvisoryLock = FileLock> {
    dir: PathBuf,
    jsonl_path: PathBuf,
    cache: C,
    lock: L,
    options: StoreOptions,
}

impl Store {
    /// Open the store in `dir`, reading `config.toml` if present.
    ///
    /// An unreadable or malformed `config.toml` is logged and replaced by
    /// the defaults; it never prevents opening the store.
    ///
    /// # Errors
    ///
    /// Returns an error if `dir` or `tasks.jsonl` is missing or the cache
    /// cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        check_layout(dir)?;
        let config = load_store_config(dir).unwrap_or_else(|err| {
            tracing::warn!(error = %err, hint = ?err.code().hint(), "ignoring config, using defaults");
            StoreConfig::default()
        });
        Self::open_with(dir, StoreOptions::from(&config.lock))
    }

    /// Open the store in `dir` with explicit options; `config.toml` is not
    /// consulted.
    ///
    /// # Errors
    ///
    /// Same as [`Store::open`].
    pub fn open_with(dir: impl AsRef<Path>, options: StoreOptions) -> Result<Self, StoreError> {
        let dir = dir.as_ref();
        check_layout(dir)?;
        let cache = SqliteCache::open(&dir.join(CACHE_FILE))?;
        let lock = FileLock::new(dir.join(LOCK_FILE)).with_poll_interval(options.lock_poll_interval);
        Self::with_parts(dir, cache, lock, options)
    }
}

impl<C: TaskCache, L: AdvisoryLock> Store<C, L> {
    /// Assemble a store from an explicit cache and lock.
    ///
    /// # Errors
    ///
    /// Returns an error if `dir` or `<dir>/tasks.jsonl` is missing.
    pub fn with_parts(
        dir: impl AsRef<Path>,
        cache: C,
        lock: L,
        options: StoreOptions,
    ) -> Result<Self, StoreError> {
        let dir = dir.as_ref().to_path_buf();
        let jsonl_path = check_layout(&dir)?;
        Ok(Self {
            dir,
            jsonl_path,
            cache,
            lock,
            options,
        })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn jsonl_path(&self) -> &Path {
        &self.jsonl_path
    }

    #[must_use]
    pub const fn options(&self) -> StoreOptions {
        self.options
    }

    #[must_use]
    pub const fn lock_timeout(&self) -> Duration {
        self.options.lock_timeout
    }

    /// Read-modify-write the task list under the exclusive lock.
    ///
    /// `f` receives every task in file order and returns the complete new
    /// list. If it returns an error the file is not touched and the error
    /// comes back as [`StoreError::Rejected`]. Once the new file is in place
    /// the call succeeds even if refreshing the cache fails; the next
    /// operation notices the stale hash and rebuilds.
    ///
    /// # Errors
    ///
    /// Lock timeout, unreadable or malformed `tasks.jsonl`, an unrecoverable
    /// cache, closure rejection, or a failed write.
    pub fn mutate<F>(&mut self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(Vec<Task>) -> anyhow::Result<Vec<Task>>,
    {
        tracing::debug!(dir = %self.dir.display(), "acquiring exclusive lock");
        let _guard = self.lock.acquire_exclusive(self.options.lock_timeout)?;
        tracing::debug!("exclusive lock held");

        let (content, tasks) = self.load()?;
        self.refresh_cache(&content, &tasks)?;

        tracing::debug!(tasks = tasks.len(), "running mutation");
        let updated = match f(tasks) {
            Ok(updated) => updated,
            Err(err) => {
                tracing::debug!(error = %err, "mutation rejected, tasks file untouched");
                return Err(StoreError::Rejected(err));
            }
        };

        jsonl::write_tasks(&self.jsonl_path, &updated)?;
        tracing::debug!(tasks = updated.len(), "rewrote tasks file");

        match jsonl::read_content(&self.jsonl_path) {
            Ok(written) => {
                if let Err(err) = self.cache.rebuild(&updated, &written) {
                    tracing::warn!(
                        error = %err,
                        "tasks file written but cache update failed; next read will rebuild"
                    );
                } else {
                    tracing::debug!("cache rebuilt after write");
                }
            }
            Err(err) => {
                tracing::warn!(
                    error = %err,
                    "tasks file written but could not be re-read for the cache"
                );
            }
        }

        tracing::debug!("mutation committed, releasing lock");
        Ok(())
    }

    /// Run `f` against a fresh cache under the shared lock.
    ///
    /// # Errors
    ///
    /// Lock timeout, unreadable or malformed `tasks.jsonl`, an unrecoverable
    /// cache, or [`StoreError::Query`] carrying the closure's own error.
    pub fn query<T, F>(&mut self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&C) -> anyhow::Result<T>,
    {
        tracing::debug!(dir = %self.dir.display(), "acquiring shared lock");
        let _guard = self.lock.acquire_shared(self.options.lock_timeout)?;
        tracing::debug!("shared lock held");

        let (content, tasks) = self.load()?;
        self.refresh_cache(&content, &tasks)?;

        let result = f(&self.cache).map_err(StoreError::Query);
        tracing::debug!(ok = result.is_ok(), "query finished, releasing lock");
        result
    }

    /// Throw the cache away and rebuild it from `tasks.jsonl`.
    ///
    /// Returns the number of tasks projected.
    ///
    /// # Errors
    ///
    /// Lock timeout, unreadable or malformed `tasks.jsonl`, or a cache that
    /// cannot be recreated.
    pub fn rebuild(&mut self) -> Result<usize, StoreError> {
        let _guard = self.lock.acquire_exclusive(self.options.lock_timeout)?;

        self.cache.reset()?;
        let (content, tasks) = self.load()?;
        self.cache.rebuild(&tasks, &content)?;

        tracing::info!(
            dir = %self.dir.display(),
            tasks = tasks.len(),
            "rebuilt cache from tasks file"
        );
        Ok(tasks.len())
    }

    fn load(&self) -> Result<(Vec<u8>, Vec<Task>), StoreError> {
        let content = jsonl::read_content(&self.jsonl_path)?;
        let tasks = jsonl::parse_tasks(&content)?;
        tracing::debug!(bytes = content.len(), tasks = tasks.len(), "loaded tasks file");
        Ok((content, tasks))
    }

    fn refresh_cache(&mut self, content: &[u8], tasks: &[Task]) -> Result<(), StoreError> {
        let outcome = self.cache.ensure_fresh(content, tasks)?;
        tracing::debug!(?outcome, "cache ensured");
        Ok(())
    }
}

impl<L: AdvisoryLock> Store<SqliteCache, L> {
    /// Expand a full or partial task id to the unique stored id.
    ///
    /// Input is case-insensitive and may omit the `tick-` prefix. At least
    /// three characters are required. A full six-character id wins even
    /// when it is also a prefix of other ids.
    ///
    /// # Errors
    ///
    /// [`StoreError::InvalidPartialId`], [`StoreError::TaskNotFound`], or
    /// [`StoreError::AmbiguousId`], plus anything [`Store::query`] returns.
    pub fn resolve_id(&mut self, input: &str) -> Result<String, StoreError> {
        let lowered = input.trim().to_ascii_lowercase();
        let hex = lowered.strip_prefix(ID_PREFIX).unwrap_or(&lowered);
        if hex.chars().count() < MIN_PARTIAL_ID_LEN {
            return Err(StoreError::InvalidPartialId(input.to_string()));
        }
        let full_prefix = format!("{ID_PREFIX}{hex}");
        let exact = hex.chars().count() == FULL_ID_HEX_LEN;

        let mut matches = self.query(|cache| {
            let conn = cache.conn();
            if exact {
                let mut stmt = conn.prepare_cached("SELECT id FROM tasks WHERE id = ?1")?;
                if stmt.exists([&full_prefix])? {
                    return Ok(vec![full_prefix.clone()]);
                }
            }
            let mut stmt = conn.prepare_cached(
                "SELECT id FROM tasks WHERE substr(id, 1, length(?1)) = ?1 ORDER BY id",
            )?;
            let ids = stmt
                .query_map([&full_prefix], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ids)
        })?;

        match matches.len() {
            0 => Err(StoreError::TaskNotFound(input.to_string())),
            1 => Ok(matches.remove(0)),
            _ => Err(StoreError::AmbiguousId {
                prefix: hex.to_string(),
                matches,
            }),
        }
    }

    /// Close the cache connection, reporting any close error.
    ///
    /// # Errors
    ///
    /// Returns the error SQLite reported while closing.
    pub fn close(self) -> Result<(), StoreError> {
        self.cache.close()?;
        Ok(())
    }
}

/// Validate the directory layout and return the `tasks.jsonl` path.
fn check_layout(dir: &Path) -> Result<PathBuf, StoreError> {
    if !dir.exists() {
        return Err(StoreError::MissingDir {
            path: dir.to_path_buf(),
        });
    }
    if !dir.is_dir() {
        return Err(StoreError::NotADirectory {
            path: dir.to_path_buf(),
        });
    }
    let jsonl_path = dir.join(TASKS_FILE);
    if !jsonl_path.is_file() {
        return Err(StoreError::MissingTasksFile { path: jsonl_path });
    }
    Ok(jsonl_path)
}
