//! Disposable query cache derived from `tasks.jsonl`.
//!
//! The cache is a normalized projection of the task list plus one metadata
//! value: the SHA-256 of the JSONL bytes it was built from. It is valid only
//! while that hash equals the hash of the current file; anything else is
//! stale and gets rebuilt wholesale before a reader may trust it.
//!
//! # Module layout
//!
//! - [`TaskCache`]: the narrow freshness/rebuild interface the store drives.
//! - [`sqlite`]: [`SqliteCache`], the on-disk `cache.db` implementation.
//! - [`memory`]: [`MemoryCache`], an in-process implementation.
//! - [`schema`]: fixed SQL schema for `cache.db`.

pub mod memory;
pub mod schema;
pub mod sqlite;

pub use memory::MemoryCache;
pub use sqlite::SqliteCache;

use std::io;
use std::path::PathBuf;

use sha2::{Digest, Sha256};

use crate::error::ErrorCode;
use crate::model::Task;

/// Metadata key holding the content hash of the JSONL bytes.
pub const HASH_KEY: &str = "jsonl_hash";

/// Hex-encoded SHA-256 of `content`, the cache's freshness token.
#[must_use]
pub fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Errors raised while maintaining the cache.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The cache file could not be opened or configured.
    #[error("failed to open cache {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },

    /// The cache exists but its tables do not match the expected layout.
    #[error("cache schema mismatch: {0}")]
    SchemaMismatch(String),

    /// A corrupt cache file could not be deleted.
    #[error("failed to remove cache file {}: {source}", path.display())]
    Remove {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Two tasks in one rebuild batch share an identifier.
    #[error("duplicate task id {0}")]
    DuplicateId(String),

    /// Any other SQLite failure.
    #[error("cache query failed: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl CacheError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Open { .. } | Self::SchemaMismatch(_) => ErrorCode::CorruptCache,
            Self::Remove { .. } | Self::DuplicateId(_) | Self::Sqlite(_) => {
                ErrorCode::CacheWriteFailed
            }
        }
    }

    /// `true` when the error means the backing store itself is damaged and
    /// only a reset can help.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Open { .. } | Self::SchemaMismatch(_) => true,
            Self::Sqlite(rusqlite::Error::SqliteFailure(err, _)) => matches!(
                err.code,
                rusqlite::ErrorCode::DatabaseCorrupt | rusqlite::ErrorCode::NotADatabase
            ),
            _ => false,
        }
    }

    /// `true` when SQLite reported lock contention rather than damage.
    #[must_use]
    pub fn is_contention(&self) -> bool {
        matches!(self, Self::Sqlite(err) if is_busy(err))
    }
}

pub(crate) fn is_busy(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            )
    )
}

/// What [`TaskCache::ensure_fresh`] had to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    /// Stored hash matched; nothing was touched.
    Fresh,
    /// Stored hash was missing or different; the projection was rebuilt.
    Rebuilt,
    /// The cache was unreadable; it was reset and rebuilt from scratch.
    Recovered,
}

/// The projection contract: answer "is this still valid" and "throw it away
/// and rebuild it". Everything else the store needs is derived from these.
pub trait TaskCache {
    /// Compare the stored content hash with the hash of `content`.
    ///
    /// A cache with no stored hash is simply not fresh.
    ///
    /// # Errors
    ///
    /// Returns an error only when the stored hash cannot be read at all
    /// (unreadable schema, damaged file).
    fn is_fresh(&self, content: &[u8]) -> Result<bool, CacheError>;

    /// Replace the whole projection with `tasks` and record the hash of
    /// `content`, all or nothing.
    ///
    /// # Errors
    ///
    /// On error the previously committed projection and hash are unchanged.
    fn rebuild(&mut self, tasks: &[Task], content: &[u8]) -> Result<(), CacheError>;

    /// Discard the backing store and recreate an empty schema.
    ///
    /// # Errors
    ///
    /// Returns an error if the damaged store cannot be removed or recreated.
    fn reset(&mut self) -> Result<(), CacheError>;

    /// Gatekeeper run before every store operation: no-op when fresh,
    /// rebuild when stale, reset and rebuild when the check itself fails.
    /// A check that fails on lock contention skips the reset and only
    /// rebuilds.
    ///
    /// # Errors
    ///
    /// Only the error of the final rebuild attempt is surfaced.
    fn ensure_fresh(&mut self, content: &[u8], tasks: &[Task]) -> Result<Freshness, CacheError> {
        match self.is_fresh(content) {
            Ok(true) => Ok(Freshness::Fresh),
            Ok(false) => match self.rebuild(tasks, content) {
                Ok(()) => Ok(Freshness::Rebuilt),
                Err(err) if err.is_corruption() => {
                    tracing::warn!(error = %err, "cache rebuild hit a damaged store, resetting");
                    self.reset()?;
                    self.rebuild(tasks, content)?;
                    Ok(Freshness::Recovered)
                }
                Err(err) => Err(err),
            },
            Err(err) if err.is_contention() => {
                // Another process holds the file; rebuild in place rather than delete it.
                tracing::warn!(error = %err, "cache freshness check hit contention, rebuilding");
                self.rebuild(tasks, content)?;
                Ok(Freshness::Rebuilt)
            }
            Err(err) => {
                tracing::warn!(error = %err, "cache freshness check failed, rebuilding from scratch");
                self.reset()?;
                self.rebuild(tasks, content)?;
                Ok(Freshness::Recovered)
            }
        }
    }
}
