//! File-backed cache on a single `rusqlite::Connection`.
//!
//! Runtime defaults follow the projection database conventions:
//! - `journal_mode = WAL` so readers in other processes are not blocked
//! - `busy_timeout = 5s` to absorb transient writer contention
//! - `synchronous = NORMAL`; the cache is disposable
//!
//! Opening never hands back a broken handle. A file that is not a database,
//! or a database with a foreign layout, is deleted (with its `-wal`/`-shm`
//! side files) and recreated empty. The next freshness check then rebuilds
//! it from `tasks.jsonl`.

use std::ffi::OsString;
use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{
    Connection, OpenFlags, OptionalExtension, TransactionBehavior, ffi, params, types::Type,
};

use super::{CacheError, HASH_KEY, TaskCache, content_hash, is_busy, schema};
use crate::model::{Status, Task, task::timestamp};

/// Busy timeout applied to every cache connection.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const INSERT_TASK_SQL: &str = "INSERT INTO tasks \
     (id, title, status, priority, description, parent, created, updated, closed) \
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

// A blocking edge listed twice on one task collapses to one row.
const INSERT_EDGE_SQL: &str =
    "INSERT OR IGNORE INTO dependencies (task_id, blocked_by) VALUES (?1, ?2)";

const UPSERT_HASH_SQL: &str = "INSERT INTO metadata (key, value) VALUES (?1, ?2) \
     ON CONFLICT(key) DO UPDATE SET value = excluded.value";

const SELECT_HASH_SQL: &str = "SELECT value FROM metadata WHERE key = ?1";

/// SQLite implementation of [`TaskCache`].
///
/// The connection stays open for the life of the cache. If another process
/// resets `cache.db`, this handle keeps working against the unlinked file:
/// results stay correct because freshness is always checked against
/// `tasks.jsonl`, but the new on-disk file is only refreshed by whoever
/// opened it. Reopen the store to pick it up.
#[derive(Debug)]
pub struct SqliteCache {
    conn: Connection,
    /// `None` for an injected connection; reset then rebuilds in place.
    path: Option<PathBuf>,
}

impl SqliteCache {
    /// Open (or create) the cache at `path`, recreating it if unreadable.
    ///
    /// # Errors
    ///
    /// Returns an error only if the damaged file cannot be removed or a
    /// fresh database cannot be created in its place.
    pub fn open(path: &Path) -> Result<Self, CacheError> {
        let conn = match open_at(path) {
            Ok(conn) => conn,
            Err(err) if err.is_corruption() => {
                tracing::warn!(
                    path = %path.display(),
                    error = %err,
                    "cache unreadable, recreating"
                );
                remove_cache_files(path)?;
                open_at(path)?
            }
            Err(err) => return Err(err),
        };

        tracing::debug!(path = %path.display(), "opened task cache");
        Ok(Self {
            conn,
            path: Some(path.to_path_buf()),
        })
    }

    /// Wrap a caller-provided connection. Tables are created if missing; a
    /// foreign layout is dropped and recreated.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created on `conn`.
    pub fn from_connection(conn: Connection) -> Result<Self, CacheError> {
        if let Err(err) = schema::apply(&conn) {
            tracing::warn!(error = %err, "injected cache connection has a foreign schema, resetting");
            schema::drop_all(&conn)?;
            schema::apply(&conn)?;
        }
        Ok(Self { conn, path: None })
    }

    /// Private in-memory cache, mostly useful in tests and benches.
    ///
    /// # Errors
    ///
    /// Returns an error if SQLite cannot allocate the database.
    pub fn in_memory() -> Result<Self, CacheError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Read-only access for query closures.
    #[must_use]
    pub const fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Backing file, if this cache was opened from a path.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Content hash recorded by the last successful rebuild.
    ///
    /// # Errors
    ///
    /// Returns an error if the metadata table cannot be read.
    pub fn recorded_hash(&self) -> Result<Option<String>, CacheError> {
        Ok(select_hash(&self.conn)?)
    }

    /// Number of task rows in the projection.
    ///
    /// # Errors
    ///
    /// Returns an error if the query fails.
    pub fn task_count(&self) -> Result<usize, CacheError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM tasks", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or(0))
    }

    /// Reassemble the projected tasks in file order, blocking edges included.
    ///
    /// # Errors
    ///
    /// Returns an error if a query fails or a stored value cannot be decoded.
    pub fn load_tasks(&self) -> Result<Vec<Task>, CacheError> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT id, title, status, priority, description, parent, created, updated, closed \
             FROM tasks ORDER BY rowid",
        )?;
        let mut tasks = stmt
            .query_map([], row_to_task)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut edges = self
            .conn
            .prepare_cached("SELECT blocked_by FROM dependencies WHERE task_id = ?1 ORDER BY rowid")?;
        for task in &mut tasks {
            task.blocked_by = edges
                .query_map([&task.id], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
        }
        Ok(tasks)
    }

    /// Close the connection explicitly, surfacing any close error.
    ///
    /// # Errors
    ///
    /// Returns the error SQLite reported while closing.
    pub fn close(self) -> Result<(), CacheError> {
        self.conn.close().map_err(|(_, err)| CacheError::from(err))
    }
}

impl TaskCache for SqliteCache {
    fn is_fresh(&self, content: &[u8]) -> Result<bool, CacheError> {
        let stored = select_hash(&self.conn)?;
        Ok(stored.is_some_and(|hash| hash == content_hash(content)))
    }

    fn rebuild(&mut self, tasks: &[Task], content: &[u8]) -> Result<(), CacheError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute("DELETE FROM dependencies", [])?;
        tx.execute("DELETE FROM tasks", [])?;

        {
            let mut insert_task = tx.prepare_cached(INSERT_TASK_SQL)?;
            let mut insert_edge = tx.prepare_cached(INSERT_EDGE_SQL)?;

            for task in tasks {
                insert_task
                    .execute(params![
                        task.id,
                        task.title,
                        task.status.as_str(),
                        task.priority,
                        task.description.as_deref(),
                        task.parent.as_deref(),
                        timestamp::format(&task.created),
                        timestamp::format(&task.updated),
                        task.closed.as_ref().map(timestamp::format),
                    ])
                    .map_err(|err| duplicate_or(err, &task.id))?;

                for blocker in &task.blocked_by {
                    insert_edge.execute(params![task.id, blocker])?;
                }
            }
        }

        tx.execute(UPSERT_HASH_SQL, params![HASH_KEY, content_hash(content)])?;
        tx.commit()?;

        tracing::debug!(tasks = tasks.len(), "rebuilt task cache");
        Ok(())
    }

    fn reset(&mut self) -> Result<(), CacheError> {
        let Some(path) = self.path.clone() else {
            schema::drop_all(&self.conn)?;
            return schema::apply(&self.conn);
        };

        // Release the file handle before unlinking it.
        let placeholder = Connection::open_in_memory()?;
        let old = mem::replace(&mut self.conn, placeholder);
        if let Err((_, err)) = old.close() {
            tracing::debug!(error = %err, "closing damaged cache connection failed");
        }

        remove_cache_files(&path)?;
        self.conn = open_at(&path)?;
        tracing::warn!(path = %path.display(), "task cache reset");
        Ok(())
    }
}

/// Look up the stored content hash without modifying anything.
///
/// Opens `path` read-only, so it is safe to call while another process holds
/// the store lock. A missing cache file yields `Ok(None)`.
///
/// # Errors
///
/// Returns an error if the file exists but cannot be read as a cache.
pub fn stored_hash(path: &Path) -> Result<Option<String>, CacheError> {
    if !path.exists() {
        return Ok(None);
    }
    let conn = Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(
        |source| CacheError::Open {
            path: path.to_path_buf(),
            source,
        },
    )?;
    Ok(select_hash(&conn)?)
}

fn open_at(path: &Path) -> Result<Connection, CacheError> {
    // Contention is not damage; only other failures mark the file unusable.
    let open_err = |source: rusqlite::Error| {
        if is_busy(&source) {
            CacheError::Sqlite(source)
        } else {
            CacheError::Open {
                path: path.to_path_buf(),
                source,
            }
        }
    };
    let conn = Connection::open(path).map_err(open_err)?;
    configure_connection(&conn).map_err(open_err)?;
    schema::apply(&conn)?;
    Ok(conn)
}

fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.busy_timeout(DEFAULT_BUSY_TIMEOUT)?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    let _journal_mode: String =
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get(0))?;
    Ok(())
}

fn select_hash(conn: &Connection) -> rusqlite::Result<Option<String>> {
    let value: Option<Option<String>> = conn
        .query_row(SELECT_HASH_SQL, [HASH_KEY], |row| row.get(0))
        .optional()?;
    Ok(value.flatten())
}

/// Delete `cache.db` and its WAL side files. Missing files are not errors.
fn remove_cache_files(path: &Path) -> Result<(), CacheError> {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = OsString::from(path.as_os_str());
        name.push(suffix);
        let target = PathBuf::from(name);
        match fs::remove_file(&target) {
            Ok(()) => tracing::debug!(path = %target.display(), "removed cache file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CacheError::Remove {
                    path: target,
                    source,
                });
            }
        }
    }
    Ok(())
}

/// Only key conflicts mean a duplicate id; other constraint failures stay
/// plain SQLite errors.
fn duplicate_or(err: rusqlite::Error, id: &str) -> CacheError {
    match &err {
        rusqlite::Error::SqliteFailure(failure, _)
            if matches!(
                failure.extended_code,
                ffi::SQLITE_CONSTRAINT_PRIMARYKEY | ffi::SQLITE_CONSTRAINT_UNIQUE
            ) =>
        {
            CacheError::DuplicateId(id.to_string())
        }
        _ => CacheError::Sqlite(err),
    }
}

fn row_to_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(2)?;
    let status = status
        .parse::<Status>()
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(err)))?;

    Ok(Task {
        id: row.get(0)?,
        title: row.get(1)?,
        status,
        priority: row.get(3)?,
        description: row.get(4)?,
        blocked_by: Vec::new(),
        parent: row.get(5)?,
        created: column_timestamp(row, 6)?,
        updated: column_timestamp(row, 7)?,
        closed: row
            .get::<_, Option<String>>(8)?
            .map(|raw| parse_timestamp(&raw, 8))
            .transpose()?,
    })
}

fn column_timestamp(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_timestamp(&raw, idx)
}

fn parse_timestamp(raw: &str, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    timestamp::parse(raw)
        .map_err(|err| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err)))
}

#[cfg(test)]
mod tests {
    use super::{DEFAULT_BUSY_TIMEOUT, SqliteCache, stored_hash};
    use crate::cache::{CacheError, Freshness, TaskCache, content_hash};
    use crate::model::{Status, Task};
    use chrono::{TimeZone, Utc};
    use rusqlite::Connection;
    use std::fs;
    use tempfile::TempDir;

    fn temp_cache() -> (TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("cache.db");
        (dir, path)
    }

    fn task(id: &str, blocked_by: &[&str]) -> Task {
        let now = Utc.with_ymd_and_hms(2026, 1, 19, 10, 0, 0).single().expect("date");
        let mut task = Task::new(id, format!("title {id}"), now);
        task.blocked_by = blocked_by.iter().map(ToString::to_string).collect();
        task
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
            .expect("count rows")
    }

    #[test]
    fn open_sets_wal_and_busy_timeout() {
        let (_dir, path) = temp_cache();
        let cache = SqliteCache::open(&path).expect("open cache");

        let journal_mode: String = cache
            .conn()
            .pragma_query_value(None, "journal_mode", |row| row.get(0))
            .expect("journal_mode");
        assert_eq!(journal_mode.to_ascii_lowercase(), "wal");

        let busy_timeout_ms: u64 = cache
            .conn()
            .pragma_query_value(None, "busy_timeout", |row| row.get(0))
            .expect("busy_timeout");
        assert_eq!(u128::from(busy_timeout_ms), DEFAULT_BUSY_TIMEOUT.as_millis());
        assert_eq!(cache.path(), Some(path.as_path()));
    }

    #[test]
    fn new_cache_is_never_fresh() {
        let cache = SqliteCache::in_memory().expect("cache");
        assert!(!cache.is_fresh(b"").expect("fresh check"));
        assert!(cache.recorded_hash().expect("hash").is_none());
    }

    #[test]
    fn rebuild_projects_tasks_edges_and_hash() {
        let mut cache = SqliteCache::in_memory().expect("cache");
        let tasks = vec![
            task("tick-aaaaaa", &[]),
            task("tick-bbbbbb", &["tick-aaaaaa", "tick-cccccc"]),
        ];

        cache.rebuild(&tasks, b"content").expect("rebuild");

        assert_eq!(count(cache.conn(), "tasks"), 2);
        assert_eq!(count(cache.conn(), "dependencies"), 2);
        assert_eq!(
            cache.recorded_hash().expect("hash"),
            Some(content_hash(b"content"))
        );
        assert!(cache.is_fresh(b"content").expect("fresh"));
        assert!(!cache.is_fresh(b"content\n").expect("stale"));
    }

    #[test]
    fn load_tasks_reassembles_rows_in_file_order() {
        let mut cache = SqliteCache::in_memory().expect("cache");
        let mut done = task("tick-cccccc", &["tick-aaaaaa"]);
        done.status = Status::Done;
        done.description = Some("shipped".into());
        done.parent = Some("tick-aaaaaa".into());
        done.closed = Some(done.updated);
        let tasks = vec![task("tick-bbbbbb", &[]), task("tick-aaaaaa", &[]), done];

        cache.rebuild(&tasks, b"x").expect("rebuild");

        assert_eq!(cache.load_tasks().expect("load"), tasks);
        assert_eq!(cache.task_count().expect("count"), 3);
    }

    #[test]
    fn rebuild_replaces_previous_rows() {
        let mut cache = SqliteCache::in_memory().expect("cache");
        cache
            .rebuild(&[task("tick-aaaaaa", &["tick-zzzzzz"])], b"v1")
            .expect("v1");
        cache.rebuild(&[task("tick-bbbbbb", &[])], b"v2").expect("v2");

        let ids: Vec<String> = cache
            .load_tasks()
            .expect("load")
            .into_iter()
            .map(|task| task.id)
            .collect();
        assert_eq!(ids, vec!["tick-bbbbbb".to_string()]);
        assert_eq!(count(cache.conn(), "dependencies"), 0);
        assert_eq!(count(cache.conn(), "metadata"), 1);
    }

    #[test]
    fn duplicate_ids_roll_back_everything() {
        let mut cache = SqliteCache::in_memory().expect("cache");
        cache.rebuild(&[task("tick-aaaaaa", &[])], b"v1").expect("v1");

        let err = cache
            .rebuild(
                &[task("tick-bbbbbb", &["tick-aaaaaa"]), task("tick-bbbbbb", &[])],
                b"v2",
            )
            .expect_err("duplicate id");

        assert!(matches!(err, CacheError::DuplicateId(ref id) if id == "tick-bbbbbb"), "{err}");
        assert!(cache.is_fresh(b"v1").expect("old hash kept"));
        assert_eq!(count(cache.conn(), "tasks"), 1);
        assert_eq!(count(cache.conn(), "dependencies"), 0);
    }

    #[test]
    fn repeated_edge_collapses_to_one_row() {
        let mut cache = SqliteCache::in_memory().expect("cache");
        cache
            .rebuild(&[task("tick-aaaaaa", &["tick-bbbbbb", "tick-bbbbbb"])], b"v1")
            .expect("rebuild");
        assert_eq!(count(cache.conn(), "dependencies"), 1);
    }

    #[test]
    fn garbage_file_is_recreated_on_open() {
        let (_dir, path) = temp_cache();
        fs::write(&path, "this is not a sqlite database. ".repeat(200)).expect("write junk");

        let cache = SqliteCache::open(&path).expect("open recovers");
        assert!(!cache.is_fresh(b"").expect("fresh check"));
        assert_eq!(cache.task_count().expect("count"), 0);
    }

    #[test]
    fn foreign_schema_is_recreated_on_open() {
        let (_dir, path) = temp_cache();
        {
            let conn = Connection::open(&path).expect("open raw");
            conn.execute_batch("CREATE TABLE tasks (id TEXT)").expect("narrow table");
        }

        let mut cache = SqliteCache::open(&path).expect("open recovers");
        cache.rebuild(&[task("tick-aaaaaa", &[])], b"v1").expect("rebuild");
        assert_eq!(cache.task_count().expect("count"), 1);
    }

    #[test]
    fn reset_removes_file_backed_state() {
        let (_dir, path) = temp_cache();
        let mut cache = SqliteCache::open(&path).expect("open");
        cache.rebuild(&[task("tick-aaaaaa", &[])], b"v1").expect("rebuild");

        cache.reset().expect("reset");

        assert!(!cache.is_fresh(b"v1").expect("fresh check"));
        assert_eq!(cache.task_count().expect("count"), 0);
        assert!(path.exists());
    }

    #[test]
    fn reset_on_injected_connection_rebuilds_in_place() {
        let mut cache = SqliteCache::in_memory().expect("cache");
        cache.rebuild(&[task("tick-aaaaaa", &[])], b"v1").expect("rebuild");

        cache.reset().expect("reset");

        assert!(cache.path().is_none());
        assert!(cache.recorded_hash().expect("hash").is_none());
        assert_eq!(cache.task_count().expect("count"), 0);
    }

    #[test]
    fn from_connection_replaces_foreign_tables() {
        let conn = Connection::open_in_memory().expect("conn");
        conn.execute_batch("CREATE TABLE metadata (k TEXT)").expect("foreign table");

        let mut cache = SqliteCache::from_connection(conn).expect("wrap");
        assert_eq!(
            cache.ensure_fresh(b"", &[]).expect("ensure"),
            Freshness::Rebuilt
        );
    }

    #[test]
    fn stored_hash_reads_without_opening_for_write() {
        let (_dir, path) = temp_cache();
        assert_eq!(stored_hash(&path).expect("missing file"), None);

        let mut cache = SqliteCache::open(&path).expect("open");
        cache.rebuild(&[], b"").expect("rebuild");
        cache.close().expect("close");

        assert_eq!(stored_hash(&path).expect("stored"), Some(content_hash(b"")));
    }
}
