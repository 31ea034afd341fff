//! Fixed SQLite schema for `cache.db`.
//!
//! - `tasks` holds one row per task, scalar fields only
//! - `dependencies` holds one row per blocking edge
//! - `metadata` is a key/value table; only `jsonl_hash` is used
//!
//! There are no migrations. A cache with any other `user_version`, or with
//! tables whose columns or constraints differ from these, is treated as
//! damaged and recreated by the caller.

use rusqlite::{Connection, types::Type};

use super::CacheError;

/// Schema version recorded in `PRAGMA user_version`.
pub const SCHEMA_VERSION: u32 = 1;

pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS tasks (
    id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'open',
    priority INTEGER NOT NULL DEFAULT 2,
    description TEXT,
    parent TEXT,
    created TEXT NOT NULL,
    updated TEXT NOT NULL,
    closed TEXT
);

CREATE TABLE IF NOT EXISTS dependencies (
    task_id TEXT NOT NULL,
    blocked_by TEXT NOT NULL,
    PRIMARY KEY (task_id, blocked_by)
);

CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT
);

CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
CREATE INDEX IF NOT EXISTS idx_tasks_priority ON tasks(priority);
CREATE INDEX IF NOT EXISTS idx_tasks_parent ON tasks(parent);
";

const DROP_SQL: &str = r"
DROP INDEX IF EXISTS idx_tasks_status;
DROP INDEX IF EXISTS idx_tasks_priority;
DROP INDEX IF EXISTS idx_tasks_parent;
DROP TABLE IF EXISTS dependencies;
DROP TABLE IF EXISTS tasks;
DROP TABLE IF EXISTS metadata;
PRAGMA user_version = 0;
";

/// Indexes every healthy cache must carry.
pub const REQUIRED_INDEXES: &[&str] = &[
    "idx_tasks_status",
    "idx_tasks_priority",
    "idx_tasks_parent",
];

/// Expected column: name, declared type, `NOT NULL` flag, primary key position.
type Column = (&'static str, &'static str, bool, u32);

/// Exact column layout of each table in [`SCHEMA_SQL`], in declaration order.
const LAYOUT: &[(&str, &[Column])] = &[
    (
        "tasks",
        &[
            ("id", "TEXT", false, 1),
            ("title", "TEXT", true, 0),
            ("status", "TEXT", true, 0),
            ("priority", "INTEGER", true, 0),
            ("description", "TEXT", false, 0),
            ("parent", "TEXT", false, 0),
            ("created", "TEXT", true, 0),
            ("updated", "TEXT", true, 0),
            ("closed", "TEXT", false, 0),
        ],
    ),
    (
        "dependencies",
        &[
            ("task_id", "TEXT", true, 1),
            ("blocked_by", "TEXT", true, 2),
        ],
    ),
    (
        "metadata",
        &[("key", "TEXT", false, 1), ("value", "TEXT", false, 0)],
    ),
];

/// Read `PRAGMA user_version` as a `u32`.
///
/// # Errors
///
/// Returns an error if the pragma cannot be read (for example when the file
/// is not a database) or the stored value is negative.
pub fn current_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    let version: i64 = conn.pragma_query_value(None, "user_version", |row| row.get(0))?;
    u32::try_from(version).map_err(|error| {
        rusqlite::Error::FromSqlConversionFailure(0, Type::Integer, Box::new(error))
    })
}

/// Create any missing tables and indexes, then verify the layout.
///
/// # Errors
///
/// Returns [`CacheError::SchemaMismatch`] when the database carries another
/// schema version or an existing table differs from [`SCHEMA_SQL`], and
/// [`CacheError::Sqlite`] for any other failure.
pub fn apply(conn: &Connection) -> Result<(), CacheError> {
    let version = current_schema_version(conn)?;
    if version != 0 && version != SCHEMA_VERSION {
        return Err(CacheError::SchemaMismatch(format!(
            "user_version {version} is not supported (expected 0 or {SCHEMA_VERSION})"
        )));
    }

    verify_layout(conn)?;
    conn.execute_batch(SCHEMA_SQL)?;
    verify_layout(conn)?;

    if version < SCHEMA_VERSION {
        conn.pragma_update(None, "user_version", i64::from(SCHEMA_VERSION))?;
    }
    Ok(())
}

/// Drop every cache table and clear the schema version.
///
/// # Errors
///
/// Returns an error if SQLite rejects the statements.
pub fn drop_all(conn: &Connection) -> Result<(), CacheError> {
    conn.execute_batch(DROP_SQL)?;
    Ok(())
}

/// Compare each existing table against [`LAYOUT`]. Missing tables are fine
/// here; they are created by [`SCHEMA_SQL`].
///
/// Column names, declared types, `NOT NULL` and primary key positions must
/// match exactly. Triggers, `WITHOUT ROWID` tables and extra indexes on the
/// cache tables are rejected as well, since each can make a rebuild fail.
fn verify_layout(conn: &Connection) -> Result<(), CacheError> {
    for (table, expected) in LAYOUT {
        if !table_exists(conn, table)? {
            continue;
        }
        let actual = table_columns(conn, table)?;
        let matches = actual.len() == expected.len()
            && actual.iter().zip(expected.iter()).all(|(got, want)| {
                got.0 == want.0
                    && got.1.eq_ignore_ascii_case(want.1)
                    && got.2 == want.2
                    && got.3 == want.3
            });
        if !matches {
            let found: Vec<&str> = actual.iter().map(|column| column.0.as_str()).collect();
            return Err(CacheError::SchemaMismatch(format!(
                "table {table} has an unexpected layout (columns: {})",
                found.join(", ")
            )));
        }
        if without_rowid(conn, table)? {
            return Err(CacheError::SchemaMismatch(format!(
                "table {table} is WITHOUT ROWID"
            )));
        }
    }

    let mut stmt = conn.prepare(
        "SELECT type, name FROM sqlite_master \
         WHERE tbl_name IN ('tasks', 'dependencies', 'metadata') \
           AND (type = 'trigger' \
                OR (type = 'index' AND name NOT LIKE 'sqlite_autoindex_%'))",
    )?;
    let objects = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    for (kind, name) in objects {
        if kind == "index" && REQUIRED_INDEXES.contains(&name.as_str()) {
            continue;
        }
        return Err(CacheError::SchemaMismatch(format!("unexpected {kind} {name}")));
    }
    Ok(())
}

/// `PRAGMA table_info` rows as (name, type, notnull, pk).
fn table_columns(
    conn: &Connection,
    table: &str,
) -> rusqlite::Result<Vec<(String, String, bool, u32)>> {
    let mut stmt =
        conn.prepare("SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1) ORDER BY cid")?;
    let columns = stmt
        .query_map([table], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(columns)
}

fn without_rowid(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT wr FROM pragma_table_list WHERE schema = 'main' AND name = ?1",
        [table],
        |row| row.get(0),
    )
}

fn table_exists(conn: &Connection, table: &str) -> rusqlite::Result<bool> {
    conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
        [table],
        |row| row.get(0),
    )
}
