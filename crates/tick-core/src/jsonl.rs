//! `tasks.jsonl` codec: one compact JSON object per line, rewritten whole.
//!
//! # Write protocol
//!
//! 1. Create a temp file next to the destination (same filesystem, so the
//!    final rename is atomic).
//! 2. Write every record followed by `\n`, flush, `fsync`.
//! 3. Rename the temp file over the destination.
//!
//! The temp file is owned by [`tempfile::NamedTempFile`] for the whole write:
//! it is either persisted by the rename or deleted when dropped. The
//! destination is never opened for writing, so a failure at any step leaves
//! its previous content intact.

use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::de::Error as _;
use tempfile::NamedTempFile;

use crate::error::ErrorCode;
use crate::model::Task;

/// Errors raised while reading or writing `tasks.jsonl`.
#[derive(Debug, thiserror::Error)]
pub enum JsonlError {
    /// The file could not be read (missing, permissions, ...).
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// A non-blank line is not a valid task record.
    #[error("line {line}: invalid task record: {source}")]
    Parse {
        /// 1-based line number.
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    /// A task could not be encoded.
    #[error("failed to serialize task {id}: {source}")]
    Serialize {
        id: String,
        #[source]
        source: serde_json::Error,
    },

    /// Creating, writing, syncing or renaming the temp file failed.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl JsonlError {
    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Read { .. } => ErrorCode::JsonlReadFailed,
            Self::Parse { .. } => ErrorCode::JsonlParseError,
            Self::Serialize { .. } | Self::Write { .. } => ErrorCode::JsonlWriteFailed,
        }
    }
}

/// Read and parse the task file at `path`.
///
/// # Errors
///
/// Returns [`JsonlError::Read`] if the file is missing or unreadable and
/// [`JsonlError::Parse`] for the first malformed line.
pub fn read_tasks(path: &Path) -> Result<Vec<Task>, JsonlError> {
    let content = read_content(path)?;
    parse_tasks(&content)
}

/// Read the raw bytes of the task file. The same bytes feed both the parser
/// and the cache content hash.
///
/// # Errors
///
/// Returns [`JsonlError::Read`] if the file is missing or unreadable.
pub fn read_content(path: &Path) -> Result<Vec<u8>, JsonlError> {
    fs::read(path).map_err(|source| JsonlError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Parse raw JSONL bytes into tasks.
///
/// Blank and whitespace-only lines are skipped. Every other line must hold
/// exactly one task object; the first failure aborts the whole parse.
///
/// # Errors
///
/// Returns [`JsonlError::Parse`] with the 1-based line number of the first
/// line that is not a valid task record.
pub fn parse_tasks(content: &[u8]) -> Result<Vec<Task>, JsonlError> {
    let mut tasks = Vec::new();

    for (idx, raw) in content.split(|byte| *byte == b'\n').enumerate() {
        let line = raw.trim_ascii();
        if line.is_empty() {
            continue;
        }

        // Derived structs also accept JSON arrays; records must be objects.
        if line.first() != Some(&b'{') {
            return Err(JsonlError::Parse {
                line: idx + 1,
                source: serde_json::Error::custom("expected a JSON object"),
            });
        }

        let task = serde_json::from_slice::<Task>(line)
            .map_err(|source| JsonlError::Parse { line: idx + 1, source })?;
        tasks.push(task);
    }

    Ok(tasks)
}

/// Encode tasks into the exact byte image [`write_tasks`] puts on disk.
///
/// # Errors
///
/// Returns [`JsonlError::Serialize`] if a task cannot be encoded.
pub fn marshal_tasks(tasks: &[Task]) -> Result<Vec<u8>, JsonlError> {
    let mut out = Vec::new();
    for task in tasks {
        encode_line(&mut out, task)?;
    }
    Ok(out)
}

/// Atomically replace `path` with `tasks`, one record per line.
///
/// # Errors
///
/// Returns [`JsonlError::Serialize`] or [`JsonlError::Write`]. In either case
/// `path` still holds its previous content and no temp file is left behind.
pub fn write_tasks(path: &Path, tasks: &[Task]) -> Result<(), JsonlError> {
    write_atomic(path, |writer| {
        for task in tasks {
            encode_line(writer, task)?;
        }
        Ok(())
    })
}

fn encode_line<W: Write>(writer: &mut W, task: &Task) -> Result<(), JsonlError> {
    serde_json::to_writer(&mut *writer, task).map_err(|source| JsonlError::Serialize {
        id: task.id.clone(),
        source,
    })?;
    writer
        .write_all(b"\n")
        .map_err(|source| JsonlError::Serialize {
            id: task.id.clone(),
            source: serde_json::Error::io(source),
        })
}

/// Run `fill` against a buffered temp file in `path`'s directory, then sync
/// and rename it over `path`.
pub(crate) fn write_atomic<F>(path: &Path, fill: F) -> Result<(), JsonlError>
where
    F: FnOnce(&mut BufWriter<&mut NamedTempFile>) -> Result<(), JsonlError>,
{
    let write_err = |source: io::Error| JsonlError::Write {
        path: path.to_path_buf(),
        source,
    };

    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };

    let mut temp = tempfile::Builder::new()
        .prefix(".tasks-")
        .suffix(".jsonl.tmp")
        .tempfile_in(dir)
        .map_err(write_err)?;

    {
        let mut writer = BufWriter::new(&mut temp);
        fill(&mut writer)?;
        writer.flush().map_err(write_err)?;
    }

    temp.as_file().sync_all().map_err(write_err)?;
    temp.persist(path).map_err(|err| write_err(err.error))?;

    tracing::trace!(path = %path.display(), "task file replaced");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Status;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn ts(hour: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 19, hour, 0, 0)
            .single()
            .expect("valid date")
    }

    fn sample_tasks() -> Vec<Task> {
        let first = Task::new("tick-a1b2c3", "Set up repo", ts(9));
        let mut second = Task::new("tick-d4e5f6", "Write storage layer", ts(10));
        second.priority = 1;
        second.description = Some("JSONL + SQLite".into());
        second.blocked_by = vec!["tick-a1b2c3".into()];
        second.parent = Some("tick-ffffff".into());
        let mut third = Task::new("tick-777777", "Retire old parser", ts(11));
        third.status = Status::Cancelled;
        third.closed = Some(ts(12));
        vec![first, second, third]
    }

    fn temp_jsonl() -> (TempDir, PathBuf) {
        let dir = TempDir::new().expect("create temp dir");
        let path = dir.path().join("tasks.jsonl");
        (dir, path)
    }

    fn dir_entries(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .expect("list dir")
            .map(|entry| entry.expect("dir entry").file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    #[test]
    fn write_then_read_returns_same_tasks() {
        let (_dir, path) = temp_jsonl();
        let tasks = sample_tasks();

        write_tasks(&path, &tasks).expect("write tasks");
        let read = read_tasks(&path).expect("read tasks");

        assert_eq!(read, tasks);
    }

    #[test]
    fn written_file_is_one_compact_line_per_task() {
        let (_dir, path) = temp_jsonl();
        write_tasks(&path, &sample_tasks()).expect("write tasks");

        let content = fs::read_to_string(&path).expect("read back");
        assert!(content.ends_with('\n'));
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(
            lines[0],
            r#"{"id":"tick-a1b2c3","title":"Set up repo","status":"open","priority":2,"created":"2026-01-19T09:00:00Z","updated":"2026-01-19T09:00:00Z"}"#
        );
        assert!(lines.iter().all(|line| !line.contains(": ")));
    }

    #[test]
    fn marshal_matches_written_bytes() {
        let (_dir, path) = temp_jsonl();
        let tasks = sample_tasks();
        write_tasks(&path, &tasks).expect("write tasks");

        assert_eq!(fs::read(&path).expect("read"), marshal_tasks(&tasks).expect("marshal"));
    }

    #[test]
    fn writing_empty_list_produces_zero_byte_file() {
        let (_dir, path) = temp_jsonl();
        fs::write(&path, "stale\n").expect("seed");

        write_tasks(&path, &[]).expect("write empty");

        assert_eq!(fs::metadata(&path).expect("stat").len(), 0);
        assert!(read_tasks(&path).expect("read").is_empty());
    }

    #[test]
    fn write_leaves_no_temp_files_behind() {
        let (dir, path) = temp_jsonl();
        write_tasks(&path, &sample_tasks()).expect("first write");
        write_tasks(&path, &sample_tasks()[..1]).expect("second write");

        assert_eq!(dir_entries(dir.path()), vec!["tasks.jsonl".to_string()]);
    }

    #[test]
    fn failure_before_rename_keeps_original_and_removes_temp() {
        let (dir, path) = temp_jsonl();
        write_tasks(&path, &sample_tasks()).expect("seed");
        let before = fs::read(&path).expect("read original");

        let result = write_atomic(&path, |writer| {
            writer
                .write_all(b"{\"id\":\"half-written")
                .map_err(|source| JsonlError::Write {
                    path: PathBuf::from("injected"),
                    source,
                })?;
            Err(JsonlError::Write {
                path: PathBuf::from("injected"),
                source: io::Error::other("disk full"),
            })
        });

        assert!(matches!(result, Err(JsonlError::Write { .. })));
        let after = fs::read(&path).expect("read after failure");
        assert_eq!(after, before);
        assert_eq!(after.len(), before.len());
        assert_eq!(dir_entries(dir.path()), vec!["tasks.jsonl".to_string()]);
    }

    #[test]
    fn write_into_missing_directory_fails_cleanly() {
        let (dir, _) = temp_jsonl();
        let path = dir.path().join("missing").join("tasks.jsonl");

        let err = write_tasks(&path, &sample_tasks()).expect_err("no parent dir");
        assert_eq!(err.code(), ErrorCode::JsonlWriteFailed);
        assert!(!path.exists());
    }

    #[test]
    fn read_missing_file_is_an_error() {
        let (_dir, path) = temp_jsonl();
        let err = read_tasks(&path).expect_err("missing file");
        assert!(matches!(err, JsonlError::Read { .. }));
        assert_eq!(err.code(), ErrorCode::JsonlReadFailed);
    }

    #[test]
    fn zero_byte_file_yields_empty_list() {
        let (_dir, path) = temp_jsonl();
        fs::write(&path, b"").expect("create empty");
        assert_eq!(read_tasks(&path).expect("read"), Vec::<Task>::new());
    }

    #[test]
    fn blank_and_whitespace_lines_are_skipped() {
        let line = r#"{"id":"tick-a1b2c3","title":"A","status":"open","priority":2,"created":"2026-01-19T09:00:00Z","updated":"2026-01-19T09:00:00Z"}"#;
        let content = format!("\n   \n{line}\r\n\t\n{line}\n\n");

        let tasks = parse_tasks(content.as_bytes()).expect("parse");
        assert_eq!(tasks.len(), 2);
    }

    #[test]
    fn parse_error_reports_one_based_line_number() {
        let good = r#"{"id":"tick-a1b2c3","title":"A","status":"open","priority":2,"created":"2026-01-19T09:00:00Z","updated":"2026-01-19T09:00:00Z"}"#;
        let content = format!("{good}\n\n{{not json}}\n{good}\n");

        let err = parse_tasks(content.as_bytes()).expect_err("bad line");
        assert!(matches!(err, JsonlError::Parse { line: 3, .. }), "{err}");
        assert!(err.to_string().starts_with("line 3:"), "{err}");
        assert_eq!(err.code(), ErrorCode::JsonlParseError);
    }

    #[test]
    fn two_objects_on_one_line_is_a_parse_error() {
        let good = r#"{"id":"tick-a1b2c3","title":"A","status":"open","priority":2,"created":"2026-01-19T09:00:00Z","updated":"2026-01-19T09:00:00Z"}"#;
        let content = format!("{good}{good}\n");

        assert!(matches!(
            parse_tasks(content.as_bytes()),
            Err(JsonlError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn unknown_status_is_a_parse_error() {
        let content = r#"{"id":"t","title":"A","status":"archived","priority":2,"created":"2026-01-19T09:00:00Z","updated":"2026-01-19T09:00:00Z"}"#;
        assert!(matches!(
            parse_tasks(content.as_bytes()),
            Err(JsonlError::Parse { line: 1, .. })
        ));
    }

    #[test]
    fn array_shaped_record_is_rejected() {
        let mut content = marshal_tasks(&sample_tasks()[..1]).expect("marshal");
        content.extend_from_slice(
            br#"["tick-aaaaaa","t","open",2,null,[],null,"2026-01-19T10:00:00Z","2026-01-19T10:00:00Z",null]"#,
        );
        content.push(b'\n');

        let err = parse_tasks(&content).expect_err("array line");
        assert!(matches!(err, JsonlError::Parse { line: 2, .. }), "{err}");
        assert!(err.to_string().contains("expected a JSON object"), "{err}");
    }
}
