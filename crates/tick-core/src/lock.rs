use crate::error::ErrorCode;
use fs2::FileExt;
use std::{
    fs::{File, OpenOptions},
    io,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    thread,
    time::{Duration, Instant},
};

/// The one message every lock timeout reports. Scripts grep for it.
pub const LOCK_TIMEOUT_MESSAGE: &str =
    "could not acquire lock on .tick/lock - another process may be using tick";

/// Default bound on how long acquisition may wait.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default sleep between acquisition attempts.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Advisory lock errors for the store's lock target.
#[derive(Debug)]
pub enum LockError {
    Timeout { path: PathBuf, waited: Duration },
    IoError(io::Error),
}

impl From<io::Error> for LockError {
    fn from(err: io::Error) -> Self {
        Self::IoError(err)
    }
}

impl LockError {
    /// Machine-readable code associated with this lock error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout { .. } => ErrorCode::LockContention,
            Self::IoError(_) => ErrorCode::InternalUnexpected,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout { .. } => f.write_str(LOCK_TIMEOUT_MESSAGE),
            Self::IoError(err) => write!(f, "failed to acquire lock: {err}"),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Timeout { .. } => None,
            Self::IoError(err) => Some(err),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockKind {
    Shared,
    Exclusive,
}

/// A single lock target usable in shared (many readers) or exclusive (one
/// writer) mode.
///
/// Guards release on drop, so every exit path of the holder, including an
/// unwinding panic, gives the lock back.
pub trait AdvisoryLock {
    type Guard;

    /// Acquire the lock exclusively, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`LockError::Timeout`] when another holder keeps the lock past
    /// `timeout`, or [`LockError::IoError`] if the target cannot be opened.
    fn acquire_exclusive(&self, timeout: Duration) -> Result<Self::Guard, LockError>;

    /// Acquire the lock in shared mode, waiting at most `timeout`.
    ///
    /// # Errors
    ///
    /// Same as [`AdvisoryLock::acquire_exclusive`].
    fn acquire_shared(&self, timeout: Duration) -> Result<Self::Guard, LockError>;
}

/// OS advisory lock (`flock`/`LockFileEx`) on a zero-byte file.
#[derive(Debug, Clone)]
pub struct FileLock {
    path: PathBuf,
    poll_interval: Duration,
}

impl FileLock {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Override the sleep between acquisition attempts.
    #[must_use]
    pub const fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Return the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AdvisoryLock for FileLock {
    type Guard = FileGuard;

    fn acquire_exclusive(&self, timeout: Duration) -> Result<FileGuard, LockError> {
        FileGuard::acquire(&self.path, timeout, self.poll_interval, LockKind::Exclusive)
    }

    fn acquire_shared(&self, timeout: Duration) -> Result<FileGuard, LockError> {
        FileGuard::acquire(&self.path, timeout, self.poll_interval, LockKind::Shared)
    }
}

/// RAII guard for a held [`FileLock`].
#[derive(Debug)]
pub struct FileGuard {
    file: File,
    path: PathBuf,
    kind: LockKind,
}

impl FileGuard {
    fn acquire(
        path: &Path,
        timeout: Duration,
        poll_interval: Duration,
        kind: LockKind,
    ) -> Result<Self, LockError> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;

        let start = Instant::now();
        loop {
            let attempt = match kind {
                LockKind::Shared => FileExt::try_lock_shared(&file),
                LockKind::Exclusive => FileExt::try_lock_exclusive(&file),
            };

            match attempt {
                Ok(()) => {
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                        kind,
                    });
                }
                Err(err) if err.kind() != io::ErrorKind::WouldBlock
                    && err.raw_os_error() != fs2::lock_contended_error().raw_os_error() =>
                {
                    return Err(LockError::IoError(err));
                }
                Err(_) => {}
            }

            if start.elapsed() >= timeout {
                return Err(LockError::Timeout {
                    path: path.to_path_buf(),
                    waited: start.elapsed(),
                });
            }

            thread::sleep(poll_interval);
        }
    }

    /// Explicitly release the lock. Release also happens automatically on drop.
    pub fn release(self) {}

    /// Return the lock file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub const fn kind(&self) -> LockKind {
        self.kind
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

#[derive(Debug, Default)]
struct GateState {
    readers: usize,
    writer: bool,
}

/// In-process reader/writer gate with the same contract as [`FileLock`].
///
/// Clones share one gate, so independent owners in one process can contend
/// on it the way separate processes contend on the lock file.
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    gate: Arc<(Mutex<GateState>, Condvar)>,
}

impl MemoryLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GateState> {
        self.gate.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, timeout: Duration, kind: LockKind) -> Result<MemoryGuard, LockError> {
        let start = Instant::now();
        let blocked = |state: &mut GateState| match kind {
            LockKind::Shared => state.writer,
            LockKind::Exclusive => state.writer || state.readers > 0,
        };

        let (mut state, wait) = self
            .gate
            .1
            .wait_timeout_while(self.state(), timeout, blocked)
            .unwrap_or_else(PoisonError::into_inner);

        if wait.timed_out() {
            return Err(LockError::Timeout {
                path: PathBuf::from("<memory>"),
                waited: start.elapsed(),
            });
        }

        match kind {
            LockKind::Shared => state.readers += 1,
            LockKind::Exclusive => state.writer = true,
        }

        Ok(MemoryGuard {
            lock: self.clone(),
            kind,
        })
    }
}

impl AdvisoryLock for MemoryLock {
    type Guard = MemoryGuard;

    fn acquire_exclusive(&self, timeout: Duration) -> Result<MemoryGuard, LockError> {
        self.acquire(timeout, LockKind::Exclusive)
    }

    fn acquire_shared(&self, timeout: Duration) -> Result<MemoryGuard, LockError> {
        self.acquire(timeout, LockKind::Shared)
    }
}

/// RAII guard for a held [`MemoryLock`].
#[derive(Debug)]
pub struct MemoryGuard {
    lock: MemoryLock,
    kind: LockKind,
}

impl Drop for MemoryGuard {
    fn drop(&mut self) {
        {
            let mut state = self.lock.state();
            match self.kind {
                LockKind::Shared => state.readers = state.readers.saturating_sub(1),
                LockKind::Exclusive => state.writer = false,
            }
        }
        self.lock.gate.1.notify_all();
    }
}
