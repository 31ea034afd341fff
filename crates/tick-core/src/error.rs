use std::fmt;

/// Machine-readable error codes for scripts and agents driving tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    NotInitialized,
    ConfigParseError,
    TaskNotFound,
    AmbiguousId,
    InvalidPartialId,
    MutationRejected,
    JsonlReadFailed,
    JsonlParseError,
    JsonlWriteFailed,
    CorruptCache,
    CacheWriteFailed,
    LockContention,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::NotInitialized => "E1001",
            Self::ConfigParseError => "E1002",
            Self::TaskNotFound => "E2001",
            Self::AmbiguousId => "E2002",
            Self::InvalidPartialId => "E2003",
            Self::MutationRejected => "E2004",
            Self::JsonlReadFailed => "E3001",
            Self::JsonlParseError => "E3002",
            Self::JsonlWriteFailed => "E3003",
            Self::CorruptCache => "E4001",
            Self::CacheWriteFailed => "E4002",
            Self::LockContention => "E5001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and terminal output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::NotInitialized => "Tick directory not initialized",
            Self::ConfigParseError => "Config file parse error",
            Self::TaskNotFound => "Task not found",
            Self::AmbiguousId => "Ambiguous task ID",
            Self::InvalidPartialId => "Partial ID too short",
            Self::MutationRejected => "Mutation rejected",
            Self::JsonlReadFailed => "Task file read failed",
            Self::JsonlParseError => "Task file parse error",
            Self::JsonlWriteFailed => "Task file write failed",
            Self::CorruptCache => "Corrupt SQLite cache",
            Self::CacheWriteFailed => "SQLite cache update failed",
            Self::LockContention => "Lock contention",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::NotInitialized => Some("Run `tick init` to create .tick/tasks.jsonl."),
            Self::ConfigParseError => Some("Fix syntax in .tick/config.toml and retry."),
            Self::TaskNotFound | Self::MutationRejected => None,
            Self::AmbiguousId => Some("Use a longer ID prefix to disambiguate."),
            Self::InvalidPartialId => Some("Provide at least 3 hex characters of the task ID."),
            Self::JsonlReadFailed => Some("Check that .tick/tasks.jsonl exists and is readable."),
            Self::JsonlParseError => {
                Some("Fix or remove the reported line in .tick/tasks.jsonl and retry.")
            }
            Self::JsonlWriteFailed => Some("Check disk space and write permissions."),
            Self::CorruptCache | Self::CacheWriteFailed => {
                Some("Run `tick rebuild` to regenerate .tick/cache.db.")
            }
            Self::LockContention => Some("Retry after the other `tick` process releases its lock."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}
