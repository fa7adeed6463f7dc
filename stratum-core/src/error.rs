//! Error types for stratum operations.

use std::path::PathBuf;

use thiserror::Error;

/// Extract the full error message from a tokio_postgres::Error,
/// including the underlying DbError details that Display hides.
pub fn format_db_error(e: &tokio_postgres::Error) -> String {
    if let Some(db_err) = e.as_db_error() {
        let mut msg = format!("ERROR: {} (SQLSTATE {})", db_err.message(), db_err.code().code());
        if let Some(detail) = db_err.detail() {
            msg.push_str(&format!("\n  Detail: {}", detail));
        }
        if let Some(hint) = db_err.hint() {
            msg.push_str(&format!("\n  Hint: {}", hint));
        }
        return msg;
    }
    // Fallback: walk the source chain
    let mut msg = e.to_string();
    let mut source = std::error::Error::source(e);
    while let Some(s) = source {
        msg.push_str(&format!(": {}", s));
        source = s.source();
    }
    if e.is_closed() {
        msg.push_str("\n  Note: The database connection was closed unexpectedly.");
    }
    msg
}

/// SQLSTATE of a postgres error, if the server reported one.
pub fn sqlstate(e: &tokio_postgres::Error) -> Option<String> {
    e.as_db_error().map(|db| db.code().code().to_string())
}

/// All error types that stratum operations can produce.
#[derive(Error, Debug)]
pub enum StratumError {
    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// The local container runtime could not be reached.
    #[error("Container runtime is not running: {0}")]
    NotRunning(String),

    /// A container runtime call failed for a reason other than the daemon being down.
    #[error("Container error: {0}")]
    ContainerError(String),

    /// Connecting to Postgres failed.
    #[error("Failed to connect to postgres at {host}:{port}: {reason}")]
    ConnectFailed {
        host: String,
        port: u16,
        reason: String,
    },

    /// A query failed outside of migration apply.
    #[error("Database error: {}", format_db_error(.0))]
    DatabaseError(#[from] tokio_postgres::Error),

    /// Local and remote migration histories diverge.
    #[error(
        "The remote database's migration history does not match local files in the migrations directory"
    )]
    HistoryConflict {
        extra_local: Vec<String>,
        extra_remote: Vec<String>,
    },

    /// The remote has migration history but there are no local files at all.
    #[error("No local migrations found, but the remote history has {} version(s). Pull or repair the remote history first.", .remote.len())]
    MissingLocal { remote: Vec<String> },

    /// Malformed SQL or version string.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// A statement failed against the target while applying a migration.
    #[error("{message}; At statement {index}: {statement}")]
    ApplyError {
        version: String,
        sqlstate: Option<String>,
        message: String,
        index: usize,
        statement: String,
    },

    /// The external schema differ exited abnormally.
    #[error("Schema differ exited with code {exit_code}: {stderr_tail}")]
    DifferError { exit_code: i32, stderr_tail: String },

    /// The pg_dump container exited abnormally.
    #[error("pg_dump exited with code {exit_code}: {stderr_tail}")]
    DumpError { exit_code: i32, stderr_tail: String },

    /// The shadow database never became healthy.
    #[error("Shadow database is unhealthy (status: {status})\n{logs}")]
    ShadowUnhealthy { status: String, logs: String },

    /// A filesystem operation on a known path failed.
    #[error("File error at {}: {source}", .path.display())]
    FileIoError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A filesystem or process I/O error without path context.
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    /// The operation was cancelled.
    #[error("Operation cancelled")]
    Cancelled,

    /// The user declined a confirmation prompt.
    #[error("Aborted: {0}")]
    Aborted(String),
}

impl StratumError {
    /// Wrap an I/O error with the path it occurred on.
    pub fn file(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StratumError::FileIoError {
            path: path.into(),
            source,
        }
    }

    /// Kind of the underlying I/O error, if this is a filesystem failure.
    pub fn io_kind(&self) -> Option<std::io::ErrorKind> {
        match self {
            StratumError::FileIoError { source, .. } => Some(source.kind()),
            StratumError::IoError(e) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Keep the last `max_lines` lines of captured process output.
pub fn tail(output: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = output.trim_end().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

/// Convenience type alias for `Result<T, StratumError>`.
pub type Result<T> = std::result::Result<T, StratumError>;
