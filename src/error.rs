use thiserror::Error;

/// Error kinds surfaced by graph construction and graph execution (spec §7).
///
/// `anyhow::Error` remains the workhorse for ad-hoc context chaining inside
/// individual operators (matching the `anyhow::{Context, Result}`
/// idiom used throughout); `BuildError` exists for the handful of places the
/// scheduler and the CLI need to branch on *kind* rather than just display
/// a message.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),

    #[error("data error: {0}")]
    Data(String),

    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("external tool `{tool}` exited with {code:?}: {stderr}")]
    ExternalTool {
        tool: String,
        code: Option<i32>,
        stderr: String,
    },

    /// Cooperative cancellation. Never counted as a node failure in the
    /// scheduler's accounting; it only ever causes the run loop to stop
    /// submitting new work and drain in-flight units.
    #[error("cancelled")]
    Cancelled,

    /// The ready set was empty on two consecutive sweeps while non-terminal
    /// nodes remained. Scheduler-level, not an operator failure.
    #[error("scheduler stalled: {0} node(s) remain unprocessed")]
    Stall(usize),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("request to {url} timed out after {0:?}", .elapsed)]
    Timeout { url: String, elapsed: std::time::Duration },
    #[error("unexpected status {status} from {url}")]
    Status { url: String, status: u16 },
}

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("transient database error: {0}")]
    Transient(String),
    #[error("permanent database error: {0}")]
    Permanent(String),
}

impl DatabaseError {
    /// Whether the caller should retry once, per spec §7's propagation policy.
    pub fn is_transient(&self) -> bool {
        matches!(self, DatabaseError::Transient(_))
    }
}

impl BuildError {
    pub fn config(msg: impl Into<String>) -> Self {
        BuildError::Config(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        BuildError::NotFound(msg.into())
    }

    pub fn data(msg: impl Into<String>) -> Self {
        BuildError::Data(msg.into())
    }

    /// `true` for the kinds that must not poison the scheduler's dependents
    /// beyond leaving the node `failed` (cancellation is terminal but
    /// semantically distinct — see spec §4.7's operator state machine).
    pub fn is_cancellation(&self) -> bool {
        matches!(self, BuildError::Cancelled)
    }
}

pub type BuildResult<T> = Result<T, BuildError>;
