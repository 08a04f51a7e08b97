use std::fmt::{Display, Formatter};
use std::time::Duration;

/// Raised when a remote-state predicate never held within its deadline.
#[derive(Debug, Clone)]
pub struct PollTimeout {
    pub predicate: String,
    pub attempts: u32,
    pub elapsed: Duration,
    pub last_observed: String,
}

impl Display for PollTimeout {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "timed out waiting for {} (attempts={}, elapsed_ms={}, last_observed={})",
            self.predicate,
            self.attempts,
            self.elapsed.as_millis(),
            self.last_observed
        )
    }
}

#[derive(thiserror::Error, Debug)]
pub enum PolicydError {
    #[error("invalid policy bundle: {0}")]
    Build(String),
    #[error("{0}")]
    PollTimeout(PollTimeout),
    #[error("transport failure: {0}")]
    Transport(String),
    #[error(
        "unexpected probe outcome for {operation} at {target}: expected {expected}, observed {observed}"
    )]
    UnexpectedOutcome {
        target: String,
        operation: String,
        expected: String,
        observed: String,
    },
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl PolicydError {
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    pub fn build(message: impl Into<String>) -> Self {
        Self::Build(message.into())
    }

    /// Short machine label used in reports and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Build(_) => "build",
            Self::PollTimeout(_) => "poll_timeout",
            Self::Transport(_) => "transport",
            Self::UnexpectedOutcome { .. } => "unexpected_outcome",
            Self::Config(_) => "config",
        }
    }
}

impl From<PollTimeout> for PolicydError {
    fn from(value: PollTimeout) -> Self {
        Self::PollTimeout(value)
    }
}

pub type PolicydResult<T> = std::result::Result<T, PolicydError>;
