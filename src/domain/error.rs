//! Recoverable errors raised by the supervisor core.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Every variant is a local condition the caller surfaces as a status
/// message; none of them should bring the host process down.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("script '{name}' not found in any search location")]
    NotFound { name: String },

    #[error("a streaming process is already running; cancel it before starting another")]
    Busy,

    #[error("'{program}' timed out after {:.1}s and was terminated", timeout.as_secs_f64())]
    Timeout { program: String, timeout: Duration },

    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("process I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to load recording from {}: {message}", path.display())]
    Load { path: PathBuf, message: String },

    #[error("no frames loaded; load a recording before playing")]
    EmptyPlayback,

    #[error("playback speed must be positive, got {0}")]
    InvalidSpeed(f64),

    #[error("playback is {0}; stop it before loading a new recording")]
    NotStopped(&'static str),
}

impl SupervisorError {
    pub(crate) fn load(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        SupervisorError::Load {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub type SupervisorResult<T> = std::result::Result<T, SupervisorError>;
