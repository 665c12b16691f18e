//! Error types for the sandbox host.

use thiserror::Error;

/// Which direction of the sandbox channel closed.
///
/// Callers use the distinction to decide whether retrying against a fresh
/// handle is worthwhile, so the two sides keep distinct error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeSide {
    /// The command pipe (host to sandbox).
    ToSandbox,
    /// The reply pipe (sandbox to host).
    FromSandbox,
}

impl std::fmt::Display for PipeSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipeSide::ToSandbox => write!(f, "pipe to sandbox"),
            PipeSide::FromSandbox => write!(f, "pipe from sandbox"),
        }
    }
}

/// Errors surfaced by spawn and invoke.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The backend could not start the isolated runtime. No handle exists.
    #[error("failed to start sandbox: {0}")]
    Spawn(String),

    /// The isolated runtime raised while executing a function.
    /// The handle remains usable for further calls.
    #[error("remote execution failed: {message}")]
    Remote {
        /// The error text as the isolated runtime reported it.
        message: String,
        /// Formatted remote stack trace, with any captured diagnostic
        /// output appended.
        traceback: String,
    },

    /// The transport failed or the process exited. Fatal to the handle:
    /// every pending and future call fails the same way.
    #[error("{side} is closed")]
    ChannelClosed {
        /// The side that was observed closed first.
        side: PipeSide,
    },

    /// A frame failed to parse or a reply referenced an unknown call id.
    /// Fatal to the handle, treated like a closed channel.
    #[error("sandbox protocol violation: {0}")]
    Protocol(String),
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, SandboxError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_sides_keep_distinct_error_text() {
        let to = SandboxError::ChannelClosed {
            side: PipeSide::ToSandbox,
        };
        let from = SandboxError::ChannelClosed {
            side: PipeSide::FromSandbox,
        };
        assert_eq!(to.to_string(), "pipe to sandbox is closed");
        assert_eq!(from.to_string(), "pipe from sandbox is closed");
    }

    #[test]
    fn remote_error_displays_message_not_traceback() {
        let err = SandboxError::Remote {
            message: "NameError: nope".into(),
            traceback: "frame 1\nframe 2".into(),
        };
        let text = err.to_string();
        assert!(text.contains("NameError: nope"));
        assert!(!text.contains("frame 1"));
    }
}
