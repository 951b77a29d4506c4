//! Custom error types for the session controller.
//!
//! This module defines `SessionError`, the single error type that crosses the
//! controller boundary. Connection and transport code works with
//! `anyhow::Result` internally and is wrapped here once the controller needs
//! to decide on an exit outcome.
//!
//! ## Error Hierarchy
//!
//! - **`InvalidTarget`** / **`Connect`**: the link was never established. Both
//!   map to [`SessionOutcome::ConnectError`].
//! - **`Config`**: a semantic problem with the session parameters detected
//!   before any streaming command was sent (e.g. a malformed channel mask).
//! - **`Send`** / **`Transport`** / **`Disconnect`** / **`Io`**: the link was up
//!   but something failed while driving it.
//! - **`Settings`**: the defaults file or environment could not be parsed.
//!
//! Everything except the connect class maps to [`SessionOutcome::RuntimeError`].
//! A short fall of stream messages is not an error at all; it is reported as
//! [`SessionOutcome::ValidationFailed`] by the controller.

use crate::session::SessionOutcome;
use std::error::Error as StdError;
use thiserror::Error;

/// Boxed, thread-safe error used as the `source` of wrapped failures.
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

/// Convenience alias for results using the session error type.
pub type SessionResult<T> = std::result::Result<T, SessionError>;

/// Primary error type for a streaming session.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Target selection is missing or ambiguous (network and serial both given).
    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    /// Every connection attempt was exhausted.
    #[error("Failed to connect to {target} after {attempts} attempt(s)")]
    Connect {
        /// Human-readable target description.
        target: String,
        /// Number of attempts made.
        attempts: u32,
        /// Failure reported by the last attempt.
        #[source]
        source: BoxError,
    },

    /// Session parameters rejected before streaming started.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Writing a command to the device failed.
    #[error("Failed to send '{command}' command")]
    Send {
        /// Command name as it appears on the wire.
        command: String,
        /// Underlying transport failure.
        #[source]
        source: BoxError,
    },

    /// The link failed while streaming.
    #[error("Transport failure: {0}")]
    Transport(String),

    /// Teardown could not close the link cleanly.
    #[error("Disconnect failed")]
    Disconnect(#[source] BoxError),

    /// Output sink or other local I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Defaults file or environment could not be loaded.
    #[error("Settings error: {0}")]
    Settings(#[from] figment::Error),
}

impl SessionError {
    /// Short machine-friendly label used when flattening cause chains.
    pub fn kind(&self) -> &'static str {
        match self {
            SessionError::InvalidTarget(_) => "InvalidTarget",
            SessionError::Connect { .. } => "ConnectError",
            SessionError::Config(_) => "ConfigError",
            SessionError::Send { .. } => "SendError",
            SessionError::Transport(_) => "TransportError",
            SessionError::Disconnect(_) => "DisconnectError",
            SessionError::Io(_) => "IoError",
            SessionError::Settings(_) => "SettingsError",
        }
    }

    /// The exit outcome this error aborts a session with.
    pub fn outcome(&self) -> SessionOutcome {
        match self {
            SessionError::InvalidTarget(_) | SessionError::Connect { .. } => {
                SessionOutcome::ConnectError
            }
            _ => SessionOutcome::RuntimeError,
        }
    }
}

/// Flatten an error and all of its nested causes into one readable line.
///
/// Each level is rendered as `Type: message` and levels are joined with
/// ` <- `, outermost first.
pub fn error_chain(err: &(dyn StdError + 'static)) -> String {
    let mut parts = Vec::new();
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(e) = current {
        parts.push(format!("{}: {}", type_label(e), e));
        current = e.source();
    }
    parts.join(" <- ")
}

fn type_label(err: &(dyn StdError + 'static)) -> &'static str {
    if let Some(session) = err.downcast_ref::<SessionError>() {
        session.kind()
    } else if err.is::<std::io::Error>() {
        "IoError"
    } else if err.is::<tokio::time::error::Elapsed>() {
        "Timeout"
    } else if err.is::<figment::Error>() {
        "SettingsError"
    } else {
        "Error"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn connect_class_maps_to_connect_outcome() {
        let err = SessionError::InvalidTarget("both network and serial given".into());
        assert_eq!(err.outcome(), SessionOutcome::ConnectError);

        let err = SessionError::Connect {
            target: "tcp://10.0.0.2:4242".into(),
            attempts: 3,
            source: "refused".into(),
        };
        assert_eq!(err.outcome(), SessionOutcome::ConnectError);
    }

    #[test]
    fn everything_else_is_runtime() {
        assert_eq!(
            SessionError::Config("bad mask".into()).outcome(),
            SessionOutcome::RuntimeError
        );
        assert_eq!(
            SessionError::Transport("closed".into()).outcome(),
            SessionOutcome::RuntimeError
        );
        assert_eq!(
            SessionError::Disconnect("socket gone".into()).outcome(),
            SessionOutcome::RuntimeError
        );
    }

    #[test]
    fn chain_lists_every_nested_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let inner = anyhow::Error::new(io).context("Failed to connect to 10.0.0.2:4242");
        let err = SessionError::Connect {
            target: "tcp://10.0.0.2:4242".into(),
            attempts: 2,
            source: inner.into(),
        };

        let chain = error_chain(&err);
        assert!(chain.starts_with("ConnectError: Failed to connect to tcp://10.0.0.2:4242 after 2 attempt(s)"));
        assert!(chain.contains(" <- Error: Failed to connect to 10.0.0.2:4242"));
        assert!(chain.ends_with("IoError: refused"));
    }

    #[test]
    fn chain_of_leaf_error_is_single_segment() {
        let err = SessionError::Config("channel mask contains 'x'".into());
        assert_eq!(
            error_chain(&err),
            "ConfigError: Configuration error: channel mask contains 'x'"
        );
    }

    #[test]
    fn send_error_keeps_command_name() {
        let cause: anyhow::Result<()> =
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe)).context("write failed");
        let err = SessionError::Send {
            command: "start".into(),
            source: cause.unwrap_err().into(),
        };
        assert_eq!(err.to_string(), "Failed to send 'start' command");
        assert!(error_chain(&err).contains("write failed"));
    }
}
