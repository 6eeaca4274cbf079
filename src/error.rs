//! Error taxonomy and OS-error logging helpers.
//!
//! Resource wrappers stay on `io::Result` and report verbs failures through
//! [`log_ret_last_os_err`]; the orchestration layer classifies failures into
//! [`BenchError`] so the binary can report which phase of the run broke.

use std::io;

use thiserror::Error;
use tracing::error;

/// Run-level result alias.
pub type Result<T> = std::result::Result<T, BenchError>;

/// Everything that can terminate a run. There is no retry at any layer.
#[derive(Debug, Error)]
pub enum BenchError {
    /// Invalid or contradictory options, detected before any hardware or
    /// network resource is touched.
    #[error("configuration error: {0}")]
    Config(String),
    /// Hardware object creation or registration failure.
    #[error("resource error: failed to {what}")]
    Resource {
        /// What was being created when the failure happened
        what: &'static str,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },
    /// Control-channel I/O failure or handshake parameter mismatch.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Failed submission, non-success completion or negative poll result.
    #[error("data-plane error: {0}")]
    DataPlane(String),
    /// Control-channel transport failure.
    #[error("control channel I/O failed")]
    Oob(#[from] io::Error),
}

impl BenchError {
    /// Configuration error from anything printable.
    pub(crate) fn config<D: std::fmt::Display>(msg: D) -> Self {
        Self::Config(msg.to_string())
    }

    /// Resource error wrapping the OS error of a failed verbs call.
    pub(crate) fn resource(what: &'static str, source: io::Error) -> Self {
        Self::Resource { what, source }
    }

    /// Protocol error from anything printable.
    pub(crate) fn protocol<D: std::fmt::Display>(msg: D) -> Self {
        Self::Protocol(msg.to_string())
    }

    /// Data-plane error from anything printable.
    pub(crate) fn data_plane<D: std::fmt::Display>(msg: D) -> Self {
        Self::DataPlane(msg.to_string())
    }
}

/// Get the last os error, log with note and return the error
pub(crate) fn log_ret_last_os_err_with_note(note: &str) -> io::Error {
    let err = io::Error::last_os_error();
    if note.is_empty() {
        error!("OS error {:?}", err);
    } else {
        error!("OS error {:?}. Note: {}", err, note);
    }
    err
}

/// Get the last os error, log and return the error
pub(crate) fn log_ret_last_os_err() -> io::Error {
    log_ret_last_os_err_with_note("")
}

/// Get the last os error and just log it
pub(crate) fn log_last_os_err() {
    // errors inside `drop` are logged, never propagated
    let _ = log_ret_last_os_err_with_note("");
}
