//! Custom error types for the crate.
//!
//! This module defines the primary error type, `FecError`. Using the `thiserror` crate, it
//! provides one consistent way to report everything that can go wrong while draining device
//! buffers, persisting recordings, reconciling time series and talking to external observers.
//!
//! ## Error Hierarchy
//!
//! - **`Database`** / **`Io`** / **`Config`**: wrapped errors from `rusqlite`, `std::io` and
//!   `figment`, created with `?` through `#[from]`.
//! - **`Region`** / **`Signal`**: persistent-storage failures that name the region
//!   `(x, y, p, region)` or the recording signal `(source, variable)` at fault.
//! - **`Transport`** / **`DrainTimeout`** / **`Cancelled`**: failures while talking to the
//!   device through the transport collaborator. Timeouts are returned to the caller, who
//!   decides whether to retry.
//! - **`Protocol`** / **`DatabasePathTooLong`** / **`InvalidTransition`** / **`ChannelClosed`**:
//!   control-channel misuse or malformed datagrams.
//!
//! Soft conditions are deliberately absent: a region that was never written is reported with a
//! `missing` flag, and observers that never confirm are reported in a
//! [`ConfirmationReport`](crate::network::ConfirmationReport).

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type FecResult<T> = std::result::Result<T, FecError>;

#[derive(Error, Debug)]
pub enum FecError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Storage error for region ({x}, {y}, {p}:{region}): {source}")]
    Region {
        x: u32,
        y: u32,
        p: u32,
        region: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Storage error for signal {source_name}/{variable}: {message}")]
    Signal {
        source_name: String,
        variable: String,
        message: String,
    },

    #[error("{source_name} {variable} has already been saved as {existing} so can not save it as {requested}")]
    DataTypeMismatch {
        source_name: String,
        variable: String,
        existing: String,
        requested: String,
    },

    #[error("Row has {actual} values but {expected} were expected")]
    RowWidth { expected: usize, actual: usize },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Drain of region ({x}, {y}, {p}:{region}) timed out after {timeout_ms} ms")]
    DrainTimeout {
        x: u32,
        y: u32,
        p: u32,
        region: u32,
        timeout_ms: u64,
    },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Database path of {0} bytes is too large to send in a command packet")]
    DatabasePathTooLong(usize),

    #[error("Cannot {action} while the control channel is {phase}")]
    InvalidTransition { action: &'static str, phase: String },

    #[error("Control channel is closed")]
    ChannelClosed,

    #[error("Vertex '{0}' is not registered with the buffer manager")]
    UnknownVertex(String),

    #[error("Vertex '{vertex}' does not record region {region}")]
    RegionNotRecorded { vertex: String, region: u32 },

    #[error("Vertex '{vertex}' does not send buffered data from region {region}")]
    RegionNotSent { vertex: String, region: u32 },

    #[error("Background task failed: {0}")]
    Task(String),
}

impl FecError {
    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            FecError::DrainTimeout { .. } | FecError::Transport(_) | FecError::Io(_)
        )
    }

    /// Attaches the region location to a raw database error.
    pub(crate) fn region(x: u32, y: u32, p: u32, region: u32, source: rusqlite::Error) -> Self {
        FecError::Region {
            x,
            y,
            p,
            region,
            source,
        }
    }

    /// Attaches the signal identity to a failure message.
    pub(crate) fn signal(source_name: &str, variable: &str, message: impl Into<String>) -> Self {
        FecError::Signal {
            source_name: source_name.to_string(),
            variable: variable.to_string(),
            message: message.into(),
        }
    }
}

impl From<tokio::task::JoinError> for FecError {
    fn from(value: tokio::task::JoinError) -> Self {
        FecError::Task(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_error_names_location() {
        let err = FecError::region(1, 2, 3, 4, rusqlite::Error::InvalidQuery);
        let msg = err.to_string();
        assert!(msg.contains("(1, 2, 3:4)"), "unexpected message: {msg}");
    }

    #[test]
    fn signal_error_names_source_and_variable() {
        let err = FecError::signal("pop_1", "v", "no tables");
        assert_eq!(err.to_string(), "Storage error for signal pop_1/v: no tables");
    }

    #[test]
    fn timeouts_are_recoverable_but_type_errors_are_not() {
        let timeout = FecError::DrainTimeout {
            x: 0,
            y: 0,
            p: 1,
            region: 2,
            timeout_ms: 100,
        };
        assert!(timeout.is_recoverable());

        let mismatch = FecError::DataTypeMismatch {
            source_name: "a".into(),
            variable: "b".into(),
            existing: "matrix".into(),
            requested: "exists".into(),
        };
        assert!(!mismatch.is_recoverable());
        assert!(!FecError::ChannelClosed.is_recoverable());
    }
}
