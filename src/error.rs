//! Error types for summagrid operations.
//!
//! Every fallible operation in the crate returns [`Result<T>`]. The variants
//! follow the failure classes of a distributed job:
//!
//! - **Configuration**: bad process count, non-divisible dimensions, unknown
//!   algorithm variant. Detected identically on every rank before matrix data
//!   moves.
//! - **Allocation**: a block buffer could not be reserved. Local to the rank
//!   that hit it.
//! - **Transport**: a send, receive or collective failed, timed out or was
//!   aborted because a peer failed. Fatal for the whole job.
//!
//! Verification mismatches are not errors; see [`crate::verify`].

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while setting up or running a SUMMA job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SummaError {
    /// Invalid job configuration (process count, variant, parameters).
    #[error("Configuration error: {message}")]
    Configuration {
        /// Human-readable error message.
        message: String,
    },

    /// A matrix dimension is incompatible with the grid or another operand.
    #[error("Dimension mismatch: {message}")]
    DimensionMismatch {
        /// Human-readable error message.
        message: String,
    },

    /// Buffer allocation failed.
    #[error("Memory allocation failed: {message} (requested {requested_elements} elements)")]
    Allocation {
        /// Number of elements that was requested.
        requested_elements: usize,
        /// Human-readable error message.
        message: String,
    },

    /// Point-to-point or collective transfer failed.
    #[error("Transport error on rank {rank}: {message}")]
    Transport {
        /// World rank that observed the failure.
        rank: usize,
        /// Human-readable error message.
        message: String,
    },

    /// A blocking receive ran past the job deadline.
    #[error("Transport timeout on rank {rank} after {waited:?} waiting for rank {peer}")]
    Timeout {
        /// World rank that was waiting.
        rank: usize,
        /// World rank it was waiting on.
        peer: usize,
        /// Time spent waiting.
        waited: Duration,
    },

    /// The job was aborted because another rank failed.
    #[error("Job aborted on rank {rank}: a peer rank failed")]
    Aborted {
        /// World rank that observed the abort.
        rank: usize,
    },

    /// Reading an input file failed.
    #[error("I/O error: {0}")]
    Io(String),

    /// An input file was malformed.
    #[error("Parse error at line {line}: {message}")]
    Parse {
        /// 1-based line number.
        line: usize,
        /// Human-readable error message.
        message: String,
    },
}

impl SummaError {
    /// Returns `true` for errors detected before any matrix data moved.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            SummaError::Configuration { .. } | SummaError::DimensionMismatch { .. }
        )
    }

    /// Process exit status for this error: `2` for configuration-class, `1` otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.is_configuration() {
            2
        } else {
            1
        }
    }

    /// Returns `true` for transport-class failures.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SummaError::Transport { .. } | SummaError::Timeout { .. } | SummaError::Aborted { .. }
        )
    }
}

impl From<std::io::Error> for SummaError {
    fn from(err: std::io::Error) -> Self {
        SummaError::Io(err.to_string())
    }
}

/// Result type alias for summagrid operations.
pub type Result<T> = std::result::Result<T, SummaError>;

/// Creates a configuration error.
pub fn configuration_error(message: impl Into<String>) -> SummaError {
    SummaError::Configuration {
        message: message.into(),
    }
}

/// Creates a dimension-mismatch error.
pub fn dimension_error(message: impl Into<String>) -> SummaError {
    SummaError::DimensionMismatch {
        message: message.into(),
    }
}

/// Creates an allocation error.
pub fn allocation_error(requested_elements: usize, message: impl Into<String>) -> SummaError {
    SummaError::Allocation {
        requested_elements,
        message: message.into(),
    }
}

/// Creates a transport error.
pub fn transport_error(rank: usize, message: impl Into<String>) -> SummaError {
    SummaError::Transport {
        rank,
        message: message.into(),
    }
}
