//! # Engine Error Types
//!
//! Structured error handling for the batch engine using thiserror
//! for typed error variants instead of `Box<dyn Error>` patterns.
//!
//! All variants carry `String` payloads so errors stay `Clone`: a single
//! batch-level failure fans out to every affected record's outcome.

use thiserror::Error;

/// Errors produced by the batch engine and its components
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("Connection pool exhausted: {message}")]
    PoolExhausted { message: String },

    #[error("Lock acquisition timed out on partition {partition}: {message}")]
    LockTimeout { partition: u32, message: String },

    #[error("Transform failed for record {record_id}: {message}")]
    TransformFailure {
        record_id: String,
        message: String,
        retryable: bool,
    },

    #[error("Sink write failed after {attempts} attempt(s): {message}")]
    SinkWriteFailure { attempts: u32, message: String },

    #[error("Source read failed: {message}")]
    SourceReadFailure { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Operation cancelled: {message}")]
    Cancelled { message: String },
}

impl EngineError {
    /// Create a pool exhausted error
    pub fn pool_exhausted(message: impl Into<String>) -> Self {
        Self::PoolExhausted {
            message: message.into(),
        }
    }

    /// Create a lock timeout error
    pub fn lock_timeout(partition: u32, message: impl Into<String>) -> Self {
        Self::LockTimeout {
            partition,
            message: message.into(),
        }
    }

    /// Create a per-record transform failure
    pub fn transform_failure(
        record_id: impl Into<String>,
        message: impl Into<String>,
        retryable: bool,
    ) -> Self {
        Self::TransformFailure {
            record_id: record_id.into(),
            message: message.into(),
            retryable,
        }
    }

    /// Create a sink write failure
    pub fn sink_write_failure(attempts: u32, message: impl Into<String>) -> Self {
        Self::SinkWriteFailure {
            attempts,
            message: message.into(),
        }
    }

    /// Create a source read failure
    pub fn source_read_failure(message: impl Into<String>) -> Self {
        Self::SourceReadFailure {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a cancellation error
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::Cancelled {
            message: message.into(),
        }
    }

    /// Whether a retry of the failed operation could reasonably succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::PoolExhausted { .. }
            | Self::LockTimeout { .. }
            | Self::SinkWriteFailure { .. }
            | Self::Cancelled { .. } => true,
            Self::TransformFailure { retryable, .. } => *retryable,
            Self::SourceReadFailure { .. } | Self::Configuration { .. } => false,
        }
    }
}

/// Conversion from serde_json::Error for sources/sinks that shuttle JSON payloads
impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::source_read_failure(err.to_string())
    }
}

/// Result type alias for engine operations
pub type EngineResult<T> = Result<T, EngineError>;
