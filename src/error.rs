use std::fmt;

use thiserror::Error;

use crate::config::Backend;

/// Result type alias for conversion operations that may fail with [`ConversionError`].
pub type Result<T, E = ConversionError> = std::result::Result<T, E>;

/// Why a conversion stopped early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller flipped the cancellation flag.
    Requested,
    /// `max_processing_time_ms` elapsed.
    Timeout,
}

impl fmt::Display for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelReason::Requested => write!(f, "cancelled by caller"),
            CancelReason::Timeout => write!(f, "processing time budget exceeded"),
        }
    }
}

/// Error types that can occur during a conversion.
///
/// Validation errors are reported before any backend work starts. Backend
/// edge cases (a branch too short to trace, a dot that cannot be placed) are
/// never surfaced here: they are skipped locally.
#[derive(Debug, Error)]
pub enum ConversionError {
    /// Malformed dimensions or pixel buffer.
    #[error("Invalid image: {reason}")]
    InvalidImage { reason: String },
    /// A numeric option is out of range.
    #[error("Invalid parameter `{field}`: {reason}")]
    InvalidParameters { field: &'static str, reason: String },
    /// Cooperative cancellation or timeout.
    #[error("Conversion cancelled: {reason}")]
    Cancelled { reason: CancelReason },
    /// Unexpected numerical degeneracy inside a backend.
    #[error("{backend} backend failed during {stage}: {message}")]
    InternalAlgorithmFailure {
        backend: Backend,
        stage: &'static str,
        message: String,
    },
}

impl ConversionError {
    pub fn invalid_image(reason: impl Into<String>) -> Self {
        Self::InvalidImage {
            reason: reason.into(),
        }
    }

    pub fn invalid_parameter(field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidParameters {
            field,
            reason: reason.into(),
        }
    }

    pub fn internal(backend: Backend, stage: &'static str, message: impl Into<String>) -> Self {
        Self::InternalAlgorithmFailure {
            backend,
            stage,
            message: message.into(),
        }
    }

    /// True for both caller cancellation and timeouts.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// Thread pool lifecycle errors.
///
/// `convert` never returns these: a pool that cannot be built degrades to
/// sequential execution.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("thread pool is already initialized")]
    AlreadyInitialized,
    #[error("threads are not supported on this target")]
    NotSupported,
    #[error("failed to build thread pool: {0}")]
    Build(String),
}
