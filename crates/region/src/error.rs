//! Error types for nebula-region
//!
//! Uses thiserror for the error enum. Every failure surfaced by the
//! allocator, the pools and the cleanup registry falls into one of the
//! coarse [`ErrorKind`] buckets, which is what callers usually branch on.

use thiserror::Error;

use crate::pool::PoolId;

// ============================================================================
// Main Error Types
// ============================================================================

/// Region allocator errors
#[must_use = "errors should be handled"]
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    // --- Allocation Errors ---
    #[error("Out of memory: the system heap refused {size} bytes")]
    OutOfMemory { size: usize },

    #[error("Size overflow during operation: {operation}")]
    SizeOverflow { operation: String },

    // --- Argument Errors ---
    #[error("Invalid argument: {reason}")]
    InvalidArgument { reason: String },

    #[error("Invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    // --- Lifecycle Errors ---
    #[error("Logic error: {reason}")]
    LogicError { reason: String },

    // --- Callback Errors ---
    #[error("Cleanup failed: {reason}")]
    CleanupFailed { reason: String },
}

/// Coarse classification of [`MemoryError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The system heap could not satisfy a request, or a size did not fit
    OutOfMemory,
    /// A required argument was missing or malformed
    InvalidArgument,
    /// An operation was issued against a pool in the wrong state, or a
    /// cleanup reported failure
    LogicError,
}

impl MemoryError {
    /// Classify the error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::OutOfMemory { .. } | Self::SizeOverflow { .. } => ErrorKind::OutOfMemory,
            Self::InvalidArgument { .. } | Self::InvalidConfig { .. } => {
                ErrorKind::InvalidArgument
            }
            Self::LogicError { .. } | Self::CleanupFailed { .. } => ErrorKind::LogicError,
        }
    }

    /// Get error code for categorization
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::OutOfMemory { .. } => "REGION:ALLOC:OOM",
            Self::SizeOverflow { .. } => "REGION:ALLOC:OVERFLOW",
            Self::InvalidArgument { .. } => "REGION:ARG:INVALID",
            Self::InvalidConfig { .. } => "REGION:CONFIG:INVALID",
            Self::LogicError { .. } => "REGION:POOL:LOGIC",
            Self::CleanupFailed { .. } => "REGION:CLEANUP:FAILED",
        }
    }

    /// True for failures that the abort hook is told about
    #[must_use]
    pub fn is_out_of_memory(&self) -> bool {
        self.kind() == ErrorKind::OutOfMemory
    }

    // ============================================================================
    // Convenience Constructors
    // ============================================================================

    /// Create out of memory error
    #[must_use]
    pub fn out_of_memory(size: usize) -> Self {
        Self::OutOfMemory { size }
    }

    /// Create size overflow error
    pub fn size_overflow(operation: &str) -> Self {
        Self::SizeOverflow {
            operation: operation.to_string(),
        }
    }

    /// Create invalid argument error
    pub fn invalid_argument(reason: &str) -> Self {
        Self::InvalidArgument {
            reason: reason.to_string(),
        }
    }

    /// Create invalid config error
    pub fn invalid_config(reason: &str) -> Self {
        Self::InvalidConfig {
            reason: reason.to_string(),
        }
    }

    /// Create logic error
    pub fn logic(reason: &str) -> Self {
        Self::LogicError {
            reason: reason.to_string(),
        }
    }

    /// The pool was destroyed before the call
    #[must_use]
    pub fn pool_destroyed(id: PoolId) -> Self {
        Self::LogicError {
            reason: format!("pool {id} has been destroyed"),
        }
    }

    /// The calling thread is not the one that created the pool
    #[must_use]
    pub fn wrong_thread(id: PoolId) -> Self {
        Self::LogicError {
            reason: format!("pool {id} used from a thread other than its owner"),
        }
    }

    /// Cancel or child-replace for a (data, function) pair that was never registered
    #[must_use]
    pub fn cleanup_not_registered() -> Self {
        Self::LogicError {
            reason: "no cleanup registered for this data and function".to_string(),
        }
    }

    /// Create cleanup failure, for use by cleanup callbacks
    pub fn cleanup_failed(reason: &str) -> Self {
        Self::CleanupFailed {
            reason: reason.to_string(),
        }
    }
}

// ============================================================================
// Result Types
// ============================================================================

/// Result type for region operations
pub type MemoryResult<T> = core::result::Result<T, MemoryError>;

// ============================================================================
// Tests
// ============================================================================
