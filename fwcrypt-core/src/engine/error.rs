//! Error Taxonomy
//!
//! This module provides the error types for the analysis engine using `thiserror`.
//! Every error carries a stable machine-readable code and a category so callers can
//! decide whether to retry, fix their input, or report a fault.
//!
//! # Error Categories
//! - **InputError**: malformed or unsupported file (user-correctable)
//! - **PartialDecodeFailure**: one function or region undecodable (report diagnostic)
//! - **ReconstructionFailure**: cyclic or unresolvable protocol graph (report diagnostic)
//! - **ResourceExhaustion**: timeout, pool saturation (retryable)
//! - **InternalFault**: unexpected failure (generic message only)
//!
//! Only `InputError`, `ResourceExhaustion`, `InternalFault` and caller cancellation abort a
//! job. The two diagnostic categories are attached to the report as [`Diagnostic`] entries.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Broad error class, stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ErrorCategory {
    InputError = 0,
    PartialDecodeFailure = 1,
    ReconstructionFailure = 2,
    ResourceExhaustion = 3,
    InternalFault = 4,
    /// Caller-initiated cancellation. Not a failure of the engine.
    Cancelled = 5,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::InputError => "InputError",
            ErrorCategory::PartialDecodeFailure => "PartialDecodeFailure",
            ErrorCategory::ReconstructionFailure => "ReconstructionFailure",
            ErrorCategory::ResourceExhaustion => "ResourceExhaustion",
            ErrorCategory::InternalFault => "InternalFault",
            ErrorCategory::Cancelled => "Cancelled",
        }
    }

    /// Whether a caller may resubmit the same input and expect a different outcome.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorCategory::ResourceExhaustion)
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Job-level analysis error.
///
/// Returned when an analysis cannot produce an [`AnalysisReport`](crate::engine::report::AnalysisReport).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AnalysisError {
    /// Zero-length input buffer.
    #[error("input is empty")]
    EmptyInput,

    /// A declared section or header table extends past the end of the buffer.
    #[error("{what} at offset 0x{offset:X} (size 0x{size:X}) exceeds input length 0x{len:X}")]
    Truncated {
        what: String,
        offset: u64,
        size: u64,
        len: u64,
    },

    /// Unrecognized or unsupported container format.
    #[error("unsupported format: {0}")]
    UnsupportedFormat(String),

    /// Architecture detection confidence fell below the threshold.
    #[error("unable to determine instruction set architecture (confidence {confidence:.2})")]
    UnknownArchitecture { confidence: f64 },

    /// Upload exceeded the configured size limit.
    #[error("input of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    /// Per-job wall-clock budget exhausted.
    #[error("analysis exceeded its {}s time budget", budget.as_secs())]
    AnalysisTimeout { budget: Duration },

    /// Admission queue is full.
    #[error("analysis queue is full ({capacity} jobs); retry later")]
    PoolSaturated { capacity: usize },

    /// Job cancelled by the caller.
    #[error("analysis cancelled")]
    Cancelled,

    /// Unexpected engine fault. The message is logged, never returned to API callers.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AnalysisError {
    /// Create a truncation error for a region of the input.
    #[cold]
    pub fn truncated(what: impl Into<String>, offset: u64, size: u64, len: usize) -> Self {
        Self::Truncated {
            what: what.into(),
            offset,
            size,
            len: len as u64,
        }
    }

    /// Create an unsupported-format error.
    #[cold]
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::UnsupportedFormat(message.into())
    }

    /// Create an internal fault.
    #[cold]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            AnalysisError::EmptyInput
            | AnalysisError::Truncated { .. }
            | AnalysisError::UnsupportedFormat(_)
            | AnalysisError::UnknownArchitecture { .. }
            | AnalysisError::PayloadTooLarge { .. } => ErrorCategory::InputError,
            AnalysisError::AnalysisTimeout { .. } | AnalysisError::PoolSaturated { .. } => {
                ErrorCategory::ResourceExhaustion
            }
            AnalysisError::Cancelled => ErrorCategory::Cancelled,
            AnalysisError::Internal(_) => ErrorCategory::InternalFault,
        }
    }

    /// Stable error code.
    pub fn code(&self) -> &'static str {
        match self {
            AnalysisError::EmptyInput => "EmptyInput",
            AnalysisError::Truncated { .. } => "Truncated",
            AnalysisError::UnsupportedFormat(_) => "UnsupportedFormat",
            AnalysisError::UnknownArchitecture { .. } => "UnknownArchitecture",
            AnalysisError::PayloadTooLarge { .. } => "PayloadTooLarge",
            AnalysisError::AnalysisTimeout { .. } => "AnalysisTimeout",
            AnalysisError::PoolSaturated { .. } => "PoolSaturated",
            AnalysisError::Cancelled => "Cancelled",
            AnalysisError::Internal(_) => "InternalFault",
        }
    }

    /// Message that is safe to hand to an external caller.
    ///
    /// Internal faults collapse to a generic sentence; everything else is user-facing already.
    pub fn public_message(&self) -> String {
        match self {
            AnalysisError::Internal(_) => "the analysis failed unexpectedly".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<std::io::Error> for AnalysisError {
    #[cold]
    fn from(err: std::io::Error) -> Self {
        AnalysisError::Internal(format!("IO error: {}", err))
    }
}

/// Instruction decoding failure for a single instruction.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough bytes left in the section for a complete instruction.
    #[error("instruction at 0x{address:X} is truncated ({available} bytes available)")]
    Truncated { address: u64, available: usize },

    /// Encoding is invalid or outside the supported subset.
    #[error("invalid or unsupported encoding 0x{raw:X} at 0x{address:X}")]
    InvalidEncoding { address: u64, raw: u64 },
}

impl DecodeError {
    pub fn address(&self) -> u64 {
        match self {
            DecodeError::Truncated { address, .. } | DecodeError::InvalidEncoding { address, .. } => {
                *address
            }
        }
    }
}

/// Non-fatal, stage-local problem recorded in the report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub category: ErrorCategory,
    /// Stable code (`DecodeError`, `CyclicProtocolGraph`, ...)
    pub code: String,
    pub message: String,
    /// Function entry or region the diagnostic refers to
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<u64>,
}

impl Diagnostic {
    pub fn decode_failure(function_entry: u64, err: &DecodeError) -> Self {
        Self {
            category: ErrorCategory::PartialDecodeFailure,
            code: "DecodeError".to_string(),
            message: format!("function at 0x{:X} excluded: {}", function_entry, err),
            address: Some(function_entry),
        }
    }

    pub fn cyclic_protocol(instance: usize, detections: &[String]) -> Self {
        Self {
            category: ErrorCategory::ReconstructionFailure,
            code: "CyclicProtocolGraph".to_string(),
            message: format!(
                "protocol instance {} has a cyclic invocation order between {}",
                instance,
                detections.join(", ")
            ),
            address: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories_and_codes() {
        assert_eq!(AnalysisError::EmptyInput.category(), ErrorCategory::InputError);
        assert_eq!(
            AnalysisError::UnknownArchitecture { confidence: 0.1 }.code(),
            "UnknownArchitecture"
        );
        let timeout = AnalysisError::AnalysisTimeout {
            budget: Duration::from_secs(5),
        };
        assert_eq!(timeout.category(), ErrorCategory::ResourceExhaustion);
        assert!(timeout.category().is_retryable());
        assert_ne!(timeout.code(), AnalysisError::Cancelled.code());
    }

    #[test]
    fn test_internal_fault_message_is_generic() {
        let err = AnalysisError::internal("index 7 out of range in block map");
        assert_eq!(err.category(), ErrorCategory::InternalFault);
        assert!(!err.public_message().contains("block map"));
    }
}
