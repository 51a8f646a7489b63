use std::fmt;

use thiserror::Error;

use crate::{Handle, RequestId};

/// Coarse classification of why the external engine refused to construct a
/// model instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreationReason {
    NotFound,
    UnsupportedFormat,
    OutOfMemory,
    Unknown,
}

impl CreationReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CreationReason::NotFound => "not found",
            CreationReason::UnsupportedFormat => "unsupported format",
            CreationReason::OutOfMemory => "out of memory",
            CreationReason::Unknown => "unknown",
        }
    }

    /// Best-effort classification of a raw engine message.
    pub fn classify(message: &str) -> Self {
        let lower = message.to_lowercase();
        if lower.contains("not found")
            || lower.contains("no such file")
            || lower.contains("does not exist")
            || lower.contains("cannot open")
        {
            CreationReason::NotFound
        } else if lower.contains("out of memory")
            || lower.contains("oom")
            || lower.contains("too large")
            || lower.contains("allocat")
        {
            CreationReason::OutOfMemory
        } else if lower.contains("format")
            || lower.contains("unsupported")
            || lower.contains("magic")
            || lower.contains("corrupt")
        {
            CreationReason::UnsupportedFormat
        } else {
            CreationReason::Unknown
        }
    }
}

impl fmt::Display for CreationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum BridgeError {
    #[error("No model found for handle {0}")]
    InvalidHandle(Handle),

    #[error("Invalid model parameters: {0}")]
    InvalidParams(String),

    #[error("Model creation failed ({reason}): {message}")]
    Creation {
        reason: CreationReason,
        message: String,
    },

    #[error("{0}")]
    Generation(String),

    #[error("Request {request_id} is already outstanding on handle {handle}")]
    DuplicateRequestId { handle: Handle, request_id: RequestId },

    #[error("Handle {0} was released while the request was pending")]
    HandleReleased(Handle),

    #[error("Memory probe failed: {0}")]
    MemoryProbe(String),
}

impl BridgeError {
    pub fn creation(reason: CreationReason, message: impl Into<String>) -> Self {
        BridgeError::Creation {
            reason,
            message: message.into(),
        }
    }

    /// Stable code used on the wire and in rejection payloads.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::InvalidHandle(_) => "INVALID_HANDLE",
            BridgeError::InvalidParams(_) => "INVALID_PARAMS",
            BridgeError::Creation { .. } => "MODEL_CREATION_FAILED",
            BridgeError::Generation(_) => "GENERATION_FAILED",
            BridgeError::DuplicateRequestId { .. } => "DUPLICATE_REQUEST_ID",
            BridgeError::HandleReleased(_) => "HANDLE_RELEASED",
            BridgeError::MemoryProbe(_) => "MEMORY_PROBE_FAILED",
        }
    }
}

pub type Result<T> = std::result::Result<T, BridgeError>;
