use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::records::GenerationStatus;

/// Classification of an upstream image-synthesis failure. Only transient
/// classes consume retry budget; the rest fail the attempt loop immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Timeout,
    RateLimited,
    Upstream,
    InvalidArgument,
    ContentPolicy,
}

impl FailureClass {
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            FailureClass::Timeout | FailureClass::RateLimited | FailureClass::Upstream
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FailureClass::Timeout => "timeout",
            FailureClass::RateLimited => "rate_limited",
            FailureClass::Upstream => "upstream",
            FailureClass::InvalidArgument => "invalid_argument",
            FailureClass::ContentPolicy => "content_policy",
        }
    }
}

impl std::fmt::Display for FailureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum StudioError {
    #[error("session cache unavailable: {reason}")]
    CacheUnavailable { reason: String },

    #[error("illegal generation status transition: {from} -> {to}")]
    InvalidTransition {
        from: GenerationStatus,
        to: GenerationStatus,
    },

    #[error("image generation failed after {attempts} attempt(s) [{class}]: {cause}")]
    GenerationFailed {
        attempts: u32,
        class: FailureClass,
        cause: String,
    },

    #[error("artifact storage failed: {cause}")]
    StorageFailed { cause: String },
}
