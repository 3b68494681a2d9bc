//! Model client boundary.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::messages::{ToolCall, TranscriptEntry};
use crate::tools::ToolSchema;

/// What the model answered for one request.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ModelResponse {
    /// Final answer; the run completes.
    Text {
        /// Answer text.
        text: String,
    },
    /// The model wants tools executed before continuing.
    ToolCalls {
        /// Requested calls, executed in order.
        calls: Vec<ToolCall>,
    },
}

/// Failure of a model request. Always fatal to the run that made it.
#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    /// Transport or provider-side failure.
    #[error("model request failed: {message}")]
    Request {
        /// Provider message.
        message: String,
    },
    /// Provider rejected the request for rate limiting.
    #[error("model rate limited: {message}")]
    RateLimited {
        /// Provider message.
        message: String,
        /// Suggested delay before retrying.
        retry_after_ms: Option<u64>,
    },
    /// Response could not be interpreted.
    #[error("invalid model response: {0}")]
    InvalidResponse(String),
}

impl ModelError {
    /// Whether a human retry is likely to succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Request { .. } | Self::RateLimited { .. })
    }
}

/// Narrow interface to the language model backend.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Produce the next response for `transcript`, offering `tools`.
    async fn respond(
        &self,
        transcript: &[TranscriptEntry],
        tools: &[ToolSchema],
    ) -> Result<ModelResponse, ModelError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_classification() {
        assert!(
            ModelError::Request {
                message: "502".into()
            }
            .is_retryable()
        );
        assert!(
            ModelError::RateLimited {
                message: "slow down".into(),
                retry_after_ms: Some(500)
            }
            .is_retryable()
        );
        assert!(!ModelError::InvalidResponse("garbage".into()).is_retryable());
    }

    #[test]
    fn error_display() {
        let err = ModelError::Request {
            message: "connection reset".into(),
        };
        assert_eq!(err.to_string(), "model request failed: connection reset");
    }

    #[test]
    fn response_wire_format() {
        let resp = ModelResponse::Text { text: "done".into() };
        let value = serde_json::to_value(&resp).unwrap();
        assert_eq!(value["type"], "text");
        assert_eq!(value["text"], "done");
    }
}
