use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Errors raised anywhere in the orchestration layer.
///
/// The execution backend and the analysis services never let these escape:
/// they are folded into error-status [`AnalysisResult`](crate::AnalysisResult)s.
/// Only the tool registry and the orchestrator propagate them.
#[derive(Error, Debug, Clone)]
pub enum FlowError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("{what} timed out after {}s", .after.as_secs_f64())]
    Timeout { what: String, after: Duration },

    #[error("Malformed response: {message}")]
    MalformedResponse { message: String, raw: String },

    #[error("Remote service returned HTTP {status}: {body}")]
    Remote { status: u16, body: String },

    #[error("Analysis engine failed: {message}")]
    Process { message: String, stderr: String },

    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool {tool} failed: {message}")]
    ToolFailed { tool: String, message: String },

    #[error("Language model request failed: {0}")]
    ModelTransport(String),

    #[error("Language model did not answer within {}s", .0.as_secs())]
    ModelTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for FlowError {
    fn from(err: serde_json::Error) -> Self {
        FlowError::Serialization(err.to_string())
    }
}

impl FlowError {
    pub fn validation(msg: impl Into<String>) -> Self {
        FlowError::Validation(msg.into())
    }

    pub fn malformed(msg: impl Into<String>, raw: impl Into<String>) -> Self {
        FlowError::MalformedResponse {
            message: msg.into(),
            raw: raw.into(),
        }
    }

    /// Classification surfaced on error results.
    pub fn kind(&self) -> FailureKind {
        match self {
            FlowError::Validation(_) => FailureKind::Validation,
            FlowError::BackendUnavailable(_) => FailureKind::BackendUnavailable,
            FlowError::Timeout { .. } | FlowError::ModelTimeout(_) => FailureKind::Timeout,
            FlowError::MalformedResponse { .. } | FlowError::Serialization(_) => {
                FailureKind::MalformedResponse
            }
            FlowError::Remote { .. } => FailureKind::Remote,
            FlowError::Process { .. } => FailureKind::Process,
            FlowError::ToolNotFound(_)
            | FlowError::ToolFailed { .. }
            | FlowError::ModelTransport(_)
            | FlowError::Config(_) => FailureKind::Internal,
        }
    }

    /// Captured engine or server output worth showing next to the message.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            FlowError::MalformedResponse { raw, .. } if !raw.is_empty() => Some(raw),
            FlowError::Process { stderr, .. } if !stderr.is_empty() => Some(stderr),
            _ => None,
        }
    }
}

/// Why a sub-analysis did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Validation,
    BackendUnavailable,
    Timeout,
    MalformedResponse,
    Remote,
    Process,
    PartialFailure,
    Internal,
}

pub type Result<T> = std::result::Result<T, FlowError>;
