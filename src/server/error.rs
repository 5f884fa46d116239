//! Error taxonomy for operations on a single instance.

use crate::protocol::ProtocolError;

/// Outcome of a failed [`ManagedServer`](super::ManagedServer) operation.
#[derive(thiserror::Error, Debug)]
pub enum ServerError {
    /// A `verify` gate did not hold. Carries the test name, e.g. `!up`.
    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("{tool} failed: {detail}")]
    ExternalTool { tool: String, detail: String },

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("{0}")]
    Timeout(String),

    #[error("config document {0} is corrupt")]
    ConfigCorruption(String),

    #[error("ownership: {0}")]
    Ownership(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Launch settings or command arguments that can never succeed.
    #[error("{0}")]
    InvalidArgument(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ServerError {
    pub fn tool(tool: &str, detail: impl Into<String>) -> Self {
        Self::ExternalTool {
            tool: tool.to_string(),
            detail: detail.into(),
        }
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Precondition(_) => "PRECONDITION_FAILED",
            Self::ExternalTool { .. } => "EXTERNAL_TOOL_FAILED",
            Self::Protocol(_) => "PROTOCOL_FAILED",
            Self::Timeout(_) => "TIMEOUT",
            Self::ConfigCorruption(_) => "CONFIG_CORRUPTION",
            Self::Ownership(_) => "OWNERSHIP_FAILED",
            Self::NotFound(_) => "NOT_FOUND",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::Io(_) => "IO_ERROR",
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }
}

pub type ServerResult<T> = Result<T, ServerError>;
