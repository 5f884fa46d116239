//! Supervisor 전용 에러 타입. 명령 요청 자체의 문제와 서버 작업의
//! 실패를 구분합니다.

use crate::server::ServerError;

/// Failure of one dispatched command.
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Provided values missing required argument: {0}")]
    MissingArgument(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0}")]
    PermissionDenied(String),

    #[error(transparent)]
    Server(#[from] ServerError),
}

impl SupervisorError {
    /// Request-level errors mean the operation was never attempted.
    pub fn is_request_error(&self) -> bool {
        !matches!(self, Self::Server(_))
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "success": false,
            "error": self.to_string(),
            "error_code": self.error_code(),
        })
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::UnknownCommand(_) => "UNKNOWN_COMMAND",
            Self::MissingArgument(_) => "MISSING_ARGUMENT",
            Self::InvalidArgument(_) => "INVALID_ARGUMENT",
            Self::PermissionDenied(_) => "PERMISSION_DENIED",
            Self::Server(e) => e.error_code(),
        }
    }
}

pub type SupervisorResult<T> = Result<T, SupervisorError>;
