//! Supervisor 전용 에러 타입. 에러 종류를 구분하여 IPC 핸들러에서
//! 적절한 HTTP 상태 코드를 반환할 수 있게 합니다.

use axum::http::StatusCode;

use super::tracker::TrackerError;
use crate::deps::InstallError;
use crate::store::StoreError;
use crate::workspace::WorkspaceError;

/// Supervisor 작업 중 발생할 수 있는 에러 유형
#[derive(thiserror::Error, Debug)]
pub enum SupervisorError {
    #[error("Job '{0}' not found")]
    NotFound(String),

    #[error("Job '{0}' is already running")]
    AlreadyRunning(String),

    #[error("Job '{0}' has no entry script installed")]
    MissingEntry(String),

    #[error("All {limit} execution slots are in use")]
    CapacityExceeded { limit: usize },

    #[error("Failed to start job '{job}': {reason}")]
    SpawnFailed { job: String, reason: String },

    #[error("A job named '{0}' already exists")]
    DuplicateName(String),

    #[error("Dependency installation failed: {0}")]
    DependencyInstall(#[from] InstallError),

    #[error("Invalid script: {0}")]
    InvalidScript(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Supervisor is shutting down")]
    ShuttingDown,

    #[error("Store error: {0}")]
    Store(StoreError),

    #[error("{0}")]
    Internal(#[from] anyhow::Error),
}

impl From<StoreError> for SupervisorError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Duplicate { name, .. } => Self::DuplicateName(name),
            StoreError::UnknownId(id) => Self::NotFound(format!("#{}", id)),
            other => Self::Store(other),
        }
    }
}

impl From<TrackerError> for SupervisorError {
    fn from(e: TrackerError) -> Self {
        Self::Internal(anyhow::anyhow!(e))
    }
}

impl From<WorkspaceError> for SupervisorError {
    fn from(e: WorkspaceError) -> Self {
        match e {
            WorkspaceError::Io(io) => Self::Internal(anyhow::anyhow!(io)),
            other => Self::InvalidScript(other.to_string()),
        }
    }
}

impl SupervisorError {
    /// HTTP 상태 코드 매핑
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::AlreadyRunning(_) | Self::DuplicateName(_) => StatusCode::CONFLICT,
            Self::MissingEntry(_) | Self::InvalidScript(_) | Self::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::CapacityExceeded { .. } | Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::SpawnFailed { .. } | Self::DependencyInstall(_) => StatusCode::BAD_GATEWAY,
            Self::Store(_) | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// JSON 에러 응답 생성
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
            Self::NotFound(_) => "NOT_FOUND",
            Self::AlreadyRunning(_) => "ALREADY_RUNNING",
            Self::MissingEntry(_) => "MISSING_ENTRY",
            Self::CapacityExceeded { .. } => "CAPACITY_EXCEEDED",
            Self::SpawnFailed { .. } => "SPAWN_FAILED",
            Self::DuplicateName(_) => "DUPLICATE_NAME",
            Self::DependencyInstall(_) => "DEPENDENCY_INSTALL_FAILED",
            Self::InvalidScript(_) => "INVALID_SCRIPT",
            Self::InvalidRequest(_) => "INVALID_REQUEST",
            Self::ShuttingDown => "SHUTTING_DOWN",
            Self::Store(_) => "STORE_ERROR",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

/// axum 핸들러에서 SupervisorError를 직접 반환할 수 있도록 IntoResponse 구현
impl axum::response::IntoResponse for SupervisorError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = axum::Json(self.to_json());
        (status, body).into_response()
    }
}
