//! 에러 처리
//!
//! ## 지원하는 에러 상황
//! - 원격 버전 확인 실패 (네트워크 끊김 / 타임아웃 / 스토어 응답 오류)
//! - 호스트 업데이트 확인 요청 실패
//! - 리로드(재시작) 실패
//! - 저장소 읽기/쓰기 오류
//!
//! 이 서브시스템의 어떤 에러도 호스트 프로세스에 치명적이지 않습니다.
//! 모든 실패는 FSM의 `Failed` 상태로 귀결되며 사용자가 재시도할 수 있습니다.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 저장소 계층 에러
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage I/O error on '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("storage document is malformed: {0}")]
    Malformed(String),

    #[error("storage lock poisoned")]
    Poisoned,
}

/// 코디네이터 에러 타입
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[serde(tag = "type", content = "details")]
pub enum CoordinatorError {
    /// 영속 저장소 오류
    #[error("Storage error: {message}")]
    Storage { message: String },

    /// 직렬화/역직렬화 오류
    #[error("Serialization error: {message}")]
    Serialization { message: String },

    /// 원격 버전 확인 실패
    #[error("Remote version probe failed: {message}")]
    Probe { message: String, recoverable: bool },

    /// 호스트 업데이트 확인 요청 실패
    #[error("Host update check failed: {message}")]
    HostCheck { message: String },

    /// 리로드 호출 실패
    #[error("Reload failed: {message}")]
    Reload { message: String },

    /// 작업 타임아웃
    #[error("Timeout after {duration_secs}s: {operation}")]
    Timeout { operation: String, duration_secs: u64 },

    /// 설정 오류
    #[error("Configuration error: {message}")]
    Config { message: String },

    /// 현재 FSM 상태에서 수행할 수 없는 요청
    #[error("Invalid state: {message}")]
    InvalidState { message: String },
}

impl CoordinatorError {
    /// 복구 가능한 에러인지 확인
    pub fn is_recoverable(&self) -> bool {
        match self {
            CoordinatorError::Storage { .. } => false,
            CoordinatorError::Serialization { .. } => false,
            CoordinatorError::Probe { recoverable, .. } => *recoverable,
            CoordinatorError::HostCheck { .. } => true,
            CoordinatorError::Reload { .. } => true, // Failed → Check 로 재시도
            CoordinatorError::Timeout { .. } => true,
            CoordinatorError::Config { .. } => false,
            CoordinatorError::InvalidState { .. } => true,
        }
    }

    /// 머신 리더블 에러 코드
    pub fn error_code(&self) -> &'static str {
        match self {
            CoordinatorError::Storage { .. } => "STORAGE_ERROR",
            CoordinatorError::Serialization { .. } => "SERIALIZATION_ERROR",
            CoordinatorError::Probe { .. } => "PROBE_FAILED",
            CoordinatorError::HostCheck { .. } => "HOST_CHECK_FAILED",
            CoordinatorError::Reload { .. } => "RELOAD_FAILED",
            CoordinatorError::Timeout { .. } => "TIMEOUT",
            CoordinatorError::Config { .. } => "INVALID_CONFIG",
            CoordinatorError::InvalidState { .. } => "INVALID_STATE",
        }
    }

    /// 사용자에게 표시할 메시지
    pub fn user_message(&self) -> String {
        match self {
            CoordinatorError::Probe { .. } => {
                "업데이트 서버에 연결할 수 없습니다. 인터넷 연결을 확인해주세요.".to_string()
            }
            CoordinatorError::HostCheck { .. } => {
                "업데이트 확인에 실패했습니다. 잠시 후 다시 시도해주세요.".to_string()
            }
            CoordinatorError::Reload { .. } => {
                "업데이트 적용에 실패했습니다. 다시 시도해주세요.".to_string()
            }
            CoordinatorError::Timeout { .. } => {
                "업데이트 다운로드가 지연되고 있습니다. 잠시 후 다시 시도해주세요.".to_string()
            }
            CoordinatorError::Storage { .. } | CoordinatorError::Serialization { .. } => {
                "업데이트 상태를 저장하는 중 오류가 발생했습니다.".to_string()
            }
            CoordinatorError::Config { message } => {
                format!("설정 오류: {}", message)
            }
            CoordinatorError::InvalidState { .. } => {
                "적용할 업데이트가 없습니다.".to_string()
            }
        }
    }

    /// reqwest 에러를 CoordinatorError로 변환
    pub fn from_reqwest(err: &reqwest::Error, operation: &str) -> Self {
        if err.is_timeout() {
            CoordinatorError::Timeout {
                operation: operation.to_string(),
                duration_secs: 30,
            }
        } else if let Some(status) = err.status() {
            CoordinatorError::Probe {
                message: format!("{} ({})", err, status.as_u16()),
                recoverable: status.is_server_error(),
            }
        } else {
            CoordinatorError::Probe {
                message: err.to_string(),
                recoverable: err.is_connect() || err.is_request() || err.is_body(),
            }
        }
    }
}

impl From<StoreError> for CoordinatorError {
    fn from(err: StoreError) -> Self {
        CoordinatorError::Storage { message: err.to_string() }
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(err: serde_json::Error) -> Self {
        CoordinatorError::Serialization { message: err.to_string() }
    }
}

/// 에러 컨텍스트 (디버깅/로깅용)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorContext {
    pub timestamp: String,
    pub operation: String,
    pub error: CoordinatorError,
}

impl ErrorContext {
    pub fn new(operation: &str, error: CoordinatorError) -> Self {
        Self {
            timestamp: chrono::Utc::now().to_rfc3339(),
            operation: operation.to_string(),
            error,
        }
    }

    /// 로그 출력
    pub fn log(&self) {
        if self.error.is_recoverable() {
            tracing::warn!("[Error] {} (recoverable): {}", self.operation, self.error);
        } else {
            tracing::error!("[Error] {} (fatal): {}", self.operation, self.error);
        }
    }
}
