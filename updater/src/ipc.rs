//! UI ↔ 코디네이터 메시지
//!
//! UI 페이지(옵션, 팝업)가 보내는 세 가지 요청과 응답 형식입니다.
//! 데몬은 같은 메시지를 `/api/updates/*` 엔드포인트로도 노출합니다.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::coordinator::UpdateCoordinator;
use crate::error::CoordinatorError;
use crate::state::UpdateSource;

/// UI에서 코디네이터로 보내는 메시지
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpdaterCommand {
    /// 수동 업데이트 확인
    CheckForUpdate,
    /// 내려받은 업데이트 적용
    ApplyUpdate { source: UpdateSource },
    /// 상태 조회 (직전 업데이트 결과를 한 번 소비)
    GetUpdateStatus,
}

/// 코디네이터에서 UI로 보내는 응답
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpdaterResponse {
    Success { data: serde_json::Value },
    Error {
        message: String,
        recoverable: bool,
        error_code: String,
    },
}

impl UpdaterResponse {
    pub fn ok<T: Serialize>(data: &T) -> Self {
        match serde_json::to_value(data) {
            Ok(data) => UpdaterResponse::Success { data },
            Err(e) => CoordinatorError::from(e).into(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, UpdaterResponse::Success { .. })
    }
}

impl From<CoordinatorError> for UpdaterResponse {
    fn from(err: CoordinatorError) -> Self {
        UpdaterResponse::Error {
            message: err.user_message(),
            recoverable: err.is_recoverable(),
            error_code: err.error_code().to_string(),
        }
    }
}

/// 메시지 처리
pub async fn dispatch(coordinator: &Arc<UpdateCoordinator>, command: UpdaterCommand) -> UpdaterResponse {
    tracing::debug!("[Updates] Handling {:?}", command);

    match command {
        UpdaterCommand::CheckForUpdate => match coordinator.check().await {
            Ok(outcome) => UpdaterResponse::ok(&serde_json::json!({
                "outcome": outcome,
                "state": coordinator.state(),
            })),
            Err(e) => e.into(),
        },
        UpdaterCommand::ApplyUpdate { source } => match coordinator.apply_update(source).await {
            Ok(()) => UpdaterResponse::ok(&serde_json::json!({ "state": coordinator.state() })),
            Err(e) => e.into(),
        },
        UpdaterCommand::GetUpdateStatus => UpdaterResponse::ok(&coordinator.get_update_status()),
    }
}
