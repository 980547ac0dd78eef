//! 데몬 내장 업데이트 API (`/api/updates/*`, `/api/host/*`)
//!
//! UI 페이지 메시지(check/apply/status)를 코디네이터로 전달하고,
//! 호스트 측 신호(다운로드 완료, 네비게이션)를 받아 코디네이터에 흘려보냅니다.
//!
//! ## 엔드포인트
//! - `POST /api/updates/check` : 수동 업데이트 확인
//! - `POST /api/updates/apply` : 내려받은 업데이트 적용 (`{ "source": "options" }`)
//! - `GET  /api/updates/status` : UI 상태 조회 (직전 결과를 한 번 소비)
//! - `GET  /api/updates/state` : FSM 상태/레코드 조회 (소비 없음)
//! - `POST /api/host/update-available` : 호스트 다운로드 완료 알림
//! - `POST /api/host/navigation` : 사용자 네비게이션 신호
//! - `GET  /api/host/page` : 재시작 후 열어야 할 페이지

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use update_coordinator_lib::{
    dispatch, Clock, SystemClock, UpdateCoordinator, UpdateSource, UpdaterCommand, UpdaterResponse,
};

use crate::host::DaemonHost;

// ═══════════════════════════════════════════════════════
// 공유 상태
// ═══════════════════════════════════════════════════════

#[derive(Clone)]
pub struct UpdateApiState {
    pub coordinator: Arc<UpdateCoordinator>,
    pub host: Arc<DaemonHost>,
}

impl UpdateApiState {
    pub fn new(coordinator: Arc<UpdateCoordinator>, host: Arc<DaemonHost>) -> Self {
        Self { coordinator, host }
    }
}

// ═══════════════════════════════════════════════════════
// 라우터
// ═══════════════════════════════════════════════════════

/// `/api/updates/*`, `/api/host/*` 라우트를 포함하는 axum Router 생성
pub fn updates_router(state: UpdateApiState) -> Router {
    Router::new()
        .route("/api/updates/check", post(check_for_update))
        .route("/api/updates/apply", post(apply_update))
        .route("/api/updates/status", get(get_status))
        .route("/api/updates/state", get(get_state))
        .route("/api/host/update-available", post(host_update_available))
        .route("/api/host/navigation", post(host_navigation))
        .route("/api/host/page", get(take_page))
        .with_state(state)
}

// ═══════════════════════════════════════════════════════
// 핸들러
// ═══════════════════════════════════════════════════════

/// POST /api/updates/check
async fn check_for_update(State(state): State<UpdateApiState>) -> impl IntoResponse {
    respond(dispatch(&state.coordinator, UpdaterCommand::CheckForUpdate).await)
}

#[derive(Deserialize)]
struct ApplyRequest {
    source: UpdateSource,
}

/// POST /api/updates/apply: 성공하면 데몬이 곧 재시작됩니다
async fn apply_update(
    State(state): State<UpdateApiState>,
    Json(body): Json<ApplyRequest>,
) -> impl IntoResponse {
    respond(dispatch(&state.coordinator, UpdaterCommand::ApplyUpdate { source: body.source }).await)
}

/// GET /api/updates/status
async fn get_status(State(state): State<UpdateApiState>) -> impl IntoResponse {
    respond(dispatch(&state.coordinator, UpdaterCommand::GetUpdateStatus).await)
}

/// GET /api/updates/state: 디버깅/툴바 아이콘용
async fn get_state(State(state): State<UpdateApiState>) -> impl IntoResponse {
    let coordinator = &state.coordinator;
    Json(json!({
        "ok": true,
        "state": coordinator.state(),
        "show_update_icon": coordinator.should_show_update_icon(),
        "auto_monitoring": coordinator.is_auto_monitoring(),
        "record": coordinator.record(),
    }))
}

#[derive(Deserialize)]
struct UpdateAvailableRequest {
    version: String,
}

/// POST /api/host/update-available
async fn host_update_available(
    State(state): State<UpdateApiState>,
    Json(body): Json<UpdateAvailableRequest>,
) -> impl IntoResponse {
    if body.version.trim().is_empty() {
        return Json(json!({
            "ok": false,
            "error": "version is required",
            "error_code": "INVALID_REQUEST",
        }));
    }

    let receivers = state.host.notify_update_available(body.version);
    Json(json!({
        "ok": true,
        "delivered": receivers > 0,
    }))
}

#[derive(Deserialize)]
struct NavigationRequest {
    #[serde(default)]
    timestamp: Option<i64>,
}

/// POST /api/host/navigation: 타임스탬프가 없으면 현재 시각
async fn host_navigation(
    State(state): State<UpdateApiState>,
    body: Option<Json<NavigationRequest>>,
) -> impl IntoResponse {
    let timestamp = body
        .and_then(|Json(body)| body.timestamp)
        .unwrap_or_else(|| SystemClock.now_ms());
    let receivers = state.host.notify_navigation(timestamp);
    Json(json!({
        "ok": true,
        "timestamp": timestamp,
        "delivered": receivers > 0,
    }))
}

/// GET /api/host/page
async fn take_page(State(state): State<UpdateApiState>) -> impl IntoResponse {
    Json(json!({
        "ok": true,
        "page": state.host.take_pending_page(),
    }))
}

// ═══════════════════════════════════════════════════════
// 응답 변환
// ═══════════════════════════════════════════════════════

/// 코디네이터 응답을 `{ok, ...}` JSON으로 평탄화
fn respond(response: UpdaterResponse) -> Json<Value> {
    match response {
        UpdaterResponse::Success { data } => {
            let mut body = json!({ "ok": true });
            match (body.as_object_mut(), data) {
                (Some(out), Value::Object(fields)) => out.extend(fields),
                (Some(out), other) => {
                    out.insert("data".to_string(), other);
                }
                (None, _) => {}
            }
            Json(body)
        }
        UpdaterResponse::Error {
            message,
            recoverable,
            error_code,
        } => {
            tracing::warn!("[Updates] Request failed: {} ({})", message, error_code);
            Json(json!({
                "ok": false,
                "error": message,
                "error_code": error_code,
                "recoverable": recoverable,
            }))
        }
    }
}
