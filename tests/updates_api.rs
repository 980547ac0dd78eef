//! ═══════════════════════════════════════════════════════════════════
//! 업데이트 API 통합 테스트
//! ═══════════════════════════════════════════════════════════════════
//!
//! 데몬 IPC 라우터를 tower::ServiceExt로 직접 호출합니다:
//!
//! 1. **상태 조회**: 초기 상태, 잘못된 요청
//! 2. **자동 흐름**: 호스트 다운로드 알림 → Available, 네비게이션 기록
//! 3. **수동 흐름**: check → 호스트 다운로드 → apply → 리로드 마커
//!
//! 호스트 업데이트 확인 서버는 로컬 axum 서버로 모킹합니다.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

use update_coordinator::host::DaemonHost;
use update_coordinator::ipc::{updates_router, UpdateApiState};
use update_coordinator_lib::{
    Clock, CoordinatorConfig, CoordinatorError, KeyValueStore, MachineTimings, MemoryStore,
    RemoteVersionProbe, SystemClock, UpdateCoordinator, UpdateSource, Version,
};

// ═══════════════════════════════════════════════════════
// 테스트 유틸리티
// ═══════════════════════════════════════════════════════

struct StaticProbe(Option<&'static str>);

#[async_trait]
impl RemoteVersionProbe for StaticProbe {
    async fn latest_version(&self) -> Result<Option<Version>, CoordinatorError> {
        Ok(self.0.and_then(Version::parse))
    }
}

struct TestDaemon {
    app: Router,
    host: Arc<DaemonHost>,
    store: Arc<MemoryStore>,
    coordinator: Arc<UpdateCoordinator>,
}

fn fast_config() -> CoordinatorConfig {
    CoordinatorConfig {
        timings: MachineTimings {
            min_display: Duration::from_millis(20),
            notification_delay: Duration::from_millis(20),
        },
        ..CoordinatorConfig::default()
    }
}

fn daemon(probe: StaticProbe, update_check_url: Option<String>) -> TestDaemon {
    let store = Arc::new(MemoryStore::new());
    let host = Arc::new(
        DaemonHost::new(update_check_url)
            .with_version("1.0.0")
            .without_restart(),
    );
    let coordinator =
        UpdateCoordinator::builder(fast_config(), store.clone(), host.clone(), Arc::new(probe)).build();
    coordinator.init();

    let app = updates_router(UpdateApiState::new(coordinator.clone(), host.clone()));
    TestDaemon { app, host, store, coordinator }
}

/// 호스트 업데이트 확인 응답을 흉내내는 로컬 서버
async fn mock_host_check(status: Value) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = Router::new().route(
        "/check",
        get(move || {
            let status = status.clone();
            async move { Json(status) }
        }),
    );
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{}/check", addr)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };

    let resp = app.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = axum::body::to_bytes(resp.into_body(), 1024 * 64).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

// ═══════════════════════════════════════════════════════
// 1. 상태 조회
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_initial_status_is_idle() {
    let d = daemon(StaticProbe(None), None);

    let (status, json) = call(&d.app, "GET", "/api/updates/status", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], true);
    assert_eq!(json["state"], "idle");
    assert_eq!(json["is_update_available"], false);
    assert_eq!(json["is_reloaded_on_update"], false);

    let (_, json) = call(&d.app, "GET", "/api/updates/state", None).await;
    assert_eq!(json["state"], "idle");
    assert_eq!(json["show_update_icon"], false);
    assert!(json["record"]["nextVersion"].is_null());
}

#[tokio::test]
async fn test_apply_without_update_is_rejected() {
    let d = daemon(StaticProbe(None), None);

    let (status, json) =
        call(&d.app, "POST", "/api/updates/apply", Some(json!({ "source": "popup" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["ok"], false);
    assert_eq!(json["error_code"], "INVALID_STATE");
}

#[tokio::test]
async fn test_apply_with_unknown_source_is_unprocessable() {
    let d = daemon(StaticProbe(None), None);

    let (status, _) =
        call(&d.app, "POST", "/api/updates/apply", Some(json!({ "source": "sidebar" }))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn test_empty_version_notification_is_rejected() {
    let d = daemon(StaticProbe(None), None);

    let (_, json) =
        call(&d.app, "POST", "/api/host/update-available", Some(json!({ "version": " " }))).await;
    assert_eq!(json["ok"], false);
    assert_eq!(json["error_code"], "INVALID_REQUEST");
}

// ═══════════════════════════════════════════════════════
// 2. 자동 흐름
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_host_notification_starts_automatic_flow() {
    let d = daemon(StaticProbe(None), None);

    let (_, json) =
        call(&d.app, "POST", "/api/host/update-available", Some(json!({ "version": "1.1.0" }))).await;
    assert_eq!(json["ok"], true);
    assert_eq!(json["delivered"], true);
    settle().await;

    let (_, json) = call(&d.app, "GET", "/api/updates/state", None).await;
    assert_eq!(json["state"], "available");
    assert_eq!(json["auto_monitoring"], true);
    // 자동 발견은 icon_delay(24시간) 전까지 아이콘 숨김
    assert_eq!(json["show_update_icon"], false);
    assert_eq!(json["record"]["nextVersion"], "1.1.0");
    assert_eq!(json["record"]["isManualCheck"], false);

    let navigated_at = SystemClock.now_ms() - 1000;
    let (_, json) =
        call(&d.app, "POST", "/api/host/navigation", Some(json!({ "timestamp": navigated_at }))).await;
    assert_eq!(json["delivered"], true);
    settle().await;
    assert_eq!(d.coordinator.record().last_navigation_timestamp, Some(navigated_at));
}

#[tokio::test]
async fn test_navigation_without_body_uses_current_time() {
    let d = daemon(StaticProbe(None), None);

    let (status, json) = call(&d.app, "POST", "/api/host/navigation", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(json["timestamp"].as_i64().unwrap() > 0);
    // 자동 흐름이 없으면 구독자도 없음
    assert_eq!(json["delivered"], false);
}

// ═══════════════════════════════════════════════════════
// 3. 수동 흐름
// ═══════════════════════════════════════════════════════

#[tokio::test]
async fn test_check_without_newer_version_reports_no_update() {
    let d = daemon(StaticProbe(Some("1.0.0")), None);

    let (_, json) = call(&d.app, "POST", "/api/updates/check", None).await;
    assert_eq!(json["ok"], true);
    assert_eq!(json["outcome"], "no_update");
    assert!(!d.coordinator.record().is_manual_check);
}

#[tokio::test]
async fn test_manual_check_download_and_apply() {
    let url = mock_host_check(json!({ "status": "update_available", "version": "2.0.0" })).await;
    let d = daemon(StaticProbe(Some("2.0.0")), Some(url));

    let (_, json) = call(&d.app, "POST", "/api/updates/check", None).await;
    assert_eq!(json["ok"], true);
    assert_eq!(json["outcome"], "waiting_for_download");
    assert_eq!(json["state"], "checking");

    // 중복 확인은 무시
    let (_, json) = call(&d.app, "POST", "/api/updates/check", None).await;
    assert_eq!(json["outcome"], "already_checking");

    d.host.notify_update_available("2.0.0".into());
    settle().await;

    let (_, json) = call(&d.app, "GET", "/api/updates/state", None).await;
    assert_eq!(json["state"], "available");
    // 수동 확인은 아이콘 즉시 표시, 자동 모니터링 없음
    assert_eq!(json["show_update_icon"], true);
    assert_eq!(json["auto_monitoring"], false);

    let (_, json) =
        call(&d.app, "POST", "/api/updates/apply", Some(json!({ "source": "options" }))).await;
    assert_eq!(json["ok"], true);
    assert_eq!(json["state"], "updating");

    let marker: Value =
        serde_json::from_str(&d.store.get("update-reload-marker").unwrap().unwrap()).unwrap();
    assert_eq!(marker["initVersion"], "1.0.0");
    assert_eq!(marker["pageToOpenAfterReload"], "options");
    assert_eq!(marker["isOk"], true);
    assert!(d.store.get("update-state").unwrap().is_none());
}

#[tokio::test]
async fn test_throttled_host_reports_no_update() {
    let url = mock_host_check(json!({ "status": "throttled" })).await;
    let d = daemon(StaticProbe(Some("2.0.0")), Some(url));

    let (_, json) = call(&d.app, "POST", "/api/updates/check", None).await;
    assert_eq!(json["outcome"], "no_update");
}

#[tokio::test]
async fn test_page_is_opened_after_reload() {
    let d = daemon(StaticProbe(None), None);
    d.store
        .set(
            "update-reload-marker",
            &json!({ "initVersion": "0.9.0", "pageToOpenAfterReload": "popup", "isOk": true }).to_string(),
        )
        .unwrap();

    d.coordinator.handle_reload(true).await;

    let (_, json) = call(&d.app, "GET", "/api/host/page", None).await;
    assert_eq!(json["page"], "popup");
    let (_, json) = call(&d.app, "GET", "/api/host/page", None).await;
    assert!(json["page"].is_null());

    let (_, json) = call(&d.app, "GET", "/api/updates/status", None).await;
    assert_eq!(json["is_reloaded_on_update"], true);
    assert_eq!(json["is_successful_update"], true);
    assert_eq!(d.host.take_pending_page(), None::<UpdateSource>);
}
