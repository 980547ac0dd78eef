//! 호스트 플랫폼 경계
//!
//! 실제 다운로드와 재시작은 호스트가 담당합니다. 코디네이터는 전역 객체 대신
//! 주입된 [`HostUpdatePort`]만 통해 호스트와 통신하므로 테스트에서는
//! 가짜 구현으로 교체할 수 있습니다.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::broadcast;

use crate::error::CoordinatorError;
use crate::state::UpdateSource;

/// 호스트 업데이트 확인 요청 결과
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateCheckStatus {
    /// 호스트가 새 버전을 찾았고 백그라운드에서 내려받는 중
    UpdateAvailable { version: String },
    NoUpdate,
    /// 호스트 측 요청 빈도 제한
    Throttled,
}

/// 호스트 업데이트 기능
#[async_trait]
pub trait HostUpdatePort: Send + Sync {
    /// 호스트에 업데이트 확인을 요청
    async fn request_update_check(&self) -> Result<UpdateCheckStatus, CoordinatorError>;

    /// "업데이트 다운로드 완료" 푸시 알림 (버전 문자열)
    fn subscribe_update_available(&self) -> broadcast::Receiver<String>;

    /// 사용자 네비게이션 신호 (밀리초 타임스탬프)
    fn subscribe_navigation(&self) -> broadcast::Receiver<i64>;

    /// 내려받은 업데이트를 적용하며 재시작.
    /// 성공하면 보통 반환하지 않지만 반환하더라도 성공으로 취급
    async fn reload(&self) -> Result<(), CoordinatorError>;

    /// 실행 중인 버전
    fn current_version(&self) -> String;

    /// 재시작 후 업데이트를 시작한 페이지 열기
    async fn open_page(&self, source: UpdateSource) -> Result<(), CoordinatorError>;
}

/// 리로드 직전 작업 (실패해도 업데이트는 계속 진행)
#[async_trait]
pub trait PreReloadHook: Send + Sync {
    async fn before_reload(&self) -> Result<(), CoordinatorError>;
}

pub struct NoopHook;

#[async_trait]
impl PreReloadHook for NoopHook {
    async fn before_reload(&self) -> Result<(), CoordinatorError> {
        Ok(())
    }
}

/// 벽시계 (밀리초 epoch). 영속 타임스탬프는 모두 이 시계를 기준으로 기록
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// 수동으로 움직이는 시계
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self { now: AtomicI64::new(now_ms) }
    }

    pub fn set(&self, now_ms: i64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: i64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_moves_only_when_told() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_ms(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_ms(), 1_500);
        clock.set(10);
        assert_eq!(clock.now_ms(), 10);
    }

    #[test]
    fn check_status_wire_format() {
        let status = UpdateCheckStatus::UpdateAvailable { version: "2.0".into() };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["status"], "update_available");
        assert_eq!(json["version"], "2.0");

        let parsed: UpdateCheckStatus = serde_json::from_str(r#"{"status":"throttled"}"#).unwrap();
        assert_eq!(parsed, UpdateCheckStatus::Throttled);
    }
}
