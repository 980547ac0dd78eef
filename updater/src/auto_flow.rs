//! 자동 업데이트 흐름
//!
//! 사용자가 요청하지 않았는데 호스트가 업데이트를 내려받은 경우를 처리합니다.
//!
//! - UI 아이콘은 `icon_delay`가 지난 뒤에만 표시
//! - 적용은 사용자가 `idle_threshold` 이상 네비게이션하지 않았을 때만 수행
//! - 재시작 후에는 저장된 타임스탬프로 유휴 시간 계산을 이어감

use serde::Deserialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::host::{Clock, HostUpdatePort};
use crate::machine::{UpdateEvent, UpdateMachine};
use crate::state::StateManager;
use crate::store::keys;

/// 자동 업데이트 타이밍
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoUpdateConfig {
    pub icon_delay: Duration,
    pub idle_threshold: Duration,
    pub check_interval: Duration,
}

impl Default for AutoUpdateConfig {
    fn default() -> Self {
        Self {
            icon_delay: Duration::from_secs(24 * 60 * 60),
            idle_threshold: Duration::from_secs(30 * 60),
            check_interval: Duration::from_secs(20),
        }
    }
}

/// 저장소의 `auto-update-config` 오버라이드 (밀리초 단위, 일부 필드만 가능)
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
struct AutoUpdateOverride {
    icon_delay_ms: Option<u64>,
    idle_threshold_ms: Option<u64>,
    check_interval_ms: Option<u64>,
}

impl AutoUpdateConfig {
    fn apply_override(mut self, o: &AutoUpdateOverride) -> Self {
        if let Some(ms) = o.icon_delay_ms {
            self.icon_delay = Duration::from_millis(ms);
        }
        if let Some(ms) = o.idle_threshold_ms {
            self.idle_threshold = Duration::from_millis(ms);
        }
        if let Some(ms) = o.check_interval_ms.filter(|ms| *ms > 0) {
            self.check_interval = Duration::from_millis(ms);
        }
        self
    }
}

struct Monitor {
    navigation: JoinHandle<()>,
    ticker: JoinHandle<()>,
}

pub struct AutoUpdateFlow {
    state: StateManager,
    machine: UpdateMachine,
    host: Arc<dyn HostUpdatePort>,
    clock: Arc<dyn Clock>,
    base_config: AutoUpdateConfig,
    config: Mutex<AutoUpdateConfig>,
    monitor: Mutex<Option<Monitor>>,
    /// 모니터링을 멈출 때마다 증가. 오래된 ticker 태스크는 스스로 종료
    epoch: AtomicU64,
    applying: AtomicBool,
}

impl AutoUpdateFlow {
    pub fn new(
        state: StateManager,
        machine: UpdateMachine,
        host: Arc<dyn HostUpdatePort>,
        clock: Arc<dyn Clock>,
        config: AutoUpdateConfig,
    ) -> Self {
        Self {
            state,
            machine,
            host,
            clock,
            base_config: config,
            config: Mutex::new(config),
            monitor: Mutex::new(None),
            epoch: AtomicU64::new(0),
            applying: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> AutoUpdateConfig {
        *lock(&self.config)
    }

    pub fn icon_delay(&self) -> Duration {
        self.config().icon_delay
    }

    pub fn is_active(&self) -> bool {
        lock(&self.monitor).is_some()
    }

    /// 저장소 오버라이드를 읽어 설정 갱신. 잘못된 값은 로그만 남기고 무시
    pub fn load_config(&self) {
        let mut config = self.base_config;

        match self.state.store().get(keys::AUTO_UPDATE_CONFIG) {
            Ok(Some(raw)) => match serde_json::from_str::<AutoUpdateOverride>(&raw) {
                Ok(o) => {
                    tracing::info!("[AutoUpdate] Using custom config from storage: {:?}", o);
                    config = config.apply_override(&o);
                }
                Err(e) => tracing::error!("[AutoUpdate] Failed to load config override: {}", e),
            },
            Ok(None) => {}
            Err(e) => tracing::error!("[AutoUpdate] Failed to read config override: {}", e),
        }

        *lock(&self.config) = config;
    }

    /// 자동 다운로드 알림 처리
    pub fn on_update_available(self: &Arc<Self>, loaded_navigation: Option<i64>) {
        // 재시작 전에 기록된 값이 있으면 유지 (아이콘 지연 계산 기준)
        if self.state.update_available_timestamp().is_none() {
            self.state.set_update_available_timestamp(self.clock.now_ms());
        }
        self.state.flush();

        self.load_config();
        self.start_monitoring(loaded_navigation);

        let config = self.config();
        tracing::info!(
            "[AutoUpdate] Monitoring started. Icon delay: {:?}, idle threshold: {:?}",
            config.icon_delay,
            config.idle_threshold
        );
    }

    /// 유휴 판정 기준 시각. 네비게이션이 없었다면 업데이트가 도착한 시각
    fn idle_reference(&self) -> Option<i64> {
        self.state
            .last_navigation_timestamp()
            .or_else(|| self.state.update_available_timestamp())
    }

    pub fn idle_duration(&self, now_ms: i64) -> Option<Duration> {
        self.idle_reference()
            .map(|reference| Duration::from_millis(now_ms.saturating_sub(reference).max(0) as u64))
    }

    pub fn should_auto_apply(&self, now_ms: i64) -> bool {
        if self.state.next_version().is_none() {
            return false;
        }
        match self.idle_duration(now_ms) {
            Some(idle) => idle >= self.config().idle_threshold,
            None => false,
        }
    }

    /// 주기 검사 한 번. 적용을 시작했으면 true
    pub async fn tick(self: &Arc<Self>) -> bool {
        if self.state.next_version().is_none() {
            tracing::debug!("[AutoUpdate] No next version found, stopping");
            self.stop_monitoring();
            return false;
        }

        let now = self.clock.now_ms();
        if !self.should_auto_apply(now) {
            tracing::trace!("[AutoUpdate] Not idle yet, idle for {:?}", self.idle_duration(now));
            return false;
        }

        tracing::info!("[AutoUpdate] Idle threshold reached, applying update. Idle for {:?}", self.idle_duration(now));
        self.stop_monitoring();
        self.apply().await;
        true
    }

    /// 자동 적용. 여러 번 호출되어도 리로드는 한 번만 수행
    pub async fn apply(&self) {
        if self.applying.swap(true, Ordering::SeqCst) {
            tracing::debug!("[AutoUpdate] Apply already in progress");
            return;
        }

        self.machine.send(UpdateEvent::Update);
        self.state.clear();
        // 조용한 자동 업데이트 후에는 페이지를 열거나 알림을 띄우지 않음
        self.state.remove_reload_marker();

        if let Err(e) = self.host.reload().await {
            tracing::error!("[AutoUpdate] Failed to reload: {}", e);
            self.machine.send(UpdateEvent::UpdateFailed);
            self.applying.store(false, Ordering::SeqCst);
        }
    }

    /// 레코드를 버리고 리스너 해제
    pub fn clear_state(&self) {
        self.stop_monitoring();
        self.state.clear();
    }

    fn start_monitoring(self: &Arc<Self>, loaded_navigation: Option<i64>) {
        let mut monitor = lock(&self.monitor);
        if monitor.is_some() {
            tracing::debug!("[AutoUpdate] Monitoring already running");
            return;
        }

        if let Some(ts) = loaded_navigation {
            if self.state.last_navigation_timestamp().is_none() {
                self.state.set_last_navigation_timestamp(ts);
            }
        }

        let navigation = {
            let state = self.state.clone();
            let mut rx = self.host.subscribe_navigation();
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(ts) => state.set_last_navigation_timestamp(ts),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::debug!("[AutoUpdate] Skipped {} navigation signals", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            })
        };

        let ticker = {
            let flow = Arc::clone(self);
            let epoch = self.epoch.load(Ordering::SeqCst);
            let period = self.config().check_interval;
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                interval.tick().await;
                loop {
                    interval.tick().await;
                    if flow.epoch.load(Ordering::SeqCst) != epoch {
                        break;
                    }
                    if flow.tick().await {
                        break;
                    }
                }
            })
        };

        *monitor = Some(Monitor { navigation, ticker });
    }

    /// 리스너 해제 (레코드는 유지)
    pub fn stop_monitoring(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(monitor) = lock(&self.monitor).take() {
            monitor.navigation.abort();
            // ticker는 자신이 적용 중일 수 있으므로 중단하지 않고 epoch로 종료
            drop(monitor.ticker);
            tracing::trace!("[AutoUpdate] Monitoring stopped");
        }
    }
}

impl Drop for AutoUpdateFlow {
    fn drop(&mut self) {
        if let Some(monitor) = lock(&self.monitor).take() {
            monitor.navigation.abort();
            monitor.ticker.abort();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
