//! 업데이트 코디네이터
//!
//! 상태 관리자, FSM, 자동/수동 흐름을 하나로 묶는 단일 상태 객체입니다.
//! 호스트의 다운로드 완료 알림은 두 흐름이 공유하며, 레코드의
//! `is_manual_check` 값에 따라 어느 흐름이 처리할지 결정됩니다.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::auto_flow::{AutoUpdateConfig, AutoUpdateFlow};
use crate::error::CoordinatorError;
use crate::host::{Clock, HostUpdatePort, NoopHook, PreReloadHook, SystemClock};
use crate::machine::{LogSink, MachineTimings, NotificationSink, UpdateEvent, UpdateMachine, UpdateState};
use crate::manual_flow::{CheckOutcome, ManualUpdateFlow};
use crate::probe::RemoteVersionProbe;
use crate::state::{PersistedUpdateRecord, StateManager, UpdateOutcome, UpdateSource};
use crate::store::KeyValueStore;

/// 코디네이터 설정
#[derive(Debug, Clone, Copy)]
pub struct CoordinatorConfig {
    pub timings: MachineTimings,
    pub auto: AutoUpdateConfig,
    pub download_timeout: Duration,
    pub save_throttle: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            timings: MachineTimings::default(),
            auto: AutoUpdateConfig::default(),
            download_timeout: ManualUpdateFlow::DEFAULT_DOWNLOAD_TIMEOUT,
            save_throttle: StateManager::DEFAULT_SAVE_THROTTLE,
        }
    }
}

/// UI 페이지용 상태 보고
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateStatusReport {
    pub state: UpdateState,
    pub is_update_available: bool,
    pub is_reloaded_on_update: bool,
    pub is_successful_update: bool,
    pub show_update_icon: bool,
}

/// 코디네이터 빌더
pub struct CoordinatorBuilder {
    config: CoordinatorConfig,
    store: Arc<dyn KeyValueStore>,
    host: Arc<dyn HostUpdatePort>,
    probe: Arc<dyn RemoteVersionProbe>,
    clock: Arc<dyn Clock>,
    hook: Arc<dyn PreReloadHook>,
    sinks: Vec<Arc<dyn NotificationSink>>,
}

impl CoordinatorBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn pre_reload_hook(mut self, hook: Arc<dyn PreReloadHook>) -> Self {
        self.hook = hook;
        self
    }

    pub fn sink(mut self, sink: Arc<dyn NotificationSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    pub fn build(self) -> Arc<UpdateCoordinator> {
        let state = StateManager::new(self.store, self.config.save_throttle);
        let machine = UpdateMachine::with_sinks(self.config.timings, self.sinks);
        let manual = ManualUpdateFlow::new(
            state.clone(),
            machine.clone(),
            self.host.clone(),
            self.probe,
            self.hook,
            self.config.download_timeout,
        );

        Arc::new(UpdateCoordinator {
            config: self.config,
            state,
            machine,
            host: self.host,
            clock: self.clock,
            manual,
            auto: Mutex::new(None),
            listener: Mutex::new(None),
        })
    }
}

pub struct UpdateCoordinator {
    config: CoordinatorConfig,
    state: StateManager,
    machine: UpdateMachine,
    host: Arc<dyn HostUpdatePort>,
    clock: Arc<dyn Clock>,
    manual: ManualUpdateFlow,
    auto: Mutex<Option<Arc<AutoUpdateFlow>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl UpdateCoordinator {
    pub fn builder(
        config: CoordinatorConfig,
        store: Arc<dyn KeyValueStore>,
        host: Arc<dyn HostUpdatePort>,
        probe: Arc<dyn RemoteVersionProbe>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            config,
            store,
            host,
            probe,
            clock: Arc::new(SystemClock),
            hook: Arc::new(NoopHook),
            sinks: vec![Arc::new(LogSink)],
        }
    }

    /// 영속 상태 복원 및 호스트 알림 리스너 시작
    pub fn init(self: &Arc<Self>) -> Option<PersistedUpdateRecord> {
        self.spawn_listener();

        let record = self.state.init()?;
        let Some(version) = record.next_version.clone() else {
            return Some(record);
        };

        // 재시작 전에 업데이트가 이미 내려받아져 있었다면 출처와 무관하게 흐름을 복원
        tracing::info!(
            "[Coordinator] Restoring pending update {} (manual: {})",
            version,
            record.is_manual_check
        );
        self.on_update_available(version, record.last_navigation_timestamp);
        Some(record)
    }

    fn spawn_listener(self: &Arc<Self>) {
        let mut listener = lock(&self.listener);
        if listener.is_some() {
            return;
        }

        let mut rx = self.host.subscribe_update_available();
        let weak = Arc::downgrade(self);
        *listener = Some(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(version) => {
                        let Some(coordinator) = weak.upgrade() else { break };
                        coordinator.on_update_available(version, None);
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("[Coordinator] Missed {} update notifications", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// 호스트 다운로드 완료 알림 (수동/자동 공용)
    pub fn on_update_available(self: &Arc<Self>, version: String, loaded_navigation: Option<i64>) {
        let is_manual = self.state.is_manual_check();
        tracing::info!("[Coordinator] Update became available, version: {}, manual check: {}", version, is_manual);

        // 상태를 먼저 기록한 뒤 UI 에 알림
        self.state.set_next_version(Some(version));
        self.machine.send(UpdateEvent::UpdateAvailable);

        if is_manual {
            self.manual.on_update_available();
            return;
        }

        let flow = Arc::new(AutoUpdateFlow::new(
            self.state.clone(),
            self.machine.clone(),
            self.host.clone(),
            self.clock.clone(),
            self.config.auto,
        ));

        if let Some(previous) = lock(&self.auto).replace(flow.clone()) {
            tracing::debug!("[Coordinator] Auto-update flow already initialized, it will be replaced");
            previous.stop_monitoring();
        }

        self.state.set_is_manual_check(false);
        flow.on_update_available(loaded_navigation);
    }

    /// 사용자 업데이트 확인. 자동 흐름보다 우선
    pub async fn check(self: &Arc<Self>) -> Result<CheckOutcome, CoordinatorError> {
        // 결과 알림이 떠 있는 동안의 확인은 새 시도로 취급
        if self.machine.dismiss_notification() {
            tracing::debug!("[Coordinator] Dismissed previous result before checking again");
        }

        match self.machine.state() {
            UpdateState::Checking => {
                tracing::debug!("[Coordinator] Check already in progress");
                return Ok(CheckOutcome::AlreadyChecking);
            }
            UpdateState::Updating => {
                return Err(CoordinatorError::InvalidState {
                    message: "update is being applied".to_string(),
                });
            }
            UpdateState::Available if self.state.next_version().is_some() => {
                // 이미 내려받은 자동 업데이트를 사용자가 발견. 아이콘은 즉시 표시
                self.detach_auto();
                self.state.set_is_manual_check(true);
                return Ok(CheckOutcome::UpdateReady);
            }
            _ => {}
        }

        self.detach_auto();
        self.manual.check().await
    }

    /// 사용자가 확인한 업데이트 적용
    pub async fn apply_update(self: &Arc<Self>, source: UpdateSource) -> Result<(), CoordinatorError> {
        if self.machine.state() != UpdateState::Available {
            return Err(CoordinatorError::InvalidState {
                message: format!("no update to apply in state {}", self.machine.state().as_str()),
            });
        }

        let this = Arc::clone(self);
        self.manual.apply_update(source, move || this.clear_auto_update_state()).await
    }

    /// 직전 업데이트 결과 (한 번만 반환)
    pub fn get_update_data(&self) -> Option<UpdateOutcome> {
        self.manual.get_update_data()
    }

    /// UI 페이지 상태 조회. 업데이트 결과를 소비하고 FSM 에 재생
    pub fn get_update_status(&self) -> UpdateStatusReport {
        let is_update_available = self.is_update_available();
        let outcome = self.get_update_data();
        let is_reloaded_on_update = outcome.is_some();

        self.machine.send(UpdateEvent::Init {
            is_update_available,
            is_reloaded_on_update,
        });

        UpdateStatusReport {
            state: self.machine.state(),
            is_update_available,
            is_reloaded_on_update,
            is_successful_update: outcome.map_or(false, |o| o.is_ok),
            show_update_icon: self.should_show_update_icon(),
        }
    }

    pub fn is_update_available(&self) -> bool {
        self.machine.state() == UpdateState::Available
    }

    pub fn should_show_update_icon(&self) -> bool {
        if !self.is_update_available() || self.state.next_version().is_none() {
            return false;
        }

        if self.state.is_manual_check() {
            return true;
        }

        let Some(available_at) = self.state.update_available_timestamp() else {
            tracing::trace!("[Coordinator] Update available timestamp is missing, hiding icon");
            return false;
        };

        let icon_delay = match lock(&self.auto).as_ref() {
            Some(flow) => flow.icon_delay(),
            None => {
                tracing::trace!("[Coordinator] Auto-update flow is not initialized, hiding icon");
                return false;
            }
        };

        let elapsed = self.clock.now_ms().saturating_sub(available_at);
        elapsed >= 0 && elapsed as u128 >= icon_delay.as_millis()
    }

    /// 시작 시 호출. `init` 전후 어느 쪽에서 불러도 됨
    ///
    /// 버전이 바뀌었는데 대기 레코드가 남아 있었다면 그 업데이트는 이미 적용된 것이므로
    /// 복원된 자동 흐름을 떼어내고 FSM을 `Idle`로 되돌립니다.
    pub async fn handle_reload(&self, is_updated: bool) {
        let had_pending = self.state.next_version().is_some();
        self.manual.handle_reload(is_updated).await;

        if is_updated && had_pending {
            self.detach_auto();
            self.machine.reset();
        }
    }

    pub fn state(&self) -> UpdateState {
        self.machine.state()
    }

    pub fn record(&self) -> PersistedUpdateRecord {
        self.state.snapshot()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<UpdateState> {
        self.machine.subscribe()
    }

    /// 자동 흐름이 모니터링 중인지
    pub fn is_auto_monitoring(&self) -> bool {
        lock(&self.auto).as_ref().map_or(false, |flow| flow.is_active())
    }

    pub fn auto_flow(&self) -> Option<Arc<AutoUpdateFlow>> {
        lock(&self.auto).clone()
    }

    /// 자동 흐름 기준으로 지금 적용해도 되는지
    pub fn should_auto_apply(&self) -> bool {
        match self.auto_flow() {
            Some(flow) => flow.should_auto_apply(self.clock.now_ms()),
            None => false,
        }
    }

    /// 보류 중인 쓰기 반영 (종료 직전)
    pub fn flush(&self) {
        self.state.flush();
    }

    /// 자동 흐름을 떼어냄. 레코드는 수동 흐름이 덮어씀
    fn detach_auto(&self) {
        if let Some(flow) = lock(&self.auto).take() {
            tracing::debug!("[Coordinator] Manual check supersedes automatic update");
            flow.stop_monitoring();
        }
    }

    fn clear_auto_update_state(&self) {
        match lock(&self.auto).take() {
            Some(flow) => flow.clear_state(),
            None => self.state.clear(),
        }
    }
}

impl Drop for UpdateCoordinator {
    fn drop(&mut self) {
        if let Some(handle) = lock(&self.listener).take() {
            handle.abort();
        }
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
