//! 수동 업데이트 흐름
//!
//! 사용자가 "업데이트 확인"을 누른 경우:
//! 1. 스토어에 새 버전이 있는지 원격 확인 (호스트 요청은 빈도 제한이 있음)
//! 2. 있으면 호스트에 다운로드를 요청하고 다운로드 완료 알림을 기다림
//! 3. 사용자가 적용을 확인하면 리로드 마커를 남기고 재시작
//!
//! 재시작 후에는 [`ManualUpdateFlow::handle_reload`]가 마커를 보고 결과를 판정합니다.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::error::{CoordinatorError, ErrorContext};
use crate::host::{HostUpdatePort, PreReloadHook, UpdateCheckStatus};
use crate::machine::{UpdateEvent, UpdateMachine, UpdateState};
use crate::probe::RemoteVersionProbe;
use crate::state::{ReloadMarker, StateManager, UpdateOutcome, UpdateSource};
use crate::version::{self, Version};

/// 수동 확인 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckOutcome {
    /// 이미 확인 중이라 무시됨
    AlreadyChecking,
    /// 이미 내려받은 업데이트가 있음
    UpdateReady,
    /// 호스트가 다운로드 중. 완료 알림을 기다림
    WaitingForDownload,
    NoUpdate,
}

pub struct ManualUpdateFlow {
    state: StateManager,
    machine: UpdateMachine,
    host: Arc<dyn HostUpdatePort>,
    probe: Arc<dyn RemoteVersionProbe>,
    hook: Arc<dyn PreReloadHook>,
    download_timeout: Duration,
    watchdog: Mutex<Option<JoinHandle<()>>>,
    /// 확인 요청이 진행 중 (FSM이 `Check`를 무시한 경우에도 직렬화)
    in_flight: AtomicBool,
}

/// 드롭될 때 진행 중 표시를 해제
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl ManualUpdateFlow {
    pub const DEFAULT_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(10 * 60);

    pub fn new(
        state: StateManager,
        machine: UpdateMachine,
        host: Arc<dyn HostUpdatePort>,
        probe: Arc<dyn RemoteVersionProbe>,
        hook: Arc<dyn PreReloadHook>,
        download_timeout: Duration,
    ) -> Self {
        Self {
            state,
            machine,
            host,
            probe,
            hook,
            download_timeout,
            watchdog: Mutex::new(None),
            in_flight: AtomicBool::new(false),
        }
    }

    /// 사용자 업데이트 확인
    pub async fn check(&self) -> Result<CheckOutcome, CoordinatorError> {
        if self.machine.state() == UpdateState::Checking || self.in_flight.swap(true, Ordering::SeqCst) {
            tracing::debug!("[ManualUpdate] Check already in progress");
            return Ok(CheckOutcome::AlreadyChecking);
        }
        let _in_flight = InFlight(&self.in_flight);

        self.state.set_is_manual_check(true);
        self.start_watchdog();
        self.machine.send(UpdateEvent::Check);

        let current = self.host.current_version();

        let in_store = match self.probe.latest_version().await {
            Ok(Some(latest)) => {
                let newer = Version::parse(&current).map_or(false, |cur| latest.is_newer_than(&cur));
                if !newer {
                    tracing::debug!(
                        "[ManualUpdate] No update in store, current version {}, latest {}",
                        current,
                        latest
                    );
                }
                newer
            }
            Ok(None) => {
                tracing::debug!("[ManualUpdate] Cannot retrieve latest version from store");
                false
            }
            Err(e) => {
                ErrorContext::new("remote version probe", e.clone()).log();
                self.fail_check();
                return Err(e);
            }
        };

        if in_store {
            match self.request_host_check(&current).await {
                Ok(true) => return Ok(CheckOutcome::WaitingForDownload),
                Ok(false) => {}
                Err(e) => {
                    ErrorContext::new("host update check", e.clone()).log();
                    self.fail_check();
                    return Err(e);
                }
            }
        }

        self.cancel_watchdog();
        self.machine.send(UpdateEvent::NoUpdateAvailable);
        self.state.set_is_manual_check(false);
        Ok(CheckOutcome::NoUpdate)
    }

    /// 호스트가 새 버전을 내려받기 시작했으면 true
    async fn request_host_check(&self, current: &str) -> Result<bool, CoordinatorError> {
        match self.host.request_update_check().await? {
            UpdateCheckStatus::UpdateAvailable { version: next } => {
                if version::is_newer(&next, current) {
                    tracing::info!(
                        "[ManualUpdate] Update is available, current version {}, next version {}",
                        current,
                        next
                    );
                    Ok(true)
                } else {
                    tracing::debug!("[ManualUpdate] Host reported {} which is not newer than {}", next, current);
                    Ok(false)
                }
            }
            status => {
                tracing::debug!("[ManualUpdate] Update is not available, status: {:?}", status);
                Ok(false)
            }
        }
    }

    fn fail_check(&self) {
        self.cancel_watchdog();
        self.machine.send(UpdateEvent::UpdateFailed);
        self.state.set_is_manual_check(false);
    }

    /// 수동 확인 이후 다운로드 완료 알림. 아이콘은 즉시 표시
    pub fn on_update_available(&self) {
        self.cancel_watchdog();
        self.state.flush();
        tracing::info!("[ManualUpdate] Update available after manual check, icon will be shown immediately");
    }

    /// 사용자가 확인한 업데이트 적용
    ///
    /// 리로드가 성공적으로 호출되면 `on_cleared`로 대기 레코드를 정리합니다.
    /// 리로드가 실패하면 마커를 지우고 `UpdateFailed`를 보내며 레코드는 유지합니다.
    pub async fn apply_update<F>(&self, source: UpdateSource, on_cleared: F) -> Result<(), CoordinatorError>
    where
        F: FnOnce(),
    {
        self.machine.send(UpdateEvent::Update);

        if let Err(e) = self.hook.before_reload().await {
            tracing::error!("[ManualUpdate] Pre-reload work failed, update will continue: {}", e);
        }

        let marker = ReloadMarker {
            init_version: self.host.current_version(),
            page_to_open_after_reload: source,
            is_ok: true,
        };

        // 리로드 전에 반드시 기록되어야 함
        if let Err(e) = self.state.set_reload_marker(&marker) {
            tracing::error!("[ManualUpdate] Failed to save reload marker: {}", e);
            self.machine.send(UpdateEvent::UpdateFailed);
            return Err(e);
        }

        self.cancel_watchdog();

        match self.host.reload().await {
            Ok(()) => {
                on_cleared();
                Ok(())
            }
            Err(e) => {
                tracing::error!("[ManualUpdate] Failed to reload: {}", e);
                self.state.remove_reload_marker();
                self.machine.send(UpdateEvent::UpdateFailed);
                Err(e)
            }
        }
    }

    /// 직전 업데이트 결과. 한 번 읽으면 사라짐
    pub fn get_update_data(&self) -> Option<UpdateOutcome> {
        self.state.take_outcome()
    }

    /// 시작할 때마다 호출. `is_updated`는 실행 버전이 바뀌었는지 여부
    pub async fn handle_reload(&self, is_updated: bool) {
        let Some(marker) = self.state.reload_marker() else {
            tracing::debug!("[ManualUpdate] No manual update data after reload found");
            if !is_updated {
                return;
            }
            // 마커 없이 내려받아 둔 업데이트가 재시작으로 적용됨
            if let Some(version) = self.state.next_version() {
                tracing::info!("[ManualUpdate] Pending update {} was applied on restart", version);
                if let Err(e) = self.state.set_last_outcome(UpdateOutcome { is_ok: true }) {
                    tracing::error!("[ManualUpdate] Failed to record update outcome: {}", e);
                }
            }
            self.state.clear();
            return;
        };

        if is_updated {
            tracing::info!("[ManualUpdate] Updated from {}", marker.init_version);
        } else {
            tracing::warn!("[ManualUpdate] Reloaded without version change, still {}", marker.init_version);
            let failed = ReloadMarker { is_ok: false, ..marker.clone() };
            if let Err(e) = self.state.set_reload_marker(&failed) {
                tracing::error!("[ManualUpdate] Failed to record update failure: {}", e);
            }
        }

        self.state.clear();

        let page = marker.page_to_open_after_reload;
        tracing::info!("[ManualUpdate] Opening {} page", page.as_str());
        if let Err(e) = self.host.open_page(page).await {
            tracing::warn!("[ManualUpdate] Failed to open {} page: {}", page.as_str(), e);
        }
    }

    fn start_watchdog(&self) {
        let machine = self.machine.clone();
        let state = self.state.clone();
        let timeout = self.download_timeout;

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(rt) => rt.spawn(async move {
                tokio::time::sleep(timeout).await;
                if machine.state() == UpdateState::Checking {
                    tracing::warn!("[ManualUpdate] No download notification within {:?}", timeout);
                    machine.send(UpdateEvent::UpdateFailed);
                    state.set_is_manual_check(false);
                }
            }),
            Err(_) => return,
        };

        if let Some(previous) = lock(&self.watchdog).replace(handle) {
            previous.abort();
        }
    }

    pub fn cancel_watchdog(&self) {
        if let Some(handle) = lock(&self.watchdog).take() {
            handle.abort();
        }
    }

    pub fn watchdog_armed(&self) -> bool {
        lock(&self.watchdog).is_some()
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
