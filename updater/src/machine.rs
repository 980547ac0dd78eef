//! 업데이트 상태 머신
//!
//! 한 번의 업데이트 시도 생명주기를 표현하는 단일 FSM입니다.
//!
//! ```text
//! Idle ──Check──▶ Checking ──(min display)──▶ Available ──Update──▶ Updating
//!  │  ▲                 ├──(min display)──▶ NotAvailable ──(delay)──▶ Idle
//!  │  └──(delay)── Success                └──(min display)──▶ Failed ──Check──▶ Checking
//!  └──UpdateAvailable / Init──▶ Available | Success
//! ```
//!
//! 전이 판정은 순수 함수 [`transition`]이 담당하고, [`UpdateMachine`]은
//! 현재 상태 보관과 지연 전이 타이머, 변경 알림만 처리합니다.
//!
//! 성공 이벤트는 없습니다. 업데이트가 성공하면 프로세스가 재시작되고,
//! 결과는 재시작 후 저장소의 리로드 마커로만 전달됩니다.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

// ══════════════════════════════════════════════════════
// 상태 / 이벤트
// ══════════════════════════════════════════════════════

/// FSM 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateState {
    Idle,
    Checking,
    NotAvailable,
    Available,
    Updating,
    Failed,
    Success,
}

impl UpdateState {
    pub const ALL: [UpdateState; 7] = [
        UpdateState::Idle,
        UpdateState::Checking,
        UpdateState::NotAvailable,
        UpdateState::Available,
        UpdateState::Updating,
        UpdateState::Failed,
        UpdateState::Success,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateState::Idle => "idle",
            UpdateState::Checking => "checking",
            UpdateState::NotAvailable => "not_available",
            UpdateState::Available => "available",
            UpdateState::Updating => "updating",
            UpdateState::Failed => "failed",
            UpdateState::Success => "success",
        }
    }
}

/// FSM 이벤트
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum UpdateEvent {
    /// 재시작 직후 영속 상태를 FSM에 재생
    Init {
        is_update_available: bool,
        is_reloaded_on_update: bool,
    },
    Check,
    UpdateAvailable,
    NoUpdateAvailable,
    Update,
    UpdateFailed,
}

/// 전이 판정 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// 현재 상태에서 처리하지 않는 이벤트
    Ignore,
    /// 즉시 전이
    Immediate(UpdateState),
    /// 상태 진입 후 최소 표시 시간이 지난 뒤 전이
    AfterMinDisplay(UpdateState),
}

/// 전이 테이블
pub fn transition(state: UpdateState, event: &UpdateEvent) -> Transition {
    use Transition::*;
    use UpdateEvent as E;
    use UpdateState as S;

    match (state, event) {
        // 업데이트 가능 여부가 재시작 플래그보다 우선
        (S::Idle, E::Init { is_update_available: true, .. }) => Immediate(S::Available),
        (S::Idle, E::Init { is_reloaded_on_update: true, .. }) => Immediate(S::Success),
        (S::Idle, E::Check) => Immediate(S::Checking),
        // 사전 확인 없이 호스트가 조용히 내려받은 경우
        (S::Idle, E::UpdateAvailable) => Immediate(S::Available),

        (S::Checking, E::UpdateAvailable) => AfterMinDisplay(S::Available),
        (S::Checking, E::NoUpdateAvailable) => AfterMinDisplay(S::NotAvailable),
        (S::Checking, E::UpdateFailed) => AfterMinDisplay(S::Failed),

        (S::Available, E::Update) => Immediate(S::Updating),

        (S::Updating, E::UpdateFailed) => AfterMinDisplay(S::Failed),

        (S::Failed, E::Check) => Immediate(S::Checking),

        _ => Ignore,
    }
}

/// 표시 시간이 지나면 스스로 `Idle`로 돌아가는 상태
pub fn auto_clear_target(state: UpdateState) -> Option<UpdateState> {
    match state {
        UpdateState::NotAvailable | UpdateState::Success => Some(UpdateState::Idle),
        _ => None,
    }
}

// ══════════════════════════════════════════════════════
// 알림
// ══════════════════════════════════════════════════════

/// UI 알림 채널 (아이콘, 팝업, 옵션 페이지 등)
pub trait NotificationSink: Send + Sync {
    fn state_changed(&self, state: UpdateState);
}

/// 상태 변경을 로그로만 남기는 싱크
pub struct LogSink;

impl NotificationSink for LogSink {
    fn state_changed(&self, state: UpdateState) {
        tracing::info!("[Notifier] Update state changed: {}", state.as_str());
    }
}

// ══════════════════════════════════════════════════════
// 머신
// ══════════════════════════════════════════════════════

/// 지연 전이 타이밍
#[derive(Debug, Clone, Copy)]
pub struct MachineTimings {
    /// `Checking`/`Updating` 표시 최소 시간
    pub min_display: Duration,
    /// `NotAvailable`/`Success` 표시 후 `Idle` 복귀까지
    pub notification_delay: Duration,
}

impl Default for MachineTimings {
    fn default() -> Self {
        Self {
            min_display: Duration::from_millis(2000),
            notification_delay: Duration::from_millis(2000),
        }
    }
}

struct MachineInner {
    state: UpdateState,
    entered_at: Instant,
    /// 상태가 바뀔 때마다 증가. 오래된 타이머를 무효화하는 데 사용
    generation: u64,
    /// 최소 표시 시간 동안 수신한 이벤트의 전이 대상 (마지막 수신 우선)
    pending: Option<UpdateState>,
}

/// 업데이트 FSM 핸들. 복제해도 같은 머신을 가리킵니다.
#[derive(Clone)]
pub struct UpdateMachine {
    inner: Arc<Mutex<MachineInner>>,
    events: broadcast::Sender<UpdateState>,
    sinks: Arc<Vec<Arc<dyn NotificationSink>>>,
    timings: MachineTimings,
}

impl UpdateMachine {
    pub fn new(timings: MachineTimings) -> Self {
        Self::with_sinks(timings, Vec::new())
    }

    pub fn with_sinks(timings: MachineTimings, sinks: Vec<Arc<dyn NotificationSink>>) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Mutex::new(MachineInner {
                state: UpdateState::Idle,
                entered_at: Instant::now(),
                generation: 0,
                pending: None,
            })),
            events,
            sinks: Arc::new(sinks),
            timings,
        }
    }

    /// 현재 상태
    pub fn state(&self) -> UpdateState {
        self.lock().state
    }

    /// 상태 변경 구독
    pub fn subscribe(&self) -> broadcast::Receiver<UpdateState> {
        self.events.subscribe()
    }

    /// 이벤트 전송
    pub fn send(&self, event: UpdateEvent) {
        let changed = {
            let mut inner = self.lock();
            match transition(inner.state, &event) {
                Transition::Ignore => {
                    tracing::debug!("[Machine] Ignoring {:?} in state {}", event, inner.state.as_str());
                    None
                }
                Transition::Immediate(target) => Some(self.commit(&mut inner, target)),
                Transition::AfterMinDisplay(target) => self.defer(&mut inner, target),
            }
        };

        if let Some(state) = changed {
            self.publish(state);
        }
    }

    /// 알림 상태(`NotAvailable`/`Success`)를 표시 시간을 기다리지 않고 `Idle`로 정리.
    /// 정리했으면 true
    pub fn dismiss_notification(&self) -> bool {
        let changed = {
            let mut inner = self.lock();
            match auto_clear_target(inner.state) {
                Some(target) => Some(self.commit(&mut inner, target)),
                None => None,
            }
        };

        match changed {
            Some(state) => {
                self.publish(state);
                true
            }
            None => false,
        }
    }

    /// 시도 자체가 무효가 된 경우 `Idle`로 강제 복귀. 대기 중인 전이도 버림
    pub fn reset(&self) {
        let changed = {
            let mut inner = self.lock();
            if inner.state == UpdateState::Idle && inner.pending.is_none() {
                return;
            }
            tracing::info!("[Machine] Reset from {}", inner.state.as_str());
            self.commit(&mut inner, UpdateState::Idle)
        };
        self.publish(changed);
    }

    fn lock(&self) -> MutexGuard<'_, MachineInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// 최소 표시 시간 이후로 전이를 미룸. 이미 지났으면 즉시 전이
    fn defer(&self, inner: &mut MachineInner, target: UpdateState) -> Option<UpdateState> {
        let fire_at = inner.entered_at + self.timings.min_display;
        let now = Instant::now();

        if fire_at <= now && inner.pending.is_none() {
            return Some(self.commit(inner, target));
        }

        let already_scheduled = inner.pending.replace(target).is_some();
        if already_scheduled {
            tracing::debug!("[Machine] Pending transition replaced by {}", target.as_str());
            return None;
        }

        let generation = inner.generation;
        let machine = self.clone();
        let spawned = spawn_timer(fire_at, move || machine.fire_pending(generation));
        if !spawned {
            inner.pending = None;
            return Some(self.commit(inner, target));
        }
        None
    }

    fn fire_pending(&self, generation: u64) {
        let changed = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            let Some(target) = inner.pending.take() else {
                return;
            };
            self.commit(&mut inner, target)
        };
        self.publish(changed);
    }

    fn fire_auto_clear(&self, generation: u64, target: UpdateState) {
        let changed = {
            let mut inner = self.lock();
            if inner.generation != generation {
                return;
            }
            self.commit(&mut inner, target)
        };
        self.publish(changed);
    }

    fn commit(&self, inner: &mut MachineInner, target: UpdateState) -> UpdateState {
        tracing::debug!("[Machine] {} -> {}", inner.state.as_str(), target.as_str());

        inner.state = target;
        inner.entered_at = Instant::now();
        inner.generation += 1;
        inner.pending = None;

        if let Some(clear_to) = auto_clear_target(target) {
            let generation = inner.generation;
            let fire_at = inner.entered_at + self.timings.notification_delay;
            let machine = self.clone();
            if !spawn_timer(fire_at, move || machine.fire_auto_clear(generation, clear_to)) {
                tracing::warn!("[Machine] No async runtime, {} will not auto-clear", target.as_str());
            }
        }

        target
    }

    fn publish(&self, state: UpdateState) {
        for sink in self.sinks.iter() {
            sink.state_changed(state);
        }
        // 구독자가 없으면 에러지만 무시해도 됨
        let _ = self.events.send(state);
    }
}

/// 런타임이 있으면 타이머 태스크를 띄우고 true 반환
fn spawn_timer<F>(fire_at: Instant, action: F) -> bool
where
    F: FnOnce() + Send + 'static,
{
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move {
                tokio::time::sleep_until(fire_at).await;
                action();
            });
            true
        }
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use UpdateState as S;

    pub(super) fn all_events() -> Vec<UpdateEvent> {
        vec![
            UpdateEvent::Init { is_update_available: false, is_reloaded_on_update: false },
            UpdateEvent::Init { is_update_available: true, is_reloaded_on_update: false },
            UpdateEvent::Init { is_update_available: false, is_reloaded_on_update: true },
            UpdateEvent::Init { is_update_available: true, is_reloaded_on_update: true },
            UpdateEvent::Check,
            UpdateEvent::UpdateAvailable,
            UpdateEvent::NoUpdateAvailable,
            UpdateEvent::Update,
            UpdateEvent::UpdateFailed,
        ]
    }

    /// 선언된 전이 이외에는 모두 무시되어야 함
    #[test]
    fn transition_table_is_exhaustive() {
        let declared = [
            (S::Idle, UpdateEvent::Init { is_update_available: true, is_reloaded_on_update: false }, Transition::Immediate(S::Available)),
            (S::Idle, UpdateEvent::Init { is_update_available: true, is_reloaded_on_update: true }, Transition::Immediate(S::Available)),
            (S::Idle, UpdateEvent::Init { is_update_available: false, is_reloaded_on_update: true }, Transition::Immediate(S::Success)),
            (S::Idle, UpdateEvent::Check, Transition::Immediate(S::Checking)),
            (S::Idle, UpdateEvent::UpdateAvailable, Transition::Immediate(S::Available)),
            (S::Checking, UpdateEvent::UpdateAvailable, Transition::AfterMinDisplay(S::Available)),
            (S::Checking, UpdateEvent::NoUpdateAvailable, Transition::AfterMinDisplay(S::NotAvailable)),
            (S::Checking, UpdateEvent::UpdateFailed, Transition::AfterMinDisplay(S::Failed)),
            (S::Available, UpdateEvent::Update, Transition::Immediate(S::Updating)),
            (S::Updating, UpdateEvent::UpdateFailed, Transition::AfterMinDisplay(S::Failed)),
            (S::Failed, UpdateEvent::Check, Transition::Immediate(S::Checking)),
        ];

        for state in UpdateState::ALL {
            for event in all_events() {
                let expected = declared
                    .iter()
                    .find(|(s, e, _)| *s == state && *e == event)
                    .map(|(_, _, t)| *t)
                    .unwrap_or(Transition::Ignore);
                assert_eq!(transition(state, &event), expected, "{:?} + {:?}", state, event);
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn check_then_no_update_clears_to_idle() {
        let machine = UpdateMachine::new(MachineTimings::default());

        machine.send(UpdateEvent::Check);
        assert_eq!(machine.state(), S::Checking);

        tokio::time::sleep(Duration::from_millis(2000)).await;
        machine.send(UpdateEvent::NoUpdateAvailable);
        assert_eq!(machine.state(), S::NotAvailable);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(machine.state(), S::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn checking_is_shown_for_minimum_duration() {
        let machine = UpdateMachine::new(MachineTimings::default());

        machine.send(UpdateEvent::Check);
        machine.send(UpdateEvent::UpdateAvailable);
        assert_eq!(machine.state(), S::Checking);

        tokio::time::sleep(Duration::from_millis(1000)).await;
        assert_eq!(machine.state(), S::Checking);

        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(machine.state(), S::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn last_event_in_window_wins() {
        let machine = UpdateMachine::new(MachineTimings::default());

        machine.send(UpdateEvent::Check);
        machine.send(UpdateEvent::UpdateFailed);
        tokio::time::sleep(Duration::from_millis(500)).await;
        machine.send(UpdateEvent::UpdateAvailable);

        tokio::time::sleep(Duration::from_millis(1600)).await;
        assert_eq!(machine.state(), S::Available);
    }

    #[tokio::test(start_paused = true)]
    async fn checking_without_event_does_not_advance() {
        let machine = UpdateMachine::new(MachineTimings::default());

        machine.send(UpdateEvent::Check);
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(machine.state(), S::Checking);
    }

    #[tokio::test(start_paused = true)]
    async fn updating_failure_waits_then_allows_retry() {
        let machine = UpdateMachine::new(MachineTimings::default());

        machine.send(UpdateEvent::UpdateAvailable);
        machine.send(UpdateEvent::Update);
        assert_eq!(machine.state(), S::Updating);

        machine.send(UpdateEvent::UpdateFailed);
        assert_eq!(machine.state(), S::Updating);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(machine.state(), S::Failed);

        // Failed는 자동으로 사라지지 않음
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(machine.state(), S::Failed);

        machine.send(UpdateEvent::Check);
        assert_eq!(machine.state(), S::Checking);
    }

    #[tokio::test(start_paused = true)]
    async fn init_after_reload_shows_success_once() {
        let machine = UpdateMachine::new(MachineTimings::default());
        let mut rx = machine.subscribe();

        machine.send(UpdateEvent::Init { is_update_available: false, is_reloaded_on_update: true });
        assert_eq!(machine.state(), S::Success);

        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(machine.state(), S::Idle);

        assert_eq!(rx.recv().await.unwrap(), S::Success);
        assert_eq!(rx.recv().await.unwrap(), S::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn sinks_receive_every_change() {
        struct Recorder(Mutex<Vec<UpdateState>>);
        impl NotificationSink for Recorder {
            fn state_changed(&self, state: UpdateState) {
                self.0.lock().unwrap().push(state);
            }
        }

        let recorder = Arc::new(Recorder(Mutex::new(Vec::new())));
        let machine = UpdateMachine::with_sinks(MachineTimings::default(), vec![recorder.clone() as Arc<dyn NotificationSink>]);

        machine.send(UpdateEvent::Update); // Idle 에서는 무시
        machine.send(UpdateEvent::UpdateAvailable);
        machine.send(UpdateEvent::Update);

        assert_eq!(*recorder.0.lock().unwrap(), vec![S::Available, S::Updating]);
    }

    #[tokio::test(start_paused = true)]
    async fn dismiss_notification_only_clears_notice_states() {
        let machine = UpdateMachine::new(MachineTimings::default());

        machine.send(UpdateEvent::Init { is_update_available: false, is_reloaded_on_update: true });
        assert_eq!(machine.state(), S::Success);
        assert!(machine.dismiss_notification());
        assert_eq!(machine.state(), S::Idle);

        // 정리 후 바로 Check 가능
        machine.send(UpdateEvent::Check);
        assert_eq!(machine.state(), S::Checking);
        assert!(!machine.dismiss_notification());
        assert_eq!(machine.state(), S::Checking);

        // 이전 Success의 자동 정리 타이머가 Checking을 건드리면 안 됨
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(machine.state(), S::Checking);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_drops_pending_transition() {
        let machine = UpdateMachine::new(MachineTimings::default());

        machine.send(UpdateEvent::Check);
        machine.send(UpdateEvent::UpdateAvailable);
        machine.reset();
        assert_eq!(machine.state(), S::Idle);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(machine.state(), S::Idle);

        machine.send(UpdateEvent::UpdateAvailable);
        machine.reset();
        assert_eq!(machine.state(), S::Idle);
    }
}
