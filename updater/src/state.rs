//! 업데이트 상태 관리자
//!
//! 대기 중인 업데이트 레코드를 저장소에 기록하고 메모리 캐시로 유지합니다.
//! 프로세스가 유휴 임계값보다 짧은 주기로 재시작될 수 있으므로
//! `update_available_timestamp`와 `last_navigation_timestamp`가 모두 영속화되어야
//! 재시작 후에도 유휴 시간 계산이 처음부터 다시 시작되지 않습니다.
//!
//! 네비게이션 타임스탬프는 매 이동마다 바뀌므로 쓰기를 스로틀링하고,
//! 나머지 필드는 즉시 기록(write-through)합니다.

use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use crate::error::CoordinatorError;
use crate::store::{keys, KeyValueStore};

/// 대기 중인 업데이트 레코드
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedUpdateRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_version: Option<String>,
    #[serde(default)]
    pub is_manual_check: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_available_timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_navigation_timestamp: Option<i64>,
    /// 리로드 마커에서 읽어온 직전 업데이트 결과 (별도 키에 저장)
    #[serde(skip)]
    pub last_outcome: Option<UpdateOutcome>,
}

/// 재시작 직후 한 번만 읽히는 업데이트 결과
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOutcome {
    pub is_ok: bool,
}

/// 수동 업데이트를 시작한 UI 페이지
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    Options,
    Popup,
}

impl UpdateSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateSource::Options => "options",
            UpdateSource::Popup => "popup",
        }
    }
}

/// 수동 리로드 직전에 기록되는 마커
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadMarker {
    pub init_version: String,
    pub page_to_open_after_reload: UpdateSource,
    pub is_ok: bool,
}

struct StateInner {
    record: PersistedUpdateRecord,
    /// 스로틀링으로 아직 기록되지 않은 변경이 있음
    dirty: bool,
    last_write: Option<Instant>,
    trailing_scheduled: bool,
}

/// 상태 관리자. 복제해도 같은 캐시를 공유합니다.
#[derive(Clone)]
pub struct StateManager {
    store: Arc<dyn KeyValueStore>,
    inner: Arc<Mutex<StateInner>>,
    save_throttle: Duration,
}

impl StateManager {
    pub const DEFAULT_SAVE_THROTTLE: Duration = Duration::from_secs(5);

    pub fn new(store: Arc<dyn KeyValueStore>, save_throttle: Duration) -> Self {
        Self {
            store,
            inner: Arc::new(Mutex::new(StateInner {
                record: PersistedUpdateRecord::default(),
                dirty: false,
                last_write: None,
                trailing_scheduled: false,
            })),
            save_throttle,
        }
    }

    pub fn store(&self) -> &Arc<dyn KeyValueStore> {
        &self.store
    }

    /// 저장소에서 레코드를 읽어 캐시를 재구성.
    /// 없거나 손상된 경우 빈 상태로 시작하며 `None` 반환
    pub fn init(&self) -> Option<PersistedUpdateRecord> {
        let loaded = match self.store.get(keys::UPDATE_STATE) {
            Ok(Some(raw)) => match serde_json::from_str::<PersistedUpdateRecord>(&raw) {
                Ok(record) => Some(record),
                Err(e) => {
                    tracing::error!("[StateManager] Failed to parse persisted update state: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::error!("[StateManager] Failed to load update state: {}", e);
                None
            }
        };

        let mut inner = self.lock();
        inner.record = loaded.clone().unwrap_or_default();
        inner.dirty = false;
        drop(inner);

        loaded.map(|mut record| {
            record.last_outcome = self.peek_outcome();
            record
        })
    }

    /// 현재 레코드 스냅샷 (`last_outcome`은 소비하지 않고 조회)
    pub fn snapshot(&self) -> PersistedUpdateRecord {
        let mut record = self.lock().record.clone();
        record.last_outcome = self.peek_outcome();
        record
    }

    pub fn next_version(&self) -> Option<String> {
        self.lock().record.next_version.clone()
    }

    pub fn set_next_version(&self, version: Option<String>) {
        self.write_through(|r| r.next_version = version);
    }

    pub fn is_manual_check(&self) -> bool {
        self.lock().record.is_manual_check
    }

    pub fn set_is_manual_check(&self, value: bool) {
        self.write_through(|r| r.is_manual_check = value);
    }

    pub fn update_available_timestamp(&self) -> Option<i64> {
        self.lock().record.update_available_timestamp
    }

    pub fn set_update_available_timestamp(&self, timestamp: i64) {
        self.write_through(|r| r.update_available_timestamp = Some(timestamp));
    }

    pub fn last_navigation_timestamp(&self) -> Option<i64> {
        self.lock().record.last_navigation_timestamp
    }

    /// 네비게이션 타임스탬프 갱신. 저장은 `save_throttle` 간격으로 제한
    pub fn set_last_navigation_timestamp(&self, timestamp: i64) {
        let mut inner = self.lock();
        inner.record.last_navigation_timestamp = Some(timestamp);
        inner.dirty = true;

        let now = Instant::now();
        let due = inner
            .last_write
            .map_or(true, |at| now.duration_since(at) >= self.save_throttle);

        if due {
            self.persist_locked(&mut inner);
            return;
        }

        if inner.trailing_scheduled {
            return;
        }

        let Some(last_write) = inner.last_write else {
            self.persist_locked(&mut inner);
            return;
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                inner.trailing_scheduled = true;
                let fire_at = last_write + self.save_throttle;
                let manager = self.clone();
                handle.spawn(async move {
                    tokio::time::sleep_until(fire_at).await;
                    manager.flush();
                });
            }
            Err(_) => self.persist_locked(&mut inner),
        }
    }

    /// 스로틀링으로 미뤄진 쓰기를 즉시 수행
    pub fn flush(&self) {
        let mut inner = self.lock();
        inner.trailing_scheduled = false;
        if inner.dirty {
            self.persist_locked(&mut inner);
        }
    }

    /// 레코드를 캐시와 저장소에서 모두 제거
    pub fn clear(&self) {
        let mut inner = self.lock();
        inner.record = PersistedUpdateRecord::default();
        inner.dirty = false;
        drop(inner);

        if let Err(e) = self.store.remove(keys::UPDATE_STATE) {
            tracing::error!("[StateManager] Failed to clear update state: {}", e);
        }
    }

    // ── 리로드 마커 ──────────────────────────────────────

    pub fn set_reload_marker(&self, marker: &ReloadMarker) -> Result<(), CoordinatorError> {
        let raw = serde_json::to_string(marker)?;
        self.store.set(keys::RELOAD_MARKER, &raw)?;
        Ok(())
    }

    pub fn reload_marker(&self) -> Option<ReloadMarker> {
        match self.store.get(keys::RELOAD_MARKER) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(marker) => Some(marker),
                Err(e) => {
                    tracing::debug!("[StateManager] Failed to parse reload marker: {}", e);
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("[StateManager] Failed to read reload marker: {}", e);
                None
            }
        }
    }

    /// 마커를 읽고 삭제 (한 번만 소비)
    pub fn take_reload_marker(&self) -> Option<ReloadMarker> {
        let marker = self.reload_marker();
        self.remove_reload_marker();
        marker
    }

    pub fn remove_reload_marker(&self) {
        if let Err(e) = self.store.remove(keys::RELOAD_MARKER) {
            tracing::warn!("[StateManager] Failed to remove reload marker: {}", e);
        }
    }

    // ── 마커 없는 업데이트 결과 ──────────────────────────

    pub fn set_last_outcome(&self, outcome: UpdateOutcome) -> Result<(), CoordinatorError> {
        let raw = serde_json::to_string(&outcome)?;
        self.store.set(keys::LAST_OUTCOME, &raw)?;
        Ok(())
    }

    fn last_outcome(&self) -> Option<UpdateOutcome> {
        match self.store.get(keys::LAST_OUTCOME) {
            Ok(Some(raw)) => serde_json::from_str(&raw)
                .map_err(|e| tracing::debug!("[StateManager] Failed to parse last outcome: {}", e))
                .ok(),
            Ok(None) => None,
            Err(e) => {
                tracing::debug!("[StateManager] Failed to read last outcome: {}", e);
                None
            }
        }
    }

    /// 직전 업데이트 결과를 읽고 삭제. 리로드 마커가 우선
    pub fn take_outcome(&self) -> Option<UpdateOutcome> {
        let from_marker = self
            .take_reload_marker()
            .map(|marker| UpdateOutcome { is_ok: marker.is_ok });
        let stored = self.last_outcome();
        if stored.is_some() {
            if let Err(e) = self.store.remove(keys::LAST_OUTCOME) {
                tracing::warn!("[StateManager] Failed to remove last outcome: {}", e);
            }
        }
        from_marker.or(stored)
    }

    fn peek_outcome(&self) -> Option<UpdateOutcome> {
        self.reload_marker()
            .map(|m| UpdateOutcome { is_ok: m.is_ok })
            .or_else(|| self.last_outcome())
    }

    // ── 내부 ──────────────────────────────────────────────

    fn lock(&self) -> MutexGuard<'_, StateInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_through<F>(&self, update: F)
    where
        F: FnOnce(&mut PersistedUpdateRecord),
    {
        let mut inner = self.lock();
        update(&mut inner.record);
        inner.dirty = true;
        self.persist_locked(&mut inner);
    }

    fn persist_locked(&self, inner: &mut StateInner) {
        let raw = match serde_json::to_string(&inner.record) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::error!("[StateManager] Failed to serialize update state: {}", e);
                return;
            }
        };

        match self.store.set(keys::UPDATE_STATE, &raw) {
            Ok(()) => {
                inner.dirty = false;
                inner.last_write = Some(Instant::now());
            }
            Err(e) => tracing::warn!("[StateManager] Failed to save update state: {}", e),
        }
    }
}
