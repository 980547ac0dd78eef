//! # 업데이트 코디네이터 라이브러리
//!
//! 셀프 업데이트를 언제, 어떻게, 적용할지 말지를 결정합니다.
//! 업데이트 파일의 빌드/서명/검증은 다루지 않으며, 다운로드와 재시작은
//! 호스트 플랫폼([`HostUpdatePort`])에 맡깁니다.
//!
//! ## 동작 원리
//! - **자동 흐름(auto_flow.rs)**: 호스트가 조용히 내려받은 업데이트. 아이콘 표시는
//!   `icon_delay` 이후, 적용은 사용자가 충분히 유휴 상태일 때
//! - **수동 흐름(manual_flow.rs)**: 사용자의 "업데이트 확인". 원격 확인 후 호스트에
//!   다운로드를 요청하고, 사용자 확인 시 적용
//! - **FSM(machine.rs)**: 두 흐름이 공유하는 단일 상태 머신. UI는 이 상태만 봄
//! - **상태 관리자(state.rs)**: 프로세스가 언제 재시작되어도 이어갈 수 있도록 영속화
//!
//! ## 재시작 복원
//! 업데이트 적용은 프로세스 재시작으로 끝나므로 성공 이벤트가 없습니다.
//! 재시작 후 [`UpdateCoordinator::init`]이 대기 레코드를 복원하고,
//! [`UpdateCoordinator::handle_reload`]가 리로드 마커로 결과를 판정합니다.
//!
//! ## 저장소 키
//! ```text
//! update-state          대기 중인 업데이트 레코드 (JSON)
//! update-reload-marker  수동 리로드 마커 / 결과
//! auto-update-config    자동 흐름 타이밍 오버라이드 (JSON)
//! last-run-version      마지막 실행 버전
//! ```

// ══════════════════════════════════════════════════════
// 모듈
// ══════════════════════════════════════════════════════

pub mod auto_flow;
pub mod coordinator;
pub mod error;
pub mod host;
pub mod ipc;
pub mod machine;
pub mod manual_flow;
pub mod probe;
pub mod run_info;
pub mod state;
pub mod store;
pub mod version;

#[cfg(test)]
mod test_support;

// Re-exports for convenience
pub use auto_flow::{AutoUpdateConfig, AutoUpdateFlow};
pub use coordinator::{CoordinatorBuilder, CoordinatorConfig, UpdateCoordinator, UpdateStatusReport};
pub use error::{CoordinatorError, ErrorContext, StoreError};
pub use host::{Clock, HostUpdatePort, ManualClock, NoopHook, PreReloadHook, SystemClock, UpdateCheckStatus};
pub use ipc::{dispatch, UpdaterCommand, UpdaterResponse};
pub use machine::{
    LogSink, MachineTimings, NotificationSink, Transition, UpdateEvent, UpdateMachine, UpdateState,
};
pub use manual_flow::{CheckOutcome, ManualUpdateFlow};
pub use probe::{BumpedVersionProbe, HttpVersionProbe, RemoteVersionProbe};
pub use run_info::RunInfo;
pub use state::{PersistedUpdateRecord, ReloadMarker, StateManager, UpdateOutcome, UpdateSource};
pub use store::{JsonFileStore, KeyValueStore, MemoryStore};
pub use version::Version;
