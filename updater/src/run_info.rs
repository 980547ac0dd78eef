//! 실행 버전 기록
//!
//! 시작할 때 저장된 `last-run-version`과 현재 버전을 비교해
//! 이번 실행이 업데이트 직후인지 판단합니다.

use crate::store::{keys, KeyValueStore};
use crate::version::Version;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunInfo {
    pub current_version: String,
    pub previous_version: Option<String>,
}

impl RunInfo {
    pub fn load(store: &dyn KeyValueStore, current_version: &str) -> Self {
        let previous_version = match store.get(keys::LAST_RUN_VERSION) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("[RunInfo] Failed to read last run version: {}", e);
                None
            }
        };

        Self {
            current_version: current_version.to_string(),
            previous_version,
        }
    }

    /// 이전 실행과 버전이 다르면 업데이트된 것으로 판단. 첫 실행은 아님
    pub fn is_updated(&self) -> bool {
        let Some(previous) = &self.previous_version else {
            return false;
        };
        match (Version::parse(previous), Version::parse(&self.current_version)) {
            (Some(prev), Some(cur)) => prev != cur,
            _ => previous != &self.current_version,
        }
    }

    pub fn is_first_run(&self) -> bool {
        self.previous_version.is_none()
    }

    /// 현재 버전을 다음 실행을 위해 기록
    pub fn record(&self, store: &dyn KeyValueStore) {
        if let Err(e) = store.set(keys::LAST_RUN_VERSION, &self.current_version) {
            tracing::warn!("[RunInfo] Failed to record run version: {}", e);
        }
    }
}
