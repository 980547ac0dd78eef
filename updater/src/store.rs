//! 영속 키/값 저장소
//!
//! 코디네이터 상태는 프로세스가 언제든 종료될 수 있다는 전제로 저장됩니다.
//! `JsonFileStore`는 하나의 JSON 객체 파일에 키별 문자열 값을 보관하며,
//! 임시 파일에 쓴 뒤 rename 하여 반쯤 쓰인 파일이 남지 않도록 합니다.

use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::StoreError;

/// 저장소 키
pub mod keys {
    /// 대기 중인 업데이트 레코드
    pub const UPDATE_STATE: &str = "update-state";
    /// 리로드 직전에 기록되는 마커 (재시작 후 결과 판정용)
    pub const RELOAD_MARKER: &str = "update-reload-marker";
    /// 마커 없이 재시작된 경우의 업데이트 결과 (자동 적용 등)
    pub const LAST_OUTCOME: &str = "update-last-outcome";
    /// 런타임 자동 업데이트 설정 오버라이드 (JSON 문자열)
    pub const AUTO_UPDATE_CONFIG: &str = "auto-update-config";
    /// 마지막으로 실행된 버전
    pub const LAST_RUN_VERSION: &str = "last-run-version";
}

/// 키/값 저장소 인터페이스
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError>;
    fn set(&self, key: &str, value: &str) -> Result<(), StoreError>;
    fn remove(&self, key: &str) -> Result<(), StoreError>;
}

/// JSON 파일 기반 저장소
pub struct JsonFileStore {
    path: PathBuf,
    /// 같은 프로세스 내 동시 쓰기 직렬화
    write_lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// 플랫폼 기본 경로의 저장소
    pub fn default_location() -> Self {
        Self::new(Self::default_path())
    }

    fn default_path() -> PathBuf {
        #[cfg(target_os = "windows")]
        {
            std::env::var("APPDATA")
                .map(|appdata| PathBuf::from(appdata).join("update-coordinator").join("update-state.json"))
                .unwrap_or_else(|_| PathBuf::from("update-state.json"))
        }
        #[cfg(not(target_os = "windows"))]
        {
            std::env::var("HOME")
                .map(|home| PathBuf::from(home).join(".update-coordinator").join("update-state.json"))
                .unwrap_or_else(|_| PathBuf::from("update-state.json"))
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 문서 전체 로드. 파일이 없으면 빈 문서
    fn load(&self) -> Result<Map<String, Value>, StoreError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(self.io_error(e)),
        };

        if content.trim().is_empty() {
            return Ok(Map::new());
        }

        match serde_json::from_str::<Value>(&content) {
            Ok(Value::Object(map)) => Ok(map),
            Ok(other) => Err(StoreError::Malformed(format!("expected object, got {}", other))),
            Err(e) => Err(StoreError::Malformed(e.to_string())),
        }
    }

    fn persist(&self, doc: &Map<String, Value>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| self.io_error(e))?;
            }
        }

        let json = serde_json::to_string_pretty(doc)
            .map_err(|e| StoreError::Malformed(e.to_string()))?;

        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| self.io_error(e))?;
        std::fs::rename(&tmp, &self.path).map_err(|e| self.io_error(e))
    }

    /// 읽기-수정-쓰기. 손상된 문서는 버리고 새로 시작
    fn modify<F>(&self, f: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut Map<String, Value>),
    {
        let _guard = self.write_lock.lock().map_err(|_| StoreError::Poisoned)?;

        let mut doc = match self.load() {
            Ok(doc) => doc,
            Err(StoreError::Malformed(reason)) => {
                tracing::warn!("[Store] Discarding malformed store {}: {}", self.path.display(), reason);
                Map::new()
            }
            Err(e) => return Err(e),
        };

        f(&mut doc);
        self.persist(&doc)
    }

    fn io_error(&self, source: std::io::Error) -> StoreError {
        StoreError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }
}

impl KeyValueStore for JsonFileStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let doc = self.load()?;
        Ok(doc.get(key).and_then(|v| v.as_str()).map(str::to_string))
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.modify(|doc| {
            doc.insert(key.to_string(), Value::String(value.to_string()));
        })
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        if !self.path.exists() {
            return Ok(());
        }
        self.modify(|doc| {
            doc.remove(key);
        })
    }
}

/// 메모리 저장소 (테스트, 휘발성 호스트용)
#[derive(Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        Ok(values.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        values.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), StoreError> {
        let mut values = self.values.lock().map_err(|_| StoreError::Poisoned)?;
        values.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn file_store_round_trip() {
        let tmp = TempDir::new().unwrap();
        let store = JsonFileStore::new(tmp.path().join("nested").join("state.json"));

        assert_eq!(store.get("a").unwrap(), None);
        store.set("a", "1").unwrap();
        store.set("b", "{\"x\":true}").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("1"));
        assert_eq!(store.get("b").unwrap().as_deref(), Some("{\"x\":true}"));

        store.remove("a").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert!(store.get("b").unwrap().is_some());

        // 새 인스턴스로 다시 열어도 유지
        let reopened = JsonFileStore::new(store.path().to_path_buf());
        assert!(reopened.get("b").unwrap().is_some());
    }

    #[test]
    fn corrupt_file_reads_as_error_and_is_replaced_on_write() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("state.json");
        std::fs::write(&path, "{ this is not json").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(store.get("a"), Err(StoreError::Malformed(_))));

        store.set("a", "ok").unwrap();
        assert_eq!(store.get("a").unwrap().as_deref(), Some("ok"));
    }

    #[test]
    fn remove_on_missing_file_is_noop() {
        let tmp = TempDir::new().unwrap();
        let store = JsonFileStore::new(tmp.path().join("absent.json"));
        store.remove("anything").unwrap();
        assert!(!store.path().exists());
    }

    #[test]
    fn memory_store_basics() {
        let store = MemoryStore::new();
        store.set(keys::UPDATE_STATE, "{}").unwrap();
        assert_eq!(store.get(keys::UPDATE_STATE).unwrap().as_deref(), Some("{}"));
        store.remove(keys::UPDATE_STATE).unwrap();
        assert_eq!(store.get(keys::UPDATE_STATE).unwrap(), None);
    }
}
