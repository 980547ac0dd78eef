//! 테스트용 가짜 호스트/프로브

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

use crate::error::CoordinatorError;
use crate::host::{HostUpdatePort, UpdateCheckStatus};
use crate::probe::RemoteVersionProbe;
use crate::state::UpdateSource;
use crate::version::Version;

pub struct FakeHost {
    pub version: Mutex<String>,
    pub status: Mutex<Result<UpdateCheckStatus, CoordinatorError>>,
    pub fail_reload: AtomicBool,
    pub reloads: AtomicUsize,
    pub checks: AtomicUsize,
    pub opened: Mutex<Vec<UpdateSource>>,
    pub available: broadcast::Sender<String>,
    pub navigation: broadcast::Sender<i64>,
}

impl FakeHost {
    pub fn new(status: Result<UpdateCheckStatus, CoordinatorError>) -> Self {
        Self {
            version: Mutex::new("1.0".to_string()),
            status: Mutex::new(status),
            fail_reload: AtomicBool::new(false),
            reloads: AtomicUsize::new(0),
            checks: AtomicUsize::new(0),
            opened: Mutex::new(Vec::new()),
            available: broadcast::channel(16).0,
            navigation: broadcast::channel(16).0,
        }
    }

    pub fn with_update(version: &str) -> Self {
        Self::new(Ok(UpdateCheckStatus::UpdateAvailable { version: version.to_string() }))
    }

    pub fn reload_count(&self) -> usize {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn set_version(&self, version: &str) {
        *self.version.lock().unwrap() = version.to_string();
    }
}

#[async_trait]
impl HostUpdatePort for FakeHost {
    async fn request_update_check(&self) -> Result<UpdateCheckStatus, CoordinatorError> {
        self.checks.fetch_add(1, Ordering::SeqCst);
        self.status.lock().unwrap().clone()
    }

    fn subscribe_update_available(&self) -> broadcast::Receiver<String> {
        self.available.subscribe()
    }

    fn subscribe_navigation(&self) -> broadcast::Receiver<i64> {
        self.navigation.subscribe()
    }

    async fn reload(&self) -> Result<(), CoordinatorError> {
        self.reloads.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        if self.fail_reload.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Reload { message: "denied".into() });
        }
        Ok(())
    }

    fn current_version(&self) -> String {
        self.version.lock().unwrap().clone()
    }

    async fn open_page(&self, source: UpdateSource) -> Result<(), CoordinatorError> {
        self.opened.lock().unwrap().push(source);
        Ok(())
    }
}

pub struct FixedProbe(pub Result<Option<&'static str>, CoordinatorError>);

#[async_trait]
impl RemoteVersionProbe for FixedProbe {
    async fn latest_version(&self) -> Result<Option<Version>, CoordinatorError> {
        self.0.clone().map(|v| v.and_then(Version::parse))
    }
}
