//! 데몬 호스트 어댑터
//!
//! 코디네이터가 보는 호스트 플랫폼을 데몬 프로세스로 구현합니다.
//! - 다운로드 완료/네비게이션 신호는 IPC 엔드포인트에서 들어와 broadcast로 전달
//! - 업데이트 확인은 `update_check_url`에 위임 (없으면 항상 NoUpdate)
//! - 리로드는 같은 인자로 새 프로세스를 띄우고 현재 프로세스를 종료

use async_trait::async_trait;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::broadcast;

use update_coordinator_lib::{CoordinatorError, HostUpdatePort, UpdateCheckStatus, UpdateSource};

/// 응답을 내보낼 시간을 준 뒤 종료
pub const EXIT_GRACE: Duration = Duration::from_millis(300);

pub struct DaemonHost {
    version: String,
    update_check_url: Option<String>,
    client: reqwest::Client,
    restart_on_reload: bool,
    available_tx: broadcast::Sender<String>,
    navigation_tx: broadcast::Sender<i64>,
    page_tx: broadcast::Sender<UpdateSource>,
    pending_page: Mutex<Option<UpdateSource>>,
}

impl DaemonHost {
    pub fn new(update_check_url: Option<String>) -> Self {
        let (available_tx, _) = broadcast::channel(16);
        let (navigation_tx, _) = broadcast::channel(64);
        let (page_tx, _) = broadcast::channel(4);
        Self {
            version: env!("CARGO_PKG_VERSION").to_string(),
            update_check_url,
            client: reqwest::Client::new(),
            restart_on_reload: true,
            available_tx,
            navigation_tx,
            page_tx,
            pending_page: Mutex::new(None),
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// 리로드 시 프로세스를 재시작하지 않음 (테스트, 임베드 용도)
    pub fn without_restart(mut self) -> Self {
        self.restart_on_reload = false;
        self
    }

    /// 호스트가 업데이트를 다 내려받았음을 알림. 수신자 수 반환
    pub fn notify_update_available(&self, version: String) -> usize {
        tracing::info!("[Host] Update downloaded: {}", version);
        self.available_tx.send(version).unwrap_or(0)
    }

    pub fn notify_navigation(&self, timestamp_ms: i64) -> usize {
        tracing::trace!("[Host] Navigation at {}", timestamp_ms);
        self.navigation_tx.send(timestamp_ms).unwrap_or(0)
    }

    pub fn subscribe_pages(&self) -> broadcast::Receiver<UpdateSource> {
        self.page_tx.subscribe()
    }

    /// 재시작 후 열어야 할 페이지 (한 번만 반환)
    pub fn take_pending_page(&self) -> Option<UpdateSource> {
        self.pending_page
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }
}

#[async_trait]
impl HostUpdatePort for DaemonHost {
    async fn request_update_check(&self) -> Result<UpdateCheckStatus, CoordinatorError> {
        let Some(url) = &self.update_check_url else {
            tracing::debug!("[Host] No update check URL configured");
            return Ok(UpdateCheckStatus::NoUpdate);
        };

        let response = self
            .client
            .get(url)
            .query(&[("version", self.version.as_str())])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| host_check_error(&e))?;

        if !response.status().is_success() {
            return Err(CoordinatorError::HostCheck {
                message: format!("update check returned {}", response.status()),
            });
        }

        response
            .json::<UpdateCheckStatus>()
            .await
            .map_err(|e| host_check_error(&e))
    }

    fn subscribe_update_available(&self) -> broadcast::Receiver<String> {
        self.available_tx.subscribe()
    }

    fn subscribe_navigation(&self) -> broadcast::Receiver<i64> {
        self.navigation_tx.subscribe()
    }

    async fn reload(&self) -> Result<(), CoordinatorError> {
        if !self.restart_on_reload {
            tracing::info!("[Host] Reload requested (restart disabled)");
            return Ok(());
        }

        let exe = std::env::current_exe().map_err(|e| CoordinatorError::Reload {
            message: format!("cannot locate executable: {}", e),
        })?;
        let args: Vec<String> = std::env::args().skip(1).collect();

        tracing::info!("[Host] Restarting {} {:?}", exe.display(), args);
        std::process::Command::new(&exe)
            .args(&args)
            .spawn()
            .map_err(|e| CoordinatorError::Reload {
                message: format!("failed to spawn {}: {}", exe.display(), e),
            })?;

        tokio::spawn(async {
            tokio::time::sleep(EXIT_GRACE).await;
            std::process::exit(0);
        });
        Ok(())
    }

    fn current_version(&self) -> String {
        self.version.clone()
    }

    async fn open_page(&self, source: UpdateSource) -> Result<(), CoordinatorError> {
        tracing::info!("[Host] Opening {} page after update", source.as_str());
        *self
            .pending_page
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(source);
        let _ = self.page_tx.send(source);
        Ok(())
    }
}

fn host_check_error(err: &reqwest::Error) -> CoordinatorError {
    match CoordinatorError::from_reqwest(err, "host update check") {
        CoordinatorError::Probe { message, .. } => CoordinatorError::HostCheck { message },
        other => other,
    }
}
