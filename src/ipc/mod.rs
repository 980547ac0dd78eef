pub mod updates;

use anyhow::Result;
use axum::Router;
use std::io::ErrorKind;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::host::EXIT_GRACE;

pub use updates::{updates_router, UpdateApiState};

/// 재시작 직후에는 부모 프로세스가 아직 포트를 잡고 있으므로 이 시간 동안 bind 재시도
pub const BIND_RETRY_WINDOW: Duration = Duration::from_millis(EXIT_GRACE.as_millis() as u64 * 10);

const BIND_RETRY_INITIAL_DELAY: Duration = Duration::from_millis(50);
const BIND_RETRY_MAX_DELAY: Duration = Duration::from_millis(500);

/// IPC HTTP 서버
#[derive(Clone)]
pub struct IPCServer {
    pub state: UpdateApiState,
    pub listen_addr: String,
    pub bind_window: Duration,
}

impl IPCServer {
    pub fn new(state: UpdateApiState, listen_addr: &str) -> Self {
        Self {
            state,
            listen_addr: listen_addr.to_string(),
            bind_window: BIND_RETRY_WINDOW,
        }
    }

    pub fn router(&self) -> Router {
        updates_router(self.state.clone()).layer(TraceLayer::new_for_http())
    }

    pub async fn start(self) -> Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);

        let router = self.router();

        // TCP 리스너
        let listener = bind_with_retry(&self.listen_addr, self.bind_window).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router).await?;
        Ok(())
    }
}

/// 주소가 사용 중이면 `window` 동안 백오프하며 다시 bind. 다른 오류는 즉시 반환
pub async fn bind_with_retry(addr: &str, window: Duration) -> std::io::Result<TcpListener> {
    let deadline = tokio::time::Instant::now() + window;
    let mut delay = BIND_RETRY_INITIAL_DELAY;

    loop {
        match TcpListener::bind(addr).await {
            Ok(listener) => return Ok(listener),
            Err(e) if e.kind() == ErrorKind::AddrInUse && tokio::time::Instant::now() + delay <= deadline => {
                tracing::warn!("[IPC] {} is in use, retrying in {}ms", addr, delay.as_millis());
                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(BIND_RETRY_MAX_DELAY);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use update_coordinator_lib::{BumpedVersionProbe, CoordinatorConfig, MemoryStore, UpdateCoordinator};

    use crate::host::DaemonHost;

    #[test]
    fn test_bind_window_outlasts_exit_grace() {
        assert!(BIND_RETRY_WINDOW > EXIT_GRACE);
    }

    #[tokio::test]
    async fn test_bind_waits_for_previous_process_to_release_port() {
        // 이전 프로세스의 리스너
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = held.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            tokio::time::sleep(EXIT_GRACE).await;
            drop(held);
        });

        let listener = bind_with_retry(&addr, BIND_RETRY_WINDOW).await.unwrap();
        assert_eq!(listener.local_addr().unwrap().to_string(), addr);
    }

    #[tokio::test]
    async fn test_bind_gives_up_after_window() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = held.local_addr().unwrap().to_string();

        let err = bind_with_retry(&addr, Duration::from_millis(200)).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AddrInUse);
        drop(held);
    }

    #[tokio::test]
    async fn test_restarted_server_serves_once_port_is_free() {
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = held.local_addr().unwrap().to_string();

        let host = Arc::new(DaemonHost::new(None).with_version("1.0.0").without_restart());
        let coordinator = UpdateCoordinator::builder(
            CoordinatorConfig::default(),
            Arc::new(MemoryStore::new()),
            host.clone(),
            Arc::new(BumpedVersionProbe::new("1.0.0")),
        )
        .build();
        let server = IPCServer::new(UpdateApiState::new(coordinator, host), &addr);
        let serving = tokio::spawn(server.start());

        tokio::time::sleep(EXIT_GRACE).await;
        assert!(!serving.is_finished());
        drop(held);

        let url = format!("http://{}/api/updates/state", addr);
        let mut body = None;
        for _ in 0..40 {
            if let Ok(resp) = reqwest::get(&url).await {
                body = Some(resp.json::<serde_json::Value>().await.unwrap());
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        let body = body.expect("server never came up");
        assert_eq!(body["ok"], true);
        assert_eq!(body["state"], "idle");
        serving.abort();
    }
}
