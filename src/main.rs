use std::sync::Arc;

use tracing_subscriber::EnvFilter;
use update_coordinator::config::{GlobalConfig, UpdaterSettings};
use update_coordinator::host::DaemonHost;
use update_coordinator::ipc::{IPCServer, UpdateApiState};
use update_coordinator_lib::{
    BumpedVersionProbe, HostUpdatePort, HttpVersionProbe, JsonFileStore, KeyValueStore,
    RemoteVersionProbe, RunInfo, UpdateCoordinator, Version,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    tracing::info!("Update coordinator daemon starting (v{})", env!("CARGO_PKG_VERSION"));

    let cfg = match GlobalConfig::load() {
        Ok(cfg) => cfg,
        Err(e) => {
            tracing::warn!("[Config] Failed to load config, using defaults: {}", e);
            GlobalConfig::default()
        }
    };
    let settings = cfg.updater;

    let store: Arc<dyn KeyValueStore> = Arc::new(match &settings.state_file {
        Some(path) => JsonFileStore::new(path.clone()),
        None => JsonFileStore::default_location(),
    });

    let host = Arc::new(DaemonHost::new(settings.host.update_check_url.clone()));
    let probe = build_probe(&settings, &host.current_version())?;

    let coordinator =
        UpdateCoordinator::builder(settings.coordinator_config(), store.clone(), host.clone(), probe)
            .build();

    // 재시작 복원 → 직전 업데이트 결과 판정 → 현재 버전 기록
    let run_info = RunInfo::load(store.as_ref(), &host.current_version());
    if run_info.is_first_run() {
        tracing::info!("[RunInfo] First run of v{}", run_info.current_version);
    } else if run_info.is_updated() {
        tracing::info!(
            "[RunInfo] Version changed since last run: {} -> {}",
            run_info.previous_version.as_deref().unwrap_or_default(),
            run_info.current_version
        );
    }
    if let Some(record) = coordinator.init() {
        tracing::info!("[Coordinator] Restored record: {:?}", record);
    }
    coordinator.handle_reload(run_info.is_updated()).await;
    run_info.record(store.as_ref());

    // Graceful shutdown: Ctrl+C 시 보류 중인 쓰기 반영
    let coordinator_shutdown = coordinator.clone();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        tracing::info!("Shutdown signal received, flushing update state...");
        coordinator_shutdown.flush();
        std::process::exit(0);
    });

    let ipc_server = IPCServer::new(
        UpdateApiState::new(coordinator.clone(), host.clone()),
        &settings.listen_addr,
    );
    if let Err(e) = ipc_server.start().await {
        tracing::error!("IPC server error: {}", e);
    }

    coordinator.flush();
    tracing::info!("Update coordinator daemon shutting down");
    Ok(())
}

/// 원격 버전 확인 방식 선택. 개발 모드가 URL보다 우선
fn build_probe(
    settings: &UpdaterSettings,
    current_version: &str,
) -> anyhow::Result<Arc<dyn RemoteVersionProbe>> {
    if settings.mock_remote_version {
        tracing::info!("[Probe] Using bumped mock version of {}", current_version);
        return Ok(Arc::new(BumpedVersionProbe::new(current_version)));
    }

    match &settings.probe_url {
        Some(url) => Ok(Arc::new(HttpVersionProbe::new(url.clone())?)),
        None => {
            tracing::info!("[Probe] No probe URL configured, remote version is unknown");
            Ok(Arc::new(UnknownVersionProbe))
        }
    }
}

struct UnknownVersionProbe;

#[async_trait::async_trait]
impl RemoteVersionProbe for UnknownVersionProbe {
    async fn latest_version(&self) -> Result<Option<Version>, update_coordinator_lib::CoordinatorError> {
        Ok(None)
    }
}
