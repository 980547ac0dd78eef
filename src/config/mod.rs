//! 데몬 설정
//!
//! `config/updater.toml` 전체, 또는 `config/global.toml`의 `[updater]` 섹션을 읽습니다.
//! 빠진 키는 모두 기본값으로 채웁니다.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use update_coordinator_lib::{AutoUpdateConfig, CoordinatorConfig, MachineTimings};

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:57480";

#[derive(Deserialize, Debug, Clone)]
#[serde(default)]
pub struct UpdaterSettings {
    pub icon_delay_secs: u64,
    pub idle_threshold_secs: u64,
    pub check_interval_secs: u64,
    pub min_display_ms: u64,
    pub notification_delay_ms: u64,
    pub download_timeout_secs: u64,
    pub save_throttle_ms: u64,
    /// 원격 버전 확인 URL (HEAD 요청 후 최종 URL에서 버전 추출)
    pub probe_url: Option<String>,
    /// 개발용: 현재 버전보다 하나 높은 원격 버전을 보고
    pub mock_remote_version: bool,
    pub state_file: Option<PathBuf>,
    pub listen_addr: String,
    pub host: HostSettings,
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(default)]
pub struct HostSettings {
    pub update_check_url: Option<String>,
}

impl Default for UpdaterSettings {
    fn default() -> Self {
        Self {
            icon_delay_secs: 24 * 60 * 60,
            idle_threshold_secs: 30 * 60,
            check_interval_secs: 20,
            min_display_ms: 2000,
            notification_delay_ms: 2000,
            download_timeout_secs: 10 * 60,
            save_throttle_ms: 5000,
            probe_url: None,
            mock_remote_version: false,
            state_file: None,
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            host: HostSettings::default(),
        }
    }
}

impl UpdaterSettings {
    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            timings: MachineTimings {
                min_display: Duration::from_millis(self.min_display_ms),
                notification_delay: Duration::from_millis(self.notification_delay_ms),
            },
            auto: AutoUpdateConfig {
                icon_delay: Duration::from_secs(self.icon_delay_secs),
                idle_threshold: Duration::from_secs(self.idle_threshold_secs),
                check_interval: Duration::from_secs(self.check_interval_secs.max(1)),
            },
            download_timeout: Duration::from_secs(self.download_timeout_secs),
            save_throttle: Duration::from_millis(self.save_throttle_ms),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct GlobalConfig {
    pub updater: UpdaterSettings,
}

impl GlobalConfig {
    /// 설정 파일을 찾아 로드. 파일이 없으면 기본값
    pub fn load() -> anyhow::Result<Self> {
        match find_config_file() {
            Some(path) => Self::load_from(&path),
            None => {
                tracing::info!("[Config] No config file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_from(path: &Path) -> anyhow::Result<Self> {
        tracing::info!("[Config] Loading {}", path.display());
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let parsed: toml::Value = toml::from_str(content)?;
        // updater.toml 전체가 설정이거나, [updater] 섹션
        let section = match parsed.get("updater") {
            Some(updater) => updater.clone(),
            None => parsed,
        };
        let updater: UpdaterSettings = section.try_into()?;
        Ok(Self { updater })
    }
}

fn find_config_file() -> Option<PathBuf> {
    let exe_dir = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|d| d.join("config")));
    let cwd_dir = Some(PathBuf::from("config"));

    for name in ["updater.toml", "global.toml"] {
        for dir in [&exe_dir, &cwd_dir].into_iter().flatten() {
            let p = dir.join(name);
            if p.exists() {
                return Some(p);
            }
        }
    }
    None
}
