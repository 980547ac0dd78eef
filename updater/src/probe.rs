//! 원격 스토어 버전 확인
//!
//! 호스트의 업데이트 확인 요청은 빈도 제한이 있으므로, 먼저 스토어에
//! 실제로 새 버전이 올라와 있는지 가볍게 확인합니다.
//! HEAD 요청의 리다이렉트 최종 URL(`..._5_1_111_0.crx`)에서 버전을 추출합니다.

use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;

use crate::error::CoordinatorError;
use crate::version::Version;

#[async_trait]
pub trait RemoteVersionProbe: Send + Sync {
    /// 스토어의 최신 버전. 알 수 없으면 `Ok(None)`
    async fn latest_version(&self) -> Result<Option<Version>, CoordinatorError>;
}

/// 리다이렉트 URL에서 버전 추출
pub fn version_from_url(url: &str) -> Option<Version> {
    let re = Regex::new(r"_([0-9_]+)\.crx$").ok()?;
    let caps = re.captures(url)?;
    let raw = caps.get(1)?.as_str().replace('_', ".");
    Version::parse(&raw)
}

/// HTTP HEAD 기반 스토어 확인
pub struct HttpVersionProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpVersionProbe {
    pub fn new(url: impl Into<String>) -> Result<Self, CoordinatorError> {
        let client = reqwest::Client::builder()
            .user_agent("update-coordinator")
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| CoordinatorError::Config {
                message: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self { client, url: url.into() })
    }
}

#[async_trait]
impl RemoteVersionProbe for HttpVersionProbe {
    async fn latest_version(&self) -> Result<Option<Version>, CoordinatorError> {
        tracing::debug!("[Probe] Checking for updates at {}", self.url);

        let response = self
            .client
            .head(&self.url)
            .send()
            .await
            .map_err(|e| CoordinatorError::from_reqwest(&e, "remote version probe"))?;

        if response.status() != reqwest::StatusCode::OK {
            tracing::debug!("[Probe] No update found at {}, status: {}", self.url, response.status());
            return Ok(None);
        }

        let final_url = response.url().as_str();
        match version_from_url(final_url) {
            Some(version) => Ok(Some(version)),
            None => {
                tracing::debug!("[Probe] Could not parse version from redirect URL: {}", final_url);
                Ok(None)
            }
        }
    }
}

/// 개발용: 항상 현재 버전보다 한 단계 높은 버전이 있다고 응답
pub struct BumpedVersionProbe {
    current: String,
}

impl BumpedVersionProbe {
    pub fn new(current: impl Into<String>) -> Self {
        Self { current: current.into() }
    }
}

#[async_trait]
impl RemoteVersionProbe for BumpedVersionProbe {
    async fn latest_version(&self) -> Result<Option<Version>, CoordinatorError> {
        let mocked = Version::parse(&self.current).map(|v| v.bump_last());
        if let Some(v) = &mocked {
            tracing::debug!("[Probe] Mocking latest store version as {}", v);
        }
        Ok(mocked)
    }
}
