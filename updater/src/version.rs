//! 확장 버전 비교 유틸리티 (외부 크레이트 없이)
//!
//! 스토어 버전은 1~4개의 점으로 구분된 정수입니다 (`5.1.111.0`).

use std::cmp::Ordering;
use std::fmt;

/// 최대 구성 요소 수
const MAX_PARTS: usize = 4;

/// 점으로 구분된 숫자 버전
#[derive(Debug, Clone)]
pub struct Version {
    parts: Vec<u64>,
}

impl Version {
    /// "5.1.111.0" 또는 "v2.0" 형식을 파싱
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let s = s.strip_prefix('v').unwrap_or(s);
        if s.is_empty() {
            return None;
        }

        let parts = s
            .split('.')
            .map(|p| p.parse::<u64>().ok())
            .collect::<Option<Vec<u64>>>()?;

        if parts.is_empty() || parts.len() > MAX_PARTS {
            return None;
        }

        Some(Self { parts })
    }

    /// 현재 버전보다 새로운 버전인지 확인
    pub fn is_newer_than(&self, other: &Version) -> bool {
        self > other
    }

    /// 마지막 구성 요소를 1 올린 버전 (개발 빌드 모킹용)
    pub fn bump_last(&self) -> Version {
        let mut parts = self.parts.clone();
        if let Some(last) = parts.last_mut() {
            *last += 1;
        }
        Version { parts }
    }

    pub fn parts(&self) -> &[u64] {
        &self.parts
    }

    fn part(&self, idx: usize) -> u64 {
        self.parts.get(idx).copied().unwrap_or(0)
    }
}

/// 두 버전 문자열 비교. 파싱 불가한 쪽은 업데이트 없음으로 취급
pub fn is_newer(candidate: &str, current: &str) -> bool {
    match (Version::parse(candidate), Version::parse(current)) {
        (Some(c), Some(cur)) => c.is_newer_than(&cur),
        _ => false,
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let joined: Vec<String> = self.parts.iter().map(|p| p.to_string()).collect();
        write!(f, "{}", joined.join("."))
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        // 누락된 뒷자리는 0 으로 비교 ("2.0" == "2.0.0.0")
        for idx in 0..MAX_PARTS {
            match self.part(idx).cmp(&other.part(idx)) {
                Ordering::Equal => {}
                ord => return ord,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Version {}
