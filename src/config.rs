use crate::sim::ResourceKind;
use anyhow::Context as _;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;

/// 시험 실행기 전체 설정이다. 모든 필드는 생략 가능하다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// tracing 최대 로그 레벨(`error`~`trace`).
    pub log_level: String,
    /// 동시에 실행할 테스트 케이스 수.
    pub max_parallel_cases: usize,
    /// 상태 대기 액션 기본 타이밍.
    pub poll: PollDefaults,
    /// 서비스 호출 제한 설정.
    pub throttle: ThrottleConfig,
    /// 시뮬레이터 설정.
    pub sim: SimConfig,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            max_parallel_cases: 1,
            poll: PollDefaults::default(),
            throttle: ThrottleConfig::default(),
            sim: SimConfig::default(),
        }
    }
}

/// 상태 대기 기본 타이밍(초 단위)이다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollDefaults {
    pub timeout_secs: u64,
    pub interval_secs: u64,
    pub initial_wait_secs: u64,
}

impl Default for PollDefaults {
    fn default() -> Self {
        Self {
            timeout_secs: 60,
            interval_secs: 5,
            initial_wait_secs: 0,
        }
    }
}

impl PollDefaults {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn initial_wait(&self) -> Duration {
        Duration::from_secs(self.initial_wait_secs)
    }
}

/// 서비스 호출 사이 최소 간격 설정이다.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    /// 호출 제한 사용 여부.
    pub enabled: bool,
    /// 호출 사이 최소 간격(초).
    pub spacing_secs: u64,
    /// 간격 확인 주기(초).
    pub check_interval_secs: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            spacing_secs: 5,
            check_interval_secs: 5,
        }
    }
}

/// 시뮬레이터 제어 평면 설정이다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// 리소스 종류별 프로젝트당 생성 한도. 없으면 무제한.
    pub quotas: BTreeMap<ResourceKind, usize>,
}

impl ThrottleConfig {
    pub fn spacing(&self) -> Duration {
        Duration::from_secs(self.spacing_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl RunnerConfig {
    /// 설정 값의 일관성을 검사한다.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.poll.interval_secs == 0 {
            anyhow::bail!("poll.interval_secs는 0보다 커야 합니다.");
        }
        if self.throttle.enabled && self.throttle.check_interval_secs == 0 {
            anyhow::bail!("throttle.check_interval_secs는 0보다 커야 합니다.");
        }
        if self.max_parallel_cases == 0 {
            anyhow::bail!("max_parallel_cases는 1 이상이어야 합니다.");
        }
        self.tracing_level()?;
        Ok(())
    }

    /// `log_level` 문자열을 tracing 레벨로 변환한다.
    pub fn tracing_level(&self) -> anyhow::Result<tracing::Level> {
        self.log_level
            .parse::<tracing::Level>()
            .map_err(|err| anyhow::anyhow!("알 수 없는 log_level '{}': {err}", self.log_level))
    }
}

/// YAML 파일을 읽어 RunnerConfig로 역직렬화한다.
pub fn load_config_from_file(path: &Path) -> anyhow::Result<RunnerConfig> {
    let mut file =
        File::open(path).with_context(|| format!("설정 파일을 열 수 없습니다: {}", path.display()))?;
    load_config_from_reader(&mut file)
}

/// Reader에서 YAML을 읽어 검증된 RunnerConfig를 만든다.
pub fn load_config_from_reader<R: Read>(reader: &mut R) -> anyhow::Result<RunnerConfig> {
    let mut buf = String::new();
    reader.read_to_string(&mut buf)?;
    let config: RunnerConfig = if buf.trim().is_empty() {
        RunnerConfig::default()
    } else {
        serde_yaml::from_str(&buf).context("설정 YAML 파싱 실패")?
    };
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_yaml_keeps_defaults() {
        let yaml = "poll:\n  timeout_secs: 120\nthrottle:\n  enabled: true\n";
        let config = load_config_from_reader(&mut yaml.as_bytes()).unwrap();
        assert_eq!(config.poll.timeout(), Duration::from_secs(120));
        assert_eq!(config.poll.interval(), Duration::from_secs(5));
        assert!(config.throttle.enabled);
        assert_eq!(config.throttle.spacing_secs, 5);
        assert_eq!(config.max_parallel_cases, 1);
        assert_eq!(config.tracing_level().unwrap(), tracing::Level::INFO);
    }

    #[test]
    fn sim_quotas_are_keyed_by_resource_kind() {
        let yaml = "sim:\n  quotas:\n    server: 2\n    volume: 0\n";
        let config = load_config_from_reader(&mut yaml.as_bytes()).unwrap();
        assert_eq!(config.sim.quotas.get(&ResourceKind::Server), Some(&2));
        assert_eq!(config.sim.quotas.get(&ResourceKind::Volume), Some(&0));

        let unknown = "sim:\n  quotas:\n    router: 1\n";
        assert!(load_config_from_reader(&mut unknown.as_bytes()).is_err());
    }

    #[test]
    fn empty_document_is_default() {
        let config = load_config_from_reader(&mut "".as_bytes()).unwrap();
        assert_eq!(config, RunnerConfig::default());
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let yaml = "poll:\n  interval_secs: 0\n";
        assert!(load_config_from_reader(&mut yaml.as_bytes()).is_err());
    }

    #[test]
    fn unknown_log_level_is_rejected() {
        let yaml = "log_level: loud\n";
        let err = load_config_from_reader(&mut yaml.as_bytes()).unwrap_err();
        assert!(err.to_string().contains("loud"));
    }
}
