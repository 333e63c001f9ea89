use crate::engine::RunReport;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// 모든 서비스 경계에서 공유하는 오류 분류 어휘이다.
///
/// 각 액션 모듈은 클라이언트 고유 오류를 이 값 중 하나로 변환해야 하며,
/// Step의 기대 오류 목록도 이 값으로 선언한다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// 인증 거부(401).
    Unauthorized,
    /// 권한 부족(403).
    Forbidden,
    /// 리소스 없음(404).
    NotFound,
    /// 상태 충돌(409).
    Conflict,
    /// 할당량 초과(413/429).
    QuotaExceeded,
    /// 잘못된 요청(400).
    BadRequest,
    /// 상태 대기 시간 초과.
    PollTimeout,
    /// 목표 대신 종료 상태에 도달.
    PollTerminalState,
    /// 컨텍스트 키 누락.
    MissingKey,
    /// 액션 인자가 올바르지 않음.
    InvalidArgument,
    /// 그 밖의 서비스 오류.
    Service,
}

impl ErrorKind {
    /// 직렬화 형식과 같은 snake_case 이름을 반환한다.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
            ErrorKind::QuotaExceeded => "quota_exceeded",
            ErrorKind::BadRequest => "bad_request",
            ErrorKind::PollTimeout => "poll_timeout",
            ErrorKind::PollTerminalState => "poll_terminal_state",
            ErrorKind::MissingKey => "missing_key",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Service => "service",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 오류를 발생시킨 제어 평면 서비스이다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Service {
    /// 서버(compute).
    Compute,
    /// 볼륨(block storage).
    BlockStorage,
    /// 이미지.
    Image,
    /// 네트워크.
    Network,
    /// 오브젝트 스토리지.
    ObjectStorage,
    /// 사용자, 프로젝트, 역할.
    Identity,
}

impl fmt::Display for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Service::Compute => "compute",
            Service::BlockStorage => "block_storage",
            Service::Image => "image",
            Service::Network => "network",
            Service::ObjectStorage => "object_storage",
            Service::Identity => "identity",
        };
        f.write_str(name)
    }
}

/// 액션이 실패를 알리기 위해 반환하는 오류이다.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActionError {
    /// 서비스 호출이 실패한 경우이다.
    #[error("[{service}] {kind}: {message}")]
    Service {
        service: Service,
        kind: ErrorKind,
        status: Option<u16>,
        message: String,
    },
    /// 제한 시간 안에 목표 상태에 도달하지 못한 경우이다.
    #[error("상태 대기 시간 초과: 목표 '{target}', 마지막 상태 '{last_state}' ({elapsed:?} 경과)")]
    PollTimeout {
        target: String,
        last_state: String,
        elapsed: Duration,
    },
    /// 목표가 아닌 종료 상태를 관측한 경우이다.
    #[error("목표 상태 '{target}' 대신 종료 상태 '{state}'에 도달했습니다.")]
    PollTerminalState { target: String, state: String },
    /// 선행 Step이 기록해야 할 컨텍스트 키가 없는 경우이다.
    #[error("컨텍스트 키가 없습니다: {key}")]
    MissingKey { key: String },
    /// 액션 인자 값이 잘못된 경우이다.
    #[error("잘못된 인자 '{name}': {reason}")]
    InvalidArgument { name: String, reason: String },
}

impl ActionError {
    /// 서비스 오류를 생성한다.
    pub fn service(service: Service, kind: ErrorKind, message: impl Into<String>) -> Self {
        ActionError::Service {
            service,
            kind,
            status: None,
            message: message.into(),
        }
    }

    pub fn missing_key(key: impl Into<String>) -> Self {
        ActionError::MissingKey { key: key.into() }
    }

    pub fn invalid_argument(name: impl Into<String>, reason: impl Into<String>) -> Self {
        ActionError::InvalidArgument {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// 기대 오류 평가에 사용하는 분류 값을 반환한다.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ActionError::Service { kind, .. } => *kind,
            ActionError::PollTimeout { .. } => ErrorKind::PollTimeout,
            ActionError::PollTerminalState { .. } => ErrorKind::PollTerminalState,
            ActionError::MissingKey { .. } => ErrorKind::MissingKey,
            ActionError::InvalidArgument { .. } => ErrorKind::InvalidArgument,
        }
    }

    /// 리소스가 더 이상 존재하지 않음을 뜻하는 오류인지 확인한다.
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

/// ScenarioFactory 구성 중 발생하는 오류이다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FactoryError {
    /// 액션 목록이 비어 있는 경우이다.
    #[error("시나리오 액션 목록이 비어 있습니다.")]
    EmptyShape,
    /// Step 인덱스가 범위를 벗어난 경우이다.
    #[error("Step 인덱스 {index}가 범위를 벗어났습니다 (Step 수: {len}).")]
    IndexOutOfRange { index: usize, len: usize },
    /// 액션이 요구하는 필수 설정이 빠진 경우이다.
    #[error("Step {index} ({action})에 필수 설정 '{field}'가 없습니다.")]
    IncompleteConfiguration {
        index: usize,
        action: String,
        field: String,
    },
}

/// Step의 기대 계약이 지켜지지 않은 원인이다.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum StepFailure {
    /// 허용 목록에 없는 오류가 발생했다.
    #[error(
        "Step {index} ({action}, identity {identity}) 예상하지 못한 오류: {error} (허용: {})",
        format_kinds(.expected)
    )]
    UnexpectedException {
        index: usize,
        action: String,
        identity: String,
        expected: Vec<ErrorKind>,
        #[source]
        error: ActionError,
    },
    /// 오류가 요구되었지만 액션이 정상 종료했다.
    #[error(
        "Step {index} ({action}, identity {identity}) 예상한 오류 [{}]가 발생하지 않았습니다.",
        format_kinds(.expected)
    )]
    MissingExpectedException {
        index: usize,
        action: String,
        identity: String,
        expected: Vec<ErrorKind>,
    },
}

impl StepFailure {
    /// 실패한 Step 인덱스를 반환한다.
    pub fn index(&self) -> usize {
        match self {
            StepFailure::UnexpectedException { index, .. }
            | StepFailure::MissingExpectedException { index, .. } => *index,
        }
    }

    /// 관측된 오류가 있으면 반환한다.
    pub fn observed(&self) -> Option<&ActionError> {
        match self {
            StepFailure::UnexpectedException { error, .. } => Some(error),
            StepFailure::MissingExpectedException { .. } => None,
        }
    }
}

/// Scenario 실행을 멈춘 실패와 그 시점까지의 실행 보고서이다.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("시나리오 '{}' 실패: {cause}", .report.scenario)]
pub struct ScenarioFailure {
    /// 처음으로 계약을 어긴 Step의 실패 원인.
    pub cause: StepFailure,
    /// 실패 시점까지의 Step별 기록.
    pub report: RunReport,
}

fn format_kinds(kinds: &[ErrorKind]) -> String {
    if kinds.is_empty() {
        return "없음".to_string();
    }
    kinds
        .iter()
        .map(ErrorKind::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_errors_map_to_their_own_kinds() {
        let timeout = ActionError::PollTimeout {
            target: "active".into(),
            last_state: "building".into(),
            elapsed: Duration::from_secs(10),
        };
        assert_eq!(timeout.kind(), ErrorKind::PollTimeout);
        let terminal = ActionError::PollTerminalState {
            target: "active".into(),
            state: "error".into(),
        };
        assert_eq!(terminal.kind(), ErrorKind::PollTerminalState);
        assert!(ActionError::service(Service::Image, ErrorKind::NotFound, "gone").is_not_found());
    }

    #[test]
    fn expected_kinds_deserialize_from_snake_case() {
        let kinds: Vec<ErrorKind> =
            serde_yaml::from_str("[unauthorized, quota_exceeded, poll_timeout]")
                .expect("YAML 파싱 실패");
        assert_eq!(
            kinds,
            vec![
                ErrorKind::Unauthorized,
                ErrorKind::QuotaExceeded,
                ErrorKind::PollTimeout
            ]
        );
    }

    #[test]
    fn missing_expected_message_names_step_and_kinds() {
        let failure = StepFailure::MissingExpectedException {
            index: 2,
            action: "role_grant".into(),
            identity: "member".into(),
            expected: vec![ErrorKind::Forbidden],
        };
        let text = failure.to_string();
        assert!(text.contains("Step 2"));
        assert!(text.contains("forbidden"));
        assert!(failure.observed().is_none());
    }
}
