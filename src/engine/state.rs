use crate::error::ErrorKind;
use std::fmt;
use std::time::Duration;

/// Step의 실행 결과 상태를 표현한다.
#[derive(Debug, Clone, PartialEq)]
pub enum StepStatus {
    /// 아직 실행되지 않았다.
    Pending,
    /// 오류 없이 정상 종료했다.
    Passed,
    /// 허용된 오류가 관측되어 통과로 처리했다.
    ExpectedError { kind: ErrorKind, message: String },
    /// 기대 계약을 지키지 못했다.
    Failed(String),
    /// 앞선 Step에서 시나리오가 의도적으로 끝나 실행하지 않았다.
    Skipped,
}

impl StepStatus {
    /// Step이 계약을 만족했는지 여부이다.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, StepStatus::Passed | StepStatus::ExpectedError { .. })
    }

    /// 액션이 실제로 호출되었는지 여부이다.
    pub fn was_executed(&self) -> bool {
        !matches!(self, StepStatus::Pending | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepStatus::Pending => f.write_str("pending"),
            StepStatus::Passed => f.write_str("passed"),
            StepStatus::ExpectedError { kind, .. } => {
                write!(f, "expected exception observed ({kind})")
            }
            StepStatus::Failed(msg) => write!(f, "failed: {msg}"),
            StepStatus::Skipped => f.write_str("skipped"),
        }
    }
}

/// 한 Step의 실행 기록이다.
#[derive(Debug, Clone, PartialEq)]
pub struct StepRecord {
    /// 시나리오 내 위치.
    pub index: usize,
    /// 액션 이름.
    pub action: String,
    /// 사용한 identity 표시 이름.
    pub identity: String,
    /// 결과 상태.
    pub status: StepStatus,
    /// 실행에 걸린 시간.
    pub elapsed: Option<Duration>,
}

/// Scenario 실행 결과 보고서이다.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// 시나리오 이름.
    pub scenario: String,
    /// Step별 기록.
    pub steps: Vec<StepRecord>,
}

impl RunReport {
    pub(crate) fn new(scenario: impl Into<String>, steps: Vec<StepRecord>) -> Self {
        Self {
            scenario: scenario.into(),
            steps,
        }
    }

    /// 지정한 Step의 상태를 반환한다.
    pub fn status(&self, index: usize) -> Option<&StepStatus> {
        self.steps.get(index).map(|record| &record.status)
    }

    /// 실제로 호출된 Step 수를 반환한다.
    pub fn executed_count(&self) -> usize {
        self.steps
            .iter()
            .filter(|record| record.status.was_executed())
            .count()
    }

    /// 실행된 모든 Step이 계약을 만족했는지 여부이다.
    pub fn is_success(&self) -> bool {
        self.steps
            .iter()
            .filter(|record| record.status.was_executed())
            .all(|record| record.status.is_satisfied())
    }
}
