use crate::error::ErrorKind;

/// 엔진에서 관찰자(CLI 등)로 전달되는 진행 이벤트이다.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// Step 시작 알림.
    StepStarted {
        scenario: String,
        index: usize,
        action: String,
        identity: String,
    },
    /// Step별 로그 라인.
    StepLog {
        scenario: String,
        index: usize,
        line: String,
    },
    /// Step 종료 알림. 기대한 오류가 관측된 경우 `expected_error`에 분류가 담긴다.
    StepFinished {
        scenario: String,
        index: usize,
        success: bool,
        expected_error: Option<ErrorKind>,
    },
    /// 전체 시나리오 종료.
    ScenarioFinished { scenario: String, success: bool },
}
