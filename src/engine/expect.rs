use crate::error::{ActionError, ErrorKind};
use std::collections::BTreeSet;

/// 한 Step 호출 결과를 기대 오류 목록에 비추어 판정한 값이다.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// 오류가 요구되지 않았고 정상 종료했다.
    Passed,
    /// 허용 목록에 있는 오류가 발생했다.
    ExpectedObserved(ActionError),
    /// 오류가 요구되었지만 정상 종료했다.
    MissingExpected,
    /// 허용 목록에 없는 오류가 발생했다.
    Unexpected(ActionError),
}

impl Verdict {
    /// Step 계약이 만족되었는지 여부이다.
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Verdict::Passed | Verdict::ExpectedObserved(_))
    }
}

/// 기대 오류 집합에 대해 액션 결과를 판정한다.
///
/// `expected`는 전체 허용 목록이다. 비어 있으면 반드시 성공해야 한다.
/// `MissingKey`는 Step 사이 의존 관계 버그이므로 목록에 있어도 허용하지 않는다.
pub fn evaluate(expected: &BTreeSet<ErrorKind>, outcome: Result<(), ActionError>) -> Verdict {
    match outcome {
        Ok(()) if expected.is_empty() => Verdict::Passed,
        Ok(()) => Verdict::MissingExpected,
        Err(err) if err.kind() == ErrorKind::MissingKey => Verdict::Unexpected(err),
        Err(err) if expected.contains(&err.kind()) => Verdict::ExpectedObserved(err),
        Err(err) => Verdict::Unexpected(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Service;

    fn kinds(list: &[ErrorKind]) -> BTreeSet<ErrorKind> {
        list.iter().copied().collect()
    }

    fn denied() -> ActionError {
        ActionError::service(Service::Identity, ErrorKind::Unauthorized, "denied")
    }

    #[test]
    fn normal_return_passes_only_without_expectations() {
        assert_eq!(evaluate(&kinds(&[]), Ok(())), Verdict::Passed);
        assert_eq!(
            evaluate(&kinds(&[ErrorKind::Unauthorized]), Ok(())),
            Verdict::MissingExpected
        );
    }

    #[test]
    fn listed_error_is_an_expected_observation() {
        let verdict = evaluate(
            &kinds(&[ErrorKind::Forbidden, ErrorKind::Unauthorized]),
            Err(denied()),
        );
        assert_eq!(verdict, Verdict::ExpectedObserved(denied()));
        assert!(verdict.is_satisfied());
    }

    #[test]
    fn unlisted_error_is_unexpected() {
        let verdict = evaluate(&kinds(&[ErrorKind::Forbidden]), Err(denied()));
        assert_eq!(verdict, Verdict::Unexpected(denied()));
        assert!(!verdict.is_satisfied());
        assert_eq!(evaluate(&kinds(&[]), Err(denied())), Verdict::Unexpected(denied()));
    }

    #[test]
    fn missing_key_is_never_expected() {
        let err = ActionError::missing_key("server_id");
        let verdict = evaluate(&kinds(&[ErrorKind::MissingKey]), Err(err.clone()));
        assert_eq!(verdict, Verdict::Unexpected(err));
    }

    #[test]
    fn poll_errors_can_be_declared_expected() {
        let err = ActionError::PollTerminalState {
            target: "active".into(),
            state: "error".into(),
        };
        let verdict = evaluate(&kinds(&[ErrorKind::PollTerminalState]), Err(err.clone()));
        assert_eq!(verdict, Verdict::ExpectedObserved(err));
    }
}
