use super::action::Identity;
use super::context::Context;
use super::events::EngineEvent;
use super::expect::{Verdict, evaluate};
use super::state::{RunReport, StepRecord, StepStatus};
use crate::error::{ScenarioFailure, StepFailure};
use crate::scenario::{ActionStep, Scenario};
use tokio::sync::mpsc::UnboundedSender;
use tokio::time::Instant;
use tracing::{info, warn};

/// Scenario의 Step을 순서대로 실행하고 Step별 기대 계약을 평가한다.
///
/// 첫 번째로 계약을 어긴 Step에서 실행을 멈추며 되돌리기는 하지 않는다.
/// 정리는 호출자가 컨텍스트의 생성 스택을 보고 수행한다.
pub async fn run_scenario<I: Identity>(
    scenario: &Scenario<I>,
    ctx: &mut Context,
    events: Option<&UnboundedSender<EngineEvent>>,
) -> Result<RunReport, ScenarioFailure> {
    let name = scenario.name().to_string();
    let mut records: Vec<StepRecord> = scenario
        .steps()
        .iter()
        .enumerate()
        .map(|(index, step)| StepRecord {
            index,
            action: step.action_name().to_string(),
            identity: step.identity().to_string(),
            status: StepStatus::Pending,
            elapsed: None,
        })
        .collect();

    for (index, step) in scenario.steps().iter().enumerate() {
        let identity = records[index].identity.clone();
        info!(scenario = %name, index, action = step.action_name(), %identity, "Step 시작");
        emit(
            events,
            EngineEvent::StepStarted {
                scenario: name.clone(),
                index,
                action: step.action_name().to_string(),
                identity: identity.clone(),
            },
        );
        let started = Instant::now();
        let verdict = evaluate(step.expected(), invoke(step, ctx).await);
        records[index].elapsed = Some(started.elapsed());

        match verdict {
            Verdict::Passed => {
                records[index].status = StepStatus::Passed;
                emit(events, finished(&name, index, true, None));
            }
            Verdict::ExpectedObserved(err) => {
                let kind = err.kind();
                info!(scenario = %name, index, %kind, "기대한 오류 관측: {err}");
                records[index].status = StepStatus::ExpectedError {
                    kind,
                    message: err.to_string(),
                };
                emit(
                    events,
                    EngineEvent::StepLog {
                        scenario: name.clone(),
                        index,
                        line: format!("expected exception observed: {err}"),
                    },
                );
                emit(events, finished(&name, index, true, Some(kind)));
                if step.halts_on_expected() {
                    for record in records.iter_mut().skip(index + 1) {
                        record.status = StepStatus::Skipped;
                    }
                    info!(scenario = %name, index, "기대한 오류로 시나리오 종료");
                    break;
                }
            }
            Verdict::MissingExpected => {
                let cause = StepFailure::MissingExpectedException {
                    index,
                    action: step.action_name().to_string(),
                    identity,
                    expected: step.expected().iter().copied().collect(),
                };
                return Err(fail(&name, records, cause, events));
            }
            Verdict::Unexpected(error) => {
                let cause = StepFailure::UnexpectedException {
                    index,
                    action: step.action_name().to_string(),
                    identity,
                    expected: step.expected().iter().copied().collect(),
                    error,
                };
                return Err(fail(&name, records, cause, events));
            }
        }
    }

    emit(
        events,
        EngineEvent::ScenarioFinished {
            scenario: name.clone(),
            success: true,
        },
    );
    Ok(RunReport::new(name, records))
}

/// 인자의 플레이스홀더를 치환한 뒤 액션을 호출한다.
async fn invoke<I: Identity>(
    step: &ActionStep<I>,
    ctx: &mut Context,
) -> Result<(), crate::error::ActionError> {
    let args = step.args().resolve(ctx)?;
    step.action().execute(step.identity(), ctx, &args).await
}

fn fail(
    name: &str,
    mut records: Vec<StepRecord>,
    cause: StepFailure,
    events: Option<&UnboundedSender<EngineEvent>>,
) -> ScenarioFailure {
    let index = cause.index();
    warn!(scenario = %name, index, "Step 실패: {cause}");
    records[index].status = StepStatus::Failed(cause.to_string());
    emit(
        events,
        EngineEvent::StepLog {
            scenario: name.to_string(),
            index,
            line: cause.to_string(),
        },
    );
    emit(events, finished(name, index, false, None));
    emit(
        events,
        EngineEvent::ScenarioFinished {
            scenario: name.to_string(),
            success: false,
        },
    );
    ScenarioFailure {
        cause,
        report: RunReport::new(name, records),
    }
}

fn finished(
    name: &str,
    index: usize,
    success: bool,
    expected_error: Option<crate::error::ErrorKind>,
) -> EngineEvent {
    EngineEvent::StepFinished {
        scenario: name.to_string(),
        index,
        success,
        expected_error,
    }
}

fn emit(events: Option<&UnboundedSender<EngineEvent>>, event: EngineEvent) {
    if let Some(sender) = events {
        let _ = sender.send(event);
    }
}
