use crate::engine::{Context, EngineEvent, Identity, RunReport, SharedAction, StackRecord};
use crate::error::{ErrorKind, FactoryError};
use crate::scenario::{Scenario, ScenarioFactory, StepOverride};
use anyhow::Context as _;
use futures::StreamExt;
use futures::stream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{info, warn};

/// YAML로 정의한 시험 스위트이다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuiteDefinition {
    /// 스위트 이름.
    pub name: String,
    /// 이름별 identity 정의. 구체 타입은 실행하는 쪽이 정한다.
    #[serde(default)]
    pub identities: BTreeMap<String, serde_yaml::Value>,
    /// 모든 케이스 컨텍스트의 초기값.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    /// 이름별 액션 순서.
    pub shapes: BTreeMap<String, Vec<String>>,
    /// 실행할 케이스 목록.
    pub cases: Vec<CaseDefinition>,
}

/// 형태 하나와 기본 identity, Step 설정을 묶은 테스트 케이스이다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseDefinition {
    pub name: String,
    pub shape: String,
    /// 기본 identity 이름.
    pub identity: String,
    /// 스위트 컨텍스트 위에 덧씌울 초기값.
    #[serde(default)]
    pub context: BTreeMap<String, Value>,
    #[serde(default)]
    pub steps: Vec<StepDefinition>,
}

/// 한 Step의 설정이다. 같은 인덱스가 여러 번 나오면 차례로 병합한다.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    pub index: usize,
    /// 적으면 해당 위치의 액션 이름과 일치해야 한다.
    #[serde(default)]
    pub action: Option<String>,
    #[serde(default)]
    pub identity: Option<String>,
    #[serde(default)]
    pub args: Option<Vec<Value>>,
    #[serde(default)]
    pub options: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub expect: Option<Vec<ErrorKind>>,
    #[serde(default)]
    pub halt_on_expected: bool,
}

/// 스위트 정의를 실행 가능한 시나리오로 바꾸는 중 발생한 오류이다.
#[derive(Debug, Error)]
pub enum SuiteError {
    #[error("케이스 '{case}': 알 수 없는 형태 '{shape}'")]
    UnknownShape { case: String, shape: String },
    #[error("형태 '{shape}': 등록되지 않은 액션 '{action}'")]
    UnknownAction { shape: String, action: String },
    #[error("케이스 '{case}': 알 수 없는 identity '{identity}'")]
    UnknownIdentity { case: String, identity: String },
    #[error("케이스 '{case}' Step {index}: 액션은 '{actual}'인데 '{expected}'로 적혀 있음")]
    StepMismatch {
        case: String,
        index: usize,
        expected: String,
        actual: String,
    },
    #[error("identity '{name}' 해석 실패: {reason}")]
    InvalidIdentity { name: String, reason: String },
    #[error("케이스 '{case}' 구성 실패: {source}")]
    Factory {
        case: String,
        #[source]
        source: FactoryError,
    },
}

impl SuiteDefinition {
    /// identity 정의를 구체 타입으로 역직렬화한다.
    pub fn identities_as<I: DeserializeOwned>(&self) -> Result<BTreeMap<String, I>, SuiteError> {
        self.identities
            .iter()
            .map(|(name, raw)| {
                serde_yaml::from_value(raw.clone())
                    .map(|identity| (name.clone(), identity))
                    .map_err(|err| SuiteError::InvalidIdentity {
                        name: name.clone(),
                        reason: err.to_string(),
                    })
            })
            .collect()
    }
}

/// YAML 파일을 읽어 SuiteDefinition으로 역직렬화한다.
pub fn load_suite_from_file(path: &Path) -> anyhow::Result<SuiteDefinition> {
    let mut file = File::open(path)
        .with_context(|| format!("스위트 파일을 열 수 없습니다: {}", path.display()))?;
    load_suite_from_reader(&mut file)
}

/// Reader에서 YAML을 읽어 SuiteDefinition으로 파싱한다.
pub fn load_suite_from_reader<R: Read>(reader: &mut R) -> anyhow::Result<SuiteDefinition> {
    let mut buf = String::new();
    reader.read_to_string(&mut buf)?;
    let suite: SuiteDefinition = serde_yaml::from_str(&buf).context("스위트 YAML 파싱 실패")?;
    Ok(suite)
}

/// 이름으로 액션을 찾는 등록부이다.
pub struct ActionRegistry<I: Identity> {
    actions: BTreeMap<String, SharedAction<I>>,
}

impl<I: Identity> Default for ActionRegistry<I> {
    fn default() -> Self {
        Self {
            actions: BTreeMap::new(),
        }
    }
}

impl<I: Identity> ActionRegistry<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// 액션 자신의 이름으로 등록한다. 같은 이름이 있으면 교체한다.
    pub fn register(&mut self, action: SharedAction<I>) {
        self.actions.insert(action.name().to_string(), action);
    }

    pub fn get(&self, name: &str) -> Option<SharedAction<I>> {
        self.actions.get(name).cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.actions.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// 액션 이름 목록을 실제 액션 순서로 바꾼다.
    pub fn resolve_shape(
        &self,
        shape: &str,
        names: &[String],
    ) -> Result<Vec<SharedAction<I>>, SuiteError> {
        names
            .iter()
            .map(|name| {
                self.get(name).ok_or_else(|| SuiteError::UnknownAction {
                    shape: shape.to_string(),
                    action: name.clone(),
                })
            })
            .collect()
    }
}

/// 케이스 정의로 시나리오를 만든다. 시나리오 이름은 케이스 이름이다.
pub fn build_case<I: Identity>(
    suite: &SuiteDefinition,
    case: &CaseDefinition,
    registry: &ActionRegistry<I>,
    identities: &BTreeMap<String, I>,
) -> Result<Scenario<I>, SuiteError> {
    let names = suite
        .shapes
        .get(&case.shape)
        .ok_or_else(|| SuiteError::UnknownShape {
            case: case.name.clone(),
            shape: case.shape.clone(),
        })?;
    let actions = registry.resolve_shape(&case.shape, names)?;
    let identity_named = |name: &str| {
        identities
            .get(name)
            .cloned()
            .ok_or_else(|| SuiteError::UnknownIdentity {
                case: case.name.clone(),
                identity: name.to_string(),
            })
    };
    let factory_error = |source: FactoryError| SuiteError::Factory {
        case: case.name.clone(),
        source,
    };

    let mut factory = ScenarioFactory::new(
        case.name.clone(),
        actions.clone(),
        identity_named(&case.identity)?,
    )
    .map_err(factory_error)?;
    for step in &case.steps {
        if let (Some(expected), Some(action)) = (&step.action, actions.get(step.index)) {
            if expected != action.name() {
                return Err(SuiteError::StepMismatch {
                    case: case.name.clone(),
                    index: step.index,
                    expected: expected.clone(),
                    actual: action.name().to_string(),
                });
            }
        }
        let mut over = StepOverride::new();
        if let Some(name) = &step.identity {
            over = over.identity(identity_named(name)?);
        }
        if let Some(args) = &step.args {
            over = over.args(args.iter().cloned());
        }
        if let Some(options) = &step.options {
            over = over.options(options.clone());
        }
        if let Some(kinds) = &step.expect {
            over = over.expect_only(kinds.iter().copied());
        }
        if step.halt_on_expected {
            over = over.halt_on_expected();
        }
        factory = factory.set(step.index, over).map_err(factory_error)?;
    }
    factory.produce().map_err(factory_error)
}

/// 스위트 실행 방식이다.
#[derive(Debug, Clone)]
pub struct SuiteOptions {
    /// 동시에 실행할 케이스 수(최소 1).
    pub max_parallel_cases: usize,
    /// 첫 실패 이후 아직 시작하지 않은 케이스를 실행하지 않는다.
    pub fail_fast: bool,
}

impl Default for SuiteOptions {
    fn default() -> Self {
        Self {
            max_parallel_cases: 1,
            fail_fast: false,
        }
    }
}

/// 케이스 하나의 최종 결과이다.
#[derive(Debug, Clone, PartialEq)]
pub enum CaseOutcome {
    Passed,
    /// 구성 실패이면 `step`이 없다.
    Failed { step: Option<usize>, detail: String },
    /// fail-fast로 실행하지 않았다.
    NotRun,
}

/// 케이스 실행 보고서이다.
#[derive(Debug, Clone)]
pub struct CaseReport {
    pub name: String,
    pub outcome: CaseOutcome,
    /// 실행했다면 Step별 기록.
    pub report: Option<RunReport>,
    /// 정리 대상 리소스 기록. 실패한 케이스도 남긴다.
    pub stack: Vec<StackRecord>,
    /// 실행이 끝난 시점의 컨텍스트 스냅샷.
    pub context: Option<Value>,
}

/// 스위트 실행 결과이다. 케이스는 정의 순서를 따른다.
#[derive(Debug, Clone)]
pub struct SuiteReport {
    pub suite: String,
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    pub fn passed(&self) -> usize {
        self.count(|outcome| matches!(outcome, CaseOutcome::Passed))
    }

    pub fn failed(&self) -> usize {
        self.count(|outcome| matches!(outcome, CaseOutcome::Failed { .. }))
    }

    pub fn not_run(&self) -> usize {
        self.count(|outcome| matches!(outcome, CaseOutcome::NotRun))
    }

    fn count(&self, pred: impl Fn(&CaseOutcome) -> bool) -> usize {
        self.cases.iter().filter(|case| pred(&case.outcome)).count()
    }

    /// 모든 케이스가 통과했는지 여부이다.
    pub fn is_success(&self) -> bool {
        self.cases
            .iter()
            .all(|case| case.outcome == CaseOutcome::Passed)
    }

    /// 사람이 읽는 요약 문자열을 만든다.
    pub fn render(&self) -> String {
        let mut out = format!("== {} ==\n", self.suite);
        for case in &self.cases {
            let _ = match &case.outcome {
                CaseOutcome::Passed => writeln!(out, "[PASS] {}", case.name),
                CaseOutcome::Failed {
                    step: Some(index),
                    detail,
                } => writeln!(out, "[FAIL] {} (step {index}): {detail}", case.name),
                CaseOutcome::Failed { step: None, detail } => {
                    writeln!(out, "[FAIL] {}: {detail}", case.name)
                }
                CaseOutcome::NotRun => writeln!(out, "[SKIP] {}", case.name),
            };
            if !case.stack.is_empty() && case.outcome != CaseOutcome::Passed {
                for record in &case.stack {
                    let fields: Vec<String> =
                        record.iter().map(|(k, v)| format!("{k}={v}")).collect();
                    let _ = writeln!(out, "       남은 리소스: {}", fields.join(", "));
                }
            }
            if let (CaseOutcome::Failed { .. }, Some(context)) = (&case.outcome, &case.context) {
                let _ = writeln!(out, "       컨텍스트: {context}");
            }
        }
        let _ = write!(
            out,
            "합계: {}개 중 {}개 통과, {}개 실패, {}개 미실행",
            self.cases.len(),
            self.passed(),
            self.failed(),
            self.not_run()
        );
        out
    }
}

/// 스위트의 모든 케이스를 실행한다.
///
/// 케이스마다 새 컨텍스트를 쓰며 최대 `max_parallel_cases`개를 동시에 실행한다.
pub async fn run_suite<I: Identity>(
    suite: &SuiteDefinition,
    registry: &ActionRegistry<I>,
    identities: &BTreeMap<String, I>,
    options: &SuiteOptions,
    events: Option<&UnboundedSender<EngineEvent>>,
) -> SuiteReport {
    let stop = AtomicBool::new(false);
    let stop = &stop;
    info!(suite = %suite.name, cases = suite.cases.len(), "스위트 시작");

    let mut results: Vec<(usize, CaseReport)> = stream::iter(suite.cases.iter().enumerate())
        .map(|(order, case)| async move {
            if options.fail_fast && stop.load(Ordering::SeqCst) {
                return (order, not_run(case));
            }
            let report = run_case(suite, case, registry, identities, events).await;
            if report.outcome != CaseOutcome::Passed {
                stop.store(true, Ordering::SeqCst);
            }
            (order, report)
        })
        .buffer_unordered(options.max_parallel_cases.max(1))
        .collect()
        .await;
    results.sort_by_key(|(order, _)| *order);

    let report = SuiteReport {
        suite: suite.name.clone(),
        cases: results.into_iter().map(|(_, case)| case).collect(),
    };
    info!(
        suite = %report.suite,
        passed = report.passed(),
        failed = report.failed(),
        "스위트 종료"
    );
    report
}

fn not_run(case: &CaseDefinition) -> CaseReport {
    CaseReport {
        name: case.name.clone(),
        outcome: CaseOutcome::NotRun,
        report: None,
        stack: Vec::new(),
        context: None,
    }
}

fn not_started(case: &CaseDefinition, detail: String) -> CaseReport {
    warn!(case = %case.name, "케이스 구성 실패: {detail}");
    CaseReport {
        name: case.name.clone(),
        outcome: CaseOutcome::Failed { step: None, detail },
        report: None,
        stack: Vec::new(),
        context: None,
    }
}

async fn run_case<I: Identity>(
    suite: &SuiteDefinition,
    case: &CaseDefinition,
    registry: &ActionRegistry<I>,
    identities: &BTreeMap<String, I>,
    events: Option<&UnboundedSender<EngineEvent>>,
) -> CaseReport {
    let scenario = match build_case(suite, case, registry, identities) {
        Ok(scenario) => scenario,
        Err(err) => return not_started(case, err.to_string()),
    };
    let seed = suite
        .context
        .iter()
        .chain(case.context.iter())
        .map(|(key, value)| (key.clone(), value.clone()));
    let mut ctx = match Context::with_vars(seed) {
        Ok(ctx) => ctx,
        Err(err) => return not_started(case, format!("초기 컨텍스트 오류: {err}")),
    };

    let result = match events {
        Some(sender) => scenario.run_observed(&mut ctx, sender).await,
        None => scenario.run(&mut ctx).await,
    };
    let (outcome, report) = match result {
        Ok(report) => (CaseOutcome::Passed, report),
        Err(failure) => (
            CaseOutcome::Failed {
                step: Some(failure.cause.index()),
                detail: failure.cause.to_string(),
            },
            failure.report,
        ),
    };
    CaseReport {
        name: case.name.clone(),
        outcome,
        report: Some(report),
        stack: ctx.stack().to_vec(),
        context: Some(ctx.snapshot()),
    }
}
