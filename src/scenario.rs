use crate::engine::{
    ActionArgs, Context, EngineEvent, Identity, RunReport, SharedAction, run_scenario,
};
use crate::error::{ErrorKind, FactoryError, ScenarioFailure};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;

/// 시나리오 한 위치에 묶인 실행 단위이다.
#[derive(Clone)]
pub struct ActionStep<I: Identity> {
    /// 호출할 액션.
    action: SharedAction<I>,
    /// 액션을 수행할 identity.
    identity: I,
    /// 위치/옵션 인자.
    args: ActionArgs,
    /// 허용되는 오류 분류 목록. 비어 있으면 반드시 성공해야 한다.
    expected: BTreeSet<ErrorKind>,
    /// 기대 오류가 관측되면 시나리오를 성공으로 끝낼지 여부.
    halt_on_expected: bool,
}

impl<I: Identity> ActionStep<I> {
    pub fn action(&self) -> &SharedAction<I> {
        &self.action
    }

    pub fn action_name(&self) -> &str {
        self.action.name()
    }

    pub fn identity(&self) -> &I {
        &self.identity
    }

    pub fn args(&self) -> &ActionArgs {
        &self.args
    }

    pub fn expected(&self) -> &BTreeSet<ErrorKind> {
        &self.expected
    }

    pub fn halts_on_expected(&self) -> bool {
        self.halt_on_expected
    }
}

impl<I: Identity> fmt::Debug for ActionStep<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionStep")
            .field("action", &self.action.name())
            .field("identity", &self.identity.to_string())
            .field("args", &self.args)
            .field("expected", &self.expected)
            .field("halt_on_expected", &self.halt_on_expected)
            .finish()
    }
}

/// 특정 Step의 기본값을 덮어쓰는 설정이다.
///
/// 지정하지 않은 필드는 이전 설정 또는 팩토리 기본값을 유지한다.
#[derive(Debug, Clone)]
pub struct StepOverride<I> {
    identity: Option<I>,
    positional: Option<Vec<Value>>,
    options: Option<BTreeMap<String, Value>>,
    expected: Option<BTreeSet<ErrorKind>>,
    halt_on_expected: Option<bool>,
}

impl<I> Default for StepOverride<I> {
    fn default() -> Self {
        Self {
            identity: None,
            positional: None,
            options: None,
            expected: None,
            halt_on_expected: None,
        }
    }
}

impl<I> StepOverride<I> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Step을 수행할 identity를 지정한다.
    pub fn identity(mut self, identity: I) -> Self {
        self.identity = Some(identity);
        self
    }

    /// 위치 인자 목록을 통째로 지정한다.
    pub fn args<V: Into<Value>>(mut self, args: impl IntoIterator<Item = V>) -> Self {
        self.positional = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// 옵션 인자 하나를 추가한다.
    pub fn option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options
            .get_or_insert_with(BTreeMap::new)
            .insert(name.into(), value.into());
        self
    }

    /// 옵션 인자 맵을 통째로 지정한다.
    pub fn options(mut self, options: BTreeMap<String, Value>) -> Self {
        self.options = Some(options);
        self
    }

    /// 허용할 오류 분류를 추가한다.
    pub fn expect(mut self, kind: ErrorKind) -> Self {
        self.expected
            .get_or_insert_with(BTreeSet::new)
            .insert(kind);
        self
    }

    /// 허용할 오류 분류 목록을 통째로 지정한다. 빈 목록은 "반드시 성공"을 뜻한다.
    pub fn expect_only(mut self, kinds: impl IntoIterator<Item = ErrorKind>) -> Self {
        self.expected = Some(kinds.into_iter().collect());
        self
    }

    /// 기대 오류가 관측되면 남은 Step을 건너뛰고 시나리오를 성공으로 끝낸다.
    pub fn halt_on_expected(mut self) -> Self {
        self.halt_on_expected = Some(true);
        self
    }

    /// 나중 설정에서 지정된 필드가 이전 값을 대체한다.
    fn merge(&mut self, later: StepOverride<I>) {
        if later.identity.is_some() {
            self.identity = later.identity;
        }
        if later.positional.is_some() {
            self.positional = later.positional;
        }
        if later.options.is_some() {
            self.options = later.options;
        }
        if later.expected.is_some() {
            self.expected = later.expected;
        }
        if later.halt_on_expected.is_some() {
            self.halt_on_expected = later.halt_on_expected;
        }
    }
}

/// 이름을 가진 고정 액션 순서이다. 어떤 워크플로를 시험하는지를 정의한다.
#[derive(Clone)]
pub struct ScenarioShape<I: Identity> {
    name: String,
    actions: Vec<SharedAction<I>>,
}

impl<I: Identity> ScenarioShape<I> {
    pub fn new(name: impl Into<String>, actions: Vec<SharedAction<I>>) -> Self {
        Self {
            name: name.into(),
            actions,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// 이 순서와 기본 identity로 팩토리를 만든다.
    pub fn factory(&self, default_identity: I) -> Result<ScenarioFactory<I>, FactoryError> {
        ScenarioFactory::new(self.name.clone(), self.actions.clone(), default_identity)
    }
}

/// 고정 액션 순서에 Step별 설정을 덧입혀 Scenario를 만드는 빌더이다.
///
/// `set`은 팩토리를 소비하고 돌려주므로 체인으로 구성한다.
/// `produce`는 팩토리를 빌리기만 하므로 같은 구성으로 여러 Scenario를 만들 수 있다.
#[derive(Clone)]
pub struct ScenarioFactory<I: Identity> {
    name: String,
    actions: Vec<SharedAction<I>>,
    default_identity: I,
    overrides: BTreeMap<usize, StepOverride<I>>,
}

impl<I: Identity> ScenarioFactory<I> {
    /// 액션 순서와 기본 identity로 팩토리를 생성한다.
    pub fn new(
        name: impl Into<String>,
        actions: Vec<SharedAction<I>>,
        default_identity: I,
    ) -> Result<Self, FactoryError> {
        if actions.is_empty() {
            return Err(FactoryError::EmptyShape);
        }
        Ok(Self {
            name: name.into(),
            actions,
            default_identity,
            overrides: BTreeMap::new(),
        })
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// `index` Step의 설정을 덮어쓴다. 같은 인덱스에 다시 호출하면 필드 단위로 병합한다.
    pub fn set(mut self, index: usize, step: StepOverride<I>) -> Result<Self, FactoryError> {
        if index >= self.actions.len() {
            return Err(FactoryError::IndexOutOfRange {
                index,
                len: self.actions.len(),
            });
        }
        self.overrides.entry(index).or_default().merge(step);
        Ok(self)
    }

    /// 모든 Step의 설정을 확정해 변경할 수 없는 Scenario를 만든다.
    pub fn produce(&self) -> Result<Scenario<I>, FactoryError> {
        let mut steps = Vec::with_capacity(self.actions.len());
        for (index, action) in self.actions.iter().enumerate() {
            let step = match self.overrides.get(&index) {
                Some(over) => ActionStep {
                    action: action.clone(),
                    identity: over
                        .identity
                        .clone()
                        .unwrap_or_else(|| self.default_identity.clone()),
                    args: ActionArgs {
                        positional: over.positional.clone().unwrap_or_default(),
                        options: over.options.clone().unwrap_or_default(),
                    },
                    expected: over.expected.clone().unwrap_or_default(),
                    halt_on_expected: over.halt_on_expected.unwrap_or(false),
                },
                None => ActionStep {
                    action: action.clone(),
                    identity: self.default_identity.clone(),
                    args: ActionArgs::default(),
                    expected: BTreeSet::new(),
                    halt_on_expected: false,
                },
            };
            if let Some(field) = action.missing_field(&step.args) {
                return Err(FactoryError::IncompleteConfiguration {
                    index,
                    action: action.name().to_string(),
                    field: field.to_string(),
                });
            }
            steps.push(step);
        }
        Ok(Scenario {
            name: self.name.clone(),
            steps,
        })
    }
}

impl<I: Identity> fmt::Debug for ScenarioFactory<I> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let actions: Vec<&str> = self.actions.iter().map(|a| a.name()).collect();
        f.debug_struct("ScenarioFactory")
            .field("name", &self.name)
            .field("actions", &actions)
            .field("default_identity", &self.default_identity.to_string())
            .field("overridden", &self.overrides.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// 확정된 Step 순서이다. 생성 후에는 변경되지 않는다.
#[derive(Debug, Clone)]
pub struct Scenario<I: Identity> {
    name: String,
    steps: Vec<ActionStep<I>>,
}

impl<I: Identity> Scenario<I> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[ActionStep<I>] {
        &self.steps
    }

    pub fn step(&self, index: usize) -> Option<&ActionStep<I>> {
        self.steps.get(index)
    }

    /// 전체 Step 수를 반환한다.
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Step 수가 비었는지 여부를 확인한다.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// 컨텍스트에 대해 Step을 순서대로 실행한다.
    ///
    /// 원격 상태를 바꾸므로 한 컨텍스트에 대해 한 번만 의미가 있다.
    pub async fn run(&self, ctx: &mut Context) -> Result<RunReport, ScenarioFailure> {
        run_scenario(self, ctx, None).await
    }

    /// 실행하면서 진행 이벤트를 `events`로 보낸다.
    pub async fn run_observed(
        &self,
        ctx: &mut Context,
        events: &UnboundedSender<EngineEvent>,
    ) -> Result<RunReport, ScenarioFailure> {
        run_scenario(self, ctx, Some(events)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Action, StepStatus, WaitForStatus};
    use crate::error::{ActionError, Service, StepFailure};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    /// 호출 기록을 남기고 미리 정한 결과를 돌려주는 목업 액션이다.
    struct RecordingAction {
        name: &'static str,
        fails_with: Option<ErrorKind>,
        writes: Option<(&'static str, &'static str)>,
        calls: Arc<Mutex<Vec<(&'static str, String, ActionArgs)>>>,
    }

    #[async_trait]
    impl Action<&'static str> for RecordingAction {
        fn name(&self) -> &str {
            self.name
        }

        async fn execute(
            &self,
            identity: &&'static str,
            ctx: &mut Context,
            args: &ActionArgs,
        ) -> Result<(), ActionError> {
            self.calls
                .lock()
                .await
                .push((self.name, identity.to_string(), args.clone()));
            if let Some((key, value)) = self.writes {
                ctx.set(key, value)?;
            }
            match self.fails_with {
                Some(kind) => Err(ActionError::service(Service::Identity, kind, "rejected")),
                None => Ok(()),
            }
        }
    }

    type Calls = Arc<Mutex<Vec<(&'static str, String, ActionArgs)>>>;

    fn action(
        calls: &Calls,
        name: &'static str,
        fails_with: Option<ErrorKind>,
    ) -> SharedAction<&'static str> {
        Arc::new(RecordingAction {
            name,
            fails_with,
            writes: None,
            calls: calls.clone(),
        })
    }

    fn role_shape(calls: &Calls) -> ScenarioShape<&'static str> {
        ScenarioShape::new(
            "role_grant",
            vec![
                action(calls, "create", None),
                action(calls, "grant_role", Some(ErrorKind::Unauthorized)),
                action(calls, "revoke_role", None),
            ],
        )
    }

    async fn called(calls: &Calls) -> Vec<&'static str> {
        calls.lock().await.iter().map(|(name, _, _)| *name).collect()
    }

    #[test]
    fn empty_shape_is_rejected() {
        let err = ScenarioFactory::<&'static str>::new("empty", Vec::new(), "admin").unwrap_err();
        assert_eq!(err, FactoryError::EmptyShape);
    }

    #[test]
    fn set_rejects_out_of_range_index() {
        let calls = Calls::default();
        let err = role_shape(&calls)
            .factory("admin")
            .unwrap()
            .set(3, StepOverride::new().identity("member"))
            .err()
            .unwrap();
        assert_eq!(err, FactoryError::IndexOutOfRange { index: 3, len: 3 });
    }

    #[test]
    fn produce_falls_back_to_factory_defaults() {
        let calls = Calls::default();
        let scenario = role_shape(&calls)
            .factory("admin")
            .unwrap()
            .set(1, StepOverride::new().identity("member"))
            .unwrap()
            .produce()
            .unwrap();
        assert_eq!(scenario.len(), 3);
        assert_eq!(*scenario.step(0).unwrap().identity(), "admin");
        assert_eq!(*scenario.step(1).unwrap().identity(), "member");
        assert!(scenario.step(2).unwrap().expected().is_empty());
        assert_eq!(scenario.step(2).unwrap().args(), &ActionArgs::default());
    }

    #[test]
    fn repeated_set_merges_fields() {
        let calls = Calls::default();
        let scenario = role_shape(&calls)
            .factory("admin")
            .unwrap()
            .set(1, StepOverride::new().identity("member"))
            .unwrap()
            .set(1, StepOverride::new().args(["role-x"]))
            .unwrap()
            .produce()
            .unwrap();
        let step = scenario.step(1).unwrap();
        assert_eq!(*step.identity(), "member");
        assert_eq!(step.args().positional, vec![json!("role-x")]);
    }

    #[test]
    fn identical_set_twice_is_idempotent() {
        let calls = Calls::default();
        let over = || {
            StepOverride::new()
                .identity("member")
                .args(["x"])
                .option("domain", "Default")
                .expect(ErrorKind::Forbidden)
        };
        let factory = role_shape(&calls).factory("admin").unwrap();
        let once = factory.clone().set(1, over()).unwrap().produce().unwrap();
        let twice = factory
            .set(1, over())
            .unwrap()
            .set(1, over())
            .unwrap()
            .produce()
            .unwrap();
        for (a, b) in once.steps().iter().zip(twice.steps()) {
            assert!(Arc::ptr_eq(a.action(), b.action()));
            assert_eq!(a.identity(), b.identity());
            assert_eq!(a.args(), b.args());
            assert_eq!(a.expected(), b.expected());
            assert_eq!(a.halts_on_expected(), b.halts_on_expected());
        }
    }

    #[test]
    fn factory_is_reusable_after_produce() {
        let calls = Calls::default();
        let factory = role_shape(&calls)
            .factory("admin")
            .unwrap()
            .set(0, StepOverride::new().identity("creator"))
            .unwrap();
        let first = factory.produce().unwrap();
        let second = factory
            .set(2, StepOverride::new().identity("member"))
            .unwrap()
            .produce()
            .unwrap();
        assert_eq!(*first.step(2).unwrap().identity(), "admin");
        assert_eq!(*second.step(2).unwrap().identity(), "member");
        assert_eq!(*second.step(0).unwrap().identity(), "creator");
    }

    #[tokio::test]
    async fn all_successful_steps_complete() {
        let calls = Calls::default();
        let shape = ScenarioShape::new(
            "plain",
            vec![action(&calls, "create", None), action(&calls, "show", None)],
        );
        let scenario = shape.factory("admin").unwrap().produce().unwrap();

        let report = scenario.run(&mut Context::new()).await.unwrap();

        assert!(report.is_success());
        assert_eq!(report.executed_count(), 2);
        assert_eq!(called(&calls).await, vec!["create", "show"]);
    }

    #[tokio::test]
    async fn expected_error_passes_and_run_continues() {
        let calls = Calls::default();
        let scenario = role_shape(&calls)
            .factory("admin")
            .unwrap()
            .set(1, StepOverride::new().expect(ErrorKind::Unauthorized))
            .unwrap()
            .produce()
            .unwrap();

        let report = scenario.run(&mut Context::new()).await.unwrap();

        assert!(matches!(
            report.status(1),
            Some(StepStatus::ExpectedError {
                kind: ErrorKind::Unauthorized,
                ..
            })
        ));
        assert_eq!(report.status(2), Some(&StepStatus::Passed));
        assert_eq!(called(&calls).await, vec!["create", "grant_role", "revoke_role"]);
    }

    #[tokio::test]
    async fn expected_error_can_end_the_scenario() {
        let calls = Calls::default();
        let scenario = role_shape(&calls)
            .factory("admin")
            .unwrap()
            .set(
                1,
                StepOverride::new()
                    .expect(ErrorKind::Unauthorized)
                    .halt_on_expected(),
            )
            .unwrap()
            .produce()
            .unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

        let report = scenario
            .run_observed(&mut Context::new(), &tx)
            .await
            .unwrap();

        assert!(report.is_success());
        assert_eq!(report.status(0), Some(&StepStatus::Passed));
        assert!(matches!(
            report.status(1),
            Some(StepStatus::ExpectedError { .. })
        ));
        assert_eq!(report.status(2), Some(&StepStatus::Skipped));
        assert_eq!(called(&calls).await, vec!["create", "grant_role"]);

        drop(tx);
        let mut flagged = None;
        let mut finished_ok = false;
        while let Some(event) = rx.recv().await {
            match event {
                EngineEvent::StepFinished {
                    index,
                    expected_error: Some(kind),
                    ..
                } => flagged = Some((index, kind)),
                EngineEvent::ScenarioFinished { success, .. } => finished_ok = success,
                _ => {}
            }
        }
        assert_eq!(flagged, Some((1, ErrorKind::Unauthorized)));
        assert!(finished_ok);
    }

    #[tokio::test]
    async fn normal_return_where_error_demanded_fails_and_stops() {
        let calls = Calls::default();
        let scenario = role_shape(&calls)
            .factory("admin")
            .unwrap()
            .set(0, StepOverride::new().identity("member").expect(ErrorKind::Forbidden))
            .unwrap()
            .produce()
            .unwrap();

        let failure = scenario.run(&mut Context::new()).await.unwrap_err();

        assert_eq!(
            failure.cause,
            StepFailure::MissingExpectedException {
                index: 0,
                action: "create".into(),
                identity: "member".into(),
                expected: vec![ErrorKind::Forbidden],
            }
        );
        assert!(matches!(failure.report.status(0), Some(StepStatus::Failed(_))));
        assert_eq!(failure.report.status(1), Some(&StepStatus::Pending));
        assert_eq!(called(&calls).await, vec!["create"]);
    }

    #[tokio::test]
    async fn unexpected_error_reports_step_identity_and_error() {
        let calls = Calls::default();
        let scenario = role_shape(&calls)
            .factory("bu-admin")
            .unwrap()
            .set(1, StepOverride::new().expect(ErrorKind::Forbidden))
            .unwrap()
            .produce()
            .unwrap();

        let failure = scenario.run(&mut Context::new()).await.unwrap_err();

        match &failure.cause {
            StepFailure::UnexpectedException {
                index,
                identity,
                error,
                ..
            } => {
                assert_eq!(*index, 1);
                assert_eq!(identity, "bu-admin");
                assert_eq!(error.kind(), ErrorKind::Unauthorized);
            }
            other => panic!("예상하지 못한 실패: {other:?}"),
        }
        assert_eq!(called(&calls).await, vec!["create", "grant_role"]);
    }

    #[tokio::test]
    async fn later_steps_see_context_written_by_earlier_steps() {
        let calls = Calls::default();
        let create: SharedAction<&'static str> = Arc::new(RecordingAction {
            name: "server_create",
            fails_with: None,
            writes: Some(("server_id", "s-1")),
            calls: calls.clone(),
        });
        let scenario = ScenarioFactory::new(
            "context",
            vec![create, action(&calls, "server_show", None)],
            "admin",
        )
        .unwrap()
        .set(1, StepOverride::new().option("server", "${server_id}"))
        .unwrap()
        .produce()
        .unwrap();

        scenario.run(&mut Context::new()).await.unwrap();

        let recorded = calls.lock().await;
        assert_eq!(recorded[1].2.options["server"], json!("s-1"));
    }

    #[tokio::test]
    async fn missing_context_key_is_an_unexpected_failure() {
        let calls = Calls::default();
        let scenario = ScenarioFactory::new("missing", vec![action(&calls, "show", None)], "admin")
            .unwrap()
            .set(
                0,
                StepOverride::new()
                    .option("server", "${server_id}")
                    .expect(ErrorKind::MissingKey),
            )
            .unwrap()
            .produce()
            .unwrap();

        let failure = scenario.run(&mut Context::new()).await.unwrap_err();

        assert_eq!(
            failure.cause.observed(),
            Some(&ActionError::missing_key("server_id"))
        );
        assert!(called(&calls).await.is_empty());
    }

    struct NeverRead;

    #[async_trait]
    impl crate::engine::StatusReader<&'static str> for NeverRead {
        async fn read_status(
            &self,
            _identity: &&'static str,
            _ctx: &mut Context,
            _args: &ActionArgs,
        ) -> Result<String, ActionError> {
            Ok("active".into())
        }
    }

    #[test]
    fn polling_step_without_target_is_incomplete() {
        let wait: SharedAction<&'static str> =
            Arc::new(WaitForStatus::<&'static str>::new("image_wait", Arc::new(NeverRead)));
        let factory = ScenarioFactory::new("wait", vec![wait], "admin").unwrap();
        assert_eq!(
            factory.produce().unwrap_err(),
            FactoryError::IncompleteConfiguration {
                index: 0,
                action: "image_wait".into(),
                field: "target_status".into(),
            }
        );
        let null_target = factory
            .clone()
            .set(0, StepOverride::new().option("target_status", json!(null)))
            .unwrap();
        assert!(matches!(
            null_target.produce(),
            Err(FactoryError::IncompleteConfiguration { index: 0, .. })
        ));
        let scenario = factory
            .set(0, StepOverride::new().option("target_status", "active"))
            .unwrap()
            .produce();
        assert!(scenario.is_ok());
    }

    #[test]
    fn factory_debug_names_actions_and_overrides() {
        let calls = Calls::default();
        let factory = role_shape(&calls)
            .factory("admin")
            .unwrap()
            .set(1, StepOverride::new().identity("member"))
            .unwrap();
        let text = format!("{factory:?}");
        assert!(text.contains("grant_role"));
        assert!(text.contains("overridden: [1]"));
    }
}
