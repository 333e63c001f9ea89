use super::cloud::{ResourceKind, Role, SimCloud, SimIdentity};
use crate::config::RunnerConfig;
use crate::engine::{
    Action, ActionArgs, BoundaryExt, Context, RateLimiter, SharedAction, StatusReader, Throttled,
    WaitForStatus, stack_record,
};
use crate::error::{ActionError, Service};
use crate::suite::ActionRegistry;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

/// 리소스 단위 작업 종류이다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verb {
    Create,
    Show,
    Update,
    Delete,
}

impl Verb {
    fn as_str(&self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Show => "show",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }
}

/// `key` 옵션이 있으면 그 값을, 없으면 리소스 종류의 기본 키를 쓴다.
fn context_key(kind: ResourceKind, args: &ActionArgs) -> Result<String, ActionError> {
    Ok(args
        .option_str("key")?
        .map(str::to_string)
        .unwrap_or_else(|| kind.context_key()))
}

/// `<kind>_<verb>` 이름의 리소스 액션이다.
///
/// 생성은 ID를 컨텍스트와 생성 스택에 기록하고, 나머지는 컨텍스트의 ID를 대상으로 한다.
/// 옵션: `key`(컨텍스트 키), `name`(생성/수정 이름).
pub struct ResourceAction {
    name: String,
    kind: ResourceKind,
    verb: Verb,
    cloud: Arc<SimCloud>,
}

impl ResourceAction {
    fn new(kind: ResourceKind, verb: Verb, cloud: Arc<SimCloud>) -> Self {
        Self {
            name: format!("{kind}_{}", verb.as_str()),
            kind,
            verb,
            cloud,
        }
    }

    fn service(&self) -> Service {
        self.kind.service()
    }
}

#[async_trait]
impl Action<SimIdentity> for ResourceAction {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        identity: &SimIdentity,
        ctx: &mut Context,
        args: &ActionArgs,
    ) -> Result<(), ActionError> {
        let key = context_key(self.kind, args)?;
        match self.verb {
            Verb::Create => {
                let name = args
                    .option_str("name")?
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("rbac-{}", self.kind));
                let id = self
                    .cloud
                    .create(identity, self.kind, &name)
                    .await
                    .at_boundary(self.service())?;
                info!(action = %self.name, %id, %identity, "리소스 생성 완료");
                ctx.set(key.as_str(), id.clone())?;
                ctx.append_to_stack(stack_record([(key, id)]));
            }
            Verb::Show => {
                let id = ctx.get_str(&key)?.to_string();
                let status = self
                    .cloud
                    .status(identity, self.kind, &id)
                    .await
                    .at_boundary(self.service())?;
                debug!(action = %self.name, %id, %status, "리소스 조회");
                ctx.set(format!("{}_status", self.kind), status)?;
            }
            Verb::Update => {
                let id = ctx.get_str(&key)?.to_string();
                let name = args
                    .option_str("name")?
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("rbac-{}-updated", self.kind));
                self.cloud
                    .update(identity, self.kind, &id, &name)
                    .await
                    .at_boundary(self.service())?;
            }
            Verb::Delete => {
                let id = ctx.get_str(&key)?.to_string();
                self.cloud
                    .delete(identity, self.kind, &id)
                    .await
                    .at_boundary(self.service())?;
                info!(action = %self.name, %id, %identity, "리소스 삭제 요청");
            }
        }
        Ok(())
    }
}

/// 컨텍스트에 기록된 리소스의 상태를 읽는 조회기이다.
struct ResourceStatus {
    kind: ResourceKind,
    cloud: Arc<SimCloud>,
}

#[async_trait]
impl StatusReader<SimIdentity> for ResourceStatus {
    async fn read_status(
        &self,
        identity: &SimIdentity,
        ctx: &mut Context,
        args: &ActionArgs,
    ) -> Result<String, ActionError> {
        let key = context_key(self.kind, args)?;
        let id = ctx.get_str(&key)?.to_string();
        self.cloud
            .status(identity, self.kind, &id)
            .await
            .at_boundary(self.kind.service())
    }
}

/// 프로젝트 역할 부여/회수 액션이다.
///
/// 옵션: `user`, `project`(필수), `domain`(기본값은 호출자 도메인), `role`(기본값 member).
pub struct RoleAction {
    name: &'static str,
    grant: bool,
    cloud: Arc<SimCloud>,
}

impl RoleAction {
    pub const GRANT: &'static str = "role_grant_user_project";
    pub const REVOKE: &'static str = "role_revoke_user_project";

    fn new(grant: bool, cloud: Arc<SimCloud>) -> Self {
        Self {
            name: if grant { Self::GRANT } else { Self::REVOKE },
            grant,
            cloud,
        }
    }
}

fn required_str<'a>(args: &'a ActionArgs, name: &str) -> Result<&'a str, ActionError> {
    args.option_str(name)?
        .ok_or_else(|| ActionError::invalid_argument(name, "값이 없습니다."))
}

fn role_option(args: &ActionArgs) -> Result<Role, ActionError> {
    match args.options.get("role") {
        None | Some(Value::Null) => Ok(Role::Member),
        Some(value) => serde_json::from_value(value.clone())
            .map_err(|err| ActionError::invalid_argument("role", err.to_string())),
    }
}

#[async_trait]
impl Action<SimIdentity> for RoleAction {
    fn name(&self) -> &str {
        self.name
    }

    async fn execute(
        &self,
        identity: &SimIdentity,
        _ctx: &mut Context,
        args: &ActionArgs,
    ) -> Result<(), ActionError> {
        let user = required_str(args, "user")?;
        let project = required_str(args, "project")?;
        let domain = args.option_str("domain")?.unwrap_or(&identity.domain);
        let role = role_option(args)?;
        let result = if self.grant {
            self.cloud
                .grant_role(identity, user, domain, project, role)
                .await
        } else {
            self.cloud
                .revoke_role(identity, user, domain, project, role)
                .await
        };
        result.at_boundary(Service::Identity)?;
        info!(action = self.name, %user, %project, %role, "역할 변경 완료");
        Ok(())
    }

    fn missing_field(&self, args: &ActionArgs) -> Option<&'static str> {
        ["user", "project"]
            .into_iter()
            .find(|name| !args.has_option(name))
    }
}

/// 시뮬레이터 액션을 모두 등록한다.
///
/// 리소스마다 `<kind>_create`, `_show`, `_update`, `_delete`, `_wait_for_status`를 만들고
/// 역할 부여/회수 액션을 더한다. 호출 제한이 켜져 있으면 상태 대기를 뺀 호출 액션을
/// 하나의 `RateLimiter` 뒤에 둔다.
pub fn register_sim_actions(
    registry: &mut ActionRegistry<SimIdentity>,
    cloud: Arc<SimCloud>,
    config: &RunnerConfig,
) {
    let limiter = config.throttle.enabled.then(|| {
        Arc::new(RateLimiter::new(
            config.throttle.spacing(),
            config.throttle.check_interval(),
        ))
    });
    let guard = |action: SharedAction<SimIdentity>| -> SharedAction<SimIdentity> {
        match &limiter {
            Some(limiter) => Arc::new(Throttled::new(action, limiter.clone())),
            None => action,
        }
    };

    for kind in ResourceKind::ALL {
        for verb in [Verb::Create, Verb::Show, Verb::Update, Verb::Delete] {
            registry.register(guard(Arc::new(ResourceAction::new(
                kind,
                verb,
                cloud.clone(),
            ))));
        }
        let reader = Arc::new(ResourceStatus {
            kind,
            cloud: cloud.clone(),
        });
        let wait = WaitForStatus::<SimIdentity>::new(format!("{kind}_wait_for_status"), reader)
            .default_target(kind.ready_status())
            .terminal_states(kind.terminal_states().iter().copied())
            .timing(
                config.poll.timeout(),
                config.poll.interval(),
                config.poll.initial_wait(),
            )
            .status_key(format!("{kind}_status"));
        registry.register(Arc::new(wait));
    }
    registry.register(guard(Arc::new(RoleAction::new(true, cloud.clone()))));
    registry.register(guard(Arc::new(RoleAction::new(false, cloud))));
}
