use crate::engine::HttpFailure;
use crate::error::Service;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use tokio::sync::Mutex;
use tracing::debug;

/// 시뮬레이터가 인식하는 역할이다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// 모든 도메인의 모든 리소스를 다룰 수 있다.
    CloudAdmin,
    /// 자기 도메인 안의 리소스와 역할을 다룰 수 있다.
    BuAdmin,
    /// 자기 프로젝트(또는 역할을 부여받은 프로젝트)의 리소스만 다룰 수 있다.
    #[serde(alias = "_member_")]
    Member,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::CloudAdmin => "cloud-admin",
            Role::BuAdmin => "bu-admin",
            Role::Member => "member",
        };
        f.write_str(name)
    }
}

/// 시뮬레이터 사용자 자격 증명이다.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SimIdentity {
    pub user: String,
    pub domain: String,
    pub project: String,
    pub role: Role,
}

impl SimIdentity {
    pub fn new(
        user: impl Into<String>,
        domain: impl Into<String>,
        project: impl Into<String>,
        role: Role,
    ) -> Self {
        Self {
            user: user.into(),
            domain: domain.into(),
            project: project.into(),
            role,
        }
    }
}

impl fmt::Display for SimIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}/{} ({})",
            self.user, self.domain, self.project, self.role
        )
    }
}

/// 시뮬레이터 리소스 종류이다.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Network,
    Subnet,
    Port,
    Server,
    Volume,
    Image,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 6] = [
        ResourceKind::Network,
        ResourceKind::Subnet,
        ResourceKind::Port,
        ResourceKind::Server,
        ResourceKind::Volume,
        ResourceKind::Image,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Network => "network",
            ResourceKind::Subnet => "subnet",
            ResourceKind::Port => "port",
            ResourceKind::Server => "server",
            ResourceKind::Volume => "volume",
            ResourceKind::Image => "image",
        }
    }

    /// 리소스를 소유한 서비스이다.
    pub fn service(&self) -> Service {
        match self {
            ResourceKind::Network | ResourceKind::Subnet | ResourceKind::Port => Service::Network,
            ResourceKind::Server => Service::Compute,
            ResourceKind::Volume => Service::BlockStorage,
            ResourceKind::Image => Service::Image,
        }
    }

    /// 생성된 ID를 기록하는 기본 컨텍스트 키이다.
    pub fn context_key(&self) -> String {
        format!("{}_id", self.as_str())
    }

    /// 생성 직후부터 읽을 때마다 차례로 보이는 상태 목록이다. 마지막 값에서 멈춘다.
    fn lifecycle(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Network | ResourceKind::Subnet | ResourceKind::Port => &["active"],
            ResourceKind::Server => &["build", "build", "active"],
            ResourceKind::Volume => &["creating", "available"],
            ResourceKind::Image => &["queued", "saving", "active"],
        }
    }

    /// 생성이 끝났을 때의 상태이다.
    pub fn ready_status(&self) -> &'static str {
        self.lifecycle().last().copied().unwrap_or("active")
    }

    /// 도달하면 준비 상태로 갈 수 없는 상태 목록이다.
    pub fn terminal_states(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::Network | ResourceKind::Subnet | ResourceKind::Port => &["error"],
            ResourceKind::Server => &["active", "error", "deleted"],
            ResourceKind::Volume => &["available", "error", "error_deleting", "deleted"],
            ResourceKind::Image => &["active", "killed", "deleted"],
        }
    }

    /// 삭제 요청 후 사라지기 전까지 "deleting"으로 보이는 조회 횟수이다.
    fn deleting_reads(&self) -> u32 {
        match self {
            ResourceKind::Server | ResourceKind::Volume | ResourceKind::Image => 1,
            _ => 0,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 시뮬레이터 API가 돌려주는 HTTP 형태의 오류이다.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("HTTP {status}: {message}")]
pub struct SimError {
    pub status: u16,
    pub message: String,
}

impl SimError {
    fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }
}

impl HttpFailure for SimError {
    fn http_status(&self) -> Option<u16> {
        Some(self.status)
    }

    fn detail(&self) -> String {
        self.message.clone()
    }
}

/// 권한 검사 대상 작업이다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Create,
    Read,
    Update,
    Delete,
    ManageRoles,
}

/// 저장된 리소스 한 건이다.
#[derive(Debug, Clone)]
struct Resource {
    kind: ResourceKind,
    name: String,
    domain: String,
    project: String,
    status: String,
    upcoming: VecDeque<&'static str>,
    deleting_reads_left: Option<u32>,
}

/// 프로젝트 역할 부여 기록이다.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct Grant {
    user: String,
    domain: String,
    project: String,
    role: Role,
}

#[derive(Debug, Default)]
struct CloudState {
    next_id: u64,
    resources: BTreeMap<String, Resource>,
    grants: BTreeSet<Grant>,
    quotas: BTreeMap<ResourceKind, usize>,
}

impl CloudState {
    /// RBAC 정책: 도메인 밖 접근은 401, 프로젝트 밖 접근과 멤버의 역할 관리는 403이다.
    fn authorize(
        &self,
        who: &SimIdentity,
        op: Operation,
        domain: &str,
        project: &str,
    ) -> Result<(), SimError> {
        match who.role {
            Role::CloudAdmin => Ok(()),
            Role::BuAdmin if who.domain == domain => Ok(()),
            Role::BuAdmin => Err(SimError::new(
                401,
                format!("{} cannot act in domain {domain}", who.user),
            )),
            Role::Member if who.domain != domain => Err(SimError::new(
                401,
                format!("{} cannot act in domain {domain}", who.user),
            )),
            Role::Member if op == Operation::ManageRoles => Err(SimError::new(
                403,
                format!("{} may not manage roles", who.user),
            )),
            Role::Member if who.project == project || self.has_grant(who, domain, project) => {
                Ok(())
            }
            Role::Member => Err(SimError::new(
                403,
                format!("{} has no role on project {project}", who.user),
            )),
        }
    }

    fn has_grant(&self, who: &SimIdentity, domain: &str, project: &str) -> bool {
        self.grants
            .iter()
            .any(|g| g.user == who.user && g.domain == domain && g.project == project)
    }

    fn resource(&self, kind: ResourceKind, id: &str) -> Result<&Resource, SimError> {
        self.resources
            .get(id)
            .filter(|r| r.kind == kind)
            .ok_or_else(|| SimError::new(404, format!("{kind} {id} not found")))
    }
}

/// 메모리 안에서 동작하는 제어 평면 시뮬레이터이다.
///
/// 리소스 상태는 조회할 때마다 한 단계씩 진행하고, 삭제는 비동기로 끝난다.
#[derive(Debug, Default)]
pub struct SimCloud {
    state: Mutex<CloudState>,
}

impl SimCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// 리소스 종류별 프로젝트 생성 한도를 둔 시뮬레이터를 만든다.
    pub fn with_quotas(quotas: impl IntoIterator<Item = (ResourceKind, usize)>) -> Self {
        Self {
            state: Mutex::new(CloudState {
                quotas: quotas.into_iter().collect(),
                ..CloudState::default()
            }),
        }
    }

    /// 호출자의 도메인/프로젝트 소유로 리소스를 생성하고 ID를 반환한다.
    pub async fn create(
        &self,
        who: &SimIdentity,
        kind: ResourceKind,
        name: &str,
    ) -> Result<String, SimError> {
        let mut state = self.state.lock().await;
        state.authorize(who, Operation::Create, &who.domain, &who.project)?;
        if let Some(limit) = state.quotas.get(&kind).copied() {
            let used = state
                .resources
                .values()
                .filter(|r| r.kind == kind && r.project == who.project)
                .count();
            if used >= limit {
                return Err(SimError::new(
                    413,
                    format!("{kind} quota of {limit} exceeded for project {}", who.project),
                ));
            }
        }
        state.next_id += 1;
        let id = format!("{kind}-{:04}", state.next_id);
        let mut upcoming: VecDeque<&'static str> = kind.lifecycle().iter().copied().collect();
        let status = upcoming.pop_front().unwrap_or("active").to_string();
        debug!(%id, user = %who.user, "리소스 생성");
        state.resources.insert(
            id.clone(),
            Resource {
                kind,
                name: name.to_string(),
                domain: who.domain.clone(),
                project: who.project.clone(),
                status,
                upcoming,
                deleting_reads_left: None,
            },
        );
        Ok(id)
    }

    /// 현재 상태를 돌려주고 상태를 한 단계 진행한다.
    pub async fn status(
        &self,
        who: &SimIdentity,
        kind: ResourceKind,
        id: &str,
    ) -> Result<String, SimError> {
        let mut state = self.state.lock().await;
        let (domain, project) = {
            let resource = state.resource(kind, id)?;
            (resource.domain.clone(), resource.project.clone())
        };
        state.authorize(who, Operation::Read, &domain, &project)?;
        let vanish = {
            let resource = state
                .resources
                .get_mut(id)
                .ok_or_else(|| SimError::new(404, format!("{kind} {id} not found")))?;
            match resource.deleting_reads_left {
                Some(0) => true,
                Some(left) => {
                    resource.deleting_reads_left = Some(left - 1);
                    false
                }
                None => {
                    let current = resource.status.clone();
                    if let Some(next) = resource.upcoming.pop_front() {
                        resource.status = next.to_string();
                    }
                    return Ok(current);
                }
            }
        };
        if vanish {
            state.resources.remove(id);
            return Err(SimError::new(404, format!("{kind} {id} not found")));
        }
        Ok("deleting".to_string())
    }

    /// 리소스 이름을 바꾼다.
    pub async fn update(
        &self,
        who: &SimIdentity,
        kind: ResourceKind,
        id: &str,
        name: &str,
    ) -> Result<(), SimError> {
        let mut state = self.state.lock().await;
        let (domain, project) = {
            let resource = state.resource(kind, id)?;
            (resource.domain.clone(), resource.project.clone())
        };
        state.authorize(who, Operation::Update, &domain, &project)?;
        if let Some(resource) = state.resources.get_mut(id) {
            debug!(%id, from = %resource.name, to = %name, "리소스 이름 변경");
            resource.name = name.to_string();
        }
        Ok(())
    }

    /// 삭제를 요청한다. 서버/볼륨/이미지는 한 번 더 조회된 뒤 사라진다.
    pub async fn delete(
        &self,
        who: &SimIdentity,
        kind: ResourceKind,
        id: &str,
    ) -> Result<(), SimError> {
        let mut state = self.state.lock().await;
        let (domain, project) = {
            let resource = state.resource(kind, id)?;
            (resource.domain.clone(), resource.project.clone())
        };
        state.authorize(who, Operation::Delete, &domain, &project)?;
        if kind.deleting_reads() == 0 {
            state.resources.remove(id);
        } else if let Some(resource) = state.resources.get_mut(id) {
            resource.status = "deleting".to_string();
            resource.upcoming.clear();
            resource.deleting_reads_left = Some(kind.deleting_reads());
        }
        Ok(())
    }

    /// 사용자에게 프로젝트 역할을 부여한다.
    pub async fn grant_role(
        &self,
        who: &SimIdentity,
        user: &str,
        domain: &str,
        project: &str,
        role: Role,
    ) -> Result<(), SimError> {
        let mut state = self.state.lock().await;
        state.authorize(who, Operation::ManageRoles, domain, project)?;
        let grant = Grant {
            user: user.to_string(),
            domain: domain.to_string(),
            project: project.to_string(),
            role,
        };
        if !state.grants.insert(grant) {
            return Err(SimError::new(
                409,
                format!("{user} already has {role} on {project}"),
            ));
        }
        Ok(())
    }

    /// 부여된 프로젝트 역할을 회수한다.
    pub async fn revoke_role(
        &self,
        who: &SimIdentity,
        user: &str,
        domain: &str,
        project: &str,
        role: Role,
    ) -> Result<(), SimError> {
        let mut state = self.state.lock().await;
        state.authorize(who, Operation::ManageRoles, domain, project)?;
        let grant = Grant {
            user: user.to_string(),
            domain: domain.to_string(),
            project: project.to_string(),
            role,
        };
        if !state.grants.remove(&grant) {
            return Err(SimError::new(
                404,
                format!("{user} has no {role} on {project}"),
            ));
        }
        Ok(())
    }

    /// 운영자 권한으로 리소스 상태를 강제로 바꾼다(장애 주입용).
    #[cfg(test)]
    pub(crate) async fn force_status(&self, id: &str, status: &str) -> Result<(), SimError> {
        let mut state = self.state.lock().await;
        let resource = state
            .resources
            .get_mut(id)
            .ok_or_else(|| SimError::new(404, format!("{id} not found")))?;
        resource.status = status.to_string();
        resource.upcoming.clear();
        Ok(())
    }

    /// 남아 있는 리소스 수를 반환한다.
    #[cfg(test)]
    pub(crate) async fn count(&self, kind: ResourceKind) -> usize {
        self.state
            .lock()
            .await
            .resources
            .values()
            .filter(|r| r.kind == kind)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn admin() -> SimIdentity {
        SimIdentity::new("root", "Default", "ops", Role::CloudAdmin)
    }

    fn member(project: &str) -> SimIdentity {
        SimIdentity::new("alice", "Default", project, Role::Member)
    }

    #[tokio::test]
    async fn server_status_advances_on_each_read() {
        let cloud = SimCloud::new();
        let id = cloud
            .create(&admin(), ResourceKind::Server, "vm")
            .await
            .unwrap();
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(cloud.status(&admin(), ResourceKind::Server, &id).await.unwrap());
        }
        assert_eq!(seen, vec!["build", "build", "active", "active"]);
    }

    #[tokio::test]
    async fn deleted_server_vanishes_after_one_read() {
        let cloud = SimCloud::new();
        let id = cloud
            .create(&admin(), ResourceKind::Server, "vm")
            .await
            .unwrap();
        cloud.delete(&admin(), ResourceKind::Server, &id).await.unwrap();
        assert_eq!(
            cloud.status(&admin(), ResourceKind::Server, &id).await.unwrap(),
            "deleting"
        );
        let err = cloud
            .status(&admin(), ResourceKind::Server, &id)
            .await
            .unwrap_err();
        assert_eq!(err.status, 404);
        assert_eq!(cloud.count(ResourceKind::Server).await, 0);
    }

    #[tokio::test]
    async fn policy_distinguishes_domain_and_project_boundaries() {
        let cloud = SimCloud::new();
        let id = cloud
            .create(&member("blue"), ResourceKind::Volume, "data")
            .await
            .unwrap();
        let other_project = member("green");
        let other_domain = SimIdentity::new("bob", "Domain2", "blue", Role::BuAdmin);
        let same_domain_admin = SimIdentity::new("carol", "Default", "x", Role::BuAdmin);

        let err = cloud
            .status(&other_project, ResourceKind::Volume, &id)
            .await
            .unwrap_err();
        assert_eq!(err.status, 403);
        let err = cloud
            .status(&other_domain, ResourceKind::Volume, &id)
            .await
            .unwrap_err();
        assert_eq!(err.status, 401);
        assert!(cloud
            .status(&same_domain_admin, ResourceKind::Volume, &id)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn granted_role_opens_project_until_revoked() {
        let cloud = SimCloud::new();
        let id = cloud
            .create(&member("blue"), ResourceKind::Network, "net")
            .await
            .unwrap();
        let guest = member("green");
        cloud
            .grant_role(&admin(), "alice", "Default", "blue", Role::Member)
            .await
            .unwrap();
        assert!(cloud.status(&guest, ResourceKind::Network, &id).await.is_ok());
        cloud
            .revoke_role(&admin(), "alice", "Default", "blue", Role::Member)
            .await
            .unwrap();
        assert_eq!(
            cloud
                .status(&guest, ResourceKind::Network, &id)
                .await
                .unwrap_err()
                .status,
            403
        );
        let err = cloud
            .grant_role(&guest, "alice", "Default", "green", Role::Member)
            .await
            .unwrap_err();
        assert_eq!(err.status, 403);
    }

    #[tokio::test]
    async fn quota_limits_creation_per_project() {
        let cloud = SimCloud::with_quotas([(ResourceKind::Server, 1)]);
        cloud
            .create(&member("blue"), ResourceKind::Server, "a")
            .await
            .unwrap();
        let err = cloud
            .create(&member("blue"), ResourceKind::Server, "b")
            .await
            .unwrap_err();
        assert_eq!(err.status, 413);
        assert!(cloud
            .create(&member("green"), ResourceKind::Server, "c")
            .await
            .is_ok());
    }

    #[test]
    fn identities_deserialize_from_yaml() {
        let yaml = "user: dave\ndomain: Default\nproject: ops\nrole: _member_\n";
        let identity: SimIdentity = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(identity.role, Role::Member);
        assert_eq!(identity.to_string(), "dave@Default/ops (member)");
    }
}
