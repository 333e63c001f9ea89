//! 멀티 서비스 클라우드 제어 평면을 위한 역할 기반 접근 제어(RBAC) 적합성 시험 도구.
//!
//! 액션 순서(시나리오 형태)를 identity별로 실행하고, 각 Step이 성공하거나
//! 지정한 권한 오류로 실패하는지 검증한다.

pub mod config;
pub mod engine;
pub mod error;
pub mod scenario;
pub mod sim;
pub mod suite;

pub use engine::{Action, ActionArgs, Context, Identity, RunReport, SharedAction};
pub use error::{ActionError, ErrorKind, FactoryError, ScenarioFailure, Service, StepFailure};
pub use scenario::{ActionStep, Scenario, ScenarioFactory, ScenarioShape, StepOverride};
