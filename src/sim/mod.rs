//! 메모리 안에서 동작하는 멀티 서비스 제어 평면과 그 위의 액션 모음이다.
//!
//! 실제 클라우드 없이 시나리오 엔진과 시험 스위트를 끝까지 돌려 볼 때 쓴다.

mod actions;
mod cloud;

pub use actions::{ResourceAction, RoleAction, register_sim_actions};
pub use cloud::{ResourceKind, Role, SimCloud, SimError, SimIdentity};
