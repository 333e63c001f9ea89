mod action;
mod context;
mod events;
mod expect;
mod poll;
mod runner;
mod state;
mod throttle;
mod translate;

pub use action::{Action, ActionArgs, Identity, SharedAction};
pub use context::{Context, STACK_KEY, StackRecord, stack_record};
pub use events::EngineEvent;
pub use expect::{Verdict, evaluate};
pub use poll::{
    DELETED, PollOutcome, PollSpec, PollState, PollingWaiter, StatusReader, StatusSource,
    WaitForStatus,
};
pub use runner::run_scenario;
pub use state::{RunReport, StepRecord, StepStatus};
pub use throttle::{RateLimiter, Throttled};
pub use translate::{BoundaryExt, HttpFailure, kind_for_status, translate};
