use super::action::{Action, ActionArgs, Identity, SharedAction};
use super::context::Context;
use crate::error::ActionError;
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, sleep};
use tracing::debug;

/// 보호된 호출 사이에 최소 간격을 두는 호출 제한기이다.
///
/// 한 번 생성해 호출자들에게 공유한다. 보호된 호출은 하나씩 순서대로 실행된다.
#[derive(Debug)]
pub struct RateLimiter {
    /// 이전 호출 종료 후 다음 호출까지 필요한 최소 간격.
    spacing: Duration,
    /// 간격이 지났는지 다시 확인하기 전 대기 시간.
    check_interval: Duration,
    /// 마지막 보호 호출이 끝난 시각.
    last_run: Mutex<Option<Instant>>,
}

impl RateLimiter {
    /// 새 제한기를 생성한다. `check_interval`이 0이면 `spacing` 단위로 확인한다.
    pub fn new(spacing: Duration, check_interval: Duration) -> Self {
        let check_interval = if check_interval.is_zero() {
            spacing
        } else {
            check_interval
        };
        Self {
            spacing,
            check_interval,
            last_run: Mutex::new(None),
        }
    }

    /// 차례가 올 때까지 기다린 뒤 `task`를 실행하고 종료 시각을 기록한다.
    pub async fn run<F: Future>(&self, task: F) -> F::Output {
        let mut last_run = self.last_run.lock().await;
        if let Some(last) = *last_run {
            while last.elapsed() < self.spacing {
                debug!(remaining = ?self.spacing.saturating_sub(last.elapsed()), "호출 제한 대기");
                sleep(self.check_interval).await;
            }
        }
        let output = task.await;
        *last_run = Some(Instant::now());
        output
    }

    /// 마지막 보호 호출이 끝난 시각을 반환한다.
    pub async fn last_run(&self) -> Option<Instant> {
        *self.last_run.lock().await
    }
}

/// 임의의 액션을 `RateLimiter` 뒤에서 실행하는 래퍼이다.
pub struct Throttled<I: Identity> {
    inner: SharedAction<I>,
    limiter: Arc<RateLimiter>,
}

impl<I: Identity> Throttled<I> {
    pub fn new(inner: SharedAction<I>, limiter: Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

#[async_trait]
impl<I: Identity> Action<I> for Throttled<I> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn execute(
        &self,
        identity: &I,
        ctx: &mut Context,
        args: &ActionArgs,
    ) -> Result<(), ActionError> {
        self.limiter
            .run(self.inner.execute(identity, ctx, args))
            .await
    }

    fn missing_field(&self, args: &ActionArgs) -> Option<&'static str> {
        self.inner.missing_field(args)
    }
}
