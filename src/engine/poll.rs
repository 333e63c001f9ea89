use super::action::{Action, ActionArgs, Identity};
use super::context::Context;
use crate::error::ActionError;
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, warn};

/// 리소스가 사라진 상태를 뜻하는 목표 상태 이름이다.
pub const DELETED: &str = "deleted";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

/// 한 번의 상태 대기를 정의한다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollSpec {
    /// 기다릴 상태(소문자).
    pub target: String,
    /// 도달하면 목표에 더 이상 갈 수 없는 상태 목록(소문자).
    pub terminal_states: BTreeSet<String>,
    /// 첫 샘플부터 잰 제한 시간. 0이면 정확히 한 번만 샘플링한다.
    pub timeout: Duration,
    /// 샘플 간격. 0보다 커야 한다.
    pub interval: Duration,
    /// 첫 샘플 전에 기다릴 시간. 제한 시간에 포함되지 않는다.
    pub initial_wait: Duration,
}

impl PollSpec {
    /// 기본 타이밍(60초 제한, 5초 간격)으로 대기 정의를 생성한다.
    pub fn new(target: impl AsRef<str>) -> Self {
        Self {
            target: target.as_ref().to_lowercase(),
            terminal_states: BTreeSet::new(),
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
            initial_wait: Duration::ZERO,
        }
    }

    pub fn terminal_states<S: AsRef<str>>(mut self, states: impl IntoIterator<Item = S>) -> Self {
        self.terminal_states = states
            .into_iter()
            .map(|s| s.as_ref().to_lowercase())
            .collect();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn initial_wait(mut self, initial_wait: Duration) -> Self {
        self.initial_wait = initial_wait;
        self
    }

    /// 목표가 리소스 소멸을 뜻하는지 여부이다.
    pub fn target_is_absence(&self) -> bool {
        self.target == DELETED
    }
}

/// 대기 상태 기계의 현재 상태이다.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollState {
    Waiting,
    Reached,
    FailedTerminal,
    FailedTimeout,
    FailedNotFound,
}

/// 목표 상태 도달 결과이다.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// 마지막으로 관측한 상태. 리소스가 사라졌으면 `deleted`.
    pub final_state: String,
    /// 수행한 샘플 수.
    pub samples: u32,
    /// 첫 샘플부터 목표 도달까지 걸린 시간.
    pub elapsed: Duration,
    /// 상태 조회가 "없음" 오류로 끝났는지 여부.
    pub vanished: bool,
}

/// 상태 값을 한 번 읽어 오는 대상이다.
#[async_trait]
pub trait StatusSource: Send {
    /// 현재 상태 이름을 읽는다. 리소스가 없으면 `NotFound` 분류 오류를 반환해야 한다.
    async fn sample(&mut self) -> Result<String, ActionError>;
}

/// 상태를 반복 조회하여 목표 상태, 종료 상태, 제한 시간 중 하나에 이를 때까지 기다린다.
#[derive(Debug)]
pub struct PollingWaiter {
    spec: PollSpec,
    state: PollState,
}

impl PollingWaiter {
    /// 대기 정의를 검증하고 `Waiting` 상태의 대기자를 생성한다.
    pub fn new(spec: PollSpec) -> Result<Self, ActionError> {
        if spec.interval.is_zero() {
            return Err(ActionError::invalid_argument(
                "interval",
                "폴링 간격은 0보다 커야 합니다.",
            ));
        }
        Ok(Self {
            spec,
            state: PollState::Waiting,
        })
    }

    pub fn spec(&self) -> &PollSpec {
        &self.spec
    }

    pub fn state(&self) -> PollState {
        self.state
    }

    /// 목표 상태에 도달할 때까지 샘플링한다.
    ///
    /// # 반환값
    /// 목표 도달 시 `PollOutcome`을, 종료 상태/시간 초과/리소스 없음이면 해당 오류를 반환한다.
    /// 그 밖의 조회 오류는 그대로 전파한다.
    pub async fn wait<S: StatusSource>(
        &mut self,
        source: &mut S,
    ) -> Result<PollOutcome, ActionError> {
        if !self.spec.initial_wait.is_zero() {
            debug!(
                wait = ?self.spec.initial_wait,
                target_status = %self.spec.target,
                "첫 샘플 전 대기"
            );
            sleep(self.spec.initial_wait).await;
        }
        let started = Instant::now();
        let mut samples: u32 = 0;
        loop {
            samples += 1;
            let status = match source.sample().await {
                Ok(status) => status.to_lowercase(),
                Err(err) if err.is_not_found() => {
                    if self.spec.target_is_absence() {
                        self.state = PollState::Reached;
                        info!(samples, state = DELETED, "리소스가 사라져 소멸 상태로 간주");
                        return Ok(PollOutcome {
                            final_state: DELETED.to_string(),
                            samples,
                            elapsed: started.elapsed(),
                            vanished: true,
                        });
                    }
                    self.state = PollState::FailedNotFound;
                    warn!(target_status = %self.spec.target, "상태 조회 중 리소스가 사라짐");
                    return Err(err);
                }
                Err(err) => return Err(err),
            };
            let elapsed = started.elapsed();
            debug!(%status, target_status = %self.spec.target, ?elapsed, samples, "상태 샘플");
            if status == self.spec.target {
                self.state = PollState::Reached;
                return Ok(PollOutcome {
                    final_state: status,
                    samples,
                    elapsed,
                    vanished: false,
                });
            }
            if self.spec.terminal_states.contains(&status) {
                self.state = PollState::FailedTerminal;
                return Err(ActionError::PollTerminalState {
                    target: self.spec.target.clone(),
                    state: status,
                });
            }
            if elapsed >= self.spec.timeout {
                self.state = PollState::FailedTimeout;
                return Err(ActionError::PollTimeout {
                    target: self.spec.target.clone(),
                    last_state: status,
                    elapsed,
                });
            }
            sleep(self.spec.interval).await;
        }
    }
}

/// 상태 조회 액션이 구현하는 읽기 규약이다.
#[async_trait]
pub trait StatusReader<I: Identity>: Send + Sync {
    /// 리소스의 현재 상태 이름을 읽는다 (대소문자 무시).
    async fn read_status(
        &self,
        identity: &I,
        ctx: &mut Context,
        args: &ActionArgs,
    ) -> Result<String, ActionError>;
}

/// `StatusReader`를 한 Step 호출 범위에서 `StatusSource`로 묶는다.
struct ReaderSource<'a, I: Identity> {
    reader: &'a dyn StatusReader<I>,
    identity: &'a I,
    ctx: &'a mut Context,
    args: &'a ActionArgs,
    status_key: Option<&'a str>,
}

#[async_trait]
impl<'a, I: Identity> StatusSource for ReaderSource<'a, I> {
    async fn sample(&mut self) -> Result<String, ActionError> {
        let status = self
            .reader
            .read_status(self.identity, self.ctx, self.args)
            .await?
            .to_lowercase();
        if let Some(key) = self.status_key {
            self.ctx.set(key, status.clone())?;
        }
        Ok(status)
    }
}

/// 상태 조회 액션과 `PollingWaiter`를 묶은 대기 액션이다.
///
/// 옵션: `target_status`, `timeout`, `interval`, `initial_wait`(초), `terminal_states`(목록).
pub struct WaitForStatus<I: Identity> {
    name: String,
    reader: Arc<dyn StatusReader<I>>,
    default_target: Option<String>,
    terminal_states: BTreeSet<String>,
    timeout: Duration,
    interval: Duration,
    initial_wait: Duration,
    status_key: Option<String>,
}

impl<I: Identity> WaitForStatus<I> {
    pub fn new(name: impl Into<String>, reader: Arc<dyn StatusReader<I>>) -> Self {
        Self {
            name: name.into(),
            reader,
            default_target: None,
            terminal_states: BTreeSet::new(),
            timeout: DEFAULT_TIMEOUT,
            interval: DEFAULT_INTERVAL,
            initial_wait: Duration::ZERO,
            status_key: None,
        }
    }

    /// `target_status` 옵션이 없을 때 사용할 목표 상태를 지정한다.
    pub fn default_target(mut self, target: impl AsRef<str>) -> Self {
        self.default_target = Some(target.as_ref().to_lowercase());
        self
    }

    pub fn terminal_states<S: AsRef<str>>(mut self, states: impl IntoIterator<Item = S>) -> Self {
        self.terminal_states = states
            .into_iter()
            .map(|s| s.as_ref().to_lowercase())
            .collect();
        self
    }

    /// 옵션이 없을 때 쓰는 기본 타이밍을 지정한다.
    pub fn timing(mut self, timeout: Duration, interval: Duration, initial_wait: Duration) -> Self {
        self.timeout = timeout;
        self.interval = interval;
        self.initial_wait = initial_wait;
        self
    }

    /// 관측 상태를 기록할 컨텍스트 키를 지정한다. 목표 도달 시 제거된다.
    pub fn status_key(mut self, key: impl Into<String>) -> Self {
        self.status_key = Some(key.into());
        self
    }

    fn spec_for(&self, args: &ActionArgs) -> Result<PollSpec, ActionError> {
        let target = match args.option_str("target_status")? {
            Some(target) => target.to_lowercase(),
            None => self
                .default_target
                .clone()
                .ok_or_else(|| ActionError::invalid_argument("target_status", "값이 없습니다."))?,
        };
        let terminal = args
            .option_string_set("terminal_states")?
            .unwrap_or_else(|| self.terminal_states.clone());
        Ok(PollSpec {
            target,
            terminal_states: terminal,
            timeout: args.option_secs("timeout")?.unwrap_or(self.timeout),
            interval: args.option_secs("interval")?.unwrap_or(self.interval),
            initial_wait: args.option_secs("initial_wait")?.unwrap_or(self.initial_wait),
        })
    }
}

#[async_trait]
impl<I: Identity> Action<I> for WaitForStatus<I> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(
        &self,
        identity: &I,
        ctx: &mut Context,
        args: &ActionArgs,
    ) -> Result<(), ActionError> {
        let mut waiter = PollingWaiter::new(self.spec_for(args)?)?;
        info!(action = %self.name, target_status = %waiter.spec().target, "상태 대기 시작");
        let outcome = {
            let mut source = ReaderSource {
                reader: self.reader.as_ref(),
                identity,
                ctx: &mut *ctx,
                args,
                status_key: self.status_key.as_deref(),
            };
            waiter.wait(&mut source).await?
        };
        if let Some(key) = &self.status_key {
            // 소멸로 끝난 경우에는 기록된 값이 없을 수 있다.
            let _ = ctx.pop_key(key);
        }
        info!(
            action = %self.name,
            state = %outcome.final_state,
            samples = outcome.samples,
            elapsed = ?outcome.elapsed,
            "목표 상태 도달"
        );
        Ok(())
    }

    fn missing_field(&self, args: &ActionArgs) -> Option<&'static str> {
        let given = matches!(args.option_str("target_status"), Ok(Some(_)));
        if self.default_target.is_none() && !given {
            return Some("target_status");
        }
        None
    }
}
