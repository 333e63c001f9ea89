use super::context::Context;
use crate::error::ActionError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// 액션을 수행할 자격 증명/클라이언트 묶음이 만족해야 하는 조건이다.
///
/// 엔진은 내용을 들여다보지 않으며, `Display`는 보고서에 이름을 남길 때만 쓴다.
pub trait Identity: Clone + fmt::Display + Send + Sync + 'static {}

impl<T> Identity for T where T: Clone + fmt::Display + Send + Sync + 'static {}

/// 액션에 전달되는 위치 인자와 옵션 인자이다.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ActionArgs {
    /// 순서가 있는 위치 인자 목록.
    #[serde(default)]
    pub positional: Vec<Value>,
    /// 옵션 이름별 값.
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl ActionArgs {
    pub fn new() -> Self {
        Self::default()
    }

    /// 위치 인자를 추가한다.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.positional.push(value.into());
        self
    }

    /// 옵션 인자를 설정한다.
    pub fn option(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(name.into(), value.into());
        self
    }

    pub fn positional(&self, index: usize) -> Option<&Value> {
        self.positional.get(index)
    }

    /// 문자열 위치 인자를 조회한다.
    pub fn positional_str(&self, index: usize) -> Result<&str, ActionError> {
        let name = format!("#{index}");
        self.positional
            .get(index)
            .ok_or_else(|| ActionError::invalid_argument(&name, "위치 인자가 없습니다."))?
            .as_str()
            .ok_or_else(|| ActionError::invalid_argument(&name, "문자열이 아닙니다."))
    }

    pub fn has_option(&self, name: &str) -> bool {
        self.options.contains_key(name)
    }

    /// 문자열 옵션을 조회한다. 값이 없으면 `None`이다.
    pub fn option_str(&self, name: &str) -> Result<Option<&str>, ActionError> {
        match self.options.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => Ok(Some(text.as_str())),
            Some(_) => Err(ActionError::invalid_argument(name, "문자열이 아닙니다.")),
        }
    }

    /// 초 단위 숫자 옵션을 `Duration`으로 조회한다. 소수 초를 허용한다.
    pub fn option_secs(&self, name: &str) -> Result<Option<Duration>, ActionError> {
        match self.options.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => {
                let secs = value
                    .as_f64()
                    .ok_or_else(|| ActionError::invalid_argument(name, "숫자가 아닙니다."))?;
                Duration::try_from_secs_f64(secs)
                    .map(Some)
                    .map_err(|err| ActionError::invalid_argument(name, err.to_string()))
            }
        }
    }

    /// 문자열 목록 옵션을 소문자 집합으로 조회한다.
    pub fn option_string_set(&self, name: &str) -> Result<Option<BTreeSet<String>>, ActionError> {
        match self.options.get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| {
                    item.as_str().map(str::to_lowercase).ok_or_else(|| {
                        ActionError::invalid_argument(name, "문자열 목록이 아닙니다.")
                    })
                })
                .collect::<Result<BTreeSet<_>, _>>()
                .map(Some),
            Some(_) => Err(ActionError::invalid_argument(name, "목록이 아닙니다.")),
        }
    }

    /// 모든 문자열 인자의 `${key}` 플레이스홀더를 컨텍스트 값으로 치환한 사본을 만든다.
    pub fn resolve(&self, ctx: &Context) -> Result<ActionArgs, ActionError> {
        let positional = self
            .positional
            .iter()
            .map(|value| resolve_value(value, ctx))
            .collect::<Result<Vec<_>, _>>()?;
        let mut options = BTreeMap::new();
        for (name, value) in &self.options {
            options.insert(name.clone(), resolve_value(value, ctx)?);
        }
        Ok(ActionArgs {
            positional,
            options,
        })
    }
}

fn resolve_value(value: &Value, ctx: &Context) -> Result<Value, ActionError> {
    match value {
        Value::String(text) => Ok(Value::String(ctx.expand_placeholders(text)?)),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(item, ctx))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = serde_json::Map::new();
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(item, ctx)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

/// 모든 서비스 액션이 따르는 호출 규약이다.
///
/// 실패는 반드시 `ActionError`로 알려야 하며 오류 코드를 반환하지 않는다.
#[async_trait]
pub trait Action<I: Identity>: Send + Sync {
    /// 보고서와 로그에 쓰는 액션 이름.
    fn name(&self) -> &str;

    /// 주어진 identity로 액션을 수행한다.
    async fn execute(
        &self,
        identity: &I,
        ctx: &mut Context,
        args: &ActionArgs,
    ) -> Result<(), ActionError>;

    /// 구조적으로 필요한 옵션이 빠졌으면 그 이름을 반환한다.
    fn missing_field(&self, _args: &ActionArgs) -> Option<&'static str> {
        None
    }
}

/// 여러 시나리오가 공유하는 액션 핸들이다.
pub type SharedAction<I> = Arc<dyn Action<I>>;
