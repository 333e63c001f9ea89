use crate::error::ActionError;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};

/// 스냅샷에서 생성 스택이 노출되는 예약 키이다.
pub const STACK_KEY: &str = "stack";

/// 생성 Step이 스택에 남기는 `{리소스 종류: 리소스 ID}` 기록이다.
pub type StackRecord = BTreeMap<String, String>;

/// `(키, 값)` 쌍 목록으로 스택 기록을 만든다.
pub fn stack_record<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> StackRecord
where
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// 한 시나리오 실행 동안 Step 사이에서 값을 공유하기 위한 컨텍스트이다.
///
/// 키의 생산자/소비자 관계는 Step 순서로만 결정되며, 누락된 키를 읽는 것은
/// 해당 Step의 실행 실패로 처리된다. `stack` 키는 생성 스택 전용이다.
#[derive(Debug, Clone)]
pub struct Context {
    /// 문자열 키 기반 변수 저장소이다. `stack` 항목은 생성 스택의 JSON 사본이다.
    vars: HashMap<String, Value>,
    /// 외부에 생성한 리소스 기록이다. 엔진은 읽지 않는다.
    stack: Vec<StackRecord>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

fn reserved(key: &str) -> ActionError {
    ActionError::invalid_argument(key, "생성 스택 전용 키입니다.")
}

impl Context {
    /// 빈 생성 스택만 가진 컨텍스트를 생성한다.
    pub fn new() -> Self {
        let mut vars = HashMap::new();
        vars.insert(STACK_KEY.to_string(), Value::Array(Vec::new()));
        Self {
            vars,
            stack: Vec::new(),
        }
    }

    /// 초기 변수 목록으로 컨텍스트를 생성한다. `stack` 키가 있으면 거부한다.
    pub fn with_vars<K: Into<String>>(
        vars: impl IntoIterator<Item = (K, Value)>,
    ) -> Result<Self, ActionError> {
        let mut ctx = Self::new();
        for (key, value) in vars {
            ctx.set(key, value)?;
        }
        Ok(ctx)
    }

    /// 변수 값을 조회한다. `stack`은 생성 스택 목록을 돌려준다.
    ///
    /// # 반환값
    /// 키가 없으면 `ActionError::MissingKey`를 반환한다.
    pub fn get(&self, key: &str) -> Result<&Value, ActionError> {
        self.vars
            .get(key)
            .ok_or_else(|| ActionError::missing_key(key))
    }

    /// 문자열 변수 값을 조회한다.
    pub fn get_str(&self, key: &str) -> Result<&str, ActionError> {
        self.get(key)?.as_str().ok_or_else(|| {
            ActionError::invalid_argument(key, "컨텍스트 값이 문자열이 아닙니다.")
        })
    }

    pub fn contains(&self, key: &str) -> bool {
        self.vars.contains_key(key)
    }

    /// 변수 값을 덮어쓴다. 생성 스택 키에는 쓸 수 없다.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) -> Result<(), ActionError> {
        let key = key.into();
        if key == STACK_KEY {
            return Err(reserved(&key));
        }
        self.vars.insert(key, value.into());
        Ok(())
    }

    /// 변수를 제거하고 그 값을 반환한다. 생성 스택은 제거할 수 없다.
    pub fn pop_key(&mut self, key: &str) -> Result<Value, ActionError> {
        if key == STACK_KEY {
            return Err(reserved(key));
        }
        self.vars
            .remove(key)
            .ok_or_else(|| ActionError::missing_key(key))
    }

    /// 생성 스택에 기록을 추가한다.
    pub fn append_to_stack(&mut self, record: StackRecord) {
        let entry = Value::Object(
            record
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        );
        if let Some(Value::Array(items)) = self.vars.get_mut(STACK_KEY) {
            items.push(entry);
        }
        self.stack.push(record);
    }

    /// 지금까지 기록된 생성 스택을 생성 순서대로 반환한다.
    pub fn stack(&self) -> &[StackRecord] {
        &self.stack
    }

    /// `${key}` 패턴을 컨텍스트 값으로 치환한다.
    ///
    /// 문자열 값은 그대로, 그 밖의 값은 JSON 표기로 치환한다.
    ///
    /// # 반환값
    /// 치환할 키가 없으면 `ActionError::MissingKey`를 반환한다.
    pub fn expand_placeholders(&self, template: &str) -> Result<String, ActionError> {
        static PLACEHOLDER: Lazy<Regex> = Lazy::new(|| {
            Regex::new(r"\$\{([A-Za-z0-9_.\-]+)\}").expect("정규식 컴파일 실패")
        });
        if !template.contains("${") {
            return Ok(template.to_string());
        }
        let mut missing: Option<String> = None;
        let result = PLACEHOLDER.replace_all(template, |caps: &regex::Captures| {
            let key = &caps[1];
            match self.vars.get(key) {
                Some(Value::String(text)) => text.clone(),
                Some(other) => other.to_string(),
                None => {
                    missing.get_or_insert_with(|| key.to_string());
                    String::new()
                }
            }
        });
        match missing {
            Some(key) => Err(ActionError::missing_key(key)),
            None => Ok(result.into_owned()),
        }
    }

    /// 진단용으로 변수와 생성 스택을 하나의 JSON 객체로 만든다.
    pub fn snapshot(&self) -> Value {
        let map: Map<String, Value> = self
            .vars
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use serde_json::json;

    #[test]
    fn missing_key_reads_fail_with_missing_key() {
        let mut ctx = Context::new();
        assert_eq!(
            ctx.get("server_id").unwrap_err().kind(),
            ErrorKind::MissingKey
        );
        assert_eq!(
            ctx.pop_key("server_id").unwrap_err(),
            ActionError::missing_key("server_id")
        );
    }

    #[test]
    fn set_overwrites_and_pop_removes() {
        let mut ctx = Context::new();
        ctx.set("image_status", "queued").unwrap();
        ctx.set("image_status", "active").unwrap();
        assert_eq!(ctx.get_str("image_status").unwrap(), "active");
        assert_eq!(ctx.pop_key("image_status").unwrap(), json!("active"));
        assert!(!ctx.contains("image_status"));
    }

    #[test]
    fn stack_keeps_creation_order() {
        let mut ctx = Context::new();
        ctx.append_to_stack(stack_record([("network_id", "n-1")]));
        ctx.append_to_stack(stack_record([
            ("container_name", "c-1"),
            ("object_name", "o-1"),
        ]));
        assert_eq!(ctx.stack().len(), 2);
        assert_eq!(ctx.stack()[0]["network_id"], "n-1");
        assert_eq!(
            ctx.get(STACK_KEY).unwrap(),
            &json!([{"network_id": "n-1"}, {"container_name": "c-1", "object_name": "o-1"}])
        );
    }

    #[test]
    fn stack_key_is_reserved() {
        let mut ctx = Context::new();
        ctx.append_to_stack(stack_record([("image_id", "i-1")]));

        let err = ctx.set(STACK_KEY, "user value").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        assert_eq!(ctx.pop_key(STACK_KEY).unwrap_err().kind(), ErrorKind::InvalidArgument);
        assert!(Context::with_vars([(STACK_KEY, json!([]))]).is_err());

        ctx.set("image_status", "active").unwrap();
        let snapshot = ctx.snapshot();
        assert_eq!(snapshot[STACK_KEY], json!([{"image_id": "i-1"}]));
        assert_eq!(snapshot["image_status"], json!("active"));
    }

    #[test]
    fn empty_context_exposes_empty_stack() {
        let ctx = Context::new();
        assert_eq!(ctx.get(STACK_KEY).unwrap(), &json!([]));
        assert!(ctx.stack().is_empty());
    }

    #[test]
    fn placeholders_expand_from_context_values() {
        let ctx =
            Context::with_vars([("server_id", json!("s-42")), ("port", json!(8080))]).unwrap();
        let expanded = ctx
            .expand_placeholders("servers/${server_id}:${port}")
            .unwrap();
        assert_eq!(expanded, "servers/s-42:8080");
        let err = ctx.expand_placeholders("${volume_id}").unwrap_err();
        assert_eq!(err, ActionError::missing_key("volume_id"));
    }
}
