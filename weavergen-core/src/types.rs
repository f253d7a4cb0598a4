use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

// ─── Scalar aliases ───────────────────────────────────────────

/// Epoch milliseconds (UTC).
pub type Timestamp = i64;

/// Recorder-scoped span identifier, allocated monotonically per run.
pub type SpanId = u64;

/// Current wall clock in epoch milliseconds.
pub fn now_ms() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

// ─── Value ────────────────────────────────────────────────────

/// A typed data-object value carried through the execution context.
///
/// Serializes untagged, so artefact JSON reads naturally
/// (`{"errors": 0, "agent_roles": ["analyst"]}`).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::Null => ValueType::Any,
            Value::Bool(_) => ValueType::Bool,
            Value::Int(_) => ValueType::Int,
            Value::Float(_) => ValueType::Float,
            Value::Str(_) => ValueType::Str,
            Value::List(_) => ValueType::List,
            Value::Map(_) => ValueType::Map,
        }
    }

    /// Truthiness used by `has`-style presence checks: `Null` and `false`
    /// are falsy, everything else is truthy.
    pub fn is_truthy(&self) -> bool {
        !matches!(self, Value::Null | Value::Bool(false))
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Numeric view for comparisons and `numeric_sum` merges.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(n) => Some(*n as f64),
            Value::Float(f) => Some(*f),
            _ => None,
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Int(n)
    }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self {
        Value::Float(f)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Str(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(0.0))
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => Value::Map(
                map.into_iter()
                    .map(|(k, v)| (k, Value::from(v)))
                    .collect(),
            ),
        }
    }
}

// ─── Type constraints ─────────────────────────────────────────

/// Declared type constraint on a task input or output key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Bool,
    Int,
    Float,
    Str,
    List,
    Map,
    Any,
}

impl ValueType {
    pub fn accepts(&self, value: &Value) -> bool {
        match self {
            ValueType::Any => true,
            // Int is acceptable where Float is declared.
            ValueType::Float => matches!(value, Value::Float(_) | Value::Int(_)),
            other => *other == value.value_type(),
        }
    }
}

// ─── Merge rules ──────────────────────────────────────────────

/// Reconciliation rule for a data object written on more than one
/// parallel branch. A key without a declared rule that is written on
/// multiple branches is a merge conflict.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeRule {
    /// Adopt the write with the latest end time; ties broken by branch index.
    LastWriterWins,
    /// Concatenate list values in branch-index order.
    AppendList,
    /// Sum numeric values.
    NumericSum,
}

impl MergeRule {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "last_writer_wins" => Some(MergeRule::LastWriterWins),
            "append_list" => Some(MergeRule::AppendList),
            "numeric_sum" => Some(MergeRule::NumericSum),
            _ => None,
        }
    }
}

// ─── Retry policy ─────────────────────────────────────────────

/// Backoff strategy between retry attempts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    Constant,
    Exponential,
}

/// Bounded retry policy attached to a service task.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Error kinds eligible for retry. Empty disables retry regardless
    /// of `max_attempts`.
    pub retry_on: BTreeSet<crate::error::ErrorKind>,
    pub fallback_to_mock: bool,
}

impl RetryPolicy {
    /// A policy that never retries and never falls back.
    pub fn none() -> Self {
        RetryPolicy {
            max_attempts: 1,
            backoff: Backoff::Constant,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            retry_on: BTreeSet::new(),
            fallback_to_mock: false,
        }
    }

    /// Delay before the given retry (attempt numbers start at 1; the delay
    /// is applied before attempt `attempt + 1`).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match self.backoff {
            Backoff::Constant => self.initial_delay,
            Backoff::Exponential => {
                let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
                let scaled = self.initial_delay.saturating_mul(factor);
                if self.max_delay > Duration::ZERO {
                    scaled.min(self.max_delay)
                } else {
                    scaled
                }
            }
        }
    }

    /// `max_attempts ≥ 1`; `fallback_to_mock` requires a non-empty `retry_on`.
    pub fn validate(&self) -> Result<(), String> {
        if self.max_attempts == 0 {
            return Err("max_attempts must be >= 1".to_string());
        }
        if self.fallback_to_mock && self.retry_on.is_empty() {
            return Err("fallback_to_mock requires a non-empty retry_on set".to_string());
        }
        Ok(())
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            retry_on: [crate::error::ErrorKind::Transient, crate::error::ErrorKind::Timeout]
                .into_iter()
                .collect(),
            fallback_to_mock: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn value_json_roundtrip_is_untagged() {
        let v = Value::Map(
            [
                ("errors".to_string(), Value::Int(0)),
                (
                    "agent_roles".to_string(),
                    Value::List(vec![Value::Str("analyst".into())]),
                ),
            ]
            .into_iter()
            .collect(),
        );
        let json = serde_json::to_string(&v).unwrap();
        assert_eq!(json, r#"{"agent_roles":["analyst"],"errors":0}"#);
        let back: Value = serde_json::from_str(&json).unwrap();
        assert_eq!(back, v);
    }

    #[test]
    fn float_constraint_accepts_int() {
        assert!(ValueType::Float.accepts(&Value::Int(3)));
        assert!(!ValueType::Int.accepts(&Value::Float(3.0)));
    }

    #[test]
    fn exponential_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Backoff::Exponential,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(300),
            retry_on: [ErrorKind::Transient].into_iter().collect(),
            fallback_to_mock: false,
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(300));
        assert_eq!(policy.delay_for(4), Duration::from_millis(300));
    }

    #[test]
    fn fallback_requires_retry_on() {
        let mut policy = RetryPolicy::none();
        policy.fallback_to_mock = true;
        assert!(policy.validate().is_err());
    }
}
