// Protocol Models
// Data structures for measurement protocols, steps and their results

use crate::expression::Expression;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Static and resolved step parameters, ordered by name
pub type ParameterMap = BTreeMap<String, Value>;

/// Named analysis outputs produced by one step
pub type AnalysisOutputs = HashMap<String, Value>;

/// Parameter value that makes the owning step skip
pub const SKIP_KEYWORD: &str = "SKIP";

/// Parameter value that ends the protocol at the owning step
pub const STOP_KEYWORD: &str = "STOP";

// =============================================================================
// Protocol definition
// =============================================================================

/// A fully loaded, validated protocol. Immutable once loaded.
#[derive(Debug, Clone)]
pub struct ProtocolDefinition {
    pub name: String,
    pub settings: RunSettings,
    pub steps: Vec<StepSpec>,
}

impl ProtocolDefinition {
    pub fn step(&self, name: &str) -> Option<&StepSpec> {
        self.steps.iter().find(|s| s.name == name)
    }

    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.name.as_str()).collect()
    }
}

/// Global run parameters, passed through to the instrument layer untouched
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSettings {
    pub sample_volume: f64,
    pub total_volume: f64,
    pub discard_sample: bool,
    /// Purge time in seconds
    pub purge: f64,
    pub wash: WashSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WashSettings {
    pub wash_volume: f64,
    pub washing_cycles: u32,
}

/// Kind of work a step asks the capability to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    #[default]
    Measure,
    Dilute,
}

impl TaskKind {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "measure" => Some(TaskKind::Measure),
            "dilute" => Some(TaskKind::Dilute),
            _ => None,
        }
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskKind::Measure => write!(f, "measure"),
            TaskKind::Dilute => write!(f, "dilute"),
        }
    }
}

/// One named step of a protocol
#[derive(Debug, Clone)]
pub struct StepSpec {
    /// Unique within the protocol
    pub name: String,
    pub task: TaskKind,
    /// Technique identifier understood by the capability (SWV, CV, CA, ...)
    pub technique: String,
    pub parameters: ParameterMap,
    pub update_rules: Vec<ParameterUpdateRule>,
    /// Forwarded to the capability as-is
    pub analysis: Value,
}

/// Derives one parameter of a step from an earlier step's analysis outputs
#[derive(Debug, Clone)]
pub struct ParameterUpdateRule {
    /// Parameter of the owning step to overwrite or insert
    pub target: String,
    /// Name of a step preceding the owning step
    pub source_step: String,
    /// Output key within the source step's analysis outputs
    pub source_key: String,
    /// When absent the output value is used directly
    pub selection: Option<SelectionExpression>,
}

/// Ordered filters followed by one pick
#[derive(Debug, Clone)]
pub struct SelectionExpression {
    pub filters: Vec<FilterClause>,
    pub pick: PickClause,
}

#[derive(Debug, Clone)]
pub struct FilterClause {
    pub key: String,
    pub predicate: Expression,
}

#[derive(Debug, Clone)]
pub struct PickClause {
    pub key: String,
    pub aggregator: Expression,
}

// =============================================================================
// Step results
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StepStatus::Succeeded | StepStatus::Failed | StepStatus::Skipped
        )
    }

    /// Whether moving from `self` to `next` goes forward
    pub fn can_transition_to(&self, next: StepStatus) -> bool {
        match (self, next) {
            (StepStatus::Pending, StepStatus::Running)
            | (StepStatus::Pending, StepStatus::Failed)
            | (StepStatus::Pending, StepStatus::Skipped) => true,
            (StepStatus::Running, StepStatus::Succeeded)
            | (StepStatus::Running, StepStatus::Failed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Succeeded => "succeeded",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// A labelled binary blob emitted while a step runs
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepPayload {
    pub label: String,
    pub data: Bytes,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_name: String,
    pub status: StepStatus,
    pub payloads: Vec<StepPayload>,
    pub outputs: AnalysisOutputs,
    pub error: Option<String>,
    /// Parameters the step ran with, after update rules
    pub parameters: ParameterMap,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StepResult {
    pub fn pending(step_name: impl Into<String>) -> Self {
        Self {
            step_name: step_name.into(),
            status: StepStatus::Pending,
            payloads: Vec::new(),
            outputs: HashMap::new(),
            error: None,
            parameters: BTreeMap::new(),
            started_at: None,
            completed_at: None,
        }
    }
}

// =============================================================================
// Value type for outputs, parameters and expressions
// =============================================================================

/// Dynamically typed value. A record is an `Object`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(HashMap<String, Value>),
}

impl Value {
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0 && !n.is_nan(),
            Value::String(s) => !s.is_empty(),
            Value::Array(a) => !a.is_empty(),
            Value::Object(o) => !o.is_empty(),
        }
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&[Value]> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Field of a record; `None` for missing keys and non-records
    pub fn field(&self, key: &str) -> Option<&Value> {
        match self {
            Value::Object(map) => map.get(key),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Whether this value is the given control keyword
    pub fn is_keyword(&self, keyword: &str) -> bool {
        self.as_str() == Some(keyword)
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Number::from_f64(*n)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => {
                serde_json::Value::Array(items.iter().map(Value::to_json).collect())
            }
            Value::Object(map) => serde_json::Value::Object(
                map.iter().map(|(k, v)| (k.clone(), v.to_json())).collect(),
            ),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => write!(f, "null"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => {
                if n.fract() == 0.0 && n.abs() < 1e15 {
                    write!(f, "{}", *n as i64)
                } else {
                    write!(f, "{}", n)
                }
            }
            Value::String(s) => write!(f, "{}", s),
            Value::Array(_) | Value::Object(_) => write!(f, "{}", self.to_json()),
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::Array(items)
    }
}

/// Build a record from `(key, value)` pairs
pub fn record<K, V>(fields: impl IntoIterator<Item = (K, V)>) -> Value
where
    K: Into<String>,
    V: Into<Value>,
{
    Value::Object(
        fields
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_status_transitions() {
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Running));
        assert!(StepStatus::Pending.can_transition_to(StepStatus::Skipped));
        assert!(StepStatus::Running.can_transition_to(StepStatus::Succeeded));
        assert!(!StepStatus::Succeeded.can_transition_to(StepStatus::Running));
        assert!(!StepStatus::Running.can_transition_to(StepStatus::Pending));
        assert!(!StepStatus::Skipped.can_transition_to(StepStatus::Failed));
    }

    #[test]
    fn test_value_from_json() {
        let json = serde_json::json!({"peak": -0.25, "height": 3, "ok": true});
        let value = Value::from(json);

        assert_eq!(value.field("peak"), Some(&Value::Number(-0.25)));
        assert_eq!(value.field("height"), Some(&Value::Number(3.0)));
        assert_eq!(value.field("missing"), None);
    }

    #[test]
    fn test_value_display() {
        assert_eq!(Value::Number(3.0).to_string(), "3");
        assert_eq!(Value::Number(-0.25).to_string(), "-0.25");
        assert_eq!(Value::from("SWV").to_string(), "SWV");
        assert_eq!(Value::Null.to_string(), "null");
    }

    #[test]
    fn test_keyword_detection() {
        assert!(Value::from("SKIP").is_keyword(SKIP_KEYWORD));
        assert!(!Value::from("skip").is_keyword(SKIP_KEYWORD));
        assert!(!Value::Number(1.0).is_keyword(STOP_KEYWORD));
    }

    #[test]
    fn test_value_deserialize_untagged() {
        let value: Value = serde_json::from_str(r#"[{"peak": 0.1}, 2, "a", null]"#).unwrap();
        let items = value.as_array().unwrap();
        assert_eq!(items.len(), 4);
        assert_eq!(items[0].field("peak"), Some(&Value::Number(0.1)));
        assert_eq!(items[1], Value::Number(2.0));
        assert_eq!(items[3], Value::Null);
    }
}
