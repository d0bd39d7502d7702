//! Predicates shared by `condition`, `while` and `switch`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use wfcore::{lookup_path, ConfigMap, NodeError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Operator {
    #[default]
    Equals,
    NotEquals,
    GreaterThan,
    GreaterThanOrEqual,
    LessThan,
    LessThanOrEqual,
    Contains,
    Exists,
    Truthy,
}

/// `{field, operator, value}` where `field` is a dotted path into the
/// `{input, nodes, variables}` scope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    #[serde(default)]
    pub operator: Operator,
    #[serde(default)]
    pub value: Value,
}

impl Condition {
    pub fn from_config(config: &ConfigMap) -> Result<Self, NodeError> {
        if !config.contains_key("field") {
            return Err(NodeError::MissingConfig("field".to_string()));
        }
        serde_json::from_value(Value::Object(config.clone()))
            .map_err(|e| NodeError::invalid_config("operator", e.to_string()))
    }

    pub fn evaluate(&self, scope: &Value) -> bool {
        let actual = lookup_path(scope, &self.field);
        match self.operator {
            Operator::Exists => actual.is_some_and(|v| !v.is_null()),
            Operator::Truthy => actual.is_some_and(truthy),
            Operator::Equals => actual.is_some_and(|v| loose_eq(v, &self.value)),
            Operator::NotEquals => !actual.is_some_and(|v| loose_eq(v, &self.value)),
            Operator::Contains => actual.is_some_and(|v| contains(v, &self.value)),
            Operator::GreaterThan => compare(actual, &self.value, |o| o.is_gt()),
            Operator::GreaterThanOrEqual => compare(actual, &self.value, |o| o.is_ge()),
            Operator::LessThan => compare(actual, &self.value, |o| o.is_lt()),
            Operator::LessThanOrEqual => compare(actual, &self.value, |o| o.is_le()),
        }
    }
}

pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Equality that treats `1` and `1.0` as the same number.
pub fn loose_eq(left: &Value, right: &Value) -> bool {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l == r,
        _ => left == right,
    }
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::String(s) => needle.as_str().is_some_and(|n| s.contains(n)),
        Value::Array(items) => items.iter().any(|item| loose_eq(item, needle)),
        Value::Object(map) => needle.as_str().is_some_and(|k| map.contains_key(k)),
        _ => false,
    }
}

fn compare(actual: Option<&Value>, expected: &Value, accept: fn(std::cmp::Ordering) -> bool) -> bool {
    let Some(actual) = actual else {
        return false;
    };
    let ordering = match (actual, expected) {
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => match (actual.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => None,
        },
    };
    ordering.is_some_and(accept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn check(field: &str, operator: Operator, value: Value, scope: &Value) -> bool {
        Condition {
            field: field.to_string(),
            operator,
            value,
        }
        .evaluate(scope)
    }

    #[test]
    fn test_numeric_comparisons() {
        let scope = json!({"input": {"count": 5}});
        assert!(check("input.count", Operator::Equals, json!(5.0), &scope));
        assert!(check("input.count", Operator::GreaterThan, json!(4), &scope));
        assert!(check("input.count", Operator::LessThanOrEqual, json!(5), &scope));
        assert!(!check("input.count", Operator::LessThan, json!(5), &scope));
        assert!(!check("input.missing", Operator::GreaterThan, json!(0), &scope));
    }

    #[test]
    fn test_contains_exists_truthy() {
        let scope = json!({"input": {"tags": ["a", "b"], "name": "web-01", "empty": ""}});
        assert!(check("input.tags", Operator::Contains, json!("b"), &scope));
        assert!(check("input.name", Operator::Contains, json!("web"), &scope));
        assert!(check("input.name", Operator::Exists, Value::Null, &scope));
        assert!(!check("input.nope", Operator::Exists, Value::Null, &scope));
        assert!(!check("input.empty", Operator::Truthy, Value::Null, &scope));
        assert!(check("input.nope", Operator::NotEquals, json!(1), &scope));
    }

    #[test]
    fn test_operator_names() {
        let config: ConfigMap = serde_json::from_value(json!({
            "field": "input.x",
            "operator": "greaterThanOrEqual",
            "value": 3
        }))
        .unwrap();
        let condition = Condition::from_config(&config).unwrap();
        assert_eq!(condition.operator, Operator::GreaterThanOrEqual);

        let bad: ConfigMap = serde_json::from_value(json!({"field": "x", "operator": "near"})).unwrap();
        assert!(matches!(
            Condition::from_config(&bad),
            Err(NodeError::InvalidConfig { .. })
        ));
    }
}
