//! Evaluation context normalization.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EvalError;

/// Name of the targeting identifier in an OFREP context.
pub const TARGETING_KEY: &str = "targetingKey";

/// A scalar context attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AttributeValue {
    Bool(bool),
    Number(f64),
    String(String),
}

impl AttributeValue {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => n.as_f64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            Value::Null | Value::Array(_) | Value::Object(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

/// A normalized evaluation context: a non-empty targeting key plus scalar
/// attributes. Unknown attribute names are kept.
#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationContext {
    targeting_key: String,
    attributes: HashMap<String, AttributeValue>,
}

impl EvaluationContext {
    pub fn new(targeting_key: impl Into<String>) -> Result<Self, EvalError> {
        let targeting_key = targeting_key.into();
        if targeting_key.trim().is_empty() {
            return Err(EvalError::InvalidContext(
                "targetingKey must not be empty".to_string(),
            ));
        }
        Ok(Self {
            targeting_key,
            attributes: HashMap::new(),
        })
    }

    pub fn with_attribute(mut self, key: impl Into<String>, value: AttributeValue) -> Self {
        self.attributes.insert(key.into(), value);
        self
    }

    pub fn targeting_key(&self) -> &str {
        &self.targeting_key
    }

    pub fn get(&self, key: &str) -> Option<&AttributeValue> {
        self.attributes.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.attributes.contains_key(key)
    }

    pub fn attributes(&self) -> &HashMap<String, AttributeValue> {
        &self.attributes
    }
}

/// Normalize a raw OFREP context object.
///
/// `null`, arrays and objects are dropped: no criterion can compare them.
pub fn normalize(raw: &Map<String, Value>) -> Result<EvaluationContext, EvalError> {
    let targeting_key = match raw.get(TARGETING_KEY) {
        Some(Value::String(s)) => s.clone(),
        Some(_) => {
            return Err(EvalError::InvalidContext(
                "targetingKey must be a string".to_string(),
            ))
        }
        None => {
            return Err(EvalError::InvalidContext(
                "targetingKey is required".to_string(),
            ))
        }
    };

    let mut context = EvaluationContext::new(targeting_key)?;
    for (key, value) in raw {
        if key == TARGETING_KEY {
            continue;
        }
        match AttributeValue::from_json(value) {
            Some(v) => {
                context.attributes.insert(key.clone(), v);
            }
            None => tracing::trace!(attribute = %key, "dropping non-scalar context attribute"),
        }
    }

    Ok(context)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn keeps_scalar_attributes_including_unknown_keys() {
        let ctx = normalize(&raw(json!({
            "targetingKey": "user-001",
            "userTier": "premium",
            "age": 42,
            "beta": true,
            "somethingNew": "kept"
        })))
        .unwrap();

        assert_eq!(ctx.targeting_key(), "user-001");
        assert_eq!(ctx.get("userTier"), Some(&AttributeValue::String("premium".into())));
        assert_eq!(ctx.get("age"), Some(&AttributeValue::Number(42.0)));
        assert_eq!(ctx.get("beta"), Some(&AttributeValue::Bool(true)));
        assert!(ctx.contains("somethingNew"));
        assert!(!ctx.contains(TARGETING_KEY));
    }

    #[test]
    fn drops_non_scalar_attributes() {
        let ctx = normalize(&raw(json!({
            "targetingKey": "u",
            "tags": ["a", "b"],
            "nested": {"a": 1},
            "nothing": null
        })))
        .unwrap();

        assert!(ctx.attributes().is_empty());
    }

    #[test]
    fn rejects_missing_targeting_key() {
        let err = normalize(&raw(json!({"userTier": "free"}))).unwrap_err();
        assert!(matches!(err, EvalError::InvalidContext(_)));
    }

    #[test]
    fn rejects_empty_and_blank_targeting_key() {
        assert!(normalize(&raw(json!({"targetingKey": ""}))).is_err());
        assert!(normalize(&raw(json!({"targetingKey": "   "}))).is_err());
    }

    #[test]
    fn rejects_non_string_targeting_key() {
        let err = normalize(&raw(json!({"targetingKey": 17}))).unwrap_err();
        assert_eq!(
            err,
            EvalError::InvalidContext("targetingKey must be a string".into())
        );
    }
}
