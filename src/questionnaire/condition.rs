//! Boolean visibility condition trees: AND/OR/NOT/VISIBLE/COMPLETED/ALWAYS.

use serde_json::Value;

use crate::error::BrokerError;

#[derive(Debug, Clone)]
pub enum Condition {
    And(Vec<Condition>),
    Or(Vec<Condition>),
    Not(Box<Condition>),
    Visible(String),
    Completed(String),
    Always(bool),
}

impl Condition {
    /// Normalize a raw JSON condition tree. Operators are case-insensitive
    /// on input and validated structurally at this point, so a malformed
    /// tree fails at construction time rather than during evaluation.
    pub fn from_value(value: &Value) -> Result<Self, BrokerError> {
        let object = value
            .as_object()
            .ok_or_else(|| BrokerError::TypeMismatch("condition must be a JSON object".into()))?;
        let operator = object
            .get("operator")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::InvalidArgument("condition is missing \"operator\"".into()))?
            .to_ascii_uppercase();

        match operator.as_str() {
            "AND" | "OR" => {
                let items = object
                    .get("conditions")
                    .and_then(Value::as_array)
                    .ok_or_else(|| {
                        BrokerError::InvalidArgument(format!("{operator} requires non-empty \"conditions\""))
                    })?;
                if items.is_empty() {
                    return Err(BrokerError::InvalidArgument(format!(
                        "{operator} requires a non-empty \"conditions\" list"
                    )));
                }
                let parsed = items
                    .iter()
                    .map(Condition::from_value)
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(if operator == "AND" {
                    Condition::And(parsed)
                } else {
                    Condition::Or(parsed)
                })
            }
            "NOT" => {
                let inner = object
                    .get("condition")
                    .ok_or_else(|| BrokerError::InvalidArgument("NOT requires a \"condition\" mapping".into()))?;
                Ok(Condition::Not(Box::new(Condition::from_value(inner)?)))
            }
            "VISIBLE" | "COMPLETED" => {
                let section_id = object
                    .get("section_id")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())
                    .ok_or_else(|| {
                        BrokerError::InvalidArgument(format!("{operator} requires a non-empty \"section_id\""))
                    })?
                    .to_string();
                Ok(if operator == "VISIBLE" {
                    Condition::Visible(section_id)
                } else {
                    Condition::Completed(section_id)
                })
            }
            "ALWAYS" => {
                let value = match object.get("value") {
                    None => true,
                    Some(v) => v
                        .as_bool()
                        .ok_or_else(|| BrokerError::TypeMismatch("ALWAYS \"value\" must be a boolean".into()))?,
                };
                Ok(Condition::Always(value))
            }
            other => Err(BrokerError::InvalidArgument(format!("unknown condition operator {other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_always_with_default_true() {
        let cond = Condition::from_value(&json!({"operator": "always"})).unwrap();
        assert!(matches!(cond, Condition::Always(true)));
    }

    #[test]
    fn rejects_empty_conjunction() {
        let err = Condition::from_value(&json!({"operator": "AND", "conditions": []})).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_unknown_operator() {
        let err = Condition::from_value(&json!({"operator": "XOR"})).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }

    #[test]
    fn parses_nested_and_or_not() {
        let cond = Condition::from_value(&json!({
            "operator": "and",
            "conditions": [
                {"operator": "completed", "section_id": "1"},
                {"operator": "not", "condition": {"operator": "visible", "section_id": "2"}},
            ],
        }))
        .unwrap();
        match cond {
            Condition::And(items) => assert_eq!(items.len(), 2),
            other => panic!("expected And, got {other:?}"),
        }
    }
}
