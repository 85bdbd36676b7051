//! A single questionnaire question: options, skip semantics, and the
//! value-acceptance rules from the visibility/answer algebra.

use serde_json::{Map, Value};
use std::collections::HashMap;

use crate::error::BrokerError;

#[derive(Debug, Clone)]
pub struct Question {
    pub question_id: String,
    pub question_text: String,
    pub question_type: String,
    options: Option<Vec<String>>,
    option_lookup: HashMap<String, String>,
    pub skippable: bool,
    pub spelling_sensitive: bool,
    value: Option<Value>,
    skipped: bool,
}

impl Question {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        question_id: impl Into<String>,
        question_text: impl Into<String>,
        question_type: Option<String>,
        options: Option<Vec<String>>,
        skippable: bool,
        spelling_sensitive: bool,
    ) -> Result<Self, BrokerError> {
        if options.is_some() && spelling_sensitive {
            return Err(BrokerError::InvalidArgument(
                "a question cannot combine \"options\" with \"spelling_sensitive\"".into(),
            ));
        }

        let mut option_lookup = HashMap::new();
        if let Some(opts) = &options {
            if opts.is_empty() {
                return Err(BrokerError::InvalidArgument(
                    "\"options\" must be a non-empty list when provided".into(),
                ));
            }
            for option in opts {
                if option.is_empty() {
                    return Err(BrokerError::InvalidArgument("options must be non-empty strings".into()));
                }
                let folded = option.to_lowercase();
                if option_lookup.insert(folded, option.clone()).is_some() {
                    return Err(BrokerError::InvalidArgument(format!(
                        "duplicate option {option:?} (case-insensitive)"
                    )));
                }
            }
        }

        Ok(Self {
            question_id: question_id.into(),
            question_text: question_text.into(),
            question_type: question_type.unwrap_or_else(|| "text".to_string()),
            options,
            option_lookup,
            skippable,
            spelling_sensitive,
            value: None,
            skipped: false,
        })
    }

    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped
    }

    pub fn has_answer(&self) -> bool {
        !self.skipped && self.value.is_some()
    }

    /// Apply the value-acceptance rules for this question's shape and
    /// store the (possibly canonicalized) result. Clears `skipped`.
    pub fn set_value(&mut self, value: Value) -> Result<(), BrokerError> {
        let stored = if let Some(options) = &self.options {
            match &value {
                Value::String(s) => self
                    .option_lookup
                    .get(&s.to_lowercase())
                    .cloned()
                    .map(Value::String)
                    .ok_or_else(|| BrokerError::InvalidArgument(format!("{s:?} is not one of {options:?}")))?,
                other => {
                    if options.iter().any(|o| Value::String(o.clone()) == *other) {
                        other.clone()
                    } else {
                        return Err(BrokerError::InvalidArgument(format!(
                            "{other:?} is not one of {options:?}"
                        )));
                    }
                }
            }
        } else if self.spelling_sensitive {
            let elements = value
                .as_array()
                .ok_or_else(|| BrokerError::InvalidArgument("spelling-sensitive answers must be a list of single-character strings".into()))?;
            let mut letters = String::with_capacity(elements.len());
            for element in elements {
                let s = element.as_str().ok_or_else(|| {
                    BrokerError::TypeMismatch(format!("expected a single-character string, got {element:?}"))
                })?;
                if s.chars().count() != 1 {
                    return Err(BrokerError::InvalidArgument(format!(
                        "expected a single-character string, got {s:?}"
                    )));
                }
                letters.push_str(s);
            }
            Value::String(letters)
        } else {
            value
        };

        self.value = Some(stored);
        self.skipped = false;
        Ok(())
    }

    pub fn clear_value(&mut self) {
        self.value = None;
    }

    pub fn skip(&mut self) -> Result<(), BrokerError> {
        if !self.skippable {
            return Err(BrokerError::InvalidArgument(format!(
                "question {:?} is not skippable",
                self.question_id
            )));
        }
        self.skipped = true;
        Ok(())
    }

    pub fn unskip(&mut self) {
        self.skipped = false;
    }

    pub fn to_mapping(&self) -> Value {
        let mut map = Map::new();
        map.insert("question_id".into(), Value::String(self.question_id.clone()));
        map.insert("question_text".into(), Value::String(self.question_text.clone()));
        map.insert("question_type".into(), Value::String(self.question_type.clone()));
        map.insert(
            "options".into(),
            self.options
                .clone()
                .map(|o| Value::Array(o.into_iter().map(Value::String).collect()))
                .unwrap_or(Value::Null),
        );
        map.insert("skippable".into(), Value::Bool(self.skippable));
        map.insert("spelling_sensitive".into(), Value::Bool(self.spelling_sensitive));
        map.insert("skipped".into(), Value::Bool(self.skipped));
        map.insert("value".into(), self.value.clone().unwrap_or(Value::Null));
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn yes_no() -> Question {
        Question::new(
            "q1",
            "Proceed?",
            None,
            Some(vec!["Yes".into(), "No".into()]),
            true,
            false,
        )
        .unwrap()
    }

    #[test]
    fn rejects_duplicate_options_case_insensitively() {
        let err = Question::new("q1", "t", None, Some(vec!["Yes".into(), "yes".into()]), true, false)
            .unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }

    #[test]
    fn rejects_options_combined_with_spelling_sensitive() {
        let err = Question::new("q1", "t", None, Some(vec!["Yes".into()]), true, true).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }

    #[test]
    fn option_matching_is_case_insensitive_and_canonicalizes() {
        let mut q = yes_no();
        q.set_value(json!("YES")).unwrap();
        assert_eq!(q.value(), Some(&json!("Yes")));
    }

    #[test]
    fn option_mismatch_is_rejected() {
        let mut q = yes_no();
        assert!(q.set_value(json!("maybe")).is_err());
    }

    #[test]
    fn setting_value_clears_skipped() {
        let mut q = yes_no();
        q.skip().unwrap();
        assert!(q.is_skipped());
        q.set_value(json!("Yes")).unwrap();
        assert!(!q.is_skipped());
    }

    #[test]
    fn non_skippable_question_rejects_skip() {
        let mut q = Question::new("q1", "t", None, None, false, false).unwrap();
        assert!(q.skip().is_err());
    }

    #[test]
    fn spelling_sensitive_accepts_char_array_and_concatenates() {
        let mut q = Question::new("q1", "email", None, None, true, true).unwrap();
        let chars: Vec<Value> = "james@test.com".chars().map(|c| json!(c.to_string())).collect();
        q.set_value(Value::Array(chars)).unwrap();
        assert_eq!(q.value(), Some(&json!("james@test.com")));
    }

    #[test]
    fn spelling_sensitive_rejects_plain_string() {
        let mut q = Question::new("q1", "email", None, None, true, true).unwrap();
        let err = q.set_value(json!("james@test.com")).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }

    #[test]
    fn spelling_sensitive_rejects_wrong_length_element() {
        let mut q = Question::new("q1", "email", None, None, true, true).unwrap();
        let err = q.set_value(json!(["te"])).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }

    #[test]
    fn spelling_sensitive_rejects_non_string_element() {
        let mut q = Question::new("q1", "email", None, None, true, true).unwrap();
        let err = q.set_value(json!([1, 2, 3])).unwrap_err();
        assert!(matches!(err, BrokerError::TypeMismatch(_)));
    }
}
