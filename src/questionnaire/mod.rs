//! Questionnaire domain model: sections, questions, the visibility
//! algebra, and rendering into a prompt-ready string.

pub mod condition;
pub mod question;
pub mod section;

use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};

use crate::error::BrokerError;
use condition::Condition;
use question::Question;
use section::Section;

/// Sorts object keys recursively so two structurally-equal values
/// serialize identically regardless of insertion order.
fn canonical(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted: Vec<(&String, &Value)> = map.iter().collect();
            sorted.sort_by(|a, b| a.0.cmp(b.0));
            let mut out = Map::new();
            for (k, v) in sorted {
                out.insert(k.clone(), canonical(v));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonical).collect()),
        other => other.clone(),
    }
}

pub struct Questionnaire {
    pub template: Option<String>,
    pub schema: Option<Value>,
    pub fallback_prompt: Option<String>,
    sections: Vec<Section>,
}

impl Questionnaire {
    pub fn new(
        template: Option<String>,
        schema: Option<Value>,
        fallback_prompt: Option<String>,
    ) -> Result<Self, BrokerError> {
        if let Some(t) = &template {
            if t.trim().is_empty() && schema.is_none() && fallback_prompt.is_none() {
                // an all-blank questionnaire is legal; render() degrades to None
            }
        }
        Ok(Self {
            template,
            schema,
            fallback_prompt,
            sections: Vec::new(),
        })
    }

    pub fn sections(&self) -> &[Section] {
        &self.sections
    }

    pub fn add_section(
        &mut self,
        section_id: impl Into<String>,
        section_name: impl Into<String>,
        section_description: Option<String>,
        condition: Option<Value>,
    ) -> Result<&mut Section, BrokerError> {
        let section_id = section_id.into();
        if self.sections.iter().any(|s| s.section_id == section_id) {
            return Err(BrokerError::InvalidArgument(format!(
                "duplicate section id {section_id:?}"
            )));
        }
        let condition = condition.as_ref().map(Condition::from_value).transpose()?;
        self.sections
            .push(Section::new(section_id, section_name, section_description, condition));
        Ok(self.sections.last_mut().unwrap())
    }

    fn section_mut(&mut self, section_id: &str) -> Result<&mut Section, BrokerError> {
        self.sections
            .iter_mut()
            .find(|s| s.section_id == section_id)
            .ok_or_else(|| BrokerError::InvalidArgument(format!("unknown section {section_id:?}")))
    }

    pub fn section(&self, section_id: &str) -> Option<&Section> {
        self.sections.iter().find(|s| s.section_id == section_id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn add_question(
        &mut self,
        section_id: &str,
        question_id: impl Into<String>,
        question_text: impl Into<String>,
        question_type: Option<String>,
        question_options: Option<Vec<String>>,
        skippable: bool,
        spelling_sensitive: bool,
    ) -> Result<(), BrokerError> {
        let question = Question::new(
            question_id,
            question_text,
            question_type,
            question_options,
            skippable,
            spelling_sensitive,
        )?;
        self.section_mut(section_id)?.add_question(question)?;
        Ok(())
    }

    fn split_address(address: &str) -> Result<(&str, &str), BrokerError> {
        let mut parts = address.splitn(2, '.');
        let section_id = parts.next().unwrap_or("");
        let question_id = parts.next().unwrap_or("");
        if section_id.is_empty() || question_id.is_empty() || address.matches('.').count() != 1 {
            return Err(BrokerError::InvalidArgument(format!(
                "{address:?} must have exactly one non-empty \"section.question\" separator"
            )));
        }
        Ok((section_id, question_id))
    }

    pub fn get(&self, dotted: &str) -> Result<&Question, BrokerError> {
        let (section_id, question_id) = Self::split_address(dotted)?;
        self.section(section_id)
            .and_then(|s| s.get_question(question_id))
            .ok_or_else(|| BrokerError::InvalidArgument(format!("unknown question {dotted:?}")))
    }

    fn get_mut(&mut self, dotted: &str) -> Result<&mut Question, BrokerError> {
        let (section_id, question_id) = Self::split_address(dotted)?;
        self.section_mut(section_id)?
            .get_question_mut(question_id)
            .ok_or_else(|| BrokerError::InvalidArgument(format!("unknown question {dotted:?}")))
    }

    pub fn set_answer(&mut self, dotted: &str, value: Value) -> Result<(), BrokerError> {
        self.get_mut(dotted)?.set_value(value)
    }

    pub fn clear_question(&mut self, dotted: &str) -> Result<(), BrokerError> {
        self.get_mut(dotted)?.clear_value();
        Ok(())
    }

    pub fn skip_question(&mut self, dotted: &str) -> Result<(), BrokerError> {
        self.get_mut(dotted)?.skip()
    }

    pub fn unskip_question(&mut self, dotted: &str) -> Result<(), BrokerError> {
        self.get_mut(dotted)?.unskip();
        Ok(())
    }

    /// Resolve a single section's visibility, memoizing results and
    /// breaking cycles by treating a re-entered section as not visible
    /// for the inner call (the outer call still completes normally).
    fn resolve(&self, section_id: &str, memo: &mut HashMap<String, bool>, stack: &mut HashSet<String>) -> bool {
        if let Some(cached) = memo.get(section_id) {
            return *cached;
        }
        if stack.contains(section_id) {
            return false;
        }
        let Some(section) = self.section(section_id) else {
            return false;
        };
        stack.insert(section_id.to_string());
        let result = match &section.condition {
            None => true,
            Some(cond) => self.evaluate(cond, memo, stack),
        };
        stack.remove(section_id);
        memo.insert(section_id.to_string(), result);
        result
    }

    fn evaluate(&self, condition: &Condition, memo: &mut HashMap<String, bool>, stack: &mut HashSet<String>) -> bool {
        match condition {
            Condition::And(items) => {
                !items.is_empty() && items.iter().all(|c| self.evaluate(c, memo, stack))
            }
            Condition::Or(items) => items.iter().any(|c| self.evaluate(c, memo, stack)),
            Condition::Not(inner) => !self.evaluate(inner, memo, stack),
            Condition::Visible(section_id) => self.resolve(section_id, memo, stack),
            Condition::Completed(section_id) => {
                self.section(section_id).map(Section::is_completed).unwrap_or(false)
            }
            Condition::Always(value) => *value,
        }
    }

    pub fn get_visible_sections(&self) -> Vec<&Section> {
        let mut memo = HashMap::new();
        let mut stack = HashSet::new();
        self.sections
            .iter()
            .filter(|s| self.resolve(&s.section_id, &mut memo, &mut stack))
            .collect()
    }

    fn sections_payload(&self) -> Value {
        Value::Object(Map::from_iter([(
            "sections".to_string(),
            Value::Array(
                self.get_visible_sections()
                    .into_iter()
                    .map(Section::to_mapping)
                    .collect(),
            ),
        )]))
    }

    /// The `questionnaire` payload handed to templates and serialized
    /// for tier 2/3 rendering: the schema if one is configured, else the
    /// visible-sections mapping if any sections exist, else nothing.
    fn questionnaire_payload(&self) -> Option<Value> {
        if let Some(schema) = &self.schema {
            Some(schema.clone())
        } else if !self.sections.is_empty() {
            Some(self.sections_payload())
        } else {
            None
        }
    }

    /// Render the questionnaire for injection into the initial prompt.
    /// See module docs for the four-tier fallback strategy.
    pub fn render(&self, state: Option<&Value>) -> Result<Option<String>, BrokerError> {
        if let Some(template) = &self.template {
            if !template.trim().is_empty() {
                let mut env = minijinja::Environment::new();
                env.add_template("questionnaire", template)?;
                let tmpl = env.get_template("questionnaire")?;
                let context = minijinja::context! {
                    state => state.cloned().unwrap_or(Value::Object(Map::new())),
                    questionnaire => self.questionnaire_payload().unwrap_or(Value::Object(Map::new())),
                };
                let rendered = tmpl.render(context)?;
                let trimmed = rendered.trim();
                return Ok(if trimmed.is_empty() {
                    None
                } else {
                    Some(trimmed.to_string())
                });
            }
        }

        if let Some(payload) = self.questionnaire_payload() {
            return Ok(Some(serde_json::to_string(&canonical(&payload))?));
        }

        if let Some(prompt) = &self.fallback_prompt {
            if !prompt.trim().is_empty() {
                let agent_name = state
                    .and_then(|s| s.get("agent_name"))
                    .and_then(Value::as_str)
                    .unwrap_or("our team");
                let branch_name = state
                    .and_then(|s| s.get("branch_name"))
                    .and_then(Value::as_str)
                    .unwrap_or("our branch");
                return Ok(Some(format!(
                    "{prompt} Agent: {agent_name}, Branch: {branch_name}."
                )));
            }
        }

        Ok(None)
    }
}
