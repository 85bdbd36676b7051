//! A questionnaire section: an ordered group of questions gated by an
//! optional visibility condition.

use serde_json::{Map, Value};

use super::condition::Condition;
use super::question::Question;
use crate::error::BrokerError;

#[derive(Debug, Clone)]
pub struct Section {
    pub section_id: String,
    pub section_name: String,
    pub section_description: Option<String>,
    pub condition: Option<Condition>,
    questions: Vec<Question>,
}

impl Section {
    pub fn new(
        section_id: impl Into<String>,
        section_name: impl Into<String>,
        section_description: Option<String>,
        condition: Option<Condition>,
    ) -> Self {
        Self {
            section_id: section_id.into(),
            section_name: section_name.into(),
            section_description,
            condition,
            questions: Vec::new(),
        }
    }

    pub fn questions(&self) -> &[Question] {
        &self.questions
    }

    pub fn add_question(&mut self, question: Question) -> Result<&mut Question, BrokerError> {
        if self.questions.iter().any(|q| q.question_id == question.question_id) {
            return Err(BrokerError::InvalidArgument(format!(
                "duplicate question id {:?} in section {:?}",
                question.question_id, self.section_id
            )));
        }
        self.questions.push(question);
        Ok(self.questions.last_mut().unwrap())
    }

    pub fn get_question(&self, question_id: &str) -> Option<&Question> {
        self.questions.iter().find(|q| q.question_id == question_id)
    }

    pub fn get_question_mut(&mut self, question_id: &str) -> Option<&mut Question> {
        self.questions.iter_mut().find(|q| q.question_id == question_id)
    }

    /// A section with no questions is never completed; otherwise every
    /// non-skipped question must carry a value.
    pub fn is_completed(&self) -> bool {
        if self.questions.is_empty() {
            return false;
        }
        self.questions.iter().all(|q| q.is_skipped() || q.value().is_some())
    }

    pub fn to_mapping(&self) -> Value {
        let mut map = Map::new();
        map.insert("section_id".into(), Value::String(self.section_id.clone()));
        map.insert("section_name".into(), Value::String(self.section_name.clone()));
        map.insert(
            "section_description".into(),
            self.section_description.clone().map(Value::String).unwrap_or(Value::Null),
        );
        map.insert(
            "questions".into(),
            Value::Array(self.questions.iter().map(Question::to_mapping).collect()),
        );
        Value::Object(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn question(id: &str) -> Question {
        Question::new(id, "text", None, None, true, false).unwrap()
    }

    #[test]
    fn empty_section_is_never_completed() {
        let section = Section::new("s1", "Section 1", None, None);
        assert!(!section.is_completed());
    }

    #[test]
    fn completed_requires_every_non_skipped_question_answered() {
        let mut section = Section::new("s1", "Section 1", None, None);
        section.add_question(question("q1")).unwrap();
        section.add_question(question("q2")).unwrap();
        assert!(!section.is_completed());

        section.get_question_mut("q1").unwrap().set_value(serde_json::json!("a")).unwrap();
        assert!(!section.is_completed());

        section.get_question_mut("q2").unwrap().skip().unwrap();
        assert!(section.is_completed());
    }

    #[test]
    fn duplicate_question_id_is_rejected() {
        let mut section = Section::new("s1", "Section 1", None, None);
        section.add_question(question("q1")).unwrap();
        assert!(section.add_question(question("q1")).is_err());
    }
}
