//! Scaffolding: builds the initial system-message template, the
//! questionnaire payload, and the tool catalog for a session.

use parking_lot::Mutex;
use serde_json::Value;

use crate::error::BrokerError;
use crate::questionnaire::Questionnaire;

/// Per-session object that renders the initial prompt, the
/// questionnaire payload, and the tool catalog.
pub trait AgentScaffolding: Send + Sync {
    fn initial_message_template(&self) -> &str;
    fn render_questionnaire(&self, state: Option<&Value>) -> Result<Option<String>, BrokerError>;
    fn tools(&self) -> Option<&Value>;

    /// Eagerly prime the questionnaire cache. Default implementation
    /// just renders once and discards the result.
    fn build_questionnaire(&self, state: Option<&Value>) -> Result<Option<String>, BrokerError> {
        self.render_questionnaire(state)
    }
}

/// The only scaffolding variant this crate defines: a template-driven
/// initial message plus a `Questionnaire` payload.
pub struct QuestionnaireAgentScaffolding {
    template: String,
    questionnaire: Questionnaire,
    tools: Option<Value>,
    cache: Mutex<Option<(Option<Value>, Option<String>)>>,
}

pub const DEFAULT_QUESTIONNAIRE_TEMPLATE: &str =
    "Please complete the following questionnaire before we continue.";

impl QuestionnaireAgentScaffolding {
    pub fn new(template: String, questionnaire: Questionnaire, tools: Option<Value>) -> Self {
        Self {
            template,
            questionnaire,
            tools,
            cache: Mutex::new(None),
        }
    }

    pub fn questionnaire(&self) -> &Questionnaire {
        &self.questionnaire
    }

    pub fn questionnaire_mut(&mut self) -> &mut Questionnaire {
        &mut self.questionnaire
    }
}

impl AgentScaffolding for QuestionnaireAgentScaffolding {
    fn initial_message_template(&self) -> &str {
        &self.template
    }

    fn render_questionnaire(&self, state: Option<&Value>) -> Result<Option<String>, BrokerError> {
        let mut cache = self.cache.lock();

        // A `None` state means "use defaults", not "invalidate the
        // cache" — if anything is cached, reuse it.
        if state.is_none() {
            if let Some((_, rendered)) = cache.as_ref() {
                return Ok(rendered.clone());
            }
        } else if let Some((cached_state, rendered)) = cache.as_ref() {
            if cached_state.as_deref() == state {
                return Ok(rendered.clone());
            }
        }

        let rendered = self.questionnaire.render(state)?;
        *cache = Some((state.cloned(), rendered.clone()));
        Ok(rendered)
    }

    fn tools(&self) -> Option<&Value> {
        self.tools.as_ref()
    }
}

fn normalise_tools_config(tools: Option<&Value>) -> Option<Value> {
    match tools {
        None => None,
        Some(Value::Array(items)) => Some(Value::Array(items.clone())),
        Some(single @ Value::Object(_)) => Some(Value::Array(vec![single.clone()])),
        Some(other) => Some(other.clone()),
    }
}

/// Build a scaffolding instance from the `agent` submapping of a
/// session's config. A blank `initial_message_template` is treated as
/// absent. A bare-string `agent.questionnaire` is treated as the
/// template when no explicit `questionnaire_template` is given.
pub fn create_scaffolding(config: &Value) -> Result<Box<dyn AgentScaffolding>, BrokerError> {
    let agent = config.get("agent").cloned().unwrap_or(Value::Object(Default::default()));
    let agent_type = agent
        .get("type")
        .and_then(Value::as_str)
        .unwrap_or("questionnaire");
    if agent_type != "questionnaire" {
        return Err(BrokerError::InvalidArgument(format!(
            "unknown agent scaffolding type {agent_type:?}"
        )));
    }

    let template = agent
        .get("initial_message_template")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or("")
        .to_string();

    let questionnaire_template = agent
        .get("questionnaire_template")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string);

    let bare_questionnaire = agent.get("questionnaire");

    let (template_str, schema) = match (questionnaire_template, bare_questionnaire) {
        (Some(t), _) => (Some(t), None),
        (None, Some(Value::String(s))) if !s.trim().is_empty() => (Some(s.clone()), None),
        (None, Some(other @ (Value::Object(_) | Value::Array(_)))) => (None, Some(other.clone())),
        _ => (None, None),
    };

    let fallback_prompt = agent
        .get("fallback_prompt")
        .and_then(Value::as_str)
        .map(str::to_string);

    let questionnaire = Questionnaire::new(template_str, schema, fallback_prompt)?;
    let tools = normalise_tools_config(agent.get("tools"));

    Ok(Box::new(QuestionnaireAgentScaffolding::new(
        template,
        questionnaire,
        tools,
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blank_initial_message_template_is_treated_as_absent() {
        let scaffolding = create_scaffolding(&json!({
            "agent": {"type": "questionnaire", "initial_message_template": "   "}
        }))
        .unwrap();
        assert_eq!(scaffolding.initial_message_template(), "");
    }

    #[test]
    fn bare_string_questionnaire_is_treated_as_template() {
        let scaffolding = create_scaffolding(&json!({
            "agent": {"type": "questionnaire", "questionnaire": "Questionnaire for {{ state.branch_name }}"}
        }))
        .unwrap();
        let rendered = scaffolding
            .render_questionnaire(Some(&json!({"branch_name": "HQ"})))
            .unwrap();
        assert_eq!(rendered, Some("Questionnaire for HQ".to_string()));
    }

    #[test]
    fn explicit_questionnaire_template_wins_over_bare_string() {
        let scaffolding = create_scaffolding(&json!({
            "agent": {
                "type": "questionnaire",
                "questionnaire": "ignored",
                "questionnaire_template": "from template",
            }
        }))
        .unwrap();
        assert_eq!(scaffolding.render_questionnaire(None).unwrap(), Some("from template".to_string()));
    }

    #[test]
    fn tools_mapping_is_normalised_into_a_single_element_list() {
        let scaffolding = create_scaffolding(&json!({
            "agent": {"type": "questionnaire", "tools": {"type": "function", "name": "search"}}
        }))
        .unwrap();
        assert_eq!(scaffolding.tools().unwrap().as_array().unwrap().len(), 1);
    }

    #[test]
    fn unknown_agent_type_is_rejected() {
        let err = create_scaffolding(&json!({"agent": {"type": "freeform"}})).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument(_)));
    }

    #[test]
    fn render_questionnaire_reuses_cache_for_equal_state() {
        let scaffolding = create_scaffolding(&json!({
            "agent": {"type": "questionnaire", "questionnaire": "Hi {{ state.name }}"}
        }))
        .unwrap();
        let state = json!({"name": "Ana"});
        let first = scaffolding.render_questionnaire(Some(&state)).unwrap();
        let second = scaffolding.render_questionnaire(Some(&state)).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn render_questionnaire_with_none_state_reuses_last_cache() {
        let scaffolding = create_scaffolding(&json!({
            "agent": {"type": "questionnaire", "questionnaire": "Hi {{ state.name }}"}
        }))
        .unwrap();
        let state = json!({"name": "Ana"});
        let first = scaffolding.render_questionnaire(Some(&state)).unwrap();
        let reused = scaffolding.render_questionnaire(None).unwrap();
        assert_eq!(first, reused);
    }
}
