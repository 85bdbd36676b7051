//! Typed access over the session's otherwise-arbitrary JSON config, per
//! the recognized keys table.

use serde_json::{Map, Value};

/// Thin, validating wrapper over the session's config mapping. Holds no
/// behavior beyond the accessors the recognized keys table calls for —
/// reading env vars or files stays a host responsibility.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    raw: Value,
}

impl BrokerConfig {
    pub fn new(raw: Value) -> Self {
        Self { raw }
    }

    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn llm(&self) -> Option<&Value> {
        self.raw.get("llm")
    }

    pub fn agent(&self) -> Value {
        self.raw
            .get("agent")
            .cloned()
            .unwrap_or(Value::Object(Map::new()))
    }
}
