//! Upstream Connector contract and the process-wide legacy-shim registry.

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::BrokerError;
use crate::transport::{BoxedPort, TungsteniteWebSocketPort};

/// A zero-argument asynchronous factory producing a Transport Port
/// connected to the upstream LLM realtime endpoint. Owns URL
/// composition and credential handling; the session core only ever
/// calls `connect`.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self) -> Result<BoxedPort, BrokerError>;
}

/// Reference connector: composes a `wss://` URL from `model`/`root_url`
/// config fields and attaches a bearer header from `api_key`.
///
/// This is intentionally generic — it targets any `.../realtime`-shaped
/// WebSocket endpoint rather than one specific vendor's API.
pub struct DefaultUpstreamConnector {
    root_url: String,
    model: String,
    api_key: Option<String>,
}

impl DefaultUpstreamConnector {
    pub fn new(llm_config: &Value) -> Result<Self, BrokerError> {
        let model = llm_config
            .get("model")
            .and_then(Value::as_str)
            .ok_or_else(|| BrokerError::Session("llm.model is required to connect upstream".into()))?
            .to_string();
        let root_url = llm_config
            .get("root_url")
            .and_then(Value::as_str)
            .unwrap_or("wss://api.openai.com/v1/realtime")
            .to_string();
        let api_key = llm_config
            .get("api_key")
            .and_then(Value::as_str)
            .map(str::to_string);
        Ok(Self {
            root_url,
            model,
            api_key,
        })
    }

    fn build_url(&self) -> Result<url::Url, BrokerError> {
        let mut url = url::Url::parse(&self.root_url)
            .map_err(|e| BrokerError::Session(format!("invalid upstream root_url: {e}")))?;
        match url.scheme() {
            "http" => url.set_scheme("ws").ok(),
            "https" => url.set_scheme("wss").ok(),
            _ => None,
        };
        url.query_pairs_mut().append_pair("model", &self.model);
        Ok(url)
    }
}

#[async_trait]
impl UpstreamConnector for DefaultUpstreamConnector {
    async fn connect(&self) -> Result<BoxedPort, BrokerError> {
        let url = self.build_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| BrokerError::Session(format!("invalid upstream request: {e}")))?;
        if let Some(key) = &self.api_key {
            request.headers_mut().insert(
                "Authorization",
                format!("Bearer {key}")
                    .parse()
                    .map_err(|e| BrokerError::Session(format!("invalid api key header: {e}")))?,
            );
        }
        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| BrokerError::Session(format!("upstream connect failed: {e}")))?;
        Ok(Arc::new(TungsteniteWebSocketPort::new(stream, "upstream")))
    }
}

use tokio_tungstenite::tungstenite::client::IntoClientRequest;

/// Process-wide registry allowing a legacy-compatible connector to be
/// substituted for the default at runtime, and restored afterward.
///
/// This is the only form of monkey-patching the core supports: `register`
/// swaps in an override and returns whatever override (if any) was
/// previously installed, so callers can restore it later.
pub struct ConnectorRegistry {
    legacy: parking_lot::Mutex<Option<Arc<dyn UpstreamConnector>>>,
}

impl ConnectorRegistry {
    pub const fn new() -> Self {
        Self {
            legacy: parking_lot::Mutex::new(None),
        }
    }

    /// Install `connector` as the legacy override. Returns whatever
    /// override was previously installed, if any.
    pub fn register(
        &self,
        connector: Arc<dyn UpstreamConnector>,
    ) -> Option<Arc<dyn UpstreamConnector>> {
        self.legacy.lock().replace(connector)
    }

    /// Remove the legacy override, if any, returning it.
    pub fn unregister(&self) -> Option<Arc<dyn UpstreamConnector>> {
        self.legacy.lock().take()
    }

    /// Resolve the connector to use: the legacy override if present,
    /// else `default`.
    pub fn resolve(&self, default: Arc<dyn UpstreamConnector>) -> Arc<dyn UpstreamConnector> {
        self.legacy.lock().clone().unwrap_or(default)
    }

    /// The legacy override, if one is currently installed, without
    /// requiring a caller to already have a default connector in hand.
    pub fn resolve_override(&self) -> Option<Arc<dyn UpstreamConnector>> {
        self.legacy.lock().clone()
    }
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide registry consulted by `Session::initialize` before
/// falling back to its own default connector — the Rust expression of
/// "a process-wide registration function returning the previous
/// connector".
pub static GLOBAL_CONNECTOR_REGISTRY: ConnectorRegistry = ConnectorRegistry::new();
