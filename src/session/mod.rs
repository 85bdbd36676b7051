//! Session core: the state machine, handshake choreography, relay
//! startup, and teardown.

pub mod config;

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;

use crate::connector::{UpstreamConnector, GLOBAL_CONNECTOR_REGISTRY};
use crate::error::BrokerError;
use crate::event_bus::EventBus;
use crate::relay::{pump_upstream_to_user, pump_user_to_upstream};
use crate::scaffolding::{create_scaffolding, AgentScaffolding};
use crate::transport::BoxedPort;
use config::BrokerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    New,
    Initializing,
    Active,
    Closed,
}

/// Thin wrapper tagging the upstream port with a diagnostic label, the
/// Rust analogue of the original's labeled WebSocket client wrapper.
struct UpstreamClient {
    label: String,
    port: BoxedPort,
}

impl UpstreamClient {
    async fn send(&self, message: Value) -> Result<(), BrokerError> {
        self.port.send(message).await
    }

    async fn receive(&self) -> Result<Value, BrokerError> {
        self.port.receive().await
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.port.close().await
    }
}

/// Options accepted by `Session::new`, mirroring the entity surface's
/// constructor keyword arguments.
#[derive(Default)]
pub struct SessionOptions {
    pub session_id: Option<String>,
    pub state: Option<Map<String, Value>>,
    pub metadata: Option<Map<String, Value>>,
    pub user_port: Option<BoxedPort>,
    pub config: Option<Value>,
    pub llm_config: Option<Value>,
    pub agent_scaffolding_config: Option<Value>,
    pub receive_timeout: Option<Duration>,
    pub connector: Option<Arc<dyn UpstreamConnector>>,
}

struct SessionInner {
    lifecycle: Lifecycle,
    state: Map<String, Value>,
    metadata: Map<String, Value>,
    updated_at: OffsetDateTime,
    user_port: Option<BoxedPort>,
    upstream: Option<UpstreamClient>,
    scaffolding: Option<Box<dyn AgentScaffolding>>,
    pump_handles: Vec<AbortHandle>,
    transport_error: Option<BrokerError>,
}

/// A single user↔upstream conversational session.
pub struct Session {
    pub id: String,
    pub created_at: OffsetDateTime,
    pub events: Arc<EventBus>,
    config: BrokerConfig,
    receive_timeout: Duration,
    default_connector: Option<Arc<dyn UpstreamConnector>>,
    inner: Mutex<SessionInner>,
}

impl Session {
    pub fn new(options: SessionOptions) -> Result<Arc<Self>, BrokerError> {
        let mut config = options.config.unwrap_or(Value::Object(Map::new()));
        if options.llm_config.is_some() || options.agent_scaffolding_config.is_some() {
            let map = config
                .as_object_mut()
                .ok_or_else(|| BrokerError::InvalidArgument("config must be a JSON object".into()))?;
            if let Some(llm) = options.llm_config {
                map.insert("llm".to_string(), llm);
            }
            if let Some(agent) = options.agent_scaffolding_config {
                map.insert("agent".to_string(), agent);
            }
        }

        let now = OffsetDateTime::now_utc();
        let id = options
            .session_id
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());

        let session = Arc::new(Self {
            id,
            created_at: now,
            events: EventBus::new(),
            config: BrokerConfig::new(config),
            receive_timeout: options.receive_timeout.unwrap_or(Duration::from_secs(5)),
            default_connector: options.connector,
            inner: Mutex::new(SessionInner {
                lifecycle: Lifecycle::New,
                state: options.state.unwrap_or_default(),
                metadata: options.metadata.unwrap_or_default(),
                updated_at: now,
                user_port: options.user_port,
                upstream: None,
                scaffolding: None,
                pump_handles: Vec::new(),
                transport_error: None,
            }),
        });

        // `EventBus` has no access to `Session`'s state, so it calls back
        // through this hook to touch `updated_at` after every dispatch,
        // matching `_touch()` at the end of the original's `emit`.
        let weak = Arc::downgrade(&session);
        session.events.set_touch_hook(Arc::new(move || {
            let weak = weak.clone();
            Box::pin(async move {
                if let Some(session) = weak.upgrade() {
                    session.inner.lock().await.updated_at = OffsetDateTime::now_utc();
                }
            })
        }));

        Ok(session)
    }

    pub async fn is_closed(&self) -> bool {
        self.inner.lock().await.lifecycle == Lifecycle::Closed
    }

    pub async fn transport_error(&self) -> Option<BrokerError> {
        self.inner.lock().await.transport_error.clone()
    }

    pub async fn updated_at(&self) -> OffsetDateTime {
        self.inner.lock().await.updated_at
    }

    // --- mapping-style state accessors -------------------------------

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.inner.lock().await.state.get(key).cloned()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.inner.lock().await.state.contains_key(key)
    }

    pub async fn set(&self, key: impl Into<String>, value: Value) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if inner.lifecycle == Lifecycle::Closed {
            return Err(BrokerError::SessionClosed);
        }
        inner.state.insert(key.into(), value);
        inner.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<Option<Value>, BrokerError> {
        let mut inner = self.inner.lock().await;
        if inner.lifecycle == Lifecycle::Closed {
            return Err(BrokerError::SessionClosed);
        }
        let removed = inner.state.remove(key);
        inner.updated_at = OffsetDateTime::now_utc();
        Ok(removed)
    }

    pub async fn setdefault(&self, key: impl Into<String>, default: Value) -> Result<Value, BrokerError> {
        let mut inner = self.inner.lock().await;
        if inner.lifecycle == Lifecycle::Closed {
            return Err(BrokerError::SessionClosed);
        }
        let key = key.into();
        if !inner.state.contains_key(&key) {
            inner.state.insert(key.clone(), default);
            inner.updated_at = OffsetDateTime::now_utc();
        }
        Ok(inner.state.get(&key).cloned().unwrap())
    }

    pub async fn update(&self, patch: Map<String, Value>) -> Result<(), BrokerError> {
        let mut inner = self.inner.lock().await;
        if inner.lifecycle == Lifecycle::Closed {
            return Err(BrokerError::SessionClosed);
        }
        inner.state.extend(patch);
        inner.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn state_snapshot(&self) -> Value {
        Value::Object(self.inner.lock().await.state.clone())
    }

    /// Build the deep-copied `session.update` snapshot sent to upstream.
    async fn session_snapshot(&self) -> Value {
        let inner = self.inner.lock().await;
        let mut snapshot = Map::new();
        snapshot.insert("id".into(), Value::String(self.id.clone()));
        snapshot.insert(
            "created_at".into(),
            Value::String(self.created_at.to_string()),
        );
        snapshot.insert("updated_at".into(), Value::String(inner.updated_at.to_string()));
        snapshot.insert("state".into(), Value::Object(inner.state.clone()));
        snapshot.insert("metadata".into(), Value::Object(inner.metadata.clone()));
        if let Some(llm) = self.config.llm() {
            snapshot.insert("llm".into(), llm.clone());
        }
        snapshot.insert("config".into(), self.config.raw().clone());
        let tools = inner
            .scaffolding
            .as_ref()
            .and_then(|s| s.tools())
            .cloned()
            .unwrap_or(Value::Null);
        snapshot.insert("tools".into(), tools);
        Value::Object(snapshot)
    }

    /// Run the handshake choreography. A no-op if already active.
    pub async fn initialize(self: &Arc<Self>) -> Result<(), BrokerError> {
        {
            let inner = self.inner.lock().await;
            match inner.lifecycle {
                Lifecycle::Active => return Ok(()),
                Lifecycle::Closed => return Err(BrokerError::SessionClosed),
                Lifecycle::Initializing => return Ok(()),
                Lifecycle::New => {}
            }
        }

        match self.run_handshake().await {
            Ok(()) => Ok(()),
            Err(err) => {
                // Any failure during the handshake choreography — not
                // just a handshake timeout — must leave the session
                // cleanly torn down rather than stuck mid-`Initializing`.
                self.close().await;
                Err(err)
            }
        }
    }

    async fn run_handshake(self: &Arc<Self>) -> Result<(), BrokerError> {
        let user_port = {
            let mut inner = self.inner.lock().await;
            let Some(port) = inner.user_port.clone() else {
                return Err(BrokerError::Session(
                    "initialize() requires a user transport port to be attached".into(),
                ));
            };
            inner.lifecycle = Lifecycle::Initializing;
            port
        };

        let connector = match GLOBAL_CONNECTOR_REGISTRY.resolve_override() {
            Some(legacy) => legacy,
            None => self.resolve_default_connector()?,
        };
        let upstream_port = connector.connect().await?;
        let upstream = UpstreamClient {
            label: "openai".to_string(),
            port: upstream_port,
        };

        let handshake = tokio::time::timeout(self.receive_timeout, upstream.receive())
            .await
            .map_err(|_| BrokerError::Session("handshake timed out waiting for upstream".into()))??;

        user_port.accept().await?;
        user_port.send(handshake).await?;

        let scaffolding = create_scaffolding(self.config.raw())?;

        let snapshot = {
            let mut inner = self.inner.lock().await;
            inner.scaffolding = Some(scaffolding);
            inner.upstream = Some(upstream);
            drop(inner);
            self.session_snapshot().await
        };
        self.upstream_send(serde_json::json!({"type": "session.update", "session": snapshot}))
            .await?;

        let state_view = self.state_snapshot().await;
        let mut content = Vec::new();
        {
            let inner = self.inner.lock().await;
            let scaffolding = inner.scaffolding.as_ref().expect("scaffolding just set");
            let initial_message = scaffolding.initial_message_template();
            if !initial_message.trim().is_empty() {
                content.push(serde_json::json!({
                    "type": "input_text",
                    "text": format!("<system>{initial_message}</system>"),
                }));
            }
            if let Some(rendered) = scaffolding.render_questionnaire(Some(&state_view))? {
                content.push(serde_json::json!({
                    "type": "input_text",
                    "text": format!("<questionnaire>{rendered}</questionnaire>"),
                }));
            }
        }

        if !content.is_empty() {
            self.upstream_send(serde_json::json!({
                "type": "conversation.item.create",
                "item": {"type": "message", "role": "user", "content": content},
            }))
            .await?;
            self.upstream_send(serde_json::json!({"type": "response.create"})).await?;
        }

        self.spawn_pumps(user_port).await?;

        {
            let mut inner = self.inner.lock().await;
            inner.lifecycle = Lifecycle::Active;
        }

        Ok(())
    }

    async fn spawn_pumps(self: &Arc<Self>, user_port: BoxedPort) -> Result<(), BrokerError> {
        let upstream_port = {
            let inner = self.inner.lock().await;
            inner
                .upstream
                .as_ref()
                .map(|u| Arc::clone(&u.port))
                .expect("upstream must be connected before spawning pumps")
        };

        let h_up = tokio::spawn(pump_upstream_to_user(Arc::clone(&upstream_port), Arc::clone(&user_port)));
        let h_down = tokio::spawn(pump_user_to_upstream(Arc::clone(&user_port), Arc::clone(&upstream_port)));

        // `close()` aborts the pumps directly through these abort
        // handles. A detached watcher per pump owns the `JoinHandle`
        // itself and reports the outcome back to the session; watching
        // from a separate task (rather than from inside the pump task)
        // means aborting the pump never also cancels the code path that
        // reacts to that abort.
        let abort_up = h_up.abort_handle();
        let abort_down = h_down.abort_handle();
        self.spawn_pump_watcher(h_up);
        self.spawn_pump_watcher(h_down);

        {
            let mut inner = self.inner.lock().await;
            inner.pump_handles.push(abort_up);
            inner.pump_handles.push(abort_down);
        }
        Ok(())
    }

    fn spawn_pump_watcher(self: &Arc<Self>, handle: tokio::task::JoinHandle<Result<(), BrokerError>>) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let result = match handle.await {
                Ok(result) => result,
                Err(join_err) if join_err.is_cancelled() => Ok(()),
                Err(join_err) => Err(BrokerError::Session(format!("relay pump panicked: {join_err}"))),
            };
            session.handle_pump_result(result).await;
        });
    }

    async fn handle_pump_result(self: &Arc<Self>, result: Result<(), BrokerError>) {
        if let Err(err) = result {
            if !matches!(err, BrokerError::UpstreamClosedOk) {
                let mut inner = self.inner.lock().await;
                if inner.transport_error.is_none() {
                    inner.transport_error = Some(err);
                }
            }
        }
        self.close().await;
    }

    async fn upstream_send(&self, message: Value) -> Result<(), BrokerError> {
        let inner = self.inner.lock().await;
        let upstream = inner
            .upstream
            .as_ref()
            .ok_or_else(|| BrokerError::Session("no upstream connection".into()))?;
        upstream.send(message).await
    }

    /// The connector to use absent a legacy override: whatever was
    /// injected via `SessionOptions::connector`, or else one built from
    /// `config.llm` on demand.
    fn resolve_default_connector(&self) -> Result<Arc<dyn UpstreamConnector>, BrokerError> {
        if let Some(connector) = &self.default_connector {
            return Ok(Arc::clone(connector));
        }
        let llm = self
            .config
            .llm()
            .ok_or_else(|| BrokerError::Session("no upstream connector configured and no llm config to build one from".into()))?;
        Ok(Arc::new(crate::connector::DefaultUpstreamConnector::new(llm)?))
    }

    /// Idempotent teardown: aborts the relay pumps, closes both ports
    /// best-effort, fails pending waiters, and clears the event
    /// registries.
    pub async fn close(self: &Arc<Self>) {
        let (handles, user_port, upstream) = {
            let mut inner = self.inner.lock().await;
            if inner.lifecycle == Lifecycle::Closed {
                return;
            }
            inner.lifecycle = Lifecycle::Closed;
            (
                std::mem::take(&mut inner.pump_handles),
                inner.user_port.take(),
                inner.upstream.take(),
            )
        };

        for handle in handles {
            handle.abort();
        }
        self.events.shutdown();
        if let Some(port) = user_port {
            let _ = port.close().await;
        }
        if let Some(client) = upstream {
            let _ = client.close().await;
        }
    }

    /// Return a guard whose `Drop` closes the session — the async
    /// context-manager equivalent.
    pub fn scoped(self: &Arc<Self>) -> SessionGuard {
        SessionGuard {
            session: Arc::clone(self),
        }
    }
}

/// Closes the wrapped session when dropped, so `let _guard = session.scoped();`
/// guarantees teardown even on an early return or panic unwind.
pub struct SessionGuard {
    session: Arc<Session>,
}

impl SessionGuard {
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        let session = Arc::clone(&self.session);
        tokio::spawn(async move {
            session.close().await;
        });
    }
}
