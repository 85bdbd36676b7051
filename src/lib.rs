//! Realtime agent session broker.
//!
//! Mediates a single conversational session between a downstream user
//! connected over a bidirectional message channel and an upstream LLM
//! "realtime" service reached over a separate outbound channel: it runs
//! the upstream handshake, injects the initial system prompt and
//! questionnaire payload, advertises a tool catalog, and then bridges
//! both channels as a full-duplex relay while tracking session state.
//!
//! The four load-bearing pieces are [`session`] (the lifecycle state
//! machine and relay startup/teardown), [`event_bus`] (ordered handler
//! dispatch and predicate-based waiters), [`questionnaire`] (the typed
//! section/question tree and its visibility algebra), and [`relay`]
//! (the two concurrent bridging pumps). [`transport`] and [`connector`]
//! describe the Transport Port / Upstream Connector contracts the core
//! consumes without owning their concrete wire protocols.

pub mod connector;
pub mod error;
pub mod event_bus;
pub mod events;
pub mod questionnaire;
pub mod relay;
pub mod scaffolding;
pub mod session;
pub mod transport;

pub use error::BrokerError;
pub use event_bus::EventBus;
pub use events::{Event, HandlerToken};
pub use questionnaire::Questionnaire;
pub use scaffolding::{create_scaffolding, AgentScaffolding};
pub use session::{Session, SessionGuard, SessionOptions};
pub use transport::{BoxedPort, TransportPort};
