//! Structured error type for the broker crate.
//!
//! Every variant maps to one of the error kinds in the broker specification
//! (session-closed, session-error, event-handler-error, aggregate-dispatch-error,
//! invalid-argument, type-error, timeout, upstream-closed-ok).

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// One handler failure captured during a single `emit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventHandlerErrorDetail {
    pub event: String,
    pub callback: String,
    pub original: String,
}

impl std::fmt::Display for EventHandlerErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "handler {} failed while processing event {:?}: {}",
            self.callback, self.event, self.original
        )
    }
}

/// Structured, serializable error type for the broker crate.
#[derive(Debug, Error, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum BrokerError {
    #[error("session is closed")]
    SessionClosed,

    #[error("session error: {0}")]
    Session(String),

    #[error("{} error(s) occurred while dispatching an event", .0.len())]
    AggregateDispatch(Vec<EventHandlerErrorDetail>),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("type error: {0}")]
    TypeMismatch(String),

    #[error("failed to render template: {0}")]
    RenderError(String),

    #[error("operation timed out")]
    Timeout,

    #[error("upstream closed the connection gracefully")]
    UpstreamClosedOk,
}

impl From<minijinja::Error> for BrokerError {
    fn from(e: minijinja::Error) -> Self {
        BrokerError::RenderError(e.to_string())
    }
}

impl From<serde_json::Error> for BrokerError {
    fn from(e: serde_json::Error) -> Self {
        BrokerError::TypeMismatch(e.to_string())
    }
}
