//! The two concurrent relay pumps started once a session is active.
//!
//! Grounded in `acp/websocket.rs::handle_websocket_connection`'s
//! split-sender/split-receiver task pair: each direction is its own
//! loop, run as its own task, so a stall in one direction never blocks
//! the other.

use crate::error::BrokerError;
use crate::transport::BoxedPort;

/// `upstream.receive() -> user.send()`, forever, until either side
/// errors (including a graceful upstream close, surfaced as
/// `BrokerError::UpstreamClosedOk`).
pub async fn pump_upstream_to_user(upstream: BoxedPort, user: BoxedPort) -> Result<(), BrokerError> {
    loop {
        let message = upstream.receive().await?;
        user.send(message).await?;
    }
}

/// `user.receive() -> upstream.send()`, forever, until either side
/// errors.
pub async fn pump_user_to_upstream(user: BoxedPort, upstream: BoxedPort) -> Result<(), BrokerError> {
    loop {
        let message = user.receive().await?;
        upstream.send(message).await?;
    }
}
