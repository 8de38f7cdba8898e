//! Relay transport capability: an opaque bidirectional text channel.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::TransportError;

/// Lifecycle and payload events arriving from the relay, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    Message(String),
    /// Remote side closed the connection.
    Closed,
    /// Transport failure; the connection is unusable afterwards.
    Error(String),
}

/// An open relay connection.
///
/// Dropping `outgoing` asks the transport to close the connection.
#[derive(Debug)]
pub struct RelayConnection {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<RelayEvent>,
}

#[async_trait]
pub trait RelayTransport: Send + Sync + 'static {
    /// Opens a connection; resolves once the transport is open.
    async fn open(&self, url: &str) -> Result<RelayConnection, TransportError>;
}
