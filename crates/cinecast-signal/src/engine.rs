//! Media engine capability consumed by the negotiation state machine.
//!
//! The engine owns codec negotiation, ICE and transport. The signaling core
//! only drives it through [`MediaSession`] and listens to its ordered
//! [`EngineEvent`] stream.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::EngineError;
use crate::types::{
    IceCandidate, IceConnectionState, LocalTrack, MediaKind, PeerConnectionState, RemoteTrack,
    SessionDescription, TransceiverDirection,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Rendezvous (STUN/TURN) server URLs. Must not be empty.
    pub ice_servers: Vec<String>,
    /// Subscribers also request an audio track.
    pub receive_audio: bool,
}

impl SessionConfig {
    pub fn new(ice_servers: Vec<String>) -> Self {
        Self {
            ice_servers,
            receive_audio: true,
        }
    }
}

impl From<&cinecast_common::SignalingConfig> for SessionConfig {
    fn from(config: &cinecast_common::SignalingConfig) -> Self {
        Self::new(config.ice_servers.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// A discovered candidate, or `None` once gathering is complete.
    Candidate(Option<IceCandidate>),
    Track(RemoteTrack),
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
}

/// A freshly created media session and the receiving end of its events.
pub struct SessionHandle {
    pub session: Arc<dyn MediaSession>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    async fn create_session(&self, config: &SessionConfig) -> Result<SessionHandle, EngineError>;
}

#[async_trait]
pub trait MediaSession: Send + Sync {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), EngineError>;

    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<(), EngineError>;

    async fn create_offer(&self) -> Result<SessionDescription, EngineError>;

    /// Starts candidate gathering.
    async fn set_local_description(&self, description: SessionDescription)
        -> Result<(), EngineError>;

    /// Current local description, including every candidate gathered so far.
    async fn local_description(&self) -> Result<Option<SessionDescription>, EngineError>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError>;

    async fn close(&self) -> Result<(), EngineError>;
}
