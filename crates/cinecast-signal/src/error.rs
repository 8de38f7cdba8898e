//! Error taxonomy for the signaling core.
//!
//! Every failure is returned or reported as an event; errors that travel
//! inside events are `Clone`.

use std::path::PathBuf;

use thiserror::Error;

use crate::negotiation::NegotiationState;
use crate::types::SdpType;

/// Relay connect/send failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("a relay connection is already active")]
    AlreadyActive,
    #[error("relay channel is not connected")]
    NotConnected,
    #[error("failed to connect to relay: {0}")]
    Connect(String),
    #[error("failed to send to relay: {0}")]
    Send(String),
    #[error("relay connection lost: {0}")]
    Lost(String),
    #[error("relay channel closed while connecting")]
    Closed,
}

/// Malformed or unrecognized wire payload.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("unrecognized format")]
    Unrecognized,
}

#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("failed to serialize payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Remote description rejected by the current session state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApplyError {
    #[error("remote description not accepted before local offer is ready (state: {0})")]
    NotReady(NegotiationState),
    #[error("remote description already applied")]
    AlreadyApplied,
    #[error("expected an answer from the counterpart, got {0}")]
    WrongDirection(SdpType),
    #[error("media engine rejected remote description: {0}")]
    Rejected(String),
    #[error("session is closed")]
    Closed,
}

/// Camera or file acquisition failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CaptureError {
    #[error("capture unavailable: {0}")]
    Unavailable(String),
    #[error("failed to open {path}: {reason}")]
    File { path: PathBuf, reason: String },
    #[error("source produced no tracks")]
    NoTracks,
}

/// Fault reported by the media engine capability.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("media engine error: {0}")]
pub struct EngineError(pub String);

impl EngineError {
    pub fn new(msg: impl std::fmt::Display) -> Self {
        Self(msg.to_string())
    }
}

impl From<webrtc::Error> for EngineError {
    fn from(err: webrtc::Error) -> Self {
        Self::new(err)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NegotiationError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("at least one ICE server is required")]
    NoIceServers,
    #[error("cannot {op} in state {state}")]
    InvalidState {
        op: &'static str,
        state: NegotiationState,
    },
    #[error("engine produced no local description")]
    MissingLocalDescription,
    #[error("session closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ControllerError {
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("a session attempt is already active")]
    AlreadyActive,
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("failed to encode offer: {0}")]
    Encode(String),
    #[error(transparent)]
    Apply(#[from] ApplyError),
    #[error(transparent)]
    Capture(#[from] CaptureError),
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),
}

impl From<EncodeError> for ControllerError {
    fn from(err: EncodeError) -> Self {
        Self::Encode(err.to_string())
    }
}
