#![forbid(unsafe_code)]
//! Cinecast signaling core.
//!
//! Connects a publisher or subscriber to a rendezvous relay, negotiates a
//! media session through a single finalized offer and its answer, and tears
//! everything down on request.

pub mod capture;
pub mod channel;
pub mod codec;
pub mod controller;
pub mod engine;
pub mod error;
pub mod negotiation;
pub mod notify;
pub mod rtc;
pub mod transport;
pub mod types;
pub mod ws;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use channel::{ConnectionStatus, SignalingChannel};
pub use codec::{decode_payload, decode_remote, encode_offer, Action, Envelope, WireFormat};
pub use controller::{AttemptInfo, ControllerEvent, SessionController};
pub use engine::{EngineEvent, MediaEngine, MediaSession, SessionConfig};
pub use error::{
    ApplyError, CaptureError, ControllerError, DecodeError, EncodeError, EngineError,
    NegotiationError, TransportError,
};
pub use negotiation::{NegotiationSession, NegotiationState, SessionEvent};
pub use types::{
    IceCandidate, LocalTrack, MediaKind, MediaSource, RemoteTrack, Role, SdpType,
    SessionDescription, SourceConfig,
};
