use std::any::Any;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Negotiation posture of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Offers local media (broadcaster).
    Publisher,
    /// Requests to receive media (viewer).
    Subscriber,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publisher => write!(f, "publisher"),
            Self::Subscriber => write!(f, "subscriber"),
        }
    }
}

/// Where a publisher's tracks come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaSource {
    Camera,
    File,
}

/// Source selection handed to the controller, carrying what acquisition needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceConfig {
    Camera,
    File(PathBuf),
}

impl SourceConfig {
    pub fn kind(&self) -> MediaSource {
        match self {
            Self::Camera => MediaSource::Camera,
            Self::File(_) => MediaSource::File,
        }
    }
}

/// Session description kind, serialized lowercase as in `{"type": "offer"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    /// Proposal from the side that starts negotiation
    Offer,
    /// Provisional answer; may still be replaced by a final one
    Pranswer,
    /// Final answer to an offer
    Answer,
    /// Revert to the last stable description
    Rollback,
}

impl fmt::Display for SdpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Offer => "offer",
            Self::Pranswer => "pranswer",
            Self::Answer => "answer",
            Self::Rollback => "rollback",
        };
        f.write_str(s)
    }
}

/// A session description as spoken by the media engines: `{type, sdp}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => write!(f, "audio"),
            Self::Video => write!(f, "video"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransceiverDirection {
    /// Send and receive media
    SendRecv,
    /// Send only
    SendOnly,
    /// Receive only; used for subscriber placeholders
    RecvOnly,
    /// Negotiated but carrying no media
    Inactive,
}

/// A captured local track. `handle` is the engine-specific track object.
#[derive(Clone)]
pub struct LocalTrack {
    pub id: String,
    pub kind: MediaKind,
    pub handle: Arc<dyn Any + Send + Sync>,
}

impl LocalTrack {
    pub fn new(id: impl Into<String>, kind: MediaKind, handle: Arc<dyn Any + Send + Sync>) -> Self {
        Self {
            id: id.into(),
            kind,
            handle,
        }
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A track announced by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
    pub stream_id: String,
}

/// A discovered network candidate, opaque to the signaling layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
}

/// Aggregate transport state reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    /// Created, no transport activity yet
    New,
    /// ICE or DTLS handshake in progress
    Connecting,
    /// Media transport established
    Connected,
    /// Connectivity lost; may recover on its own
    Disconnected,
    /// Connectivity lost for good
    Failed,
    /// Closed locally
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// ICE agent state reported by the media engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    /// Gathering or waiting for remote candidates
    New,
    /// Checking candidate pairs
    Checking,
    /// A usable pair was found; checks may continue
    Connected,
    /// Checks finished with a selected pair
    Completed,
    /// Consent checks failing; may recover
    Disconnected,
    /// No usable pair
    Failed,
    /// Agent shut down
    Closed,
}

impl fmt::Display for IceConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Checking => "checking",
            Self::Connected => "connected",
            Self::Completed => "completed",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}
