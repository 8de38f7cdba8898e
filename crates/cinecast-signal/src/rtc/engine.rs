use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine as RtcMediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::RTCRtpTransceiverInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;

use crate::engine::{EngineEvent, MediaEngine, MediaSession, SessionConfig, SessionHandle};
use crate::error::EngineError;
use crate::types::{
    IceCandidate, IceConnectionState, LocalTrack, MediaKind, PeerConnectionState, RemoteTrack,
    SessionDescription, TransceiverDirection,
};

/// Media engine backed by `webrtc-rs` with its default codecs and interceptors.
pub struct WebRtcEngine {
    api: API,
}

impl WebRtcEngine {
    pub fn new() -> Result<Self, EngineError> {
        let mut m = RtcMediaEngine::default();
        m.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut m)?;
        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();
        Ok(Self { api })
    }
}

#[async_trait]
impl MediaEngine for WebRtcEngine {
    async fn create_session(&self, config: &SessionConfig) -> Result<SessionHandle, EngineError> {
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await?);
        let (tx, events) = mpsc::unbounded_channel();
        install_callbacks(&pc, tx);
        debug!("Created peer connection");

        Ok(SessionHandle {
            session: Arc::new(WebRtcSession { pc }),
            events,
        })
    }
}

fn install_callbacks(pc: &RTCPeerConnection, tx: mpsc::UnboundedSender<EngineEvent>) {
    let candidates = tx.clone();
    pc.on_ice_candidate(Box::new(move |c| {
        let event = match c {
            Some(candidate) => match candidate.to_json() {
                Ok(init) => Some(EngineEvent::Candidate(Some(IceCandidate {
                    candidate: init.candidate,
                }))),
                Err(e) => {
                    warn!("Failed to serialize ICE candidate: {}", e);
                    None
                }
            },
            None => Some(EngineEvent::Candidate(None)),
        };
        if let Some(event) = event {
            let _ = candidates.send(event);
        }
        Box::pin(async {})
    }));

    let states = tx.clone();
    pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
        let _ = states.send(EngineEvent::ConnectionState(peer_state(s)));
        Box::pin(async {})
    }));

    let ice_states = tx.clone();
    pc.on_ice_connection_state_change(Box::new(move |s: RTCIceConnectionState| {
        let _ = ice_states.send(EngineEvent::IceConnectionState(ice_state(s)));
        Box::pin(async {})
    }));

    pc.on_track(Box::new(move |track, _receiver, _transceiver| {
        let kind = match track.kind() {
            RTPCodecType::Audio => MediaKind::Audio,
            _ => MediaKind::Video,
        };
        let _ = tx.send(EngineEvent::Track(RemoteTrack {
            id: track.id(),
            kind,
            stream_id: track.stream_id(),
        }));

        // Drain RTP so the receive buffers keep moving; rendering is up to the host.
        tokio::spawn(async move {
            let mut packets = 0u64;
            while track.read_rtp().await.is_ok() {
                packets += 1;
            }
            debug!("Remote {} track ended after {} packets", kind, packets);
        });
        Box::pin(async {})
    }));
}

pub struct WebRtcSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for WebRtcSession {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), EngineError> {
        let sample_track = track
            .handle
            .clone()
            .downcast::<TrackLocalStaticSample>()
            .map_err(|_| EngineError::new(format!("track {} is not a webrtc track", track.id)))?;
        let sender = self
            .pc
            .add_track(sample_track as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP must be read for the interceptors to run.
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });
        Ok(())
    }

    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<(), EngineError> {
        let codec_type = match kind {
            MediaKind::Audio => RTPCodecType::Audio,
            MediaKind::Video => RTPCodecType::Video,
        };
        let direction = match direction {
            TransceiverDirection::SendRecv => RTCRtpTransceiverDirection::Sendrecv,
            TransceiverDirection::SendOnly => RTCRtpTransceiverDirection::Sendonly,
            TransceiverDirection::RecvOnly => RTCRtpTransceiverDirection::Recvonly,
            TransceiverDirection::Inactive => RTCRtpTransceiverDirection::Inactive,
        };
        self.pc
            .add_transceiver_from_kind(
                codec_type,
                Some(RTCRtpTransceiverInit {
                    direction,
                    send_encodings: vec![],
                }),
            )
            .await?;
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc(&offer)
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.pc
            .set_local_description(to_rtc(&description)?)
            .await?;
        Ok(())
    }

    async fn local_description(&self) -> Result<Option<SessionDescription>, EngineError> {
        match self.pc.local_description().await {
            Some(local) => from_rtc(&local).map(Some),
            None => Ok(None),
        }
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        self.pc
            .set_remote_description(to_rtc(&description)?)
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.pc.close().await?;
        info!("Peer connection closed");
        Ok(())
    }
}

/// Both sides serialize as `{type, sdp}`.
fn to_rtc(description: &SessionDescription) -> Result<RTCSessionDescription, EngineError> {
    let value = serde_json::to_value(description).map_err(EngineError::new)?;
    serde_json::from_value(value).map_err(EngineError::new)
}

fn from_rtc(description: &RTCSessionDescription) -> Result<SessionDescription, EngineError> {
    let value = serde_json::to_value(description).map_err(EngineError::new)?;
    serde_json::from_value(value).map_err(EngineError::new)
}

fn peer_state(state: RTCPeerConnectionState) -> PeerConnectionState {
    match state {
        RTCPeerConnectionState::Connecting => PeerConnectionState::Connecting,
        RTCPeerConnectionState::Connected => PeerConnectionState::Connected,
        RTCPeerConnectionState::Disconnected => PeerConnectionState::Disconnected,
        RTCPeerConnectionState::Failed => PeerConnectionState::Failed,
        RTCPeerConnectionState::Closed => PeerConnectionState::Closed,
        _ => PeerConnectionState::New,
    }
}

fn ice_state(state: RTCIceConnectionState) -> IceConnectionState {
    match state {
        RTCIceConnectionState::Checking => IceConnectionState::Checking,
        RTCIceConnectionState::Connected => IceConnectionState::Connected,
        RTCIceConnectionState::Completed => IceConnectionState::Completed,
        RTCIceConnectionState::Disconnected => IceConnectionState::Disconnected,
        RTCIceConnectionState::Failed => IceConnectionState::Failed,
        RTCIceConnectionState::Closed => IceConnectionState::Closed,
        _ => IceConnectionState::New,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SdpType;

    #[test]
    fn test_description_converts_both_ways() {
        let ours = SessionDescription::answer("v=0\r\n");
        let theirs = to_rtc(&ours).expect("to rtc");
        assert_eq!(theirs.sdp, "v=0\r\n");

        let back = from_rtc(&theirs).expect("from rtc");
        assert_eq!(back.sdp_type, SdpType::Answer);
        assert_eq!(back, ours);
    }

    #[test]
    fn test_state_mapping() {
        assert_eq!(
            peer_state(RTCPeerConnectionState::Connected),
            PeerConnectionState::Connected
        );
        assert_eq!(
            peer_state(RTCPeerConnectionState::Unspecified),
            PeerConnectionState::New
        );
        assert_eq!(
            ice_state(RTCIceConnectionState::Completed),
            IceConnectionState::Completed
        );
    }

    #[tokio::test]
    async fn test_subscriber_offer_without_network() {
        let engine = WebRtcEngine::new().expect("engine");
        let handle = engine
            .create_session(&SessionConfig::new(vec!["stun:127.0.0.1:3478".into()]))
            .await
            .expect("session");
        handle
            .session
            .add_transceiver(MediaKind::Video, TransceiverDirection::RecvOnly)
            .await
            .expect("transceiver");
        let offer = handle.session.create_offer().await.expect("offer");
        assert_eq!(offer.sdp_type, SdpType::Offer);
        assert!(offer.sdp.contains("m=video"));
        assert!(offer.sdp.contains("a=recvonly"));
        handle.session.close().await.expect("close");
    }
}
