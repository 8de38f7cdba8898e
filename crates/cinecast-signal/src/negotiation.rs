//! Negotiation state machine for one call attempt.
//!
//! ```text
//! Idle -> Building -> GatheringCandidates -> Ready -> RemoteApplied -> Active
//!   \__________\______________\_______________\__________\__________\--> Closed
//! ```
//!
//! Signaling is non-trickle: the local description is only handed out once the
//! engine reports the end of candidate gathering (a `None` candidate), so the
//! single offer carries every candidate. A session is owned by exactly one
//! attempt and cannot be reused after `close`.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::{EngineEvent, MediaEngine, MediaSession, SessionConfig};
use crate::error::{ApplyError, NegotiationError};
use crate::notify::Notifier;
use crate::types::{
    IceCandidate, IceConnectionState, LocalTrack, MediaKind, MediaSource, PeerConnectionState,
    RemoteTrack, Role, SdpType, SessionDescription, TransceiverDirection,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    /// Engine session not yet allocated
    Idle,
    /// Attaching tracks or transceivers, creating the offer
    Building,
    /// Offer set locally, waiting for the end-of-candidates sentinel
    GatheringCandidates,
    /// Local description complete, waiting for the answer
    Ready,
    /// Answer applied, waiting for media or connectivity
    RemoteApplied,
    /// Media or connectivity confirmed
    Active,
    /// Released; terminal
    Closed,
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Building => "building",
            Self::GatheringCandidates => "gathering-candidates",
            Self::Ready => "ready",
            Self::RemoteApplied => "remote-applied",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Notifications surfaced to the owner of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    StateChanged(NegotiationState),
    CandidateGathered(IceCandidate),
    GatheringComplete { candidates: usize },
    TrackAdded(RemoteTrack),
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
}

impl fmt::Display for SessionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged(state) => write!(f, "Negotiation state: {state}"),
            Self::CandidateGathered(c) => write!(f, "Gathered candidate: {}", c.candidate),
            Self::GatheringComplete { candidates } => {
                write!(f, "Candidate gathering complete ({candidates} candidates)")
            }
            Self::TrackAdded(track) => write!(f, "Received {} track from broadcast", track.kind),
            Self::ConnectionState(state) => write!(f, "Connection state: {state}"),
            Self::IceConnectionState(state) => write!(f, "ICE connection state: {state}"),
        }
    }
}

#[derive(Default)]
struct Tracks {
    local: Vec<String>,
    remote: Vec<RemoteTrack>,
}

struct Shared {
    state: watch::Sender<NegotiationState>,
    gathered: AtomicBool,
    confirmed: AtomicBool,
    candidates: AtomicUsize,
    tracks: Mutex<Tracks>,
    events: Notifier<SessionEvent>,
}

impl Shared {
    fn current(&self) -> NegotiationState {
        *self.state.borrow()
    }

    fn tracks(&self) -> MutexGuard<'_, Tracks> {
        match self.tracks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Moves to `to` if the current state is one of `from`.
    fn transition(&self, from: &[NegotiationState], to: NegotiationState) -> bool {
        let mut previous = to;
        let changed = self.state.send_if_modified(|state| {
            if from.contains(state) {
                previous = *state;
                *state = to;
                true
            } else {
                false
            }
        });
        if changed {
            debug!("Negotiation state {} -> {}", previous, to);
            self.events.emit(SessionEvent::StateChanged(to));
        }
        changed
    }

    fn mark_ready_if_gathered(&self) {
        if self.gathered.load(Ordering::SeqCst)
            && self.transition(&[NegotiationState::GatheringCandidates], NegotiationState::Ready)
        {
            info!("Local description finalized");
        }
    }

    /// Records media or connectivity confirmation. It may arrive while the
    /// remote description is still being applied, so it is kept until then.
    fn confirm_active(&self) {
        self.confirmed.store(true, Ordering::SeqCst);
        self.mark_active_if_confirmed();
    }

    fn mark_active_if_confirmed(&self) {
        if self.confirmed.load(Ordering::SeqCst)
            && self.transition(&[NegotiationState::RemoteApplied], NegotiationState::Active)
        {
            info!("Session active");
        }
    }

    fn record_remote_track(&self, track: &RemoteTrack) -> bool {
        let mut tracks = self.tracks();
        if tracks.remote.iter().any(|t| t.id == track.id) {
            return false;
        }
        tracks.remote.push(track.clone());
        true
    }
}

pub struct NegotiationSession {
    role: Role,
    source: Option<MediaSource>,
    receive_audio: bool,
    media: Arc<dyn MediaSession>,
    shared: Arc<Shared>,
    applying: AtomicBool,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl NegotiationSession {
    /// Allocates the engine session and enters `Building`.
    pub async fn create(
        engine: &dyn MediaEngine,
        role: Role,
        source: Option<MediaSource>,
        config: &SessionConfig,
    ) -> Result<Self, NegotiationError> {
        if config.ice_servers.iter().all(|s| s.trim().is_empty()) {
            return Err(NegotiationError::NoIceServers);
        }

        let handle = engine.create_session(config).await?;
        let (state, _) = watch::channel(NegotiationState::Idle);
        let shared = Arc::new(Shared {
            state,
            gathered: AtomicBool::new(false),
            confirmed: AtomicBool::new(false),
            candidates: AtomicUsize::new(0),
            tracks: Mutex::new(Tracks::default()),
            events: Notifier::new(),
        });

        let pump = tokio::spawn(pump_engine_events(shared.clone(), role, handle.events));
        shared.transition(&[NegotiationState::Idle], NegotiationState::Building);
        info!("Created {} negotiation session", role);

        Ok(Self {
            role,
            source: if role == Role::Publisher { source } else { None },
            receive_audio: config.receive_audio,
            media: handle.session,
            shared,
            applying: AtomicBool::new(false),
            pump: Mutex::new(Some(pump)),
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn source(&self) -> Option<MediaSource> {
        self.source
    }

    pub fn state(&self) -> NegotiationState {
        self.shared.current()
    }

    pub fn local_track_ids(&self) -> Vec<String> {
        self.shared.tracks().local.clone()
    }

    pub fn remote_tracks(&self) -> Vec<RemoteTrack> {
        self.shared.tracks().remote.clone()
    }

    pub fn candidates_gathered(&self) -> usize {
        self.shared.candidates.load(Ordering::SeqCst)
    }

    pub fn on_event(&self, handler: impl Fn(SessionEvent) + Send + Sync + 'static) {
        self.shared.events.subscribe(handler);
    }

    /// Attaches local media (publisher) or receive-only transceivers
    /// (subscriber), creates the offer and starts candidate gathering.
    pub async fn build_local(&self, tracks: &[LocalTrack]) -> Result<(), NegotiationError> {
        self.expect_state("build local description", NegotiationState::Building)?;

        match self.role {
            Role::Publisher => {
                if tracks.is_empty() {
                    warn!("Publisher offer built without local tracks");
                }
                for track in tracks {
                    self.media.add_track(track).await?;
                    let mut recorded = self.shared.tracks();
                    if !recorded.local.contains(&track.id) {
                        recorded.local.push(track.id.clone());
                    }
                    debug!("Added local {} track {}", track.kind, track.id);
                }
            }
            Role::Subscriber => {
                if !tracks.is_empty() {
                    debug!("Subscriber ignores {} local track(s)", tracks.len());
                }
                self.media
                    .add_transceiver(MediaKind::Video, TransceiverDirection::RecvOnly)
                    .await?;
                if self.receive_audio {
                    self.media
                        .add_transceiver(MediaKind::Audio, TransceiverDirection::RecvOnly)
                        .await?;
                }
            }
        }

        let offer = self.media.create_offer().await?;
        self.expect_state("set local description", NegotiationState::Building)?;
        self.media.set_local_description(offer).await?;

        if !self.shared.transition(
            &[NegotiationState::Building],
            NegotiationState::GatheringCandidates,
        ) {
            return Err(self.state_error("start candidate gathering"));
        }
        info!("Local offer set; gathering candidates");
        self.shared.mark_ready_if_gathered();
        Ok(())
    }

    /// Waits for the end of candidate gathering and returns the complete local description.
    pub async fn finalized_local(&self) -> Result<SessionDescription, NegotiationError> {
        match self.state() {
            NegotiationState::Idle | NegotiationState::Building => {
                return Err(self.state_error("finalize local description"));
            }
            NegotiationState::Closed => return Err(NegotiationError::Closed),
            _ => {}
        }

        let mut rx = self.shared.state.subscribe();
        let state = *rx
            .wait_for(|s| {
                !matches!(
                    s,
                    NegotiationState::Idle
                        | NegotiationState::Building
                        | NegotiationState::GatheringCandidates
                )
            })
            .await
            .map_err(|_| NegotiationError::Closed)?;
        if state == NegotiationState::Closed {
            return Err(NegotiationError::Closed);
        }

        self.media
            .local_description()
            .await?
            .ok_or(NegotiationError::MissingLocalDescription)
    }

    /// Applies the counterpart's answer. Only valid once, after `Ready`.
    ///
    /// A rejected description leaves the session open in `Ready`.
    pub async fn apply_remote(&self, description: SessionDescription) -> Result<(), ApplyError> {
        match self.state() {
            NegotiationState::Ready => {}
            NegotiationState::RemoteApplied | NegotiationState::Active => {
                return Err(ApplyError::AlreadyApplied);
            }
            NegotiationState::Closed => return Err(ApplyError::Closed),
            early => return Err(ApplyError::NotReady(early)),
        }
        if !matches!(description.sdp_type, SdpType::Answer | SdpType::Pranswer) {
            return Err(ApplyError::WrongDirection(description.sdp_type));
        }
        if self.applying.swap(true, Ordering::SeqCst) {
            return Err(ApplyError::AlreadyApplied);
        }

        let result = self.media.set_remote_description(description).await;
        self.applying.store(false, Ordering::SeqCst);

        match result {
            Ok(()) => {
                if self
                    .shared
                    .transition(&[NegotiationState::Ready], NegotiationState::RemoteApplied)
                {
                    info!("Remote description applied");
                    self.shared.mark_active_if_confirmed();
                } else {
                    debug!("Session closed while applying remote description");
                }
                Ok(())
            }
            Err(err) => {
                warn!("Remote description rejected: {}", err);
                Err(ApplyError::Rejected(err.0))
            }
        }
    }

    /// Releases the engine session. Idempotent.
    pub async fn close(&self) {
        let changed = self.shared.state.send_if_modified(|state| {
            if *state == NegotiationState::Closed {
                false
            } else {
                *state = NegotiationState::Closed;
                true
            }
        });
        if !changed {
            return;
        }

        if let Some(pump) = self.take_pump() {
            pump.abort();
        }
        self.shared
            .events
            .emit(SessionEvent::StateChanged(NegotiationState::Closed));
        if let Err(err) = self.media.close().await {
            warn!("Failed to close media session: {}", err);
        }
        info!("Negotiation session closed");
    }

    fn take_pump(&self) -> Option<JoinHandle<()>> {
        match self.pump.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        }
    }

    fn expect_state(
        &self,
        op: &'static str,
        expected: NegotiationState,
    ) -> Result<(), NegotiationError> {
        if self.state() == expected {
            Ok(())
        } else {
            Err(self.state_error(op))
        }
    }

    fn state_error(&self, op: &'static str) -> NegotiationError {
        match self.state() {
            NegotiationState::Closed => NegotiationError::Closed,
            state => NegotiationError::InvalidState { op, state },
        }
    }
}

impl Drop for NegotiationSession {
    fn drop(&mut self) {
        if let Some(pump) = self.take_pump() {
            pump.abort();
        }
    }
}

async fn pump_engine_events(
    shared: Arc<Shared>,
    role: Role,
    mut events: mpsc::UnboundedReceiver<EngineEvent>,
) {
    while let Some(event) = events.recv().await {
        if shared.current() == NegotiationState::Closed {
            return;
        }
        match event {
            EngineEvent::Candidate(Some(candidate)) => {
                let n = shared.candidates.fetch_add(1, Ordering::SeqCst) + 1;
                debug!("Gathered candidate #{}: {}", n, candidate.candidate);
                shared.events.emit(SessionEvent::CandidateGathered(candidate));
            }
            EngineEvent::Candidate(None) => {
                if shared.gathered.swap(true, Ordering::SeqCst) {
                    continue;
                }
                let candidates = shared.candidates.load(Ordering::SeqCst);
                info!("Candidate gathering complete ({} candidates)", candidates);
                shared
                    .events
                    .emit(SessionEvent::GatheringComplete { candidates });
                shared.mark_ready_if_gathered();
            }
            EngineEvent::Track(track) => {
                if role != Role::Subscriber {
                    debug!("Publisher ignoring inbound {} track {}", track.kind, track.id);
                    continue;
                }
                if shared.record_remote_track(&track) {
                    info!("Received {} track {}", track.kind, track.id);
                    shared.events.emit(SessionEvent::TrackAdded(track));
                    shared.confirm_active();
                }
            }
            EngineEvent::ConnectionState(state) => {
                info!("Peer connection state has changed: {}", state);
                shared.events.emit(SessionEvent::ConnectionState(state));
                if state == PeerConnectionState::Connected {
                    shared.confirm_active();
                }
            }
            EngineEvent::IceConnectionState(state) => {
                debug!("ICE connection state has changed: {}", state);
                shared.events.emit(SessionEvent::IceConnectionState(state));
                if matches!(
                    state,
                    IceConnectionState::Connected | IceConnectionState::Completed
                ) {
                    shared.confirm_active();
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeEngine, FakeEngineOptions, SessionCall};
    use std::time::Duration;

    fn config() -> SessionConfig {
        SessionConfig::new(vec!["stun:stun.test:3478".into()])
    }

    fn track(id: &str) -> LocalTrack {
        LocalTrack::new(id, MediaKind::Video, Arc::new(()))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    async fn ready_publisher(engine: &FakeEngine) -> NegotiationSession {
        let session = NegotiationSession::create(
            engine,
            Role::Publisher,
            Some(MediaSource::Camera),
            &config(),
        )
        .await
        .expect("create");
        session.build_local(&[track("cam")]).await.expect("build");
        engine.last_session().expect("session").finish_gathering();
        session.finalized_local().await.expect("finalize");
        session
    }

    #[tokio::test]
    async fn test_create_requires_ice_server() {
        let engine = FakeEngine::new();
        let result = NegotiationSession::create(
            &engine,
            Role::Subscriber,
            None,
            &SessionConfig::new(vec![]),
        )
        .await;
        assert!(matches!(result, Err(NegotiationError::NoIceServers)));
        assert_eq!(engine.sessions_created(), 0);
    }

    #[tokio::test]
    async fn test_create_enters_building() {
        let engine = FakeEngine::new();
        let session = NegotiationSession::create(
            &engine,
            Role::Publisher,
            Some(MediaSource::File),
            &config(),
        )
        .await
        .expect("create");
        assert_eq!(session.state(), NegotiationState::Building);
        assert_eq!(session.source(), Some(MediaSource::File));
    }

    #[tokio::test]
    async fn test_subscriber_has_no_media_source() {
        let engine = FakeEngine::new();
        let session = NegotiationSession::create(
            &engine,
            Role::Subscriber,
            Some(MediaSource::Camera),
            &config(),
        )
        .await
        .expect("create");
        assert_eq!(session.source(), None);
    }

    #[tokio::test]
    async fn test_publisher_build_attaches_tracks_then_offers() {
        let engine = FakeEngine::new();
        let session = NegotiationSession::create(
            &engine,
            Role::Publisher,
            Some(MediaSource::Camera),
            &config(),
        )
        .await
        .expect("create");

        session
            .build_local(&[track("cam-video"), track("cam-video")])
            .await
            .expect("build");

        assert_eq!(session.state(), NegotiationState::GatheringCandidates);
        assert_eq!(session.local_track_ids(), vec!["cam-video".to_string()]);
        let calls = engine.last_session().expect("session").calls();
        assert_eq!(
            calls,
            vec![
                SessionCall::AddTrack("cam-video".into()),
                SessionCall::AddTrack("cam-video".into()),
                SessionCall::CreateOffer,
                SessionCall::SetLocalDescription(SdpType::Offer),
            ]
        );
    }

    #[tokio::test]
    async fn test_subscriber_build_adds_receive_only_transceivers() {
        let engine = FakeEngine::new();
        let session = NegotiationSession::create(&engine, Role::Subscriber, None, &config())
            .await
            .expect("create");
        session.build_local(&[]).await.expect("build");

        let calls = engine.last_session().expect("session").calls();
        assert_eq!(
            &calls[..2],
            &[
                SessionCall::AddTransceiver(MediaKind::Video, TransceiverDirection::RecvOnly),
                SessionCall::AddTransceiver(MediaKind::Audio, TransceiverDirection::RecvOnly),
            ]
        );
        assert!(session.local_track_ids().is_empty());
    }

    #[tokio::test]
    async fn test_subscriber_without_audio() {
        let engine = FakeEngine::new();
        let mut config = config();
        config.receive_audio = false;
        let session = NegotiationSession::create(&engine, Role::Subscriber, None, &config)
            .await
            .expect("create");
        session.build_local(&[]).await.expect("build");

        let transceivers = engine
            .last_session()
            .expect("session")
            .calls()
            .into_iter()
            .filter(|c| matches!(c, SessionCall::AddTransceiver(..)))
            .count();
        assert_eq!(transceivers, 1);
    }

    #[tokio::test]
    async fn test_build_twice_is_invalid() {
        let engine = FakeEngine::new();
        let session = NegotiationSession::create(&engine, Role::Subscriber, None, &config())
            .await
            .expect("create");
        session.build_local(&[]).await.expect("build");
        assert!(matches!(
            session.build_local(&[]).await,
            Err(NegotiationError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_finalize_waits_for_gathering_sentinel() {
        let engine = FakeEngine::new();
        let session = NegotiationSession::create(&engine, Role::Subscriber, None, &config())
            .await
            .expect("create");
        session.build_local(&[]).await.expect("build");
        let fake = engine.last_session().expect("session");

        fake.gather_candidate(1);
        fake.gather_candidate(2);
        let early =
            tokio::time::timeout(Duration::from_millis(50), session.finalized_local()).await;
        assert!(early.is_err(), "finalized before the sentinel");
        assert_eq!(session.state(), NegotiationState::GatheringCandidates);

        fake.finish_gathering();
        let local = session.finalized_local().await.expect("finalize");
        assert_eq!(session.state(), NegotiationState::Ready);
        assert_eq!(session.candidates_gathered(), 2);
        assert_eq!(local.sdp_type, SdpType::Offer);
        assert!(local.sdp.contains("a=candidate:1"));
        assert!(local.sdp.contains("a=candidate:2"));
    }

    #[tokio::test]
    async fn test_sentinel_during_set_local_still_reaches_ready() {
        let engine = FakeEngine::with_options(FakeEngineOptions {
            auto_gather: true,
            ..Default::default()
        });
        let session = NegotiationSession::create(&engine, Role::Subscriber, None, &config())
            .await
            .expect("create");
        session.build_local(&[]).await.expect("build");
        session.finalized_local().await.expect("finalize");
        assert_eq!(session.state(), NegotiationState::Ready);
    }

    #[tokio::test]
    async fn test_finalize_before_build_is_invalid() {
        let engine = FakeEngine::new();
        let session = NegotiationSession::create(&engine, Role::Subscriber, None, &config())
            .await
            .expect("create");
        assert!(matches!(
            session.finalized_local().await,
            Err(NegotiationError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_apply_before_ready_fails() {
        let engine = FakeEngine::new();
        let session = NegotiationSession::create(
            &engine,
            Role::Publisher,
            Some(MediaSource::Camera),
            &config(),
        )
        .await
        .expect("create");
        let answer = SessionDescription::answer("v=0\r\n");

        assert_eq!(
            session.apply_remote(answer.clone()).await,
            Err(ApplyError::NotReady(NegotiationState::Building))
        );

        session.build_local(&[track("cam")]).await.expect("build");
        assert_eq!(
            session.apply_remote(answer).await,
            Err(ApplyError::NotReady(NegotiationState::GatheringCandidates))
        );
        assert_eq!(session.state(), NegotiationState::GatheringCandidates);
    }

    #[tokio::test]
    async fn test_apply_once_ready_succeeds_once() {
        let engine = FakeEngine::new();
        let session = ready_publisher(&engine).await;
        let answer = SessionDescription::answer("v=0\r\n");

        session.apply_remote(answer.clone()).await.expect("apply");
        assert_eq!(session.state(), NegotiationState::RemoteApplied);
        assert_eq!(
            session.apply_remote(answer).await,
            Err(ApplyError::AlreadyApplied)
        );
    }

    #[tokio::test]
    async fn test_apply_rejects_offer_direction() {
        let engine = FakeEngine::new();
        let session = ready_publisher(&engine).await;
        assert_eq!(
            session.apply_remote(SessionDescription::offer("v=0\r\n")).await,
            Err(ApplyError::WrongDirection(SdpType::Offer))
        );
        assert_eq!(session.state(), NegotiationState::Ready);
    }

    #[tokio::test]
    async fn test_engine_rejection_keeps_session_open_for_retry() {
        let engine = FakeEngine::new();
        let session = ready_publisher(&engine).await;
        let fake = engine.last_session().expect("session");

        fake.reject_next_remote("bad fingerprint");
        let result = session.apply_remote(SessionDescription::answer("v=0\r\n")).await;
        assert!(matches!(result, Err(ApplyError::Rejected(_))));
        assert_eq!(session.state(), NegotiationState::Ready);

        session
            .apply_remote(SessionDescription::answer("v=0\r\n"))
            .await
            .expect("retry");
        assert_eq!(session.state(), NegotiationState::RemoteApplied);
    }

    #[tokio::test]
    async fn test_connectivity_confirmation_activates_session() {
        let engine = FakeEngine::new();
        let session = ready_publisher(&engine).await;
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        session.on_event(move |e| sink.lock().unwrap().push(e));

        session
            .apply_remote(SessionDescription::answer("v=0\r\n"))
            .await
            .expect("apply");
        let fake = engine.last_session().expect("session");
        fake.emit(EngineEvent::IceConnectionState(IceConnectionState::Checking));
        fake.emit(EngineEvent::ConnectionState(PeerConnectionState::Connected));
        settle().await;

        assert_eq!(session.state(), NegotiationState::Active);
        let seen = seen.lock().unwrap();
        assert!(seen.contains(&SessionEvent::IceConnectionState(IceConnectionState::Checking)));
        assert!(seen.contains(&SessionEvent::ConnectionState(PeerConnectionState::Connected)));
        assert!(seen.contains(&SessionEvent::StateChanged(NegotiationState::Active)));
    }

    #[tokio::test]
    async fn test_connected_while_applying_remote_activates_session() {
        let engine = FakeEngine::with_options(FakeEngineOptions {
            auto_connect: true,
            remote_apply_delay: Some(Duration::from_millis(30)),
            ..Default::default()
        });
        let session = ready_publisher(&engine).await;

        session
            .apply_remote(SessionDescription::answer("v=0\r\n"))
            .await
            .expect("apply");
        settle().await;

        assert_eq!(session.state(), NegotiationState::Active);
    }

    #[tokio::test]
    async fn test_track_before_remote_applied_activates_on_apply() {
        let engine = FakeEngine::new();
        let session = NegotiationSession::create(&engine, Role::Subscriber, None, &config())
            .await
            .expect("create");
        session.build_local(&[]).await.expect("build");
        let fake = engine.last_session().expect("session");
        fake.finish_gathering();
        session.finalized_local().await.expect("finalize");

        fake.emit(EngineEvent::Track(RemoteTrack {
            id: "video-1".into(),
            kind: MediaKind::Video,
            stream_id: "studio".into(),
        }));
        settle().await;
        assert_eq!(session.state(), NegotiationState::Ready);

        session
            .apply_remote(SessionDescription::answer("v=0\r\n"))
            .await
            .expect("apply");
        assert_eq!(session.state(), NegotiationState::Active);
    }

    #[tokio::test]
    async fn test_degraded_connectivity_is_surfaced_not_remediated() {
        let engine = FakeEngine::new();
        let session = ready_publisher(&engine).await;
        session
            .apply_remote(SessionDescription::answer("v=0\r\n"))
            .await
            .expect("apply");
        let fake = engine.last_session().expect("session");
        fake.emit(EngineEvent::ConnectionState(PeerConnectionState::Connected));
        fake.emit(EngineEvent::ConnectionState(PeerConnectionState::Failed));
        settle().await;

        assert_eq!(session.state(), NegotiationState::Active);
        assert_eq!(fake.close_calls(), 0);
    }

    #[tokio::test]
    async fn test_inbound_tracks_deduplicated() {
        let engine = FakeEngine::new();
        let session = NegotiationSession::create(&engine, Role::Subscriber, None, &config())
            .await
            .expect("create");
        let added = Arc::new(Mutex::new(Vec::new()));
        let sink = added.clone();
        session.on_event(move |e| {
            if let SessionEvent::TrackAdded(track) = e {
                sink.lock().unwrap().push(track.id);
            }
        });

        let fake = engine.last_session().expect("session");
        let video = RemoteTrack {
            id: "video-1".into(),
            kind: MediaKind::Video,
            stream_id: "studio".into(),
        };
        let audio = RemoteTrack {
            id: "audio-1".into(),
            kind: MediaKind::Audio,
            stream_id: "studio".into(),
        };
        fake.emit(EngineEvent::Track(video.clone()));
        fake.emit(EngineEvent::Track(video));
        fake.emit(EngineEvent::Track(audio));
        settle().await;

        assert_eq!(*added.lock().unwrap(), vec!["video-1", "audio-1"]);
        assert_eq!(session.remote_tracks().len(), 2);
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let engine = FakeEngine::new();
        let session = ready_publisher(&engine).await;
        let fake = engine.last_session().expect("session");

        session.close().await;
        session.close().await;

        assert_eq!(session.state(), NegotiationState::Closed);
        assert_eq!(fake.close_calls(), 1);
        assert_eq!(
            session.apply_remote(SessionDescription::answer("v=0\r\n")).await,
            Err(ApplyError::Closed)
        );
        assert!(matches!(
            session.finalized_local().await,
            Err(NegotiationError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_close_wakes_pending_finalize() {
        let engine = FakeEngine::new();
        let session = Arc::new(
            NegotiationSession::create(&engine, Role::Subscriber, None, &config())
                .await
                .expect("create"),
        );
        session.build_local(&[]).await.expect("build");

        let waiter = {
            let session = session.clone();
            tokio::spawn(async move { session.finalized_local().await })
        };
        settle().await;
        session.close().await;

        let result = waiter.await.expect("join");
        assert!(matches!(result, Err(NegotiationError::Closed)));
    }
}
