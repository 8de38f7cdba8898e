//! In-memory relay, engine and capture fakes.
//!
//! Enabled for unit tests and behind the `test-util` feature for integration
//! tests and downstream crates.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};

use crate::capture::MediaCapture;
use crate::engine::{EngineEvent, MediaEngine, MediaSession, SessionConfig, SessionHandle};
use crate::error::{CaptureError, EngineError, TransportError};
use crate::transport::{RelayConnection, RelayEvent, RelayTransport};
use crate::types::{
    IceCandidate, LocalTrack, MediaKind, PeerConnectionState, SdpType, SessionDescription,
    TransceiverDirection,
};

/// SDP body returned by [`FakeSession::create_offer`].
pub const FAKE_OFFER_SDP: &str =
    "v=0\r\no=- 1 1 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=video 9 UDP/TLS/RTP/SAVPF 96\r\n";

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

// ---------------------------------------------------------------------------
// Relay
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RelayState {
    opened: Vec<String>,
    peers: Vec<Option<RelayPeer>>,
    fail_next: Option<String>,
}

/// Relay transport whose connections are driven by the test through [`RelayPeer`].
#[derive(Default)]
pub struct FakeRelay {
    state: Mutex<RelayState>,
    gate: Option<Notify>,
}

impl FakeRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every `open` blocks until [`FakeRelay::release_open`] is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Notify::new()),
            ..Self::default()
        }
    }

    pub fn release_open(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn fail_next_open(&self, reason: &str) {
        lock(&self.state).fail_next = Some(reason.to_string());
    }

    pub fn opened_urls(&self) -> Vec<String> {
        lock(&self.state).opened.clone()
    }

    /// Hands out the relay side of the `index`th connection, once.
    pub fn take_peer(&self, index: usize) -> Option<RelayPeer> {
        lock(&self.state).peers.get_mut(index)?.take()
    }
}

#[async_trait]
impl RelayTransport for FakeRelay {
    async fn open(&self, url: &str) -> Result<RelayConnection, TransportError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        let mut state = lock(&self.state);
        state.opened.push(url.to_string());
        if let Some(reason) = state.fail_next.take() {
            return Err(TransportError::Connect(reason));
        }

        let (outgoing, sent) = mpsc::unbounded_channel();
        let (events, incoming) = mpsc::unbounded_channel();
        state.peers.push(Some(RelayPeer { sent, events }));
        Ok(RelayConnection { outgoing, incoming })
    }
}

/// The relay's end of one fake connection.
pub struct RelayPeer {
    sent: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayPeer {
    /// Next payload sent by the client; `None` after one second of silence or
    /// once the client dropped its sender.
    pub async fn next_sent(&mut self) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), self.sent.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_sent(&mut self) -> Option<String> {
        self.sent.try_recv().ok()
    }

    pub fn deliver(&self, text: impl Into<String>) {
        let _ = self.events.send(RelayEvent::Message(text.into()));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.events.send(RelayEvent::Error(reason.to_string()));
    }

    pub fn close(&self) {
        let _ = self.events.send(RelayEvent::Closed);
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default)]
pub struct FakeEngineOptions {
    /// Emit two candidates and the end-of-gathering sentinel on `set_local_description`.
    pub auto_gather: bool,
    /// Report a connected peer connection once a remote description is applied.
    pub auto_connect: bool,
    /// Hold `set_remote_description` open this long after its events are emitted.
    pub remote_apply_delay: Option<Duration>,
    pub fail_create: Option<String>,
}

/// Call log entry recorded by [`FakeSession`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionCall {
    AddTrack(String),
    AddTransceiver(MediaKind, TransceiverDirection),
    CreateOffer,
    SetLocalDescription(SdpType),
    SetRemoteDescription(SdpType),
    Close,
}

#[derive(Default)]
pub struct FakeEngine {
    options: FakeEngineOptions,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
    configs: Mutex<Vec<SessionConfig>>,
}

impl FakeEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: FakeEngineOptions) -> Self {
        Self {
            options,
            ..Self::default()
        }
    }

    pub fn sessions_created(&self) -> usize {
        lock(&self.sessions).len()
    }

    pub fn session(&self, index: usize) -> Option<Arc<FakeSession>> {
        lock(&self.sessions).get(index).cloned()
    }

    pub fn last_session(&self) -> Option<Arc<FakeSession>> {
        lock(&self.sessions).last().cloned()
    }

    pub fn last_config(&self) -> Option<SessionConfig> {
        lock(&self.configs).last().cloned()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    async fn create_session(&self, config: &SessionConfig) -> Result<SessionHandle, EngineError> {
        if let Some(reason) = &self.options.fail_create {
            return Err(EngineError::new(reason));
        }
        lock(&self.configs).push(config.clone());

        let (tx, events) = mpsc::unbounded_channel();
        let session = Arc::new(FakeSession {
            options: self.options.clone(),
            events: tx,
            state: Mutex::new(FakeSessionState::default()),
            close_calls: AtomicUsize::new(0),
        });
        lock(&self.sessions).push(session.clone());
        Ok(SessionHandle { session, events })
    }
}

#[derive(Default)]
struct FakeSessionState {
    calls: Vec<SessionCall>,
    local: Option<SessionDescription>,
    remote: Option<SessionDescription>,
    candidate_lines: Vec<String>,
    reject_next_remote: Option<String>,
}

pub struct FakeSession {
    options: FakeEngineOptions,
    events: mpsc::UnboundedSender<EngineEvent>,
    state: Mutex<FakeSessionState>,
    close_calls: AtomicUsize,
}

impl FakeSession {
    pub fn calls(&self) -> Vec<SessionCall> {
        lock(&self.state).calls.clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        lock(&self.state).remote.clone()
    }

    pub fn reject_next_remote(&self, reason: &str) {
        lock(&self.state).reject_next_remote = Some(reason.to_string());
    }

    pub fn emit(&self, event: EngineEvent) {
        let _ = self.events.send(event);
    }

    /// Reports host candidate `n`; it is included in later local descriptions.
    pub fn gather_candidate(&self, n: u8) {
        let candidate = format!("candidate:{n} 1 udp 2130706431 192.0.2.{n} 5000{n} typ host");
        lock(&self.state)
            .candidate_lines
            .push(format!("a={candidate}\r\n"));
        self.emit(EngineEvent::Candidate(Some(IceCandidate { candidate })));
    }

    pub fn finish_gathering(&self) {
        self.emit(EngineEvent::Candidate(None));
    }

    fn record(&self, call: SessionCall) {
        lock(&self.state).calls.push(call);
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn add_track(&self, track: &LocalTrack) -> Result<(), EngineError> {
        self.record(SessionCall::AddTrack(track.id.clone()));
        Ok(())
    }

    async fn add_transceiver(
        &self,
        kind: MediaKind,
        direction: TransceiverDirection,
    ) -> Result<(), EngineError> {
        self.record(SessionCall::AddTransceiver(kind, direction));
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, EngineError> {
        self.record(SessionCall::CreateOffer);
        Ok(SessionDescription::offer(FAKE_OFFER_SDP))
    }

    async fn set_local_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        {
            let mut state = lock(&self.state);
            state
                .calls
                .push(SessionCall::SetLocalDescription(description.sdp_type));
            state.local = Some(description);
        }
        if self.options.auto_gather {
            self.gather_candidate(1);
            self.gather_candidate(2);
            self.finish_gathering();
        }
        Ok(())
    }

    async fn local_description(&self) -> Result<Option<SessionDescription>, EngineError> {
        let state = lock(&self.state);
        Ok(state.local.as_ref().map(|local| SessionDescription {
            sdp_type: local.sdp_type,
            sdp: format!("{}{}", local.sdp, state.candidate_lines.concat()),
        }))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), EngineError> {
        {
            let mut state = lock(&self.state);
            state
                .calls
                .push(SessionCall::SetRemoteDescription(description.sdp_type));
            if let Some(reason) = state.reject_next_remote.take() {
                return Err(EngineError::new(reason));
            }
            state.remote = Some(description);
        }
        if self.options.auto_connect {
            self.emit(EngineEvent::ConnectionState(PeerConnectionState::Connected));
        }
        if let Some(delay) = self.options.remote_apply_delay {
            tokio::time::sleep(delay).await;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), EngineError> {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.record(SessionCall::Close);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Capture
// ---------------------------------------------------------------------------

struct CaptureState {
    tracks: Vec<(String, MediaKind)>,
    fail: Option<CaptureError>,
    acquisitions: usize,
    releases: usize,
    released: Vec<String>,
}

pub struct FakeCapture {
    state: Mutex<CaptureState>,
    gate: Option<Notify>,
}

impl Default for FakeCapture {
    fn default() -> Self {
        Self::with_tracks(&[
            ("camera-video", MediaKind::Video),
            ("camera-audio", MediaKind::Audio),
        ])
    }
}

impl FakeCapture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tracks(tracks: &[(&str, MediaKind)]) -> Self {
        Self {
            state: Mutex::new(CaptureState {
                tracks: tracks
                    .iter()
                    .map(|(id, kind)| (id.to_string(), *kind))
                    .collect(),
                fail: None,
                acquisitions: 0,
                releases: 0,
                released: Vec::new(),
            }),
            gate: None,
        }
    }

    pub fn failing(err: CaptureError) -> Self {
        let capture = Self::default();
        lock(&capture.state).fail = Some(err);
        capture
    }

    /// Acquisition blocks until [`FakeCapture::release_acquire`] is called.
    pub fn gated() -> Self {
        Self {
            gate: Some(Notify::new()),
            ..Self::default()
        }
    }

    pub fn release_acquire(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub fn acquisitions(&self) -> usize {
        lock(&self.state).acquisitions
    }

    pub fn releases(&self) -> usize {
        lock(&self.state).releases
    }

    pub fn released_ids(&self) -> Vec<String> {
        lock(&self.state).released.clone()
    }

    async fn acquire(&self, path: Option<&Path>) -> Result<Vec<LocalTrack>, CaptureError> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let mut state = lock(&self.state);
        if let Some(err) = &state.fail {
            return Err(err.clone());
        }
        state.acquisitions += 1;
        let source = path.map(|p| p.display().to_string()).unwrap_or_default();
        Ok(state
            .tracks
            .iter()
            .map(|(id, kind)| LocalTrack::new(id.clone(), *kind, Arc::new(source.clone())))
            .collect())
    }
}

#[async_trait]
impl MediaCapture for FakeCapture {
    async fn acquire_camera_tracks(&self) -> Result<Vec<LocalTrack>, CaptureError> {
        self.acquire(None).await
    }

    async fn acquire_file_tracks(&self, path: &Path) -> Result<Vec<LocalTrack>, CaptureError> {
        self.acquire(Some(path)).await
    }

    fn release(&self, tracks: &[LocalTrack]) {
        let mut state = lock(&self.state);
        state.releases += 1;
        state
            .released
            .extend(tracks.iter().map(|track| track.id.clone()));
    }
}
