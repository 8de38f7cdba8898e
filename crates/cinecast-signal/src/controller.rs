//! Orchestrates one publish or subscribe attempt end to end.
//!
//! An attempt acquires capture (publisher only), opens the relay channel,
//! creates the negotiation session, sends the finalized offer and applies the
//! counterpart's answer when it arrives. `stop` releases everything the
//! attempt acquired, exactly once. Callbacks belonging to a stopped attempt
//! are ignored.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use cinecast_common::SignalingConfig;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::capture::{self, MediaCapture};
use crate::channel::{ConnectionStatus, SignalingChannel};
use crate::codec::{self, WireFormat};
use crate::engine::{MediaEngine, SessionConfig};
use crate::error::{ApplyError, ControllerError, TransportError};
use crate::negotiation::{NegotiationSession, NegotiationState, SessionEvent};
use crate::notify::Notifier;
use crate::transport::RelayTransport;
use crate::types::{LocalTrack, Role, SourceConfig};

/// Progress and failures of the current attempt, in the order they happen.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerEvent {
    Status(ConnectionStatus),
    Session(SessionEvent),
    OfferSent { role: Role, stream_name: String },
    RemoteApplied(WireFormat),
    Error(ControllerError),
    Stopped,
}

impl fmt::Display for ControllerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Status(status) => write!(f, "{status}"),
            Self::Session(event) => write!(f, "{event}"),
            Self::OfferSent {
                role: Role::Publisher,
                stream_name,
            } => write!(f, "Broadcasting \"{stream_name}\"; waiting for viewer"),
            Self::OfferSent {
                role: Role::Subscriber,
                stream_name,
            } => write!(f, "Requested stream \"{stream_name}\"; waiting for broadcaster"),
            Self::RemoteApplied(_) => write!(f, "Remote description applied"),
            Self::Error(err) => write!(f, "Error: {err}"),
            Self::Stopped => write!(f, "Stopped"),
        }
    }
}

/// Summary of the attempt in progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptInfo {
    pub role: Role,
    pub stream_name: String,
    pub relay: Option<ConnectionStatus>,
    pub negotiation: Option<NegotiationState>,
    pub local_tracks: usize,
}

struct Attempt {
    id: u64,
    role: Role,
    stream_name: String,
    tracks: Vec<LocalTrack>,
    channel: Option<Arc<SignalingChannel>>,
    session: Option<Arc<NegotiationSession>>,
    driver: Option<JoinHandle<()>>,
}

enum DriverInput {
    Message(String),
    Status(ConnectionStatus),
}

struct Inner {
    config: SignalingConfig,
    session_config: Mutex<SessionConfig>,
    engine: Arc<dyn MediaEngine>,
    capture: Arc<dyn MediaCapture>,
    transport: Arc<dyn RelayTransport>,
    next_id: AtomicU64,
    attempt: Mutex<Option<Attempt>>,
    /// Failure that ended attempt `id` from outside its `start` call.
    aborted: Mutex<Option<(u64, ControllerError)>>,
    events: Notifier<ControllerEvent>,
}

#[derive(Clone)]
pub struct SessionController {
    inner: Arc<Inner>,
}

impl SessionController {
    pub fn new(
        config: SignalingConfig,
        engine: Arc<dyn MediaEngine>,
        capture: Arc<dyn MediaCapture>,
        transport: Arc<dyn RelayTransport>,
    ) -> Self {
        let session_config = SessionConfig::from(&config);
        Self {
            inner: Arc::new(Inner {
                config,
                session_config: Mutex::new(session_config),
                engine,
                capture,
                transport,
                next_id: AtomicU64::new(1),
                attempt: Mutex::new(None),
                aborted: Mutex::new(None),
                events: Notifier::new(),
            }),
        }
    }

    pub fn config(&self) -> &SignalingConfig {
        &self.inner.config
    }

    /// Replaces the media session parameters used by subsequent attempts.
    pub fn set_session_config(&self, session_config: SessionConfig) {
        *lock(&self.inner.session_config) = session_config;
    }

    pub fn on_event(&self, handler: impl Fn(ControllerEvent) + Send + Sync + 'static) {
        self.inner.events.subscribe(handler);
    }

    pub fn is_active(&self) -> bool {
        lock(&self.inner.attempt).is_some()
    }

    pub fn current(&self) -> Option<AttemptInfo> {
        let attempt = lock(&self.inner.attempt);
        attempt.as_ref().map(|a| AttemptInfo {
            role: a.role,
            stream_name: a.stream_name.clone(),
            relay: a.channel.as_ref().map(|c| c.status()),
            negotiation: a.session.as_ref().map(|s| s.state()),
            local_tracks: a.tracks.len(),
        })
    }

    /// Starts an attempt and returns once the offer is on the relay.
    ///
    /// The answer is applied in the background. Returns `Ok(())` without
    /// sending anything when the attempt is stopped while starting.
    pub async fn start(
        &self,
        role: Role,
        stream_name: &str,
        source: SourceConfig,
    ) -> Result<(), ControllerError> {
        let stream_name = stream_name.trim();
        if stream_name.is_empty() {
            return Err(ControllerError::InvalidInput(
                "stream name must not be empty".into(),
            ));
        }

        let id = self.inner.claim(role, stream_name)?;
        info!("Starting {} attempt for stream \"{}\"", role, stream_name);

        match self.run(id, role, stream_name, source).await {
            Ok(()) => Ok(()),
            Err(err) if self.inner.is_current(id) => {
                warn!("Session attempt failed: {}", err);
                self.inner.report(ControllerEvent::Error(err.clone()));
                self.inner.stop_attempt(id).await;
                Err(err)
            }
            Err(err) => match self.inner.take_abort(id) {
                Some(reason) => Err(reason),
                None => {
                    debug!("Attempt stopped while starting: {}", err);
                    Ok(())
                }
            },
        }
    }

    /// Ends the current attempt, if any. Idempotent.
    pub async fn stop(&self) {
        let attempt = lock(&self.inner.attempt).take();
        match attempt {
            Some(attempt) => self.inner.teardown(attempt).await,
            None => debug!("Stop requested with no active attempt"),
        }
    }

    async fn run(
        &self,
        id: u64,
        role: Role,
        stream_name: &str,
        source: SourceConfig,
    ) -> Result<(), ControllerError> {
        let inner = &self.inner;

        let tracks = match role {
            Role::Publisher => {
                let tracks = capture::acquire(inner.capture.as_ref(), &source).await?;
                if !inner.update(id, |a| a.tracks = tracks.clone()) {
                    inner.capture.release(&tracks);
                    return Ok(());
                }
                tracks
            }
            Role::Subscriber => Vec::new(),
        };

        let channel = Arc::new(SignalingChannel::new(inner.transport.clone()));
        let (tx, rx) = mpsc::unbounded_channel();
        self.wire_channel(id, &channel, tx);
        let driver = tokio::spawn(drive(Arc::downgrade(inner), id, rx));
        let stored = inner.update(id, |a| {
            a.channel = Some(channel.clone());
            a.driver = Some(driver);
        });
        if !stored {
            return Ok(());
        }
        channel.connect(&inner.config.relay_url).await?;

        let session_config = lock(&inner.session_config).clone();
        let session = Arc::new(
            NegotiationSession::create(
                inner.engine.as_ref(),
                role,
                Some(source.kind()),
                &session_config,
            )
            .await?,
        );
        let weak = Arc::downgrade(inner);
        session.on_event(move |event| {
            if let Some(inner) = weak.upgrade() {
                if inner.is_current(id) {
                    inner.report(ControllerEvent::Session(event));
                }
            }
        });
        if !inner.update(id, |a| a.session = Some(session.clone())) {
            session.close().await;
            return Ok(());
        }

        session.build_local(&tracks).await?;
        let local = session.finalized_local().await?;
        let wire = codec::encode_offer(&local, stream_name, role)?;

        if !inner.is_current(id) {
            return Ok(());
        }
        channel.send(&wire)?;
        info!("Sent {} offer for stream \"{}\"", role, stream_name);
        inner.report(ControllerEvent::OfferSent {
            role,
            stream_name: stream_name.to_string(),
        });
        Ok(())
    }

    fn wire_channel(
        &self,
        id: u64,
        channel: &SignalingChannel,
        tx: mpsc::UnboundedSender<DriverInput>,
    ) {
        let messages = tx.clone();
        channel.on_message(move |text| {
            let _ = messages.send(DriverInput::Message(text));
        });

        let weak = Arc::downgrade(&self.inner);
        channel.on_status_change(move |status| {
            if let Some(inner) = weak.upgrade() {
                if inner.is_current(id) {
                    inner.report(ControllerEvent::Status(status));
                }
            }
            let _ = tx.send(DriverInput::Status(status));
        });

        let weak = Arc::downgrade(&self.inner);
        channel.on_error(move |err| {
            if let Some(inner) = weak.upgrade() {
                if inner.is_current(id) {
                    inner.report(ControllerEvent::Error(err.into()));
                }
            }
        });
    }
}

impl Inner {
    fn claim(&self, role: Role, stream_name: &str) -> Result<u64, ControllerError> {
        let mut attempt = lock(&self.attempt);
        if attempt.is_some() {
            return Err(ControllerError::AlreadyActive);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        *attempt = Some(Attempt {
            id,
            role,
            stream_name: stream_name.to_string(),
            tracks: Vec::new(),
            channel: None,
            session: None,
            driver: None,
        });
        *lock(&self.aborted) = None;
        Ok(id)
    }

    fn is_current(&self, id: u64) -> bool {
        matches!(lock(&self.attempt).as_ref(), Some(a) if a.id == id)
    }

    /// Applies `f` to attempt `id`; `false` if that attempt is gone.
    fn update(&self, id: u64, f: impl FnOnce(&mut Attempt)) -> bool {
        match lock(&self.attempt).as_mut() {
            Some(attempt) if attempt.id == id => {
                f(attempt);
                true
            }
            _ => false,
        }
    }

    fn session_of(&self, id: u64) -> Option<Arc<NegotiationSession>> {
        match lock(&self.attempt).as_ref() {
            Some(attempt) if attempt.id == id => attempt.session.clone(),
            _ => None,
        }
    }

    fn report(&self, event: ControllerEvent) {
        self.events.emit(event);
    }

    fn take_abort(&self, id: u64) -> Option<ControllerError> {
        let mut aborted = lock(&self.aborted);
        match aborted.take() {
            Some((aborted_id, err)) if aborted_id == id => Some(err),
            other => {
                *aborted = other;
                None
            }
        }
    }

    async fn stop_attempt(&self, id: u64) {
        let attempt = {
            let mut slot = lock(&self.attempt);
            match slot.as_ref() {
                Some(a) if a.id == id => slot.take(),
                _ => None,
            }
        };
        if let Some(attempt) = attempt {
            self.teardown(attempt).await;
        }
    }

    async fn abort_attempt(&self, id: u64, reason: ControllerError) {
        if !self.is_current(id) {
            return;
        }
        *lock(&self.aborted) = Some((id, reason));
        self.stop_attempt(id).await;
    }

    async fn teardown(&self, attempt: Attempt) {
        let Attempt {
            id,
            role,
            stream_name,
            tracks,
            channel,
            session,
            driver,
        } = attempt;

        if let Some(driver) = driver {
            driver.abort();
        }
        if let Some(session) = session {
            session.close().await;
        }
        if let Some(channel) = channel {
            channel.close();
        }
        if !tracks.is_empty() {
            self.capture.release(&tracks);
        }
        info!(
            "Stopped {} attempt #{} for stream \"{}\"",
            role, id, stream_name
        );
        self.report(ControllerEvent::Stopped);
    }

    async fn handle_remote(&self, id: u64, text: &str) {
        let payload = match codec::decode_payload(text) {
            Ok(payload) => payload,
            Err(err) => {
                warn!("Dropping undecodable relay message: {}", err);
                self.report(ControllerEvent::Error(err.into()));
                return;
            }
        };

        let Some(session) = self.session_of(id) else {
            warn!("Remote description arrived before the local offer; dropping");
            self.report(ControllerEvent::Error(
                ApplyError::NotReady(NegotiationState::Idle).into(),
            ));
            return;
        };

        match session.apply_remote(payload.description).await {
            Ok(()) if self.is_current(id) => {
                self.report(ControllerEvent::RemoteApplied(payload.format));
            }
            Ok(()) => {}
            Err(err) => {
                warn!("Remote description not applied: {}", err);
                if self.is_current(id) {
                    self.report(ControllerEvent::Error(err.into()));
                }
            }
        }
    }
}

/// Serializes inbound relay traffic for attempt `id`.
async fn drive(inner: Weak<Inner>, id: u64, mut rx: mpsc::UnboundedReceiver<DriverInput>) {
    let mut connected = false;
    while let Some(input) = rx.recv().await {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match input {
            DriverInput::Message(text) => inner.handle_remote(id, &text).await,
            DriverInput::Status(ConnectionStatus::Connected) => connected = true,
            DriverInput::Status(ConnectionStatus::Disconnected) if connected => {
                if inner.is_current(id) {
                    warn!("Relay connection lost; ending attempt");
                    let reason = TransportError::Lost("relay connection ended".into());
                    // Teardown aborts this task, so it runs elsewhere.
                    tokio::spawn(async move { inner.abort_attempt(id, reason.into()).await });
                }
                return;
            }
            DriverInput::Status(_) => {}
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
