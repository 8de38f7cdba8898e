//! State-tracked wrapper over the relay transport.
//!
//! The channel never interprets payloads and never reconnects on its own.
//! Each successful `connect` starts a generation; events from an older
//! generation (after `close`, or after the connection dropped) are discarded.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::TransportError;
use crate::notify::Notifier;
use crate::transport::{RelayConnection, RelayEvent, RelayTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "Disconnected"),
            Self::Connecting => write!(f, "Connecting..."),
            Self::Connected => write!(f, "Connected to relay"),
        }
    }
}

struct ChannelState {
    status: ConnectionStatus,
    generation: u64,
    outgoing: Option<mpsc::UnboundedSender<String>>,
    pump: Option<JoinHandle<()>>,
}

struct Shared {
    state: Mutex<ChannelState>,
    messages: Notifier<String>,
    status: Notifier<ConnectionStatus>,
    errors: Notifier<TransportError>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn is_current(&self, generation: u64) -> bool {
        let state = self.lock();
        state.generation == generation && state.status == ConnectionStatus::Connected
    }

    /// Tears down the connection of `generation` if it is still the live one.
    fn connection_lost(&self, generation: u64, error: Option<TransportError>) {
        let changed = {
            let mut state = self.lock();
            if state.generation != generation || state.status == ConnectionStatus::Disconnected {
                false
            } else {
                state.status = ConnectionStatus::Disconnected;
                state.generation += 1;
                state.outgoing = None;
                // Detach rather than abort: this may be the pump itself.
                state.pump = None;
                true
            }
        };

        if changed {
            if let Some(err) = error {
                warn!("Relay transport error: {}", err);
                self.errors.emit(err);
            } else {
                info!("Relay connection closed by remote");
            }
            self.status.emit(ConnectionStatus::Disconnected);
        }
    }
}

pub struct SignalingChannel {
    transport: Arc<dyn RelayTransport>,
    shared: Arc<Shared>,
}

impl SignalingChannel {
    pub fn new(transport: Arc<dyn RelayTransport>) -> Self {
        Self {
            transport,
            shared: Arc::new(Shared {
                state: Mutex::new(ChannelState {
                    status: ConnectionStatus::Disconnected,
                    generation: 0,
                    outgoing: None,
                    pump: None,
                }),
                messages: Notifier::new(),
                status: Notifier::new(),
                errors: Notifier::new(),
            }),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.lock().status
    }

    /// Opens the relay. Only one attempt may be outstanding.
    pub async fn connect(&self, url: &str) -> Result<(), TransportError> {
        let generation = {
            let mut state = self.shared.lock();
            if state.status != ConnectionStatus::Disconnected {
                return Err(TransportError::AlreadyActive);
            }
            state.status = ConnectionStatus::Connecting;
            state.generation += 1;
            state.generation
        };
        self.shared.status.emit(ConnectionStatus::Connecting);
        info!("Connecting to relay: {}", url);

        let RelayConnection { outgoing, incoming } = match self.transport.open(url).await {
            Ok(connection) => connection,
            Err(err) => {
                let current = {
                    let mut state = self.shared.lock();
                    let current = state.generation == generation;
                    if current {
                        state.status = ConnectionStatus::Disconnected;
                    }
                    current
                };
                if current {
                    warn!("Failed to connect to relay {}: {}", url, err);
                    self.shared.errors.emit(err.clone());
                    self.shared.status.emit(ConnectionStatus::Disconnected);
                }
                return Err(err);
            }
        };

        {
            let mut state = self.shared.lock();
            if state.generation != generation {
                debug!("Relay channel closed while connecting; dropping connection");
                return Err(TransportError::Closed);
            }
            state.status = ConnectionStatus::Connected;
            state.outgoing = Some(outgoing);
        }
        info!("Connected to relay: {}", url);
        self.shared.status.emit(ConnectionStatus::Connected);

        let pump = tokio::spawn(pump_incoming(self.shared.clone(), generation, incoming));
        let mut state = self.shared.lock();
        if state.generation == generation {
            state.pump = Some(pump);
        } else {
            pump.abort();
        }
        Ok(())
    }

    pub fn send(&self, text: &str) -> Result<(), TransportError> {
        let (generation, outgoing) = {
            let state = self.shared.lock();
            if state.status != ConnectionStatus::Connected {
                return Err(TransportError::NotConnected);
            }
            (state.generation, state.outgoing.clone())
        };
        let Some(outgoing) = outgoing else {
            return Err(TransportError::NotConnected);
        };

        if outgoing.send(text.to_string()).is_err() {
            let err = TransportError::Send("relay writer stopped".into());
            self.shared.connection_lost(generation, Some(err.clone()));
            return Err(err);
        }
        debug!("Sent {} bytes to relay", text.len());
        Ok(())
    }

    pub fn on_message(&self, handler: impl Fn(String) + Send + Sync + 'static) {
        self.shared.messages.subscribe(handler);
    }

    pub fn on_status_change(&self, handler: impl Fn(ConnectionStatus) + Send + Sync + 'static) {
        self.shared.status.subscribe(handler);
    }

    pub fn on_error(&self, handler: impl Fn(TransportError) + Send + Sync + 'static) {
        self.shared.errors.subscribe(handler);
    }

    /// Idempotent. Pending continuations of the closed generation become no-ops.
    pub fn close(&self) {
        let pump = {
            let mut state = self.shared.lock();
            if state.status == ConnectionStatus::Disconnected && state.outgoing.is_none() {
                return;
            }
            state.status = ConnectionStatus::Disconnected;
            state.generation += 1;
            state.outgoing = None;
            state.pump.take()
        };
        if let Some(pump) = pump {
            pump.abort();
        }
        info!("Relay channel closed");
        self.shared.status.emit(ConnectionStatus::Disconnected);
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Some(pump) = self.shared.lock().pump.take() {
            pump.abort();
        }
    }
}

async fn pump_incoming(
    shared: Arc<Shared>,
    generation: u64,
    mut incoming: mpsc::UnboundedReceiver<RelayEvent>,
) {
    while let Some(event) = incoming.recv().await {
        match event {
            RelayEvent::Message(text) => {
                if !shared.is_current(generation) {
                    return;
                }
                debug!("Received {} bytes from relay", text.len());
                shared.messages.emit(text);
            }
            RelayEvent::Closed => {
                shared.connection_lost(generation, None);
                return;
            }
            RelayEvent::Error(reason) => {
                shared.connection_lost(generation, Some(TransportError::Lost(reason)));
                return;
            }
        }
    }
    shared.connection_lost(generation, None);
}
