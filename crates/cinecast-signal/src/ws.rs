//! WebSocket relay transport.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::error::TransportError;
use crate::transport::{RelayConnection, RelayEvent, RelayTransport};

/// Opens `ws://` or `wss://` relay connections, one text frame per payload.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebSocketTransport;

impl WebSocketTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl RelayTransport for WebSocketTransport {
    async fn open(&self, url: &str) -> Result<RelayConnection, TransportError> {
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| TransportError::Connect(e.to_string()))?;
        let (mut sink, mut stream) = ws_stream.split();

        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
        let (incoming_tx, incoming) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = outgoing_rx.recv().await {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    warn!("WebSocket send failed: {}", e);
                    return;
                }
            }
            debug!("Relay writer finished; closing WebSocket");
            let _ = sink.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => RelayEvent::Message(text.to_string()),
                    Ok(Message::Close(_)) => RelayEvent::Closed,
                    Ok(_) => continue,
                    Err(e) => RelayEvent::Error(e.to_string()),
                };
                let terminal = !matches!(event, RelayEvent::Message(_));
                if incoming_tx.send(event).is_err() || terminal {
                    return;
                }
            }
            let _ = incoming_tx.send(RelayEvent::Closed);
        });

        Ok(RelayConnection { outgoing, incoming })
    }
}
