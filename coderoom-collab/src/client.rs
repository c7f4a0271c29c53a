//! WebSocket transport for connecting to the relay server.
//!
//! Provides:
//! - Connection establishment (no automatic reconnection)
//! - Ordered, fire-and-forget event emission
//! - Decoded relay events on an mpsc receiver
//! - Explicit disconnect

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientEvent, ProtocolError, RelayEvent};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

/// Events surfaced by a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A decoded event from the relay
    Relay(RelayEvent),
    /// The connection ended cleanly
    Closed,
    /// The connection failed
    Error(String),
}

/// Outbound half of a relay connection.
pub trait Transport: Send {
    /// Queue an event for sending. Events are sent in call order.
    fn emit(&self, event: &ClientEvent) -> Result<(), ProtocolError>;

    /// Close the connection. Further emits fail.
    fn disconnect(&mut self);
}

/// The WebSocket transport.
pub struct SyncClient {
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ConnectionState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::UnboundedSender<Message>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<TransportEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<TransportEvent>,
}

impl SyncClient {
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<TransportEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket messages.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ConnectionState::Connecting;

        let ws_stream = match tokio_tungstenite::connect_async(self.server_url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                *self.state.write().await = ConnectionState::Disconnected;
                log::warn!("Failed to connect to {}: {e}", self.server_url);
                return Err(ProtocolError::ConnectionError(e.to_string()));
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Before the reader exists, so an immediate close is not overwritten.
        *self.state.write().await = ConnectionState::Connected;

        // Writer task: a single queue keeps emits in call order.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if ws_writer.send(msg).await.is_err() || closing {
                    break;
                }
            }
        });

        // Reader task: decode relay frames into transport events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            let mut failure = None;
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match RelayEvent::decode(&data) {
                        Ok(event) => {
                            if event_tx.send(TransportEvent::Relay(event)).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping frame from relay: {e}"),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        failure = Some(e.to_string());
                        break;
                    }
                }
            }

            // Connection lost
            *state.write().await = ConnectionState::Disconnected;
            let event = match failure {
                Some(reason) => TransportEvent::Error(reason),
                None => TransportEvent::Closed,
            };
            let _ = event_tx.send(event).await;
        });

        log::info!("Connected to {}", self.server_url);
        Ok(())
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ConnectionState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

impl Transport for SyncClient {
    fn emit(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        let encoded = event.encode()?;
        tx.send(Message::Binary(encoded.into()))
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    fn disconnect(&mut self) {
        if let Some(tx) = self.outgoing_tx.take() {
            let _ = tx.send(Message::Close(None));
            log::info!("Disconnecting from {}", self.server_url);
        }
    }
}
