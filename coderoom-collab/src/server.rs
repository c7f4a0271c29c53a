//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── outbox A ──► Client A
//!            ├── ClientEvent ── RoomRelay ── outbox B ──► Client B
//! Client B ──┘        │                └── outbox C ──► Client C
//!                     ▼
//!              PresenceRegistry
//! ```
//!
//! One task per connection. It decodes inbound frames, hands them to the
//! shared [`RoomRelay`], and writes the connection's outbox back onto the
//! socket. When the socket ends, for whatever reason, the same task runs
//! the departure sequence exactly once.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, Interval};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{ClientEvent, ConnectionId};
use crate::relay::{Inbox, RoomRelay};

/// Environment variable overriding [`ServerConfig::bind_addr`].
pub const BIND_ADDR_ENV: &str = "CODEROOM_BIND_ADDR";
/// Environment variable overriding [`ServerConfig::heartbeat_interval_secs`].
pub const HEARTBEAT_ENV: &str = "CODEROOM_HEARTBEAT_SECS";

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Interval between WebSocket keep-alive pings; 0 disables them
    pub heartbeat_interval_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:9090".to_string(),
            heartbeat_interval_secs: 30,
        }
    }
}

impl ServerConfig {
    /// Defaults overlaid with `CODEROOM_BIND_ADDR` / `CODEROOM_HEARTBEAT_SECS`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Defaults overlaid with whatever `lookup` returns for each variable.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Some(addr) = lookup(BIND_ADDR_ENV) {
            let addr = addr.trim();
            if addr.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: BIND_ADDR_ENV,
                    value: addr.to_string(),
                });
            }
            config.bind_addr = addr.to_string();
        }

        if let Some(secs) = lookup(HEARTBEAT_ENV) {
            config.heartbeat_interval_secs =
                secs.trim()
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue {
                        key: HEARTBEAT_ENV,
                        value: secs.clone(),
                    })?;
        }

        Ok(config)
    }

    fn heartbeat(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }
}

/// Configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Frames that could not be decoded into a client event
    pub malformed_frames: u64,
    pub active_rooms: usize,
}

#[derive(Default)]
struct AtomicServerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    total_messages: AtomicU64,
    total_bytes: AtomicU64,
    malformed_frames: AtomicU64,
}

/// The relay server.
pub struct SyncServer {
    config: ServerConfig,
    relay: Arc<RoomRelay>,
    stats: Arc<AtomicServerStats>,
}

impl SyncServer {
    /// Create a new relay server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            relay: Arc::new(RoomRelay::new()),
            stats: Arc::new(AtomicServerStats::default()),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve until the listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        log::info!("Relay server listening on {}", listener.local_addr()?);
        self.serve(listener).await
    }

    /// Serve WebSocket connections from an already bound listener.
    pub async fn serve(
        &self,
        listener: TcpListener,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let relay = self.relay.clone();
            let stats = self.stats.clone();
            let heartbeat = self.config.heartbeat();

            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, relay, stats, heartbeat).await
                {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection from handshake to teardown.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        relay: Arc<RoomRelay>,
        stats: Arc<AtomicServerStats>,
        heartbeat: Option<Duration>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (connection_id, inbox) = relay.connect().await;

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);
        log::info!("WebSocket connection {connection_id} established from {addr}");

        let result =
            Self::pump(ws_stream, addr, connection_id, inbox, &relay, &stats, heartbeat).await;

        // Teardown runs here and only here, after every inbound event of
        // this connection has been handled.
        relay.disconnect(connection_id).await;
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::info!("Connection {connection_id} from {addr} closed");

        result
    }

    async fn pump(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        connection_id: ConnectionId,
        mut inbox: Inbox,
        relay: &RoomRelay,
        stats: &AtomicServerStats,
        heartbeat: Option<Duration>,
    ) -> Result<(), tokio_tungstenite::tungstenite::Error> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let mut heartbeat: Option<Interval> =
            heartbeat.map(|period| tokio::time::interval_at(Instant::now() + period, period));

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            stats.total_messages.fetch_add(1, Ordering::Relaxed);
                            stats.total_bytes.fetch_add(data.len() as u64, Ordering::Relaxed);

                            match ClientEvent::decode(&data) {
                                Ok(event) => {
                                    // Rejections are logged and counted by the relay.
                                    let _ = relay.handle(connection_id, event).await;
                                }
                                Err(e) => {
                                    stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                                    log::warn!("Dropping frame from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Text(_))) => {
                            stats.malformed_frames.fetch_add(1, Ordering::Relaxed);
                            log::warn!("Dropping text frame from {addr}; events are binary");
                        }

                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Close from {addr}");
                            break;
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            break;
                        }

                        _ => {}
                    }
                }

                // Outgoing relay frame
                frame = inbox.recv() => {
                    match frame {
                        Some(frame) => {
                            ws_sender.send(Message::Binary(frame.to_vec().into())).await?;
                        }
                        None => break,
                    }
                }

                // Keep-alive
                _ = async {
                    match heartbeat.as_mut() {
                        Some(interval) => {
                            interval.tick().await;
                        }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }

        Ok(())
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        ServerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            total_messages: self.stats.total_messages.load(Ordering::Relaxed),
            total_bytes: self.stats.total_bytes.load(Ordering::Relaxed),
            malformed_frames: self.stats.malformed_frames.load(Ordering::Relaxed),
            active_rooms: self.relay.registry().room_count().await,
        }
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared relay (registry, routing, relay stats).
    pub fn relay(&self) -> &Arc<RoomRelay> {
        &self.relay
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn test_server_config_default() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_addr, "127.0.0.1:9090");
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert_eq!(config.heartbeat(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_config_from_empty_lookup() {
        let config = ServerConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_config_overrides() {
        let config = ServerConfig::from_lookup(lookup(&[
            (BIND_ADDR_ENV, "0.0.0.0:8080"),
            (HEARTBEAT_ENV, " 5 "),
        ]))
        .unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:8080");
        assert_eq!(config.heartbeat_interval_secs, 5);
    }

    #[test]
    fn test_config_zero_heartbeat_disables_pings() {
        let config = ServerConfig::from_lookup(lookup(&[(HEARTBEAT_ENV, "0")])).unwrap();
        assert_eq!(config.heartbeat(), None);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let err = ServerConfig::from_lookup(lookup(&[(HEARTBEAT_ENV, "soon")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::InvalidValue {
                key: HEARTBEAT_ENV,
                value: "soon".into()
            }
        );
        assert!(ServerConfig::from_lookup(lookup(&[(BIND_ADDR_ENV, "  ")])).is_err());
    }

    #[test]
    fn test_server_creation() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.bind_addr(), "127.0.0.1:9090");
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = SyncServer::with_defaults();
        assert_eq!(server.stats().await, ServerStats::default());
    }
}
