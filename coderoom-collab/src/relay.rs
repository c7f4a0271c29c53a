//! Room relay: routes client events to the right peers.
//!
//! Each connection owns one unbounded, ordered outbox. Events are encoded
//! once and the same `Arc<Vec<u8>>` frame is pushed into every recipient's
//! outbox, so two events from one sender always reach a given recipient in
//! the order they were sent.
//!
//! Fan-out for a room happens while the room guard from the
//! [`PresenceRegistry`] is held, which serializes joins, leaves and edits
//! within that room without blocking any other room.
//!
//! | Inbound (from C)            | Delivered to                  |
//! |-----------------------------|-------------------------------|
//! | `Join`                      | every member, C included      |
//! | `CodeChange`                | every member except C         |
//! | `SyncCode { target }`       | `target` only                 |
//! | connection teardown         | remaining members             |

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{mpsc, RwLock};

use crate::presence::{Departure, PresenceRegistry};
use crate::protocol::{ClientEvent, ConnectionId, Participant, ProtocolError, RelayEvent, RoomId};

/// A pre-encoded relay event.
pub type Frame = Arc<Vec<u8>>;

/// Sending half of a connection's outbox.
pub type Outbox = mpsc::UnboundedSender<Frame>;

/// Receiving half of a connection's outbox, drained by the connection's writer.
pub type Inbox = mpsc::UnboundedReceiver<Frame>;

/// Snapshot of relay counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub joins: u64,
    pub departures: u64,
    /// Inbound events accepted and routed.
    pub events_relayed: u64,
    /// Frames pushed into outboxes.
    pub deliveries: u64,
    /// Inbound events rejected (malformed, wrong room, unknown target).
    pub events_dropped: u64,
    pub active_connections: usize,
}

/// Lock-free counters, read via [`RoomRelay::stats`].
#[derive(Default)]
struct AtomicRelayStats {
    joins: AtomicU64,
    departures: AtomicU64,
    events_relayed: AtomicU64,
    deliveries: AtomicU64,
    events_dropped: AtomicU64,
}

/// Reasons an inbound event was not relayed. None of them are fatal to
/// the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("Connection {0} has not joined a room")]
    NotJoined(ConnectionId),
    #[error("Connection {0} is not a member of room {1}")]
    NotInRoom(ConnectionId, RoomId),
    #[error("Sync target {0} is not in the sender's room")]
    UnknownTarget(ConnectionId),
}

/// Routes events between the participants of each room.
#[derive(Default)]
pub struct RoomRelay {
    registry: PresenceRegistry,
    outboxes: RwLock<HashMap<ConnectionId, Outbox>>,
    stats: AtomicRelayStats,
}

impl RoomRelay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new transport connection and hand back its id and inbox.
    pub async fn connect(&self) -> (ConnectionId, Inbox) {
        let connection_id = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.outboxes.write().await.insert(connection_id, tx);
        (connection_id, rx)
    }

    /// Route one inbound event. Returns the number of frames delivered.
    pub async fn handle(&self, from: ConnectionId, event: ClientEvent) -> Result<usize, RelayError> {
        let kind = event.kind();
        let result = match event {
            ClientEvent::Join {
                room_id,
                display_name,
            } => self.join(from, room_id, display_name).await,
            ClientEvent::CodeChange { room_id, text } => {
                self.code_change(from, &room_id, text).await
            }
            ClientEvent::SyncCode { text, target } => self.sync_code(from, target, text).await,
        };

        match &result {
            Ok(delivered) => {
                self.stats.events_relayed.fetch_add(1, Ordering::Relaxed);
                log::trace!("Relayed {kind} from {from} to {delivered} peers");
            }
            Err(e) => {
                self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                log::debug!("Dropped {kind} from {from}: {e}");
            }
        }
        result
    }

    /// Admit `from` into `room_id` and broadcast the new roster to the
    /// whole room, the joiner included.
    pub async fn join(
        &self,
        from: ConnectionId,
        room_id: RoomId,
        display_name: String,
    ) -> Result<usize, RelayError> {
        ClientEvent::Join {
            room_id: room_id.clone(),
            display_name: display_name.clone(),
        }
        .validate()?;

        if let Some(current) = self.registry.room_of(from).await {
            if current != room_id {
                self.leave(from).await;
            }
        }

        let participant = Participant::new(from, display_name.clone(), room_id.clone());
        let guard = self.registry.add_locked(&room_id, participant).await;

        let event = RelayEvent::Joined {
            members: guard.members().to_vec(),
            joiner: from,
            joiner_name: display_name.clone(),
        };
        let frame = Arc::new(event.encode()?);
        let delivered = self
            .deliver(guard.members().iter().map(|m| m.connection_id), &frame)
            .await;
        drop(guard);

        self.stats.joins.fetch_add(1, Ordering::Relaxed);
        log::info!("{display_name} ({from}) joined room {room_id}");
        Ok(delivered)
    }

    /// Forward a full-text change to every other member of the room.
    pub async fn code_change(
        &self,
        from: ConnectionId,
        room_id: &RoomId,
        text: String,
    ) -> Result<usize, RelayError> {
        let guard = match self.registry.lock_room(room_id).await {
            Some(guard) if guard.contains(from) => guard,
            _ => return Err(RelayError::NotInRoom(from, room_id.clone())),
        };

        let frame = Arc::new(RelayEvent::CodeChange { text, from }.encode()?);
        let targets = guard
            .members()
            .iter()
            .map(|m| m.connection_id)
            .filter(|id| *id != from);
        Ok(self.deliver(targets, &frame).await)
    }

    /// Send the sender's document text to a single member of its room.
    pub async fn sync_code(
        &self,
        from: ConnectionId,
        target: ConnectionId,
        text: String,
    ) -> Result<usize, RelayError> {
        let room_id = self
            .registry
            .room_of(from)
            .await
            .ok_or(RelayError::NotJoined(from))?;
        let guard = self
            .registry
            .lock_room(&room_id)
            .await
            .filter(|guard| guard.contains(from))
            .ok_or(RelayError::NotJoined(from))?;

        if target == from || !guard.contains(target) {
            return Err(RelayError::UnknownTarget(target));
        }

        let frame = Arc::new(RelayEvent::CodeChange { text, from }.encode()?);
        Ok(self.deliver(std::iter::once(target), &frame).await)
    }

    /// Take a connection out of its room and tell the remaining members.
    ///
    /// Returns `None` if the connection was not in a room; calling this
    /// twice for the same connection broadcasts only once.
    pub async fn leave(&self, connection_id: ConnectionId) -> Option<Departure> {
        let (departure, guard) = self.registry.remove_locked(connection_id).await?;

        if !guard.is_empty() {
            let event = RelayEvent::Disconnected {
                connection_id,
                display_name: departure.participant.display_name.clone(),
            };
            match event.encode() {
                Ok(bytes) => {
                    let frame = Arc::new(bytes);
                    self.deliver(guard.members().iter().map(|m| m.connection_id), &frame)
                        .await;
                }
                Err(e) => log::error!("Failed to encode departure of {connection_id}: {e}"),
            }
        }
        drop(guard);

        self.stats.departures.fetch_add(1, Ordering::Relaxed);
        log::info!(
            "{} ({}) left room {}",
            departure.participant.display_name,
            connection_id,
            departure.room_id
        );
        Some(departure)
    }

    /// Tear down a connection: leave its room and drop its outbox.
    pub async fn disconnect(&self, connection_id: ConnectionId) -> Option<Departure> {
        let departure = self.leave(connection_id).await;
        self.outboxes.write().await.remove(&connection_id);
        departure
    }

    pub fn registry(&self) -> &PresenceRegistry {
        &self.registry
    }

    /// Relay statistics snapshot.
    pub async fn stats(&self) -> RelayStats {
        RelayStats {
            joins: self.stats.joins.load(Ordering::Relaxed),
            departures: self.stats.departures.load(Ordering::Relaxed),
            events_relayed: self.stats.events_relayed.load(Ordering::Relaxed),
            deliveries: self.stats.deliveries.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            active_connections: self.outboxes.read().await.len(),
        }
    }

    async fn deliver(&self, targets: impl Iterator<Item = ConnectionId>, frame: &Frame) -> usize {
        let outboxes = self.outboxes.read().await;
        let mut delivered = 0;
        for target in targets {
            let sent = outboxes
                .get(&target)
                .is_some_and(|outbox| outbox.send(frame.clone()).is_ok());
            if sent {
                delivered += 1;
            } else {
                log::trace!("No open outbox for {target}");
            }
        }
        self.stats
            .deliveries
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }
}
