//! Presence registry: who is in which room.
//!
//! ## Architecture
//!
//! ```text
//! rooms:     RwLock<HashMap<RoomId, Arc<Mutex<RoomMembers>>>>
//!                               │
//!                               ▼  one mutex per room
//!                        RoomMembers { members (join order), closed }
//!
//! locations: RwLock<HashMap<ConnectionId, RoomId>>
//! ```
//!
//! Every membership change for a room happens under that room's mutex.
//! The `*_locked` variants hand the still-held guard back to the caller
//! so that the broadcast describing the change is fanned out before any
//! other change to the same room can interleave. Rooms never block each
//! other.
//!
//! A room mutex may be held while briefly taking the `rooms` or
//! `locations` map. Nothing waits on a room mutex while holding either map.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::protocol::{ConnectionId, Participant, RoomId};

// ───────────────────────────────────────────────────────────────────
// Room state
// ───────────────────────────────────────────────────────────────────

/// Members of a single room, kept in join order.
#[derive(Debug)]
pub struct RoomMembers {
    room_id: RoomId,
    members: Vec<Participant>,
    /// Set once the room has been emptied and dropped from the registry.
    closed: bool,
}

impl RoomMembers {
    fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            members: Vec::new(),
            closed: false,
        }
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn members(&self) -> &[Participant] {
        &self.members
    }

    pub fn contains(&self, connection_id: ConnectionId) -> bool {
        self.members.iter().any(|m| m.connection_id == connection_id)
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// Exclusive access to one room. The room stays serialized until dropped.
pub type RoomGuard = OwnedMutexGuard<RoomMembers>;

/// Result of removing a connection from the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Departure {
    pub room_id: RoomId,
    pub participant: Participant,
    /// Whether the room was emptied and discarded.
    pub room_closed: bool,
}

// ───────────────────────────────────────────────────────────────────
// Registry
// ───────────────────────────────────────────────────────────────────

/// Process-wide room membership.
#[derive(Default)]
pub struct PresenceRegistry {
    rooms: RwLock<HashMap<RoomId, Arc<Mutex<RoomMembers>>>>,
    locations: RwLock<HashMap<ConnectionId, RoomId>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `participant` in `room_id` and return the room roster.
    ///
    /// Idempotent per connection id. A connection registered in another
    /// room is moved out of it first.
    pub async fn add(&self, room_id: &RoomId, participant: Participant) -> Vec<Participant> {
        self.add_locked(room_id, participant).await.members().to_vec()
    }

    /// Like [`add`](Self::add), but returns the room guard still held.
    pub async fn add_locked(&self, room_id: &RoomId, mut participant: Participant) -> RoomGuard {
        let connection_id = participant.connection_id;
        participant.room_id = room_id.clone();

        let previous = self.room_of(connection_id).await;
        if previous.as_ref().is_some_and(|prev| prev != room_id) {
            self.remove(connection_id).await;
        }

        loop {
            let room = self.get_or_create(room_id).await;
            let mut guard = room.lock_owned().await;
            if guard.closed {
                // Emptied and discarded between lookup and lock; start over.
                continue;
            }

            match guard
                .members
                .iter_mut()
                .find(|m| m.connection_id == connection_id)
            {
                Some(existing) => existing.display_name = participant.display_name.clone(),
                None => guard.members.push(participant.clone()),
            }
            self.locations
                .write()
                .await
                .insert(connection_id, room_id.clone());

            log::debug!(
                "Registered {} ({}) in room {} ({} members)",
                participant.display_name,
                connection_id,
                room_id,
                guard.len()
            );
            return guard;
        }
    }

    /// Remove a connection from whichever room it occupies.
    pub async fn remove(&self, connection_id: ConnectionId) -> Option<Departure> {
        self.remove_locked(connection_id)
            .await
            .map(|(departure, _guard)| departure)
    }

    /// Like [`remove`](Self::remove), but also returns the room guard.
    ///
    /// Only the first caller for a given connection gets `Some`: the
    /// location entry is taken before the room is touched.
    pub async fn remove_locked(
        &self,
        connection_id: ConnectionId,
    ) -> Option<(Departure, RoomGuard)> {
        let room_id = self.locations.write().await.remove(&connection_id)?;
        let room = self.rooms.read().await.get(&room_id).cloned()?;
        let mut guard = room.clone().lock_owned().await;

        let index = guard
            .members
            .iter()
            .position(|m| m.connection_id == connection_id)?;
        let participant = guard.members.remove(index);

        let room_closed = guard.members.is_empty();
        if room_closed {
            guard.closed = true;
            let mut rooms = self.rooms.write().await;
            if rooms
                .get(&room_id)
                .is_some_and(|current| Arc::ptr_eq(current, &room))
            {
                rooms.remove(&room_id);
            }
            log::debug!("Room {room_id} discarded (empty)");
        }

        Some((
            Departure {
                room_id,
                participant,
                room_closed,
            },
            guard,
        ))
    }

    /// Snapshot of a room's roster; empty if the room does not exist.
    pub async fn members_of(&self, room_id: &RoomId) -> Vec<Participant> {
        match self.lock_room(room_id).await {
            Some(guard) => guard.members().to_vec(),
            None => Vec::new(),
        }
    }

    /// Lock an existing, open room.
    pub async fn lock_room(&self, room_id: &RoomId) -> Option<RoomGuard> {
        let room = self.rooms.read().await.get(room_id).cloned()?;
        let guard = room.lock_owned().await;
        if guard.closed {
            None
        } else {
            Some(guard)
        }
    }

    /// Room currently occupied by a connection.
    pub async fn room_of(&self, connection_id: ConnectionId) -> Option<RoomId> {
        self.locations.read().await.get(&connection_id).cloned()
    }

    /// Number of non-empty rooms.
    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.read().await.keys().cloned().collect()
    }

    async fn get_or_create(&self, room_id: &RoomId) -> Arc<Mutex<RoomMembers>> {
        // Fast path: read lock
        if let Some(room) = self.rooms.read().await.get(room_id) {
            return room.clone();
        }

        let mut rooms = self.rooms.write().await;
        rooms
            .entry(room_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RoomMembers::new(room_id.clone()))))
            .clone()
    }
}

// ===================================================================
// Tests
// ===================================================================
