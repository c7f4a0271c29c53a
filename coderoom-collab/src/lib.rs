//! # coderoom-collab: Room-based real-time code sharing
//!
//! Participants join a room by id and display name. Every edit is sent as
//! the full document text and relayed to the other members of the room;
//! newcomers receive the current text from the members already there.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     WebSocket      ┌─────────────┐
//! │ Session     │ ◄─────────────────► │ SyncServer  │
//! │ + SyncClient│     Binary Proto    │ (accept)    │
//! └──────┬──────┘                     └──────┬──────┘
//!        │                                   │
//!        ▼                                   ▼
//! ┌─────────────┐                     ┌─────────────┐
//! │DocumentSync │                     │ RoomRelay   │
//! │ + TextWidget│                     │ (fan-out)   │
//! └─────────────┘                     └──────┬──────┘
//!                                            │
//!                                    ┌───────┴─────────┐
//!                                    │PresenceRegistry │
//!                                    │ (room rosters)  │
//!                                    └─────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: Binary wire protocol (bincode-encoded client/relay events)
//! - [`presence`]: Room membership registry
//! - [`relay`]: Per-room event routing and fan-out
//! - [`server`]: WebSocket relay server
//! - [`client`]: WebSocket transport
//! - [`editor`]: Text widget boundary
//! - [`document`]: Widget ↔ relay bridging with echo suppression
//! - [`session`]: Participant lifecycle state machine

pub mod protocol;
pub mod presence;
pub mod relay;
pub mod server;
pub mod client;
pub mod editor;
pub mod document;
pub mod session;

// Re-exports for convenience
pub use protocol::{ClientEvent, ConnectionId, Participant, ProtocolError, RelayEvent, RoomId};
pub use presence::{Departure, PresenceRegistry, RoomGuard, RoomMembers};
pub use relay::{Inbox, RelayError, RelayStats, RoomRelay};
pub use server::{ConfigError, ServerConfig, ServerStats, SyncServer};
pub use client::{ConnectionState, SyncClient, Transport, TransportEvent};
pub use editor::{ChangeOrigin, MemoryEditor, Position, ScrollInfo, TextChange, TextWidget};
pub use document::DocumentSync;
pub use session::{Session, SessionError, SessionNotice, SessionState};
