//! Session controller: one participant's lifecycle in a room.
//!
//! ```text
//! Disconnected ──begin_connect──► Connecting ──connected──► Joining
//!      ▲                              │                        │ first Joined
//!      │◄──────── transport error ────┴────────────────────────┤
//!      │                                                       ▼
//!      └──────────────── Leaving ◄────────── leave ─────────  Active
//! ```
//!
//! The controller does no I/O of its own. It emits through a [`Transport`]
//! and is fed [`TransportEvent`]s by whoever owns the connection;
//! [`Session::connect`] wires both ends to a WebSocket [`SyncClient`].

use thiserror::Error;
use tokio::sync::mpsc;

use crate::client::{SyncClient, Transport, TransportEvent};
use crate::document::DocumentSync;
use crate::editor::TextWidget;
use crate::protocol::{ClientEvent, ConnectionId, Participant, ProtocolError, RelayEvent, RoomId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Joining,
    Active,
    Leaving,
}

/// User-visible notifications raised by the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    PeerJoined {
        connection_id: ConnectionId,
        display_name: String,
    },
    PeerLeft {
        connection_id: ConnectionId,
        display_name: String,
    },
    Error(String),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("Cannot {action} while {state:?}")]
    InvalidState {
        action: &'static str,
        state: SessionState,
    },
    #[error("Connection failed: {0}")]
    Connection(String),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

pub struct Session<W: TextWidget> {
    state: SessionState,
    display_name: String,
    self_id: Option<ConnectionId>,
    members: Vec<Participant>,
    document: DocumentSync<W>,
    transport: Option<Box<dyn Transport>>,
    notices: Vec<SessionNotice>,
}

impl<W: TextWidget> Session<W> {
    /// Create a disconnected session. Room id and display name must not be blank.
    pub fn new(
        room_id: RoomId,
        display_name: impl Into<String>,
        widget: W,
    ) -> Result<Self, SessionError> {
        let display_name = display_name.into();
        if room_id.is_blank() {
            return Err(SessionError::MissingField("room id"));
        }
        if display_name.trim().is_empty() {
            return Err(SessionError::MissingField("display name"));
        }

        Ok(Self {
            state: SessionState::Disconnected,
            display_name,
            self_id: None,
            members: Vec::new(),
            document: DocumentSync::new(room_id, widget),
            transport: None,
            notices: Vec::new(),
        })
    }

    /// Connect over WebSocket and announce the join.
    ///
    /// The returned receiver must be drained into
    /// [`handle_transport_event`](Self::handle_transport_event).
    pub async fn connect(
        &mut self,
        url: &str,
    ) -> Result<mpsc::Receiver<TransportEvent>, SessionError> {
        self.begin_connect()?;

        let mut client = SyncClient::new(url);
        let events = client
            .take_event_rx()
            .ok_or(SessionError::Connection("event receiver already taken".into()))?;

        match client.connect().await {
            Ok(()) => {
                self.connected(Box::new(client))?;
                Ok(events)
            }
            Err(e) => {
                self.connection_failed(&e.to_string());
                Err(SessionError::Connection(e.to_string()))
            }
        }
    }

    /// Disconnected → Connecting.
    pub fn begin_connect(&mut self) -> Result<(), SessionError> {
        self.expect_state("connect", &[SessionState::Disconnected])?;
        self.state = SessionState::Connecting;
        log::info!(
            "Connecting to room {} as {}",
            self.document.room_id(),
            self.display_name
        );
        Ok(())
    }

    /// Connecting → Joining: keep the transport and emit `Join`.
    pub fn connected(&mut self, transport: Box<dyn Transport>) -> Result<(), SessionError> {
        self.expect_state("join", &[SessionState::Connecting])?;

        let join = ClientEvent::join(self.document.room_id().clone(), self.display_name.clone());
        if let Err(e) = transport.emit(&join) {
            self.transport = Some(transport);
            self.connection_failed(&e.to_string());
            return Err(e.into());
        }

        self.transport = Some(transport);
        self.state = SessionState::Joining;
        Ok(())
    }

    /// Fatal while Connecting or Joining; ignored otherwise.
    pub fn connection_failed(&mut self, reason: &str) {
        if !matches!(
            self.state,
            SessionState::Connecting | SessionState::Joining
        ) {
            return;
        }
        log::error!("Connection to room {} failed: {reason}", self.document.room_id());
        self.notices
            .push(SessionNotice::Error(format!("Connection failed: {reason}")));
        self.reset();
    }

    pub fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Relay(event) => self.handle_relay_event(event),
            TransportEvent::Closed => self.transport_lost("connection closed"),
            TransportEvent::Error(reason) => self.transport_lost(&reason),
        }
    }

    pub fn handle_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Joined {
                members,
                joiner,
                joiner_name,
            } => self.on_joined(members, joiner, joiner_name),
            RelayEvent::CodeChange { text, from } => self.on_code_change(text, from),
            RelayEvent::Disconnected {
                connection_id,
                display_name,
            } => self.on_disconnected(connection_id, display_name),
        }
    }

    /// Emit pending local edits. Returns how many were sent.
    ///
    /// Outside Joining/Active the edits are consumed but not sent.
    pub fn flush_local_changes(&mut self) -> usize {
        let events = self.document.poll_local_changes();
        if !self.is_in_room() {
            return 0;
        }
        events.iter().filter(|event| self.emit(event)).count()
    }

    /// Active (or Joining) → Leaving → Disconnected. Closes the transport.
    pub fn leave(&mut self) -> Result<(), SessionError> {
        self.expect_state("leave", &[SessionState::Joining, SessionState::Active])?;

        self.state = SessionState::Leaving;
        log::info!(
            "{} leaving room {}",
            self.display_name,
            self.document.room_id()
        );
        self.reset();
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Room roster as of the latest `Joined`/`Disconnected`, in join order.
    pub fn members(&self) -> &[Participant] {
        &self.members
    }

    /// This client's connection id, once the relay has announced it.
    pub fn self_id(&self) -> Option<ConnectionId> {
        self.self_id
    }

    pub fn room_id(&self) -> &RoomId {
        self.document.room_id()
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn document(&self) -> &DocumentSync<W> {
        &self.document
    }

    pub fn document_mut(&mut self) -> &mut DocumentSync<W> {
        &mut self.document
    }

    /// Drain queued notifications, oldest first.
    pub fn take_notices(&mut self) -> Vec<SessionNotice> {
        std::mem::take(&mut self.notices)
    }

    fn on_joined(&mut self, members: Vec<Participant>, joiner: ConnectionId, joiner_name: String) {
        match self.state {
            SessionState::Joining => {
                // Our own join is the first Joined this connection can see.
                self.self_id = Some(joiner);
                self.members = members;
                self.state = SessionState::Active;
                log::info!(
                    "Joined room {} with {} member(s)",
                    self.document.room_id(),
                    self.members.len()
                );
            }
            SessionState::Active => {
                let known = self.members.iter().any(|m| m.connection_id == joiner);
                self.members = members;
                if known || self.self_id == Some(joiner) {
                    return;
                }

                log::info!("{joiner_name} joined room {}", self.document.room_id());
                self.notices.push(SessionNotice::PeerJoined {
                    connection_id: joiner,
                    display_name: joiner_name,
                });

                // Pending local edits go out first so the snapshot is not stale.
                self.flush_local_changes();
                let sync = ClientEvent::sync_code(self.document.text(), joiner);
                self.emit(&sync);
            }
            state => log::debug!("Ignoring joined event while {state:?}"),
        }
    }

    fn on_code_change(&mut self, text: String, from: ConnectionId) {
        if !self.is_in_room() {
            log::debug!("Ignoring code change while {:?}", self.state);
            return;
        }

        // Local edits made before this text arrived go out first; the
        // remote notification the apply produces is swallowed.
        self.document.apply_remote(text, from);
        self.flush_local_changes();
    }

    fn on_disconnected(&mut self, connection_id: ConnectionId, display_name: String) {
        if !self.is_in_room() {
            return;
        }
        self.members.retain(|m| m.connection_id != connection_id);
        if self.self_id == Some(connection_id) {
            return;
        }

        log::info!("{display_name} left room {}", self.document.room_id());
        self.notices.push(SessionNotice::PeerLeft {
            connection_id,
            display_name,
        });
    }

    fn transport_lost(&mut self, reason: &str) {
        match self.state {
            SessionState::Connecting | SessionState::Joining => self.connection_failed(reason),
            SessionState::Active => {
                log::warn!(
                    "Lost connection to room {}: {reason}",
                    self.document.room_id()
                );
                self.notices
                    .push(SessionNotice::Error(format!("Connection lost: {reason}")));
                self.reset();
            }
            SessionState::Leaving | SessionState::Disconnected => {}
        }
    }

    fn emit(&self, event: &ClientEvent) -> bool {
        let Some(transport) = self.transport.as_ref() else {
            return false;
        };
        match transport.emit(event) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("Failed to send {}: {e}", event.kind());
                false
            }
        }
    }

    fn reset(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.disconnect();
        }
        self.members.clear();
        self.self_id = None;
        self.state = SessionState::Disconnected;
    }

    fn is_in_room(&self) -> bool {
        matches!(self.state, SessionState::Joining | SessionState::Active)
    }

    fn expect_state(
        &self,
        action: &'static str,
        allowed: &[SessionState],
    ) -> Result<(), SessionError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SessionError::InvalidState {
                action,
                state: self.state,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::editor::MemoryEditor;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex};

    #[derive(Clone, Default)]
    struct RecordingTransport {
        sent: Arc<Mutex<Vec<ClientEvent>>>,
        closed: Arc<AtomicBool>,
        fail: bool,
    }

    impl RecordingTransport {
        fn sent(&self) -> Vec<ClientEvent> {
            self.sent.lock().unwrap().clone()
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Transport for RecordingTransport {
        fn emit(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
            if self.fail || self.is_closed() {
                return Err(ProtocolError::ConnectionClosed);
            }
            self.sent.lock().unwrap().push(event.clone());
            Ok(())
        }

        fn disconnect(&mut self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn participant(id: ConnectionId, name: &str) -> Participant {
        Participant::new(id, name, RoomId::new("r1"))
    }

    fn joined(members: &[Participant], joiner: &Participant) -> TransportEvent {
        TransportEvent::Relay(RelayEvent::Joined {
            members: members.to_vec(),
            joiner: joiner.connection_id,
            joiner_name: joiner.display_name.clone(),
        })
    }

    /// A session that has completed its own join as `me`.
    fn active_session(
        name: &str,
        text: &str,
        me: &Participant,
        roster: &[Participant],
    ) -> (Session<MemoryEditor>, RecordingTransport) {
        let transport = RecordingTransport::default();
        let mut session = Session::new(RoomId::new("r1"), name, MemoryEditor::new(text)).unwrap();
        session.begin_connect().unwrap();
        session.connected(Box::new(transport.clone())).unwrap();
        session.handle_transport_event(joined(roster, me));
        assert_eq!(session.state(), SessionState::Active);
        (session, transport)
    }

    #[test]
    fn test_blank_fields_rejected() {
        let result = Session::new(RoomId::new(""), "Alice", MemoryEditor::default());
        assert!(matches!(result, Err(SessionError::MissingField("room id"))));

        let result = Session::new(RoomId::new("r1"), "  ", MemoryEditor::default());
        assert!(matches!(result, Err(SessionError::MissingField("display name"))));
    }

    #[test]
    fn test_lifecycle_to_active() {
        let transport = RecordingTransport::default();
        let mut session =
            Session::new(RoomId::new("r1"), "Alice", MemoryEditor::default()).unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);

        session.begin_connect().unwrap();
        assert_eq!(session.state(), SessionState::Connecting);

        session.connected(Box::new(transport.clone())).unwrap();
        assert_eq!(session.state(), SessionState::Joining);
        assert_eq!(transport.sent(), vec![ClientEvent::join("r1", "Alice")]);

        let me = participant(ConnectionId::new(), "Alice");
        session.handle_transport_event(joined(&[me.clone()], &me));

        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.self_id(), Some(me.connection_id));
        assert_eq!(session.members(), &[me]);
        // Own join: no notice, no sync.
        assert!(session.take_notices().is_empty());
        assert_eq!(transport.sent().len(), 1);
    }

    #[test]
    fn test_existing_member_syncs_newcomer() {
        let a = participant(ConnectionId::new(), "A");
        let b = participant(ConnectionId::new(), "B");
        let (mut session, transport) = active_session("A", "let x=1;", &a, &[a.clone()]);

        session.handle_transport_event(joined(&[a.clone(), b.clone()], &b));

        assert_eq!(session.members(), &[a, b.clone()]);
        assert_eq!(
            session.take_notices(),
            vec![SessionNotice::PeerJoined {
                connection_id: b.connection_id,
                display_name: "B".into(),
            }]
        );
        assert_eq!(
            transport.sent().last(),
            Some(&ClientEvent::sync_code("let x=1;", b.connection_id))
        );
    }

    #[test]
    fn test_repeated_join_of_known_member() {
        let a = participant(ConnectionId::new(), "A");
        let b = participant(ConnectionId::new(), "B");
        let (mut session, transport) =
            active_session("A", "doc", &a, &[a.clone(), b.clone()]);

        let renamed = participant(b.connection_id, "Bee");
        session.handle_transport_event(joined(&[a.clone(), renamed.clone()], &renamed));

        // Roster refreshed, but no arrival notice and no resync.
        assert_eq!(session.members(), &[a, renamed]);
        assert!(session.take_notices().is_empty());
        assert_eq!(transport.sent(), vec![ClientEvent::join("r1", "A")]);
    }

    #[test]
    fn test_newcomer_applies_sync_without_echo() {
        let a = participant(ConnectionId::new(), "A");
        let b = participant(ConnectionId::new(), "B");
        let (mut session, transport) = active_session("B", "", &b, &[a.clone(), b.clone()]);

        session.handle_transport_event(TransportEvent::Relay(RelayEvent::CodeChange {
            text: "let x=1;".into(),
            from: a.connection_id,
        }));

        assert_eq!(session.document().text(), "let x=1;");
        assert_eq!(session.document().widget().value(), "let x=1;");
        // Only the initial Join went out.
        assert_eq!(transport.sent(), vec![ClientEvent::join("r1", "B")]);
    }

    #[test]
    fn test_peer_left() {
        let a = participant(ConnectionId::new(), "A");
        let b = participant(ConnectionId::new(), "B");
        let (mut session, _transport) = active_session("B", "", &b, &[a.clone(), b.clone()]);

        session.handle_transport_event(TransportEvent::Relay(RelayEvent::Disconnected {
            connection_id: a.connection_id,
            display_name: "A".into(),
        }));

        assert_eq!(session.members(), &[b]);
        assert_eq!(
            session.take_notices(),
            vec![SessionNotice::PeerLeft {
                connection_id: a.connection_id,
                display_name: "A".into(),
            }]
        );
    }

    #[test]
    fn test_local_edits_emitted_when_active() {
        let a = participant(ConnectionId::new(), "A");
        let (mut session, transport) = active_session("A", "", &a, &[a.clone()]);

        session.document_mut().widget_mut().insert("let x");
        session.document_mut().widget_mut().insert("=1;");

        assert_eq!(session.flush_local_changes(), 2);
        assert_eq!(
            &transport.sent()[1..],
            &[
                ClientEvent::code_change("r1", "let x"),
                ClientEvent::code_change("r1", "let x=1;"),
            ]
        );
    }

    #[test]
    fn test_local_edits_not_emitted_when_disconnected() {
        let mut session =
            Session::new(RoomId::new("r1"), "Alice", MemoryEditor::default()).unwrap();
        session.document_mut().widget_mut().edit("offline");
        assert_eq!(session.flush_local_changes(), 0);
        assert_eq!(session.document().text(), "offline");
    }

    #[test]
    fn test_pending_local_edit_sent_before_remote_applied() {
        let a = participant(ConnectionId::new(), "A");
        let b = participant(ConnectionId::new(), "B");
        let (mut session, transport) = active_session("A", "", &a, &[a.clone(), b.clone()]);

        session.document_mut().widget_mut().edit("mine");
        session.handle_transport_event(TransportEvent::Relay(RelayEvent::CodeChange {
            text: "theirs".into(),
            from: b.connection_id,
        }));

        assert_eq!(
            transport.sent().last(),
            Some(&ClientEvent::code_change("r1", "mine"))
        );
        assert_eq!(session.document().text(), "theirs");
        assert_eq!(session.flush_local_changes(), 0);
    }

    #[test]
    fn test_error_while_connecting_is_fatal() {
        let mut session =
            Session::new(RoomId::new("r1"), "Alice", MemoryEditor::default()).unwrap();
        session.begin_connect().unwrap();
        session.handle_transport_event(TransportEvent::Error("refused".into()));

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            session.take_notices(),
            vec![SessionNotice::Error("Connection failed: refused".into())]
        );
    }

    #[test]
    fn test_error_while_joining_discards_transport() {
        let transport = RecordingTransport::default();
        let mut session =
            Session::new(RoomId::new("r1"), "Alice", MemoryEditor::default()).unwrap();
        session.begin_connect().unwrap();
        session.connected(Box::new(transport.clone())).unwrap();

        session.handle_transport_event(TransportEvent::Closed);

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(transport.is_closed());
        assert_eq!(session.take_notices().len(), 1);
        assert!(session.self_id().is_none());
    }

    #[test]
    fn test_failed_join_emit() {
        let transport = RecordingTransport {
            fail: true,
            ..Default::default()
        };
        let mut session =
            Session::new(RoomId::new("r1"), "Alice", MemoryEditor::default()).unwrap();
        session.begin_connect().unwrap();

        let result = session.connected(Box::new(transport));
        assert!(matches!(result, Err(SessionError::Protocol(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
    }

    #[test]
    fn test_leave_closes_transport() {
        let a = participant(ConnectionId::new(), "A");
        let (mut session, transport) = active_session("A", "", &a, &[a.clone()]);

        session.leave().unwrap();

        assert_eq!(session.state(), SessionState::Disconnected);
        assert!(transport.is_closed());
        assert!(session.members().is_empty());

        // The close that follows is expected and not reported.
        session.handle_transport_event(TransportEvent::Closed);
        assert!(session.take_notices().is_empty());
    }

    #[test]
    fn test_close_while_active_ends_session() {
        let a = participant(ConnectionId::new(), "A");
        let (mut session, _transport) = active_session("A", "", &a, &[a.clone()]);

        session.handle_transport_event(TransportEvent::Closed);

        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(
            session.take_notices(),
            vec![SessionNotice::Error("Connection lost: connection closed".into())]
        );
    }

    #[test]
    fn test_invalid_transitions() {
        let mut session =
            Session::new(RoomId::new("r1"), "Alice", MemoryEditor::default()).unwrap();
        assert!(matches!(
            session.leave(),
            Err(SessionError::InvalidState { action: "leave", .. })
        ));

        session.begin_connect().unwrap();
        assert!(matches!(
            session.begin_connect(),
            Err(SessionError::InvalidState {
                state: SessionState::Connecting,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_reports_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut session =
            Session::new(RoomId::new("r1"), "Alice", MemoryEditor::default()).unwrap();
        let result = session.connect(&format!("ws://127.0.0.1:{port}")).await;

        assert!(matches!(result, Err(SessionError::Connection(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.take_notices().len(), 1);
    }
}
