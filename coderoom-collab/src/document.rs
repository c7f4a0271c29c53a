//! Document sync client: bridges a [`TextWidget`] and the relay.
//!
//! ```text
//!  user edit ──► widget ──TextChange{Local}──► on_text_changed ──► ClientEvent::CodeChange
//!
//!  RelayEvent::CodeChange ──► apply_remote ──set_value(Remote)──► widget
//!                                                   │
//!                                 TextChange{Remote}┘──► on_text_changed ──► (nothing)
//! ```
//!
//! Conflict policy is full-document replacement: the most recently
//! delivered text wins, no merge is attempted.

use crate::editor::{ChangeOrigin, TextChange, TextWidget};
use crate::protocol::{ClientEvent, ConnectionId, RoomId};

/// Local view of the shared document for one participant.
pub struct DocumentSync<W: TextWidget> {
    room_id: RoomId,
    widget: W,
    /// Most recent text this client produced or applied.
    last_known_text: String,
    /// Local edits drained ahead of a remote apply, not yet polled.
    pending: Vec<ClientEvent>,
}

impl<W: TextWidget> DocumentSync<W> {
    pub fn new(room_id: RoomId, widget: W) -> Self {
        let last_known_text = widget.value();
        Self {
            room_id,
            widget,
            last_known_text,
            pending: Vec::new(),
        }
    }

    /// React to a change notification from the widget.
    ///
    /// Returns the event to send, if any. Changes written on behalf of a
    /// remote participant are never sent back out.
    pub fn on_text_changed(&mut self, change: TextChange) -> Option<ClientEvent> {
        if change.origin.is_remote() {
            log::trace!("Suppressing echo of remote change in room {}", self.room_id);
            return None;
        }
        if change.text == self.last_known_text {
            return None;
        }

        self.last_known_text = change.text;
        Some(ClientEvent::CodeChange {
            room_id: self.room_id.clone(),
            text: self.last_known_text.clone(),
        })
    }

    /// Drain the widget's pending notifications and collect outbound events.
    pub fn poll_local_changes(&mut self) -> Vec<ClientEvent> {
        self.drain_widget();
        std::mem::take(&mut self.pending)
    }

    fn drain_widget(&mut self) {
        for change in self.widget.take_changes() {
            if let Some(event) = self.on_text_changed(change) {
                self.pending.push(event);
            }
        }
    }

    /// Apply replacement text received from `source`.
    ///
    /// Returns `false` when the text already matches and nothing was
    /// touched. Otherwise the widget text is replaced and the cursor and
    /// scroll position are put back, clamped to the new document.
    ///
    /// Local edits the widget recorded before this call are turned into
    /// events first; the next [`poll_local_changes`](Self::poll_local_changes)
    /// returns them ahead of anything newer.
    pub fn apply_remote(&mut self, text: String, source: ConnectionId) -> bool {
        self.drain_widget();
        if text == self.last_known_text {
            return false;
        }

        let cursor = self.widget.cursor();
        let scroll = self.widget.scroll_info();

        self.widget.set_value(&text, ChangeOrigin::Remote { source });
        self.last_known_text = text;

        self.widget.set_cursor(cursor.clamp_to(&self.last_known_text));
        self.widget.scroll_to(scroll);

        log::debug!(
            "Applied {} bytes from {source} in room {}",
            self.last_known_text.len(),
            self.room_id
        );
        true
    }

    /// Text as last produced or applied by this client.
    pub fn text(&self) -> &str {
        &self.last_known_text
    }

    pub fn room_id(&self) -> &RoomId {
        &self.room_id
    }

    pub fn widget(&self) -> &W {
        &self.widget
    }

    pub fn widget_mut(&mut self) -> &mut W {
        &mut self.widget
    }

    pub fn into_widget(self) -> W {
        self.widget
    }
}
