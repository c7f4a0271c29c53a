//! Text widget boundary.
//!
//! The sync layer never renders anything. It needs a widget it can read,
//! overwrite, and ask for cursor/scroll state, plus a stream of change
//! notifications. Every notification carries the origin of the change so
//! that programmatic replacements can be told apart from user edits
//! without a shared "applying remote" flag.

use crate::protocol::ConnectionId;

/// Cursor location, in lines and characters (not bytes).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Position {
    pub line: usize,
    pub ch: usize,
}

impl Position {
    pub const START: Position = Position { line: 0, ch: 0 };

    pub fn new(line: usize, ch: usize) -> Self {
        Self { line, ch }
    }

    /// Last position of `text`.
    pub fn end_of(text: &str) -> Self {
        let line = text.matches('\n').count();
        let ch = text.rsplit('\n').next().map_or(0, |l| l.chars().count());
        Self { line, ch }
    }

    /// Nearest valid position within `text`.
    ///
    /// A line past the end maps to the end of the document; a column past
    /// the end of its line maps to the end of that line.
    pub fn clamp_to(self, text: &str) -> Self {
        match text.split('\n').nth(self.line) {
            Some(line) => Self {
                line: self.line,
                ch: self.ch.min(line.chars().count()),
            },
            None => Self::end_of(text),
        }
    }

    /// Byte offset of this position in `text`, clamped.
    pub fn byte_offset(self, text: &str) -> usize {
        let clamped = self.clamp_to(text);
        let mut offset = 0;
        for (index, line) in text.split('\n').enumerate() {
            if index == clamped.line {
                return offset
                    + line
                        .char_indices()
                        .nth(clamped.ch)
                        .map_or(line.len(), |(i, _)| i);
            }
            offset += line.len() + 1;
        }
        text.len()
    }
}

/// Viewport scroll offset, in lines and columns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScrollInfo {
    pub top: usize,
    pub left: usize,
}

/// Who caused a text change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Typed (or otherwise produced) by the local user.
    Local,
    /// Written by the sync layer on behalf of a remote participant.
    Remote { source: ConnectionId },
}

impl ChangeOrigin {
    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// A change notification: the full text after the change, and its origin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextChange {
    pub origin: ChangeOrigin,
    pub text: String,
}

/// What the sync layer needs from an editable text widget.
pub trait TextWidget {
    fn value(&self) -> String;

    /// Replace the whole text. Implementations must record a change
    /// notification tagged with `origin`.
    fn set_value(&mut self, text: &str, origin: ChangeOrigin);

    fn cursor(&self) -> Position;
    fn set_cursor(&mut self, position: Position);

    fn scroll_info(&self) -> ScrollInfo;
    fn scroll_to(&mut self, scroll: ScrollInfo);

    /// Drain change notifications recorded since the last call, oldest first.
    fn take_changes(&mut self) -> Vec<TextChange>;
}

/// In-memory widget for headless clients and tests.
///
/// Like a real editor, replacing the whole value resets the cursor and
/// scroll position to the top of the document.
#[derive(Debug, Clone, Default)]
pub struct MemoryEditor {
    text: String,
    cursor: Position,
    scroll: ScrollInfo,
    changes: Vec<TextChange>,
}

impl MemoryEditor {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }

    /// User replaces the whole text; cursor moves to the end.
    pub fn edit(&mut self, text: impl Into<String>) {
        self.text = text.into();
        self.cursor = Position::end_of(&self.text);
        self.record(ChangeOrigin::Local);
    }

    /// User types `input` at the cursor.
    pub fn insert(&mut self, input: &str) {
        let offset = self.cursor.byte_offset(&self.text);
        self.text.insert_str(offset, input);
        self.cursor = Position::end_of(&self.text[..offset + input.len()]);
        self.record(ChangeOrigin::Local);
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    fn record(&mut self, origin: ChangeOrigin) {
        self.changes.push(TextChange {
            origin,
            text: self.text.clone(),
        });
    }
}

impl TextWidget for MemoryEditor {
    fn value(&self) -> String {
        self.text.clone()
    }

    fn set_value(&mut self, text: &str, origin: ChangeOrigin) {
        self.text = text.to_string();
        self.cursor = Position::START;
        self.scroll = ScrollInfo::default();
        self.record(origin);
    }

    fn cursor(&self) -> Position {
        self.cursor
    }

    fn set_cursor(&mut self, position: Position) {
        self.cursor = position.clamp_to(&self.text);
    }

    fn scroll_info(&self) -> ScrollInfo {
        self.scroll
    }

    fn scroll_to(&mut self, scroll: ScrollInfo) {
        let last_line = self.text.matches('\n').count();
        self.scroll = ScrollInfo {
            top: scroll.top.min(last_line),
            left: scroll.left,
        };
    }

    fn take_changes(&mut self) -> Vec<TextChange> {
        std::mem::take(&mut self.changes)
    }
}
