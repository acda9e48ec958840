//! Client-side view of one room.
//!
//! Live pushes and history pages arrive independently and in any order, so
//! the view is rebuilt by folding [`RoomEvent`]s through [`apply`] and merged
//! by key, never by arrival order.

use std::collections::BTreeSet;

use uuid::Uuid;

use crate::{db::Message, protocol::ServerEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// Sent by this client, not yet acknowledged.
    Pending,
    Delivered,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub message: Message,
    pub status: DeliveryStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomView {
    entries: Vec<Entry>,
    first_item_index: i64,
    typing: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoomEvent {
    /// Newest page plus the room's total message count.
    Initialize { messages: Vec<Message>, total_count: u64 },
    Append { message: Message, status: DeliveryStatus },
    /// An older page.
    Prepend { messages: Vec<Message> },
    Edit { key: String, content: String, edited_at: i64 },
    Remove { key: String },
    TypingChanged { username: String, is_typing: bool },
    Delivered { key: String, created_at: i64 },
    Failed { key: String },
}

impl RoomView {
    /// Messages to render, hidden ones filtered out.
    pub fn visible(&self) -> impl Iterator<Item = &Entry> {
        self.entries.iter().filter(|entry| !entry.message.hidden)
    }

    /// Every entry, hidden ones included.
    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Index of the first loaded entry within the whole room history.
    pub fn first_item_index(&self) -> i64 {
        self.first_item_index
    }

    pub fn typing(&self) -> &BTreeSet<String> {
        &self.typing
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.position(key).map(|i| &self.entries[i])
    }

    /// Cursor for the next history page. Unacknowledged entries are not
    /// stored yet, so they never serve as one.
    pub fn oldest_key(&self) -> Option<&str> {
        self.entries
            .iter()
            .find(|entry| entry.status == DeliveryStatus::Delivered)
            .map(|entry| entry.message.key.as_str())
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|entry| entry.message.key == key)
    }

    /// Inserts in order unless the key is already present.
    fn insert(&mut self, message: Message, status: DeliveryStatus) -> bool {
        if self.position(&message.key).is_some() {
            return false;
        }
        let at = self
            .entries
            .partition_point(|entry| entry.message.order_key() < message.order_key());
        self.entries.insert(at, Entry { message, status });
        true
    }
}

pub fn apply(mut view: RoomView, event: RoomEvent) -> RoomView {
    match event {
        RoomEvent::Initialize { messages, total_count } => {
            view.entries.clear();
            for message in messages {
                view.insert(message, DeliveryStatus::Delivered);
            }
            view.first_item_index = (total_count as i64 - view.entries.len() as i64).max(0);
        }
        RoomEvent::Append { mut message, status } => {
            if status == DeliveryStatus::Pending {
                // an own copy stays at the bottom until the stored timestamp arrives
                if let Some(last) = view.entries.last() {
                    message.created_at = message.created_at.max(last.message.created_at);
                }
            } else if view.first_item_index > 0
                && view
                    .entries
                    .first()
                    .is_some_and(|first| message.order_key() < first.message.order_key())
            {
                // falls inside history not loaded yet, a later page brings it
                return view;
            }
            view.insert(message, status);
        }
        RoomEvent::Prepend { messages } => {
            let mut inserted = 0;
            for message in messages {
                if view.insert(message, DeliveryStatus::Delivered) {
                    inserted += 1;
                }
            }
            view.first_item_index -= inserted;
        }
        RoomEvent::Edit { key, content, edited_at } => {
            if let Some(i) = view.position(&key) {
                let message = &mut view.entries[i].message;
                message.content = content;
                message.edited_at = Some(edited_at);
            }
        }
        RoomEvent::Remove { key } => {
            if let Some(i) = view.position(&key) {
                view.entries[i].message.hidden = true;
            }
        }
        RoomEvent::TypingChanged { username, is_typing } => {
            if is_typing {
                view.typing.insert(username);
            } else {
                view.typing.remove(&username);
            }
        }
        RoomEvent::Delivered { key, created_at } => {
            if let Some(i) = view.position(&key) {
                let mut entry = view.entries.remove(i);
                entry.status = DeliveryStatus::Delivered;
                // the stored timestamp wins over the optimistic one
                entry.message.created_at = created_at;
                view.insert(entry.message, entry.status);
            }
        }
        RoomEvent::Failed { key } => {
            if let Some(i) = view.position(&key) {
                view.entries[i].status = DeliveryStatus::Failed;
            }
        }
    }
    view
}

impl ServerEvent {
    /// The room and reducer event a push translates to. Room-list events
    /// have no per-room view counterpart.
    pub fn into_room_event(self) -> Option<(Uuid, RoomEvent)> {
        use ServerEvent::*;
        let routed = match self {
            Message { message } => (
                message.room_id,
                RoomEvent::Append { message, status: DeliveryStatus::Delivered },
            ),
            MessageEdited { key, content, room_id, edited_at } => {
                (room_id, RoomEvent::Edit { key, content, edited_at })
            }
            MessageDeleted { key, room_id } => (room_id, RoomEvent::Remove { key }),
            MessageDelivered { key, room_id, created_at } => {
                (room_id, RoomEvent::Delivered { key, created_at })
            }
            MessageFailed { key, room_id } => (room_id, RoomEvent::Failed { key }),
            TypingChanged { is_typing, room_id, username } => {
                (room_id, RoomEvent::TypingChanged { username, is_typing })
            }
            RoomsUpdated { .. }
            | ParticipantsChanged { .. }
            | RoomCreated { .. }
            | RoomDeleted { .. }
            | Reply { .. }
            | Error { .. } => return None,
        };
        Some(routed)
    }
}
