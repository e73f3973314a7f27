use std::collections::HashSet;

use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

use crate::client::services::wire::ServerFrame;

/// One end of a direct message. The wire nests usernames one level deep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub username: String,
}

/// A direct chat message, immutable once created server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: i64,
    pub sender: Peer,
    pub receiver: Peer,
    pub content: String,
    #[serde(default)]
    pub is_read: bool,
    /// RFC 3339 timestamp as the server sent it.
    pub created_at: String,
}

impl Message {
    /// The other participant relative to `me`, if `me` is involved at all.
    pub fn counterpart(&self, me: &str) -> Option<&str> {
        if self.sender.username == me {
            Some(&self.receiver.username)
        } else if self.receiver.username == me {
            Some(&self.sender.username)
        } else {
            None
        }
    }

    pub fn created_at_utc(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.created_at)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }

    /// Short display time: `HH:MM` for today, date plus time otherwise.
    pub fn formatted_time(&self) -> String {
        match self.created_at_utc() {
            Some(utc) => {
                let local: DateTime<Local> = utc.with_timezone(&Local);
                if local.date_naive() == Local::now().date_naive() {
                    local.format("%H:%M").to_string()
                } else {
                    local.format("%Y-%m-%d %H:%M").to_string()
                }
            }
            None => self.created_at.clone(),
        }
    }
}

/// Ordered message log for one open friend.
///
/// Insertion order is display order. Pushes are de-duplicated by message id
/// because the socket push and the HTTP response for the same send may both
/// arrive, in either order.
#[derive(Debug, Default)]
pub struct Conversation {
    pub friend: String,
    messages: Vec<Message>,
    seen: HashSet<i64>,
}

impl Conversation {
    pub fn new(friend: impl Into<String>) -> Self {
        Self {
            friend: friend.into(),
            messages: Vec::new(),
            seen: HashSet::new(),
        }
    }

    /// Replace the log with fetched history (oldest first, as served).
    pub fn load_history(&mut self, history: Vec<Message>) {
        self.seen = history.iter().map(|m| m.id).collect();
        self.messages = history;
    }

    /// Route an inbound frame into this conversation.
    ///
    /// Returns true when the frame carried a message for this friend and it
    /// was not already present. Frames for other conversations are ignored;
    /// any other open view performs its own match.
    pub fn apply(&mut self, me: &str, frame: &ServerFrame) -> bool {
        let Some(message) = frame.message() else {
            return false;
        };
        if message.counterpart(me) != Some(self.friend.as_str()) {
            return false;
        }
        self.push_unique(message.clone())
    }

    /// Append unless a message with the same id is already present.
    pub fn push_unique(&mut self, message: Message) -> bool {
        if !self.seen.insert(message.id) {
            return false;
        }
        self.messages.push(message);
        true
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}
