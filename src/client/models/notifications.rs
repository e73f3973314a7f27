use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use crate::client::services::wire::DownloadNotice;

pub const DEFAULT_FEED_CAPACITY: usize = 20;

/// A single inbound push event, ready for display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub id: u64,
    pub message: String,
    pub received_at: DateTime<Utc>,
}

/// Bounded, newest-first log of push events.
///
/// Purely local state: it is rebuilt empty on every new notification-stream
/// connection, so a reconnect loses history. There is no replay contract with
/// the server.
#[derive(Debug)]
pub struct NotificationFeed {
    entries: VecDeque<Notification>,
    capacity: usize,
    next_id: u64,
}

impl NotificationFeed {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
            next_id: 0,
        }
    }

    /// Prepend a message, evicting the oldest entry on overflow.
    pub fn push(&mut self, message: impl Into<String>) -> &Notification {
        self.next_id += 1;
        self.entries.push_front(Notification {
            id: self.next_id,
            message: message.into(),
            received_at: Utc::now(),
        });
        while self.entries.len() > self.capacity {
            self.entries.pop_back();
        }
        &self.entries[0]
    }

    pub fn push_notice(&mut self, notice: &DownloadNotice) -> &Notification {
        self.push(format!(
            "{} downloaded \"{}\"",
            notice.downloader, notice.article_title
        ))
    }

    /// Newest first.
    pub fn iter(&self) -> impl Iterator<Item = &Notification> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl Default for NotificationFeed {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}
