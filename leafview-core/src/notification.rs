//! Transient, dismissible status messages.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

pub const DEFAULT_TTL: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Info,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub message: String,
    pub kind: NotificationKind,
    pub expires_at: Instant,
}

#[derive(Debug)]
pub struct Notifications {
    items: VecDeque<Notification>,
    ttl: Duration,
}

impl Default for Notifications {
    fn default() -> Self {
        Self::new(DEFAULT_TTL)
    }
}

impl Notifications {
    pub fn new(ttl: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            ttl,
        }
    }

    pub fn push(&mut self, message: impl Into<String>, kind: NotificationKind, now: Instant) {
        self.items.push_back(Notification {
            message: message.into(),
            kind,
            expires_at: now + self.ttl,
        });
    }

    /// Drops expired messages and returns how many were removed.
    pub fn expire(&mut self, now: Instant) -> usize {
        let before = self.items.len();
        self.items.retain(|item| item.expires_at > now);
        before - self.items.len()
    }

    pub fn latest(&self, now: Instant) -> Option<&Notification> {
        self.items.iter().rev().find(|item| item.expires_at > now)
    }

    pub fn dismiss(&mut self) -> Option<Notification> {
        self.items.pop_back()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }
}
