//! Per-connection subscription bookkeeping.
//!
//! Tracks which channels and patterns a connection is subscribed to, along
//! with the user callbacks registered for each. Entries are inserted when
//! the server confirms a subscription with a push frame, not when the
//! request is written, so the tracker always reflects server-confirmed
//! state.

use std::collections::HashMap;
use std::sync::Arc;

/// Callback invoked for every message published to a subscribed channel.
///
/// Receives the channel name and the message payload.
pub type MessageHandler = Arc<dyn Fn(&[u8], &[u8]) + Send + Sync>;

/// Callback invoked for every message delivered through a pattern
/// subscription.
///
/// Receives the pattern, the concrete channel the message was published
/// to, and the message payload.
pub type PatternMessageHandler = Arc<dyn Fn(&[u8], &[u8], &[u8]) + Send + Sync>;

/// Callback invoked when the server confirms a subscription change.
///
/// Receives the channel or pattern name and the connection's total
/// subscription count (across both kinds) as reported by the server.
pub type SubscriptionChangeHandler = Arc<dyn Fn(&[u8], i64) + Send + Sync>;

/// Whether a subscription names a concrete channel or a glob pattern.
///
/// The two kinds live in separate maps and are unsubscribed through
/// separate commands; a channel and a pattern with identical bytes are
/// unrelated subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionKind {
    Channel,
    Pattern,
}

/// The message callback held by a subscription entry.
pub enum MessageReceiver {
    Channel(MessageHandler),
    Pattern(PatternMessageHandler),
}

/// Everything registered for one subscribed channel or pattern.
pub struct SubscriptionEntry {
    pub receiver: MessageReceiver,
    pub on_subscribe: Option<SubscriptionChangeHandler>,
    pub on_unsubscribe: Option<SubscriptionChangeHandler>,
}

/// Dual map of confirmed subscriptions for a single connection.
///
/// Names are raw bytes and compared byte-for-byte; the client never
/// interprets pattern syntax, it only forwards it to the server.
#[derive(Default)]
pub struct SubscriptionTracker {
    channels: HashMap<Vec<u8>, SubscriptionEntry>,
    patterns: HashMap<Vec<u8>, SubscriptionEntry>,
}

impl SubscriptionTracker {
    pub fn new() -> Self {
        SubscriptionTracker::default()
    }

    fn map(&self, kind: SubscriptionKind) -> &HashMap<Vec<u8>, SubscriptionEntry> {
        match kind {
            SubscriptionKind::Channel => &self.channels,
            SubscriptionKind::Pattern => &self.patterns,
        }
    }

    fn map_mut(&mut self, kind: SubscriptionKind) -> &mut HashMap<Vec<u8>, SubscriptionEntry> {
        match kind {
            SubscriptionKind::Channel => &mut self.channels,
            SubscriptionKind::Pattern => &mut self.patterns,
        }
    }

    /// Records a server-confirmed subscription.
    ///
    /// Re-subscribing to an existing name replaces the previous entry and
    /// its callbacks.
    pub fn insert(&mut self, kind: SubscriptionKind, name: Vec<u8>, entry: SubscriptionEntry) {
        self.map_mut(kind).insert(name, entry);
    }

    /// Removes a subscription, returning its entry so the caller can fire
    /// the unsubscribe callback.
    pub fn remove(&mut self, kind: SubscriptionKind, name: &[u8]) -> Option<SubscriptionEntry> {
        self.map_mut(kind).remove(name)
    }

    pub fn get(&self, kind: SubscriptionKind, name: &[u8]) -> Option<&SubscriptionEntry> {
        self.map(kind).get(name)
    }

    pub fn contains(&self, kind: SubscriptionKind, name: &[u8]) -> bool {
        self.map(kind).contains_key(name)
    }

    /// Returns all confirmed names of one kind, for unsubscribe-all.
    pub fn names(&self, kind: SubscriptionKind) -> Vec<Vec<u8>> {
        self.map(kind).keys().cloned().collect()
    }

    /// True while at least one channel or pattern subscription is held.
    ///
    /// This is the single source of truth for a connection's subscriber
    /// state; it is never cached elsewhere.
    pub fn is_subscribed(&self) -> bool {
        !self.channels.is_empty() || !self.patterns.is_empty()
    }

    /// Drops every entry without firing callbacks.
    ///
    /// Used on teardown: losing the connection is not a logical
    /// unsubscribe, so no unsubscribe callbacks are synthesized.
    pub fn clear(&mut self) {
        self.channels.clear();
        self.patterns.clear();
    }
}
