//! Subscription tracking and outbound buffering.
//!
//! The symbol set is the source of truth for what the client wants to
//! receive. Control messages produced while the socket is not open are
//! buffered and flushed in order on the next open.

use crate::message::ClientMessage;
use std::collections::BTreeSet;
use tracing::debug;

/// Desired symbols plus control messages waiting for an open socket.
#[derive(Debug, Clone, Default)]
pub struct SubscriptionSet {
    symbols: BTreeSet<String>,
    buffer: Vec<ClientMessage>,
    user_id: Option<String>,
    session_id: String,
}

impl SubscriptionSet {
    pub fn new(user_id: Option<String>, session_id: impl Into<String>) -> Self {
        Self {
            symbols: BTreeSet::new(),
            buffer: Vec::new(),
            user_id,
            session_id: session_id.into(),
        }
    }

    pub fn symbols(&self) -> impl Iterator<Item = &str> {
        self.symbols.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    pub fn contains(&self, symbol: &str) -> bool {
        self.symbols.contains(symbol)
    }

    /// Add symbols. Returns the subscribe message for the newly added ones.
    pub fn add(&mut self, symbols: &[String]) -> Option<ClientMessage> {
        let added: Vec<String> = symbols
            .iter()
            .filter(|s| self.symbols.insert((*s).clone()))
            .cloned()
            .collect();
        (!added.is_empty()).then(|| self.subscribe_message(added))
    }

    /// Remove symbols. Returns the unsubscribe message for those that were present.
    pub fn remove(&mut self, symbols: &[String]) -> Option<ClientMessage> {
        let removed: Vec<String> = symbols
            .iter()
            .filter(|s| self.symbols.remove(s.as_str()))
            .cloned()
            .collect();
        (!removed.is_empty()).then(|| ClientMessage::Unsubscribe {
            commodities: removed,
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
        })
    }

    pub fn buffer(&mut self, message: ClientMessage) {
        debug!(kind = message.kind(), queued = self.buffer.len() + 1, "Buffering control message");
        self.buffer.push(message);
    }

    /// Take every buffered message, oldest first.
    pub fn drain_buffer(&mut self) -> Vec<ClientMessage> {
        std::mem::take(&mut self.buffer)
    }

    pub fn buffered(&self) -> &[ClientMessage] {
        &self.buffer
    }

    /// Replace the buffer with one subscribe covering the full symbol set,
    /// so a fresh socket restores everything.
    pub fn reset_buffer_to_full_set(&mut self) {
        self.buffer.clear();
        if !self.symbols.is_empty() {
            let all: Vec<String> = self.symbols.iter().cloned().collect();
            let message = self.subscribe_message(all);
            self.buffer.push(message);
        }
    }

    fn subscribe_message(&self, commodities: Vec<String>) -> ClientMessage {
        ClientMessage::Subscribe {
            commodities,
            user_id: self.user_id.clone(),
            session_id: self.session_id.clone(),
        }
    }
}
