//! Conversation notifications.

use tokio::sync::broadcast;

/// Lifecycle and flow-control notifications raised by a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConversationEvent {
    /// Handshake done and transport wired; services are about to bind.
    Open,
    /// The conversation closed. Raised once.
    Close,
    /// The transport stopped accepting writes.
    Overflow,
    /// The transport drained after an overflow.
    Drain,
}

/// Capacity of each conversation's notification channel.
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 16;

pub(crate) fn channel() -> broadcast::Sender<ConversationEvent> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}

/// Fire a notification. Having no subscribers is not an error.
pub(crate) fn emit(tx: &broadcast::Sender<ConversationEvent>, event: ConversationEvent) {
    let _ = tx.send(event);
}
