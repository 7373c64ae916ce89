use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use tokio::sync::mpsc;

use super::ids::ConversationId;
use super::types::MessageRecord;

type SubscriberId = u64;

#[derive(Default)]
struct FeedState {
    next_subscriber_id: SubscriberId,
    subscribers: HashMap<ConversationId, Vec<(SubscriberId, mpsc::UnboundedSender<MessageRecord>)>>,
}

/// In-process insert feed: committed messages are pushed to every receiver
/// registered for the message's conversation.
///
/// Each receiver owns an unbounded queue, so a slow reader never causes a
/// record to be skipped for it.
#[derive(Clone, Default)]
pub struct MessageFeed {
    state: Arc<Mutex<FeedState>>,
}

impl MessageFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, conversation_id: ConversationId) -> FeedReceiver {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut state = lock_state(&self.state);
        let subscriber_id = state.next_subscriber_id;
        state.next_subscriber_id += 1;
        state
            .subscribers
            .entry(conversation_id)
            .or_default()
            .push((subscriber_id, events_tx));
        drop(state);

        tracing::debug!(%conversation_id, subscriber_id, "feed receiver registered");
        FeedReceiver {
            conversation_id,
            subscriber_id,
            events: events_rx,
            state: Arc::clone(&self.state),
            closed: false,
        }
    }

    /// Pushes `record` to its conversation's receivers and returns how many accepted it.
    pub fn publish(&self, record: &MessageRecord) -> usize {
        let mut state = lock_state(&self.state);
        let Some(receivers) = state.subscribers.get_mut(&record.conversation_id) else {
            return 0;
        };

        receivers.retain(|(_, events_tx)| events_tx.send(record.clone()).is_ok());
        let delivered = receivers.len();
        if receivers.is_empty() {
            state.subscribers.remove(&record.conversation_id);
        }

        delivered
    }

    pub fn subscriber_count(&self, conversation_id: ConversationId) -> usize {
        lock_state(&self.state)
            .subscribers
            .get(&conversation_id)
            .map_or(0, Vec::len)
    }
}

pub struct FeedReceiver {
    conversation_id: ConversationId,
    subscriber_id: SubscriberId,
    events: mpsc::UnboundedReceiver<MessageRecord>,
    state: Arc<Mutex<FeedState>>,
    closed: bool,
}

impl FeedReceiver {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    pub async fn recv(&mut self) -> Option<MessageRecord> {
        if self.closed {
            return None;
        }
        self.events.recv().await
    }

    pub fn try_recv(&mut self) -> Option<MessageRecord> {
        if self.closed {
            return None;
        }
        self.events.try_recv().ok()
    }

    pub fn poll_recv(&mut self, cx: &mut Context<'_>) -> Poll<Option<MessageRecord>> {
        if self.closed {
            return Poll::Ready(None);
        }
        self.events.poll_recv(cx)
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Unregisters the receiver and discards anything still queued.
    ///
    /// Once this returns, `recv`/`try_recv` yield `None` forever.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut state = lock_state(&self.state);
        if let Some(receivers) = state.subscribers.get_mut(&self.conversation_id) {
            receivers.retain(|(subscriber_id, _)| *subscriber_id != self.subscriber_id);
            if receivers.is_empty() {
                state.subscribers.remove(&self.conversation_id);
            }
        }
        drop(state);

        self.events.close();
        while self.events.try_recv().is_ok() {}
        tracing::debug!(
            conversation_id = %self.conversation_id,
            subscriber_id = self.subscriber_id,
            "feed receiver closed"
        );
    }
}

impl Drop for FeedReceiver {
    fn drop(&mut self) {
        self.close();
    }
}

fn lock_state(state: &Mutex<FeedState>) -> MutexGuard<'_, FeedState> {
    // Feed state stays consistent even if a holder panicked; every mutation is a single step.
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::{MessageId, ProfileId};
    use crate::types::MessageKind;

    fn record(conversation_id: ConversationId, seq: u64) -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            conversation_id,
            sender_id: ProfileId::new_v7(),
            seq,
            kind: MessageKind::Text,
            content: Some(format!("message {seq}")),
            file_url: None,
            file_name: None,
            created_at_unix_ms: seq,
        }
    }

    #[test]
    fn publish_reaches_only_matching_conversation() {
        let feed = MessageFeed::new();
        let watched = ConversationId::new_v7();
        let other = ConversationId::new_v7();
        let mut receiver = feed.subscribe(watched);

        assert_eq!(feed.publish(&record(other, 1)), 0);
        assert_eq!(feed.publish(&record(watched, 1)), 1);

        let received = receiver.try_recv().unwrap();
        assert_eq!(received.conversation_id, watched);
        assert!(receiver.try_recv().is_none());
    }

    #[test]
    fn close_discards_queue_and_unregisters() {
        let feed = MessageFeed::new();
        let conversation_id = ConversationId::new_v7();
        let mut receiver = feed.subscribe(conversation_id);
        feed.publish(&record(conversation_id, 1));

        receiver.close();

        assert!(receiver.try_recv().is_none());
        assert_eq!(feed.subscriber_count(conversation_id), 0);
        assert_eq!(feed.publish(&record(conversation_id, 2)), 0);
    }

    #[test]
    fn dropped_receiver_is_unregistered() {
        let feed = MessageFeed::new();
        let conversation_id = ConversationId::new_v7();
        let first = feed.subscribe(conversation_id);
        let _second = feed.subscribe(conversation_id);
        assert_eq!(feed.subscriber_count(conversation_id), 2);

        drop(first);
        assert_eq!(feed.subscriber_count(conversation_id), 1);
    }
}
