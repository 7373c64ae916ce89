use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;
use tandem_storage::{
    ConversationId, ConversationStore, FeedReceiver, MessageFeed, MessageRecord, MessageStore,
};
use tokio::sync::oneshot;

use crate::error::ChatResult;
use crate::message_log::MessageLog;

pub type DeliveryWorker = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Per-conversation push of newly appended messages to open views.
#[derive(Clone)]
pub struct LiveDeliveryChannel {
    feed: MessageFeed,
}

impl LiveDeliveryChannel {
    pub fn new(feed: MessageFeed) -> Self {
        Self { feed }
    }

    /// Starts receiving every message appended to `conversation_id` from now on.
    ///
    /// Earlier messages are not replayed; use [`open_conversation`] to get
    /// history and live records without a gap.
    pub fn subscribe(&self, conversation_id: ConversationId) -> Subscription {
        Subscription {
            receiver: self.feed.subscribe(conversation_id),
            delivered_through: None,
        }
    }

    /// Callback flavour of [`Self::subscribe`].
    ///
    /// The caller must drive the returned worker (usually with `tokio::spawn`).
    /// `on_message` must not call `unsubscribe` on its own handle; that blocks forever.
    pub fn subscribe_with<F>(
        &self,
        conversation_id: ConversationId,
        on_message: F,
    ) -> CallbackSubscription
    where
        F: FnMut(MessageRecord) + Send + 'static,
    {
        let subscription = self.subscribe(conversation_id);
        let gate = Arc::new(Mutex::new(true));
        let (cancel_tx, cancel_rx) = oneshot::channel();

        let worker: DeliveryWorker = Box::pin(run_callback_worker(
            subscription,
            Arc::clone(&gate),
            on_message,
            cancel_rx,
        ));

        CallbackSubscription {
            handle: SubscriptionHandle {
                conversation_id,
                gate,
                cancel_tx: Some(cancel_tx),
            },
            worker,
        }
    }

    pub fn subscriber_count(&self, conversation_id: ConversationId) -> usize {
        self.feed.subscriber_count(conversation_id)
    }
}

/// Lazy, non-restartable sequence of live messages for one conversation.
///
/// Yields each seq at most once and in increasing order, even when the same
/// record is published twice. [`MessageLog`] publishes in seq order, so the
/// high-water check never hides an unseen record.
pub struct Subscription {
    receiver: FeedReceiver,
    // Highest seq already handed out, through history or this subscription.
    delivered_through: Option<u64>,
}

impl Subscription {
    pub fn conversation_id(&self) -> ConversationId {
        self.receiver.conversation_id()
    }

    pub async fn next_message(&mut self) -> Option<MessageRecord> {
        loop {
            let record = self.receiver.recv().await?;
            if self.admit(&record) {
                return Some(record);
            }
        }
    }

    pub fn try_next_message(&mut self) -> Option<MessageRecord> {
        loop {
            let record = self.receiver.try_recv()?;
            if self.admit(&record) {
                return Some(record);
            }
        }
    }

    /// Highest seq delivered so far, if any.
    pub fn delivered_through(&self) -> Option<u64> {
        self.delivered_through
    }

    /// Stops delivery. Nothing is yielded once this returns, including queued records.
    pub fn unsubscribe(&mut self) {
        self.receiver.close();
    }

    pub fn is_active(&self) -> bool {
        !self.receiver.is_closed()
    }

    fn skip_through(&mut self, seq: u64) {
        self.delivered_through = Some(seq);
    }

    fn admit(&mut self, record: &MessageRecord) -> bool {
        if self.delivered_through.is_some_and(|seq| record.seq <= seq) {
            return false;
        }
        self.delivered_through = Some(record.seq);
        true
    }
}

impl Stream for Subscription {
    type Item = MessageRecord;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match this.receiver.poll_recv(cx) {
                Poll::Ready(Some(record)) if !this.admit(&record) => continue,
                other => return other,
            }
        }
    }
}

pub struct CallbackSubscription {
    pub handle: SubscriptionHandle,
    pub worker: DeliveryWorker,
}

/// Cancels a callback subscription. Dropping the handle unsubscribes too.
pub struct SubscriptionHandle {
    conversation_id: ConversationId,
    gate: Arc<Mutex<bool>>,
    cancel_tx: Option<oneshot::Sender<()>>,
}

impl SubscriptionHandle {
    pub fn conversation_id(&self) -> ConversationId {
        self.conversation_id
    }

    /// Waits for an in-flight callback to finish; no callback runs after this returns.
    pub fn unsubscribe(&mut self) {
        let Some(cancel_tx) = self.cancel_tx.take() else {
            return;
        };

        *self.gate.lock().unwrap_or_else(PoisonError::into_inner) = false;
        let _ = cancel_tx.send(());
        tracing::debug!(conversation_id = %self.conversation_id, "callback subscription cancelled");
    }

    pub fn is_active(&self) -> bool {
        self.cancel_tx.is_some()
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

async fn run_callback_worker<F>(
    mut subscription: Subscription,
    gate: Arc<Mutex<bool>>,
    mut on_message: F,
    mut cancel_rx: oneshot::Receiver<()>,
) where
    F: FnMut(MessageRecord) + Send + 'static,
{
    let conversation_id = subscription.conversation_id();

    loop {
        tokio::select! {
            _ = &mut cancel_rx => break,
            next = subscription.next_message() => {
                let Some(record) = next else {
                    break;
                };

                // Held for the whole callback so `unsubscribe` waits on it.
                let delivered = {
                    let open = gate.lock().unwrap_or_else(PoisonError::into_inner);
                    if *open {
                        on_message(record);
                    }
                    *open
                };
                if !delivered {
                    break;
                }
            }
        }
    }

    subscription.unsubscribe();
    tracing::debug!(%conversation_id, "callback delivery worker stopped");
}

/// History plus a live subscription that continues exactly where history ends.
pub struct OpenConversation {
    pub history: Vec<MessageRecord>,
    pub live: Subscription,
}

/// Subscribes first, then loads history, so a message appended in between shows up
/// exactly once: in the history, with its live copy skipped.
pub fn open_conversation<S>(
    log: &MessageLog<S>,
    channel: &LiveDeliveryChannel,
    conversation_id: ConversationId,
) -> ChatResult<OpenConversation>
where
    S: MessageStore + ConversationStore,
{
    let mut live = channel.subscribe(conversation_id);
    let history = log.load_history(conversation_id)?;
    let covered = history.last().map_or(0, |last| last.seq);
    if covered > 0 {
        live.skip_through(covered);
    }
    log.note_published_through(conversation_id, covered);

    tracing::debug!(
        %conversation_id,
        history_len = history.len(),
        "conversation opened"
    );
    Ok(OpenConversation { history, live })
}
