pub mod delivery;
pub mod directory;
pub mod error;
pub mod friendship;
pub mod message_log;

use std::sync::Arc;

use tandem_storage::{ConversationId, MessageFeed, Storage};

pub use delivery::{
    CallbackSubscription, DeliveryWorker, LiveDeliveryChannel, OpenConversation, Subscription,
    SubscriptionHandle, open_conversation,
};
pub use directory::{
    ConversationDirectory, ConversationSummary, LastMessagePreview, order_conversation_summaries,
};
pub use error::{ChatError, ChatResult};
pub use friendship::{FriendEntry, FriendList, FriendshipLedger, project_friend_list};
pub use message_log::{
    AttachmentKind, FILE_PREVIEW, IMAGE_PREVIEW, MessageLog, MessagePayload, NO_MESSAGES_PREVIEW,
    VOICE_PREVIEW, preview,
};

/// The four messaging components wired to one store and one insert feed.
pub struct Messenger<S> {
    friendships: FriendshipLedger<S>,
    conversations: ConversationDirectory<S>,
    messages: MessageLog<S>,
    delivery: LiveDeliveryChannel,
}

impl<S> Messenger<S>
where
    S: Storage,
{
    pub fn new(store: Arc<S>) -> Self {
        let feed = MessageFeed::new();
        Self {
            friendships: FriendshipLedger::new(Arc::clone(&store)),
            conversations: ConversationDirectory::new(Arc::clone(&store)),
            messages: MessageLog::new(store, feed.clone()),
            delivery: LiveDeliveryChannel::new(feed),
        }
    }

    pub fn friendships(&self) -> &FriendshipLedger<S> {
        &self.friendships
    }

    pub fn conversations(&self) -> &ConversationDirectory<S> {
        &self.conversations
    }

    pub fn messages(&self) -> &MessageLog<S> {
        &self.messages
    }

    pub fn delivery(&self) -> &LiveDeliveryChannel {
        &self.delivery
    }

    pub fn open_conversation(&self, conversation_id: ConversationId) -> ChatResult<OpenConversation> {
        open_conversation(&self.messages, &self.delivery, conversation_id)
    }
}
