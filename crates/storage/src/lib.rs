pub mod blob;
pub mod error;
pub mod feed;
pub mod ids;
pub mod sqlite;
pub mod types;

pub use blob::{BlobStore, FsBlobStore};
pub use error::{StorageError, StorageResult};
pub use feed::{FeedReceiver, MessageFeed};
pub use ids::{ConversationId, FriendshipId, MessageId, PairKey, ProfileId};
pub use sqlite::SqliteStorage;
pub use types::{
    BlobPath, ConversationRecord, FriendshipRecord, FriendshipStatus, MembershipRecord,
    MessageKind, MessageRecord, NewMessage, NewProfile, ProfileRecord,
};

/// Identity lookup. Profiles are owned outside the messaging core; the core
/// only reads them, `create_profile` exists for provisioning.
pub trait ProfileStore: Send + Sync {
    fn create_profile(&self, input: NewProfile) -> StorageResult<ProfileRecord>;
    fn get_profile(&self, profile_id: ProfileId) -> StorageResult<Option<ProfileRecord>>;
    /// Case-insensitive exact match.
    fn find_profile_by_username(&self, username: &str) -> StorageResult<Option<ProfileRecord>>;
}

pub trait FriendshipStore: Send + Sync {
    /// Inserts a pending row. Fails with `Conflict` if any row exists for the pair.
    fn insert_friendship(
        &self,
        requester_id: ProfileId,
        addressee_id: ProfileId,
    ) -> StorageResult<FriendshipRecord>;
    fn get_friendship(&self, friendship_id: FriendshipId)
    -> StorageResult<Option<FriendshipRecord>>;
    /// Looks up the row for `{left, right}` in either direction.
    fn find_friendship_between(
        &self,
        left: ProfileId,
        right: ProfileId,
    ) -> StorageResult<Option<FriendshipRecord>>;
    /// Moves a pending row to accepted. Fails with `Conflict` if it is not pending.
    fn mark_friendship_accepted(
        &self,
        friendship_id: FriendshipId,
    ) -> StorageResult<FriendshipRecord>;
    fn delete_friendship(&self, friendship_id: FriendshipId) -> StorageResult<()>;
    fn list_friendships_for(&self, profile_id: ProfileId) -> StorageResult<Vec<FriendshipRecord>>;
}

pub trait ConversationStore: Send + Sync {
    fn list_conversation_ids_for(&self, profile_id: ProfileId)
    -> StorageResult<Vec<ConversationId>>;
    /// Returns the first of `conversation_ids` that `profile_id` is a member of.
    fn find_conversation_with_member(
        &self,
        conversation_ids: &[ConversationId],
        profile_id: ProfileId,
    ) -> StorageResult<Option<ConversationId>>;
    /// Creates the conversation and both membership rows together.
    /// Fails with `Conflict` if a conversation for the pair already exists.
    fn create_direct_conversation(
        &self,
        first: ProfileId,
        second: ProfileId,
    ) -> StorageResult<ConversationRecord>;
    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>>;
    fn list_members(&self, conversation_id: ConversationId)
    -> StorageResult<Vec<MembershipRecord>>;
}

pub trait MessageStore: Send + Sync {
    /// Appends with a store-stamped timestamp and the next sequence number.
    fn append_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord>;
    fn list_messages(&self, conversation_id: ConversationId) -> StorageResult<Vec<MessageRecord>>;
    /// Messages with `seq` greater than `after_seq`, in order.
    fn list_messages_after(
        &self,
        conversation_id: ConversationId,
        after_seq: u64,
    ) -> StorageResult<Vec<MessageRecord>>;
    fn latest_message(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<MessageRecord>>;
}

pub trait Storage: ProfileStore + FriendshipStore + ConversationStore + MessageStore {}

impl<T> Storage for T where T: ProfileStore + FriendshipStore + ConversationStore + MessageStore {}
