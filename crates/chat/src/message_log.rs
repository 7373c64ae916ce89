use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use snafu::{OptionExt, ResultExt, ensure};
use tandem_storage::{
    BlobStore, ConversationId, ConversationStore, MessageFeed, MessageKind, MessageRecord,
    MessageStore, NewMessage, ProfileId, StorageError,
};
use uuid::Uuid;

use crate::error::{
    ChatError, ChatResult, EmptyContentSnafu, MissingAttachmentSnafu, NotFoundSnafu,
    TransientIoSnafu, UploadFailedSnafu,
};

pub const IMAGE_PREVIEW: &str = "📷 Image";
pub const VOICE_PREVIEW: &str = "🎤 Voice note";
pub const FILE_PREVIEW: &str = "📎 File";
pub const NO_MESSAGES_PREVIEW: &str = "No messages yet";

const FALLBACK_ATTACHMENT_NAME: &str = "attachment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AttachmentKind {
    Image,
    Voice,
    File,
}

impl AttachmentKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match MessageKind::parse(raw)? {
            MessageKind::Image => Some(Self::Image),
            MessageKind::Voice => Some(Self::Voice),
            MessageKind::File => Some(Self::File),
            MessageKind::Text => None,
        }
    }
}

impl From<AttachmentKind> for MessageKind {
    fn from(value: AttachmentKind) -> Self {
        match value {
            AttachmentKind::Image => MessageKind::Image,
            AttachmentKind::Voice => MessageKind::Voice,
            AttachmentKind::File => MessageKind::File,
        }
    }
}

/// What a sender submits. Attachments carry a URL that the blob store already serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    Text {
        content: String,
    },
    Attachment {
        kind: AttachmentKind,
        file_url: String,
        file_name: String,
    },
}

impl MessagePayload {
    pub fn text(content: impl Into<String>) -> Self {
        Self::Text {
            content: content.into(),
        }
    }

    pub fn attachment(
        kind: AttachmentKind,
        file_url: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self::Attachment {
            kind,
            file_url: file_url.into(),
            file_name: file_name.into(),
        }
    }

    fn into_new_message(self, sender_id: ProfileId) -> ChatResult<NewMessage> {
        match self {
            Self::Text { content } => {
                ensure!(
                    !content.trim().is_empty(),
                    EmptyContentSnafu {
                        stage: "message-validate-text",
                    }
                );
                // Stored verbatim; trimming is only used for the emptiness check.
                Ok(NewMessage::text(sender_id, content))
            }
            Self::Attachment {
                kind,
                file_url,
                file_name,
            } => {
                let message_kind = MessageKind::from(kind);
                let file_url = file_url.trim().to_string();
                ensure!(
                    !file_url.is_empty(),
                    MissingAttachmentSnafu {
                        stage: "message-validate-attachment",
                        kind: message_kind.as_str(),
                    }
                );

                let file_name = if file_name.trim().is_empty() {
                    name_from_url(&file_url)
                } else {
                    file_name
                };

                Ok(NewMessage::attachment(
                    sender_id,
                    message_kind,
                    file_url,
                    file_name,
                ))
            }
        }
    }
}

/// Append-only, per-conversation message history.
///
/// Appends to one conversation are serialized in-process, and every record is
/// published in seq order: rows committed by other writers of the same store
/// are published before a later local record.
///
/// Lanes live only while a call holds them or the conversation has feed
/// subscribers, so the lane map is bounded by the conversations in use.
pub struct MessageLog<S> {
    store: Arc<S>,
    feed: MessageFeed,
    append_lanes: Mutex<AppendLanes>,
}

#[derive(Debug, Default)]
struct AppendLane {
    // Highest seq handed to the feed; `None` until the first append, relay or open.
    published_through: Option<u64>,
}

impl<S> MessageLog<S>
where
    S: MessageStore + ConversationStore,
{
    pub fn new(store: Arc<S>, feed: MessageFeed) -> Self {
        Self {
            store,
            feed,
            append_lanes: Mutex::new(HashMap::new()),
        }
    }

    pub fn append(
        &self,
        conversation_id: ConversationId,
        sender_id: ProfileId,
        payload: MessagePayload,
    ) -> ChatResult<MessageRecord> {
        let input = payload.into_new_message(sender_id)?;

        self.with_lane(conversation_id, |lane| {
            let record = self
                .store
                .append_message(conversation_id, input)
                .map_err(|error| {
                    map_missing_conversation(error, conversation_id, "message-append")
                })?;
            let delivered = self.publish_through(lane, &record);

            tracing::debug!(
                conversation_id = %record.conversation_id,
                message_id = %record.id,
                seq = record.seq,
                kind = record.kind.as_str(),
                delivered,
                "message appended"
            );
            Ok(record)
        })
    }

    /// Uploads `bytes` to `blobs`, then appends a message pointing at the public URL.
    ///
    /// Nothing is appended when the upload fails.
    pub fn send_attachment(
        &self,
        blobs: &dyn BlobStore,
        conversation_id: ConversationId,
        sender_id: ProfileId,
        kind: AttachmentKind,
        file_name: &str,
        bytes: &[u8],
    ) -> ChatResult<MessageRecord> {
        let message_kind = MessageKind::from(kind);
        ensure!(
            !bytes.is_empty(),
            MissingAttachmentSnafu {
                stage: "attachment-validate-bytes",
                kind: message_kind.as_str(),
            }
        );
        self.ensure_conversation(conversation_id, "attachment-ensure-conversation")?;

        let display_name = if file_name.trim().is_empty() {
            FALLBACK_ATTACHMENT_NAME.to_string()
        } else {
            file_name.trim().to_string()
        };
        // Time-ordered and unique, so two sends of one file name never share a key.
        let key = format!("{}-{}", Uuid::now_v7().simple(), blob_key_name(&display_name));

        let path = blobs.upload(&key, bytes).context(UploadFailedSnafu {
            stage: "attachment-upload",
            file_name: display_name.clone(),
        })?;
        let file_url = blobs.public_url(&path);

        self.append(
            conversation_id,
            sender_id,
            MessagePayload::attachment(kind, file_url, display_name),
        )
    }

    /// Full history in append order. Safe to call repeatedly.
    pub fn load_history(&self, conversation_id: ConversationId) -> ChatResult<Vec<MessageRecord>> {
        self.ensure_conversation(conversation_id, "message-history-ensure-conversation")?;

        self.store
            .list_messages(conversation_id)
            .context(TransientIoSnafu {
                stage: "message-history-load",
            })
    }

    /// Publishes messages committed by other writers of the same store.
    ///
    /// Starts after `after_seq` the first time a conversation is seen, otherwise after
    /// the highest seq this log already published. Returns the new high-water seq.
    pub fn relay_committed(
        &self,
        conversation_id: ConversationId,
        after_seq: u64,
    ) -> ChatResult<u64> {
        self.with_lane(conversation_id, |lane| {
            let from = *lane.published_through.get_or_insert(after_seq);
            let committed = self
                .store
                .list_messages_after(conversation_id, from)
                .context(TransientIoSnafu {
                    stage: "message-relay-load",
                })?;

            for record in &committed {
                self.feed.publish(record);
            }
            let high_water = committed.last().map_or(from, |record| record.seq.max(from));
            lane.published_through = Some(high_water);

            if !committed.is_empty() {
                tracing::debug!(
                    %conversation_id,
                    relayed = committed.len(),
                    high_water,
                    "relayed committed messages"
                );
            }
            Ok(high_water)
        })
    }

    /// Marks everything through `seq` as already seen by the conversation's readers,
    /// unless the lane already tracks a position.
    pub(crate) fn note_published_through(&self, conversation_id: ConversationId, seq: u64) {
        self.with_lane(conversation_id, |lane| {
            lane.published_through.get_or_insert(seq);
        });
    }

    // Publishes any foreign rows between the lane mark and `record`, then `record`.
    fn publish_through(&self, lane: &mut AppendLane, record: &MessageRecord) -> usize {
        let Some(published) = lane.published_through else {
            lane.published_through = Some(record.seq);
            return self.feed.publish(record);
        };
        if record.seq <= published {
            return 0;
        }
        if record.seq == published + 1 {
            lane.published_through = Some(record.seq);
            return self.feed.publish(record);
        }

        match self
            .store
            .list_messages_after(record.conversation_id, published)
        {
            Ok(committed) => {
                let mut delivered = None;
                for pending in &committed {
                    let count = self.feed.publish(pending);
                    if pending.id == record.id {
                        delivered = Some(count);
                    }
                }
                let delivered = delivered.unwrap_or_else(|| self.feed.publish(record));
                let high_water = committed
                    .last()
                    .map_or(record.seq, |last| last.seq.max(record.seq));
                lane.published_through = Some(high_water);
                delivered
            }
            Err(error) => {
                tracing::warn!(
                    conversation_id = %record.conversation_id,
                    after_seq = published,
                    error = %error,
                    "failed to load rows committed by other writers"
                );
                lane.published_through = Some(record.seq);
                self.feed.publish(record)
            }
        }
    }

    fn ensure_conversation(
        &self,
        conversation_id: ConversationId,
        stage: &'static str,
    ) -> ChatResult<()> {
        self.store
            .get_conversation(conversation_id)
            .context(TransientIoSnafu { stage })?
            .context(NotFoundSnafu {
                stage,
                entity: "conversation",
                key: conversation_id.to_string(),
            })?;
        Ok(())
    }

    fn with_lane<T>(
        &self,
        conversation_id: ConversationId,
        work: impl FnOnce(&mut AppendLane) -> T,
    ) -> T {
        let lane = {
            let mut lanes = lock_lanes(&self.append_lanes);
            Arc::clone(lanes.entry(conversation_id).or_default())
        };
        let result = {
            let mut state = lane.lock().unwrap_or_else(PoisonError::into_inner);
            work(&mut state)
        };
        drop(lane);

        self.release_lane(conversation_id);
        result
    }

    // Drops an idle lane once nobody is listening; a later open re-seeds its mark.
    fn release_lane(&self, conversation_id: ConversationId) {
        let mut lanes = lock_lanes(&self.append_lanes);
        let idle = lanes
            .get(&conversation_id)
            .is_some_and(|lane| Arc::strong_count(lane) == 1);
        if idle && self.feed.subscriber_count(conversation_id) == 0 {
            lanes.remove(&conversation_id);
        }
    }
}

/// List-view summary of a message. Never exposes attachment URLs.
pub fn preview(message: &MessageRecord) -> String {
    match message.kind {
        MessageKind::Text => message.content.clone().unwrap_or_default(),
        MessageKind::Image => IMAGE_PREVIEW.to_string(),
        MessageKind::Voice => VOICE_PREVIEW.to_string(),
        MessageKind::File => FILE_PREVIEW.to_string(),
    }
}

fn map_missing_conversation(
    error: StorageError,
    conversation_id: ConversationId,
    stage: &'static str,
) -> ChatError {
    if error.is_not_found() {
        ChatError::NotFound {
            stage,
            entity: "conversation",
            key: conversation_id.to_string(),
        }
    } else {
        ChatError::TransientIo {
            stage,
            source: error,
        }
    }
}

fn name_from_url(file_url: &str) -> String {
    file_url
        .rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or(FALLBACK_ATTACHMENT_NAME)
        .to_string()
}

fn blob_key_name(file_name: &str) -> String {
    let sanitized = file_name
        .chars()
        .map(|character| match character {
            '/' | '\\' => '_',
            other => other,
        })
        .collect::<String>();
    let sanitized = sanitized.trim_start_matches('.');

    if sanitized.is_empty() {
        FALLBACK_ATTACHMENT_NAME.to_string()
    } else {
        sanitized.to_string()
    }
}

type AppendLanes = HashMap<ConversationId, Arc<Mutex<AppendLane>>>;

fn lock_lanes(lanes: &Mutex<AppendLanes>) -> MutexGuard<'_, AppendLanes> {
    lanes.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use tandem_storage::{
        FsBlobStore, MessageId, NewProfile, ProfileRecord, ProfileStore, SqliteStorage,
    };

    use super::*;

    struct Fixture {
        directory: tempfile::TempDir,
        log: MessageLog<SqliteStorage>,
        feed: MessageFeed,
        alice: ProfileRecord,
        conversation_id: ConversationId,
    }

    async fn fixture() -> Fixture {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("log.sqlite3");
        let store = Arc::new(SqliteStorage::open(path.to_str().unwrap()).await.unwrap());
        let alice = store
            .create_profile(NewProfile {
                username: "alice".to_string(),
                avatar_url: None,
            })
            .unwrap();
        let bob = store
            .create_profile(NewProfile {
                username: "bob".to_string(),
                avatar_url: None,
            })
            .unwrap();
        let conversation = store.create_direct_conversation(alice.id, bob.id).unwrap();
        let feed = MessageFeed::new();

        Fixture {
            directory,
            log: MessageLog::new(store, feed.clone()),
            feed,
            alice,
            conversation_id: conversation.id,
        }
    }

    fn record(kind: MessageKind, content: Option<&str>) -> MessageRecord {
        MessageRecord {
            id: MessageId::new_v7(),
            conversation_id: ConversationId::new_v7(),
            sender_id: ProfileId::new_v7(),
            seq: 1,
            kind,
            content: content.map(str::to_string),
            file_url: Some("https://cdn.test/secret.png".to_string()),
            file_name: Some("secret.png".to_string()),
            created_at_unix_ms: 1,
        }
    }

    #[tokio::test]
    async fn whitespace_text_is_rejected_before_any_write() {
        let fixture = fixture().await;

        let error = fixture
            .log
            .append(fixture.conversation_id, fixture.alice.id, MessagePayload::text("  "))
            .unwrap_err();

        assert!(matches!(error, ChatError::EmptyContent { .. }));
        assert!(fixture.log.load_history(fixture.conversation_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn text_content_is_stored_exactly() {
        let fixture = fixture().await;

        let stored = fixture
            .log
            .append(fixture.conversation_id, fixture.alice.id, MessagePayload::text("hi"))
            .unwrap();

        assert_eq!(stored.content.as_deref(), Some("hi"));
        assert_eq!(stored.kind, MessageKind::Text);
        assert_eq!(stored.sender_id, fixture.alice.id);
    }

    #[tokio::test]
    async fn history_returns_appends_in_order() {
        let fixture = fixture().await;
        let appended = (0..8)
            .map(|index| {
                fixture
                    .log
                    .append(
                        fixture.conversation_id,
                        fixture.alice.id,
                        MessagePayload::text(format!("message {index}")),
                    )
                    .unwrap()
                    .id
            })
            .collect::<Vec<_>>();

        let history = fixture.log.load_history(fixture.conversation_id).unwrap();
        assert_eq!(
            history.iter().map(|message| message.id).collect::<Vec<_>>(),
            appended
        );
        assert!(
            history
                .windows(2)
                .all(|pair| pair[0].created_at_unix_ms <= pair[1].created_at_unix_ms)
        );

        let reloaded = fixture.log.load_history(fixture.conversation_id).unwrap();
        assert_eq!(reloaded, history);
    }

    #[tokio::test]
    async fn attachment_without_url_is_missing_attachment() {
        let fixture = fixture().await;

        let error = fixture
            .log
            .append(
                fixture.conversation_id,
                fixture.alice.id,
                MessagePayload::attachment(AttachmentKind::Voice, "   ", "note.webm"),
            )
            .unwrap_err();

        assert!(matches!(error, ChatError::MissingAttachment { kind: "voice", .. }));
    }

    #[tokio::test]
    async fn unknown_conversation_is_not_found() {
        let fixture = fixture().await;
        let missing = ConversationId::new_v7();

        let append_error = fixture
            .log
            .append(missing, fixture.alice.id, MessagePayload::text("hello"))
            .unwrap_err();
        assert!(matches!(append_error, ChatError::NotFound { entity: "conversation", .. }));

        let history_error = fixture.log.load_history(missing).unwrap_err();
        assert!(matches!(history_error, ChatError::NotFound { .. }));
    }

    #[tokio::test]
    async fn send_attachment_uploads_then_appends_url() {
        let fixture = fixture().await;
        let blobs = FsBlobStore::new(fixture.directory.path().join("blobs"), "https://cdn.test");
        let mut receiver = fixture.feed.subscribe(fixture.conversation_id);

        let stored = fixture
            .log
            .send_attachment(
                &blobs,
                fixture.conversation_id,
                fixture.alice.id,
                AttachmentKind::Image,
                "cat.png",
                b"image-bytes",
            )
            .unwrap();

        assert_eq!(stored.kind, MessageKind::Image);
        assert_eq!(stored.file_name.as_deref(), Some("cat.png"));
        let url = stored.file_url.clone().unwrap();
        assert!(url.starts_with("https://cdn.test/"));
        assert!(url.ends_with("-cat.png"));

        let again = fixture
            .log
            .send_attachment(
                &blobs,
                fixture.conversation_id,
                fixture.alice.id,
                AttachmentKind::Image,
                "cat.png",
                b"other-bytes",
            )
            .unwrap();
        assert_ne!(again.file_url, stored.file_url);
        assert_eq!(receiver.try_recv().map(|message| message.id), Some(stored.id));
    }

    #[tokio::test]
    async fn failed_upload_appends_nothing() {
        let fixture = fixture().await;
        let blocker = fixture.directory.path().join("not-a-directory");
        std::fs::write(&blocker, b"file").unwrap();
        let blobs = FsBlobStore::new(&blocker, "https://cdn.test");

        let error = fixture
            .log
            .send_attachment(
                &blobs,
                fixture.conversation_id,
                fixture.alice.id,
                AttachmentKind::File,
                "report.pdf",
                b"%PDF",
            )
            .unwrap_err();

        assert!(matches!(error, ChatError::UploadFailed { .. }));
        assert!(fixture.log.load_history(fixture.conversation_id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn relay_publishes_only_rows_not_yet_published() {
        let fixture = fixture().await;
        let mut receiver = fixture.feed.subscribe(fixture.conversation_id);
        let first = fixture
            .log
            .append(fixture.conversation_id, fixture.alice.id, MessagePayload::text("one"))
            .unwrap();
        assert_eq!(receiver.try_recv().map(|message| message.id), Some(first.id));

        let high_water = fixture.log.relay_committed(fixture.conversation_id, 0).unwrap();

        assert_eq!(high_water, first.seq);
        assert!(receiver.try_recv().is_none());
    }

    #[tokio::test]
    async fn rows_from_another_writer_are_published_before_a_later_local_append() {
        let fixture = fixture().await;
        let path = fixture.directory.path().join("log.sqlite3");
        let elsewhere = Arc::new(SqliteStorage::open(path.to_str().unwrap()).await.unwrap());
        let other_log = MessageLog::new(Arc::clone(&elsewhere), MessageFeed::new());
        let bob = elsewhere.find_profile_by_username("bob").unwrap().unwrap();

        let mut receiver = fixture.feed.subscribe(fixture.conversation_id);
        fixture.log.note_published_through(fixture.conversation_id, 0);

        let foreign = other_log
            .append(fixture.conversation_id, bob.id, MessagePayload::text("from bob elsewhere"))
            .unwrap();
        let local = fixture
            .log
            .append(fixture.conversation_id, fixture.alice.id, MessagePayload::text("local"))
            .unwrap();
        let high_water = fixture.log.relay_committed(fixture.conversation_id, 0).unwrap();

        assert_eq!(receiver.try_recv().map(|message| message.id), Some(foreign.id));
        assert_eq!(receiver.try_recv().map(|message| message.id), Some(local.id));
        assert!(receiver.try_recv().is_none());
        assert_eq!(high_water, local.seq);
    }

    #[tokio::test]
    async fn lanes_are_released_once_nobody_listens() {
        let fixture = fixture().await;
        fixture
            .log
            .append(fixture.conversation_id, fixture.alice.id, MessagePayload::text("quiet"))
            .unwrap();
        assert!(lock_lanes(&fixture.log.append_lanes).is_empty());

        let mut receiver = fixture.feed.subscribe(fixture.conversation_id);
        fixture
            .log
            .append(fixture.conversation_id, fixture.alice.id, MessagePayload::text("heard"))
            .unwrap();
        assert_eq!(lock_lanes(&fixture.log.append_lanes).len(), 1);

        receiver.close();
        fixture.log.relay_committed(fixture.conversation_id, 0).unwrap();
        assert!(lock_lanes(&fixture.log.append_lanes).is_empty());
    }

    #[test]
    fn previews_hide_attachment_urls() {
        assert_eq!(preview(&record(MessageKind::Text, Some("hello"))), "hello");
        assert_eq!(preview(&record(MessageKind::Image, None)), IMAGE_PREVIEW);
        assert_eq!(preview(&record(MessageKind::Voice, None)), VOICE_PREVIEW);
        assert_eq!(preview(&record(MessageKind::File, None)), FILE_PREVIEW);
        assert!(!preview(&record(MessageKind::File, None)).contains("https://"));
    }

    #[test]
    fn attachment_names_fall_back_to_url_segment() {
        assert_eq!(name_from_url("https://cdn.test/files/a.png"), "a.png");
        assert_eq!(name_from_url("https://cdn.test/files/"), "files");
        assert_eq!(blob_key_name("../../etc/passwd"), "_.._etc_passwd");
        assert_eq!(blob_key_name("..."), FALLBACK_ATTACHMENT_NAME);
    }
}
