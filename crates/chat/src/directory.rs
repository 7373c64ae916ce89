use std::cmp::Ordering;
use std::sync::Arc;

use snafu::{OptionExt, ResultExt, ensure};
use tandem_storage::{
    ConversationId, ConversationStore, MessageKind, MessageStore, ProfileId, ProfileRecord,
    ProfileStore,
};

use crate::error::{ChatError, ChatResult, NotFoundSnafu, SelfReferenceSnafu, TransientIoSnafu};
use crate::message_log::{NO_MESSAGES_PREVIEW, preview};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessagePreview {
    pub kind: MessageKind,
    pub sender_id: ProfileId,
    pub preview: String,
    pub created_at_unix_ms: u64,
}

/// One row of a user's conversation list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    pub conversation_id: ConversationId,
    pub participant: ProfileRecord,
    pub created_at_unix_ms: u64,
    pub last_message: Option<LastMessagePreview>,
}

impl ConversationSummary {
    pub fn preview_text(&self) -> &str {
        self.last_message
            .as_ref()
            .map_or(NO_MESSAGES_PREVIEW, |last| last.preview.as_str())
    }
}

/// Maps an unordered pair of users onto their single direct conversation.
pub struct ConversationDirectory<S> {
    store: Arc<S>,
}

impl<S> ConversationDirectory<S>
where
    S: ProfileStore + ConversationStore + MessageStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Returns the existing conversation between `user_a` and `user_b`, creating it on first contact.
    ///
    /// The lookup always runs before any insert. If a concurrent caller creates the
    /// pair's conversation between our lookup and our insert, the insert loses on the
    /// pair key and the winner's id is returned instead.
    pub fn find_or_create(&self, user_a: ProfileId, user_b: ProfileId) -> ChatResult<ConversationId> {
        ensure!(
            user_a != user_b,
            SelfReferenceSnafu {
                stage: "conversation-find-or-create-self",
                profile_id: user_a,
            }
        );
        self.ensure_profile(user_a, "conversation-find-or-create-load-first")?;
        self.ensure_profile(user_b, "conversation-find-or-create-load-second")?;

        if let Some(existing) = self.find_existing(user_a, user_b)? {
            tracing::debug!(conversation_id = %existing, "existing conversation found");
            return Ok(existing);
        }

        match self.store.create_direct_conversation(user_a, user_b) {
            Ok(created) => {
                tracing::info!(
                    conversation_id = %created.id,
                    first_member = %user_a,
                    second_member = %user_b,
                    "conversation created"
                );
                Ok(created.id)
            }
            Err(error) if error.is_conflict() => {
                tracing::warn!(
                    first_member = %user_a,
                    second_member = %user_b,
                    "conversation create lost a race; using the winner"
                );
                let winner = self.find_existing(user_a, user_b)?;
                winner.context(NotFoundSnafu {
                    stage: "conversation-find-or-create-race-winner",
                    entity: "conversation",
                    key: format!("{user_a}:{user_b}"),
                })
            }
            Err(source) => Err(ChatError::TransientIo {
                stage: "conversation-find-or-create-insert",
                source,
            }),
        }
    }

    /// Conversation list for `user`, most recently active first.
    pub fn list_for_user(&self, user: ProfileId) -> ChatResult<Vec<ConversationSummary>> {
        let conversation_ids = self
            .store
            .list_conversation_ids_for(user)
            .context(TransientIoSnafu {
                stage: "conversation-list-memberships",
            })?;

        let mut summaries = Vec::with_capacity(conversation_ids.len());
        for conversation_id in conversation_ids {
            if let Some(summary) = self.summarize(conversation_id, user)? {
                summaries.push(summary);
            }
        }

        Ok(order_conversation_summaries(summaries))
    }

    /// Both participants of `conversation_id`.
    pub fn members(&self, conversation_id: ConversationId) -> ChatResult<Vec<ProfileId>> {
        let members = self
            .store
            .list_members(conversation_id)
            .context(TransientIoSnafu {
                stage: "conversation-members-load",
            })?;
        ensure!(
            !members.is_empty(),
            NotFoundSnafu {
                stage: "conversation-members-missing",
                entity: "conversation",
                key: conversation_id.to_string(),
            }
        );

        Ok(members.into_iter().map(|member| member.profile_id).collect())
    }

    fn find_existing(
        &self,
        user_a: ProfileId,
        user_b: ProfileId,
    ) -> ChatResult<Option<ConversationId>> {
        let candidates = self
            .store
            .list_conversation_ids_for(user_a)
            .context(TransientIoSnafu {
                stage: "conversation-find-list-first-member",
            })?;

        self.store
            .find_conversation_with_member(&candidates, user_b)
            .context(TransientIoSnafu {
                stage: "conversation-find-match-second-member",
            })
    }

    fn summarize(
        &self,
        conversation_id: ConversationId,
        user: ProfileId,
    ) -> ChatResult<Option<ConversationSummary>> {
        let Some(conversation) = self
            .store
            .get_conversation(conversation_id)
            .context(TransientIoSnafu {
                stage: "conversation-list-load-conversation",
            })?
        else {
            return Ok(None);
        };

        let members = self
            .store
            .list_members(conversation_id)
            .context(TransientIoSnafu {
                stage: "conversation-list-load-members",
            })?;
        let Some(other_id) = members
            .iter()
            .map(|member| member.profile_id)
            .find(|profile_id| *profile_id != user)
        else {
            tracing::warn!(%conversation_id, "skipping conversation without a counterpart");
            return Ok(None);
        };

        let Some(participant) = self
            .store
            .get_profile(other_id)
            .context(TransientIoSnafu {
                stage: "conversation-list-load-participant",
            })?
        else {
            tracing::warn!(
                %conversation_id,
                participant_id = %other_id,
                "skipping conversation whose participant profile is missing"
            );
            return Ok(None);
        };

        let last_message = self
            .store
            .latest_message(conversation_id)
            .context(TransientIoSnafu {
                stage: "conversation-list-load-latest-message",
            })?
            .map(|message| LastMessagePreview {
                kind: message.kind,
                sender_id: message.sender_id,
                preview: preview(&message),
                created_at_unix_ms: message.created_at_unix_ms,
            });

        Ok(Some(ConversationSummary {
            conversation_id,
            participant,
            created_at_unix_ms: conversation.created_at_unix_ms,
            last_message,
        }))
    }

    fn ensure_profile(&self, profile_id: ProfileId, stage: &'static str) -> ChatResult<()> {
        self.store
            .get_profile(profile_id)
            .context(TransientIoSnafu { stage })?
            .context(NotFoundSnafu {
                stage,
                entity: "profile",
                key: profile_id.to_string(),
            })?;
        Ok(())
    }
}

/// Sorts summaries: conversations with messages by last message time descending,
/// then conversations without messages by creation time descending.
///
/// Remaining ties fall back to the conversation id so the order is total.
pub fn order_conversation_summaries(
    mut summaries: Vec<ConversationSummary>,
) -> Vec<ConversationSummary> {
    summaries.sort_by(compare_summaries);
    summaries
}

fn compare_summaries(left: &ConversationSummary, right: &ConversationSummary) -> Ordering {
    let by_activity = match (&left.last_message, &right.last_message) {
        (Some(left_last), Some(right_last)) => right_last
            .created_at_unix_ms
            .cmp(&left_last.created_at_unix_ms),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    };

    by_activity
        .then_with(|| right.created_at_unix_ms.cmp(&left.created_at_unix_ms))
        .then_with(|| right.conversation_id.cmp(&left.conversation_id))
}
