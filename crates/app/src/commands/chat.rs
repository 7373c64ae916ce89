use std::path::PathBuf;
use std::time::Duration;

use clap::Subcommand;
use snafu::{OptionExt, ResultExt, ensure};
use tandem_chat::{AttachmentKind, MessagePayload};
use tandem_storage::{
    ConversationId, FriendshipRecord, FriendshipStatus, FriendshipStore, ProfileRecord,
};
use tokio::time::MissedTickBehavior;

use crate::Context;
use crate::commands::{SenderNames, format_message};
use crate::error::{
    AppResult, ChatSnafu, InvalidAttachmentKindSnafu, InvalidIdSnafu, NotAMemberSnafu,
    NotFriendsSnafu, ReadAttachmentSnafu, ShutdownSignalSnafu, StorageSnafu,
};

const RELAY_INTERVAL: Duration = Duration::from_millis(500);

#[derive(Subcommand)]
pub enum ChatAction {
    /// Find or start the conversation with an accepted friend.
    Open { username: String },
    /// List your conversations, most recent first.
    List,
    /// Send a text message.
    Send {
        conversation_id: String,
        text: String,
    },
    /// Upload a file and send it as an image, voice or file message.
    Attach {
        conversation_id: String,
        /// image, voice or file
        kind: String,
        path: PathBuf,
        /// Display name; defaults to the file name.
        #[arg(long)]
        name: Option<String>,
    },
    /// Print the full history of a conversation.
    History { conversation_id: String },
    /// Print history, then new messages as they arrive until Ctrl-C.
    Watch { conversation_id: String },
}

pub async fn run(action: ChatAction, context: &Context) -> AppResult<()> {
    let me = context.acting_profile()?;

    match action {
        ChatAction::Open { username } => open(context, &me, &username),
        ChatAction::List => list(context, &me),
        ChatAction::Send {
            conversation_id,
            text,
        } => {
            let conversation_id = member_conversation(context, &me, &conversation_id)?;
            let sent = context
                .messenger
                .messages()
                .append(conversation_id, me.id, MessagePayload::text(text))
                .context(ChatSnafu { stage: "chat-send" })?;
            println!("sent #{} ({})", sent.seq, sent.id);
            Ok(())
        }
        ChatAction::Attach {
            conversation_id,
            kind,
            path,
            name,
        } => {
            let conversation_id = member_conversation(context, &me, &conversation_id)?;
            attach(context, &me, conversation_id, &kind, path, name)
        }
        ChatAction::History { conversation_id } => {
            let conversation_id = member_conversation(context, &me, &conversation_id)?;
            let history = context
                .messenger
                .messages()
                .load_history(conversation_id)
                .context(ChatSnafu {
                    stage: "chat-history",
                })?;

            let mut names = SenderNames::new(context);
            for message in &history {
                let sender = names.name_of(message.sender_id);
                println!("{}", format_message(message, &sender));
            }
            Ok(())
        }
        ChatAction::Watch { conversation_id } => {
            let conversation_id = member_conversation(context, &me, &conversation_id)?;
            watch(context, conversation_id).await
        }
    }
}

fn open(context: &Context, me: &ProfileRecord, username: &str) -> AppResult<()> {
    let other = context.profile_by_username(username)?;
    let friendship = context
        .store()
        .find_friendship_between(me.id, other.id)
        .context(StorageSnafu {
            stage: "chat-open-check-friendship",
        })?;
    ensure!(
        is_accepted_friendship(friendship.as_ref()),
        NotFriendsSnafu {
            stage: "chat-open-check-friendship",
            username: other.username.clone(),
        }
    );

    let conversation_id = context
        .messenger
        .conversations()
        .find_or_create(me.id, other.id)
        .context(ChatSnafu { stage: "chat-open" })?;
    println!("{conversation_id}  with {}", other.username);
    Ok(())
}

fn is_accepted_friendship(friendship: Option<&FriendshipRecord>) -> bool {
    friendship.is_some_and(|friendship| friendship.status == FriendshipStatus::Accepted)
}

fn list(context: &Context, me: &ProfileRecord) -> AppResult<()> {
    let summaries = context
        .messenger
        .conversations()
        .list_for_user(me.id)
        .context(ChatSnafu { stage: "chat-list" })?;

    for summary in &summaries {
        println!(
            "{}  {:<16} {}",
            summary.conversation_id,
            summary.participant.username,
            summary.preview_text()
        );
    }
    Ok(())
}

fn attach(
    context: &Context,
    me: &ProfileRecord,
    conversation_id: ConversationId,
    kind: &str,
    path: PathBuf,
    name: Option<String>,
) -> AppResult<()> {
    let kind = AttachmentKind::parse(kind).context(InvalidAttachmentKindSnafu {
        stage: "chat-attach-kind",
        raw: kind.to_string(),
    })?;
    let bytes = std::fs::read(&path).context(ReadAttachmentSnafu {
        stage: "chat-attach-read",
        path: path.clone(),
    })?;
    let file_name = name.unwrap_or_else(|| {
        path.file_name()
            .map(|file_name| file_name.to_string_lossy().into_owned())
            .unwrap_or_default()
    });

    let blobs = context.blob_store();
    let sent = context
        .messenger
        .messages()
        .send_attachment(&blobs, conversation_id, me.id, kind, &file_name, &bytes)
        .context(ChatSnafu {
            stage: "chat-attach",
        })?;
    println!(
        "sent #{} {}",
        sent.seq,
        sent.file_url.as_deref().unwrap_or_default()
    );
    Ok(())
}

async fn watch(context: &Context, conversation_id: ConversationId) -> AppResult<()> {
    let mut opened = context
        .messenger
        .open_conversation(conversation_id)
        .context(ChatSnafu {
            stage: "chat-watch-open",
        })?;

    let mut names = SenderNames::new(context);
    for message in &opened.history {
        let sender = names.name_of(message.sender_id);
        println!("{}", format_message(message, &sender));
    }

    // Other processes append straight to the store; relay their rows into the local feed.
    let mut high_water = opened.history.last().map_or(0, |message| message.seq);
    let mut relay_tick = tokio::time::interval(RELAY_INTERVAL);
    relay_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context(ShutdownSignalSnafu { stage: "chat-watch-signal" })?;
                break;
            }
            _ = relay_tick.tick() => {
                match context.messenger.messages().relay_committed(conversation_id, high_water) {
                    Ok(seen) => high_water = seen,
                    Err(error) => {
                        tracing::warn!(%conversation_id, error = %error, "relay poll failed");
                    }
                }
            }
            next = opened.live.next_message() => {
                let Some(message) = next else {
                    break;
                };
                let sender = names.name_of(message.sender_id);
                println!("{}", format_message(&message, &sender));
            }
        }
    }

    opened.live.unsubscribe();
    Ok(())
}

fn member_conversation(
    context: &Context,
    me: &ProfileRecord,
    raw: &str,
) -> AppResult<ConversationId> {
    let conversation_id = ConversationId::parse(raw).context(InvalidIdSnafu {
        stage: "parse-conversation-id",
        what: "conversation",
        raw: raw.to_string(),
    })?;
    let members = context
        .messenger
        .conversations()
        .members(conversation_id)
        .context(ChatSnafu {
            stage: "chat-check-membership",
        })?;
    ensure!(
        members.contains(&me.id),
        NotAMemberSnafu {
            stage: "chat-check-membership",
            username: me.username.clone(),
            conversation_id: conversation_id.to_string(),
        }
    );

    Ok(conversation_id)
}

#[cfg(test)]
mod tests {
    use tandem_storage::{ConversationStore, NewProfile, ProfileStore};

    use super::*;
    use crate::error::AppError;
    use crate::settings::{Settings, SettingsStore};

    async fn context_in(directory: &tempfile::TempDir) -> Context {
        let settings_store = SettingsStore::new(directory.path().join("settings.json"));
        settings_store
            .update(Settings {
                database_path: directory.path().join("chat.sqlite3"),
                blob_root: directory.path().join("blobs"),
                blob_public_base_url: String::new(),
                log_filter: "warn".to_string(),
                current_username: None,
            })
            .unwrap();
        Context::open(&settings_store, None).await.unwrap()
    }

    fn profile(context: &Context, username: &str) -> ProfileRecord {
        context
            .store()
            .create_profile(NewProfile {
                username: username.to_string(),
                avatar_url: None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn open_requires_an_accepted_friendship() {
        let directory = tempfile::tempdir().unwrap();
        let context = context_in(&directory).await;
        let alice = profile(&context, "alice");
        let bob = profile(&context, "bob");

        let stranger = open(&context, &alice, "bob").unwrap_err();
        assert!(matches!(stranger, AppError::NotFriends { .. }));

        let request = context
            .messenger
            .friendships()
            .send_request(alice.id, "bob")
            .unwrap();
        let pending = open(&context, &alice, "bob").unwrap_err();
        assert!(matches!(pending, AppError::NotFriends { .. }));
        assert!(context.store().list_conversation_ids_for(alice.id).unwrap().is_empty());

        context
            .messenger
            .friendships()
            .accept(request.id, bob.id)
            .unwrap();
        open(&context, &bob, "alice").unwrap();
        assert_eq!(context.store().list_conversation_ids_for(alice.id).unwrap().len(), 1);
    }
}
