use std::future::Future;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Connection, FromRow, SqliteConnection};

use super::error::{
    ConflictSnafu, InvariantViolationSnafu, NotFoundSnafu, SqliteQuerySnafu,
    SqliteRuntimeInitSnafu, SqliteThreadSpawnSnafu, StorageError,
};
use super::error::{
    CreateSqliteDirectorySnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu, SqliteMigrateSnafu,
    SqlitePragmaSnafu, StorageResult,
};
use super::ids::{ConversationId, FriendshipId, MessageId, PairKey, ProfileId};
use super::types::{
    ConversationRecord, FriendshipRecord, FriendshipStatus, MembershipRecord, MessageKind,
    MessageRecord, NewMessage, NewProfile, ProfileRecord,
};
use super::{ConversationStore, FriendshipStore, MessageStore, ProfileStore};

#[derive(Debug, Clone)]
pub struct SqliteStorage {
    database_url: String,
}

impl SqliteStorage {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        // WAL must be set on the file itself so later per-call connections inherit it.
        let _: String = sqlx::query_scalar("PRAGMA journal_mode = WAL;")
            .fetch_one(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-journal-mode",
                pragma: "journal_mode",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        // The bootstrap pool belongs to the caller's runtime; store calls reconnect on their own.
        pool.close().await;

        tracing::debug!(database_url = %database_url, "sqlite storage opened");
        Ok(Self { database_url })
    }

    pub fn database_url(&self) -> &str {
        &self.database_url
    }

    fn run_db_call<T, F>(&self, stage: &'static str, op: F) -> StorageResult<T>
    where
        T: Send + 'static,
        F: Future<Output = StorageResult<T>> + Send + 'static,
    {
        // Store traits are sync, so each call executes on a dedicated worker thread
        // with its own current-thread runtime to avoid nested-runtime blocking panics.
        let worker = std::thread::Builder::new()
            .name(format!("sqlite-store-{stage}"))
            .spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .context(SqliteRuntimeInitSnafu {
                        stage: "sqlite-store-runtime-build",
                    })?;
                runtime.block_on(op)
            })
            .context(SqliteThreadSpawnSnafu {
                stage: "sqlite-store-spawn-worker",
            })?;

        match worker.join() {
            Ok(result) => result,
            Err(_) => InvariantViolationSnafu {
                stage,
                details: "sqlite storage worker thread panicked".to_string(),
            }
            .fail(),
        }
    }
}

impl ProfileStore for SqliteStorage {
    fn create_profile(&self, input: NewProfile) -> StorageResult<ProfileRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("profile-create", async move {
            let mut connection = connect_store_connection(&database_url, "profile-create-connect").await?;
            let username = input.username.trim().to_string();
            if username.is_empty() {
                return InvariantViolationSnafu {
                    stage: "profile-create-empty-username",
                    details: "profile username must not be blank".to_string(),
                }
                .fail();
            }

            let profile_id = ProfileId::new_v7();
            let now = unix_timestamp_millis();

            sqlx::query("INSERT INTO profiles (id, username, avatar_url, created_at) VALUES (?, ?, ?, ?)")
                .bind(profile_id.to_string())
                .bind(username.clone())
                .bind(input.avatar_url.clone())
                .bind(now)
                .execute(&mut connection)
                .await
                .map_err(|source| {
                    conflict_or_query_error(
                        source,
                        "profile-create-insert",
                        "profile",
                        format!("username '{username}' is already taken"),
                    )
                })?;

            Ok(ProfileRecord {
                id: profile_id,
                username,
                avatar_url: input.avatar_url,
                created_at_unix_ms: i64_to_u64(now, "profile-create-created-at")?,
            })
        })
    }

    fn get_profile(&self, profile_id: ProfileId) -> StorageResult<Option<ProfileRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("profile-get", async move {
            let mut connection = connect_store_connection(&database_url, "profile-get-connect").await?;
            let row = sqlx::query_as::<_, ProfileRow>(
                "SELECT id, username, avatar_url, created_at FROM profiles WHERE id = ?",
            )
            .bind(profile_id.to_string())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "profile-get-query",
            })?;

            row.map(profile_row_to_record).transpose()
        })
    }

    fn find_profile_by_username(&self, username: &str) -> StorageResult<Option<ProfileRecord>> {
        let database_url = self.database_url.clone();
        let username = username.trim().to_string();
        self.run_db_call("profile-find-by-username", async move {
            let mut connection =
                connect_store_connection(&database_url, "profile-find-by-username-connect").await?;
            let row = sqlx::query_as::<_, ProfileRow>(
                "SELECT id, username, avatar_url, created_at FROM profiles WHERE username = ? COLLATE NOCASE LIMIT 1",
            )
            .bind(username)
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "profile-find-by-username-query",
            })?;

            row.map(profile_row_to_record).transpose()
        })
    }
}

impl FriendshipStore for SqliteStorage {
    fn insert_friendship(
        &self,
        requester_id: ProfileId,
        addressee_id: ProfileId,
    ) -> StorageResult<FriendshipRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("friendship-insert", async move {
            let mut connection =
                connect_store_connection(&database_url, "friendship-insert-connect").await?;
            let friendship_id = FriendshipId::new_v7();
            let pair_key = PairKey::new(requester_id, addressee_id);
            let now = unix_timestamp_millis();

            sqlx::query(
                "INSERT INTO friendships (id, requester_id, addressee_id, status, pair_key, created_at) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(friendship_id.to_string())
            .bind(requester_id.to_string())
            .bind(addressee_id.to_string())
            .bind(FriendshipStatus::Pending.as_str())
            .bind(pair_key.to_string())
            .bind(now)
            .execute(&mut connection)
            .await
            .map_err(|source| {
                conflict_or_query_error(
                    source,
                    "friendship-insert-apply",
                    "friendship",
                    format!("a friendship already exists for pair {pair_key}"),
                )
            })?;

            Ok(FriendshipRecord {
                id: friendship_id,
                requester_id,
                addressee_id,
                status: FriendshipStatus::Pending,
                created_at_unix_ms: i64_to_u64(now, "friendship-insert-created-at")?,
            })
        })
    }

    fn get_friendship(
        &self,
        friendship_id: FriendshipId,
    ) -> StorageResult<Option<FriendshipRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("friendship-get", async move {
            let mut connection = connect_store_connection(&database_url, "friendship-get-connect").await?;
            load_friendship(&mut connection, friendship_id, "friendship-get-query").await
        })
    }

    fn find_friendship_between(
        &self,
        left: ProfileId,
        right: ProfileId,
    ) -> StorageResult<Option<FriendshipRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("friendship-find-between", async move {
            let mut connection =
                connect_store_connection(&database_url, "friendship-find-between-connect").await?;
            let row = sqlx::query_as::<_, FriendshipRow>(
                "SELECT id, requester_id, addressee_id, status, created_at FROM friendships WHERE (requester_id = ? AND addressee_id = ?) OR (requester_id = ? AND addressee_id = ?) ORDER BY created_at ASC, id ASC LIMIT 1",
            )
            .bind(left.to_string())
            .bind(right.to_string())
            .bind(right.to_string())
            .bind(left.to_string())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "friendship-find-between-query",
            })?;

            row.map(friendship_row_to_record).transpose()
        })
    }

    fn mark_friendship_accepted(
        &self,
        friendship_id: FriendshipId,
    ) -> StorageResult<FriendshipRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("friendship-accept", async move {
            let mut connection =
                connect_store_connection(&database_url, "friendship-accept-connect").await?;
            let result = sqlx::query("UPDATE friendships SET status = ? WHERE id = ? AND status = ?")
                .bind(FriendshipStatus::Accepted.as_str())
                .bind(friendship_id.to_string())
                .bind(FriendshipStatus::Pending.as_str())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "friendship-accept-apply",
                })?;

            let record = load_friendship(&mut connection, friendship_id, "friendship-accept-load")
                .await?
                .context(NotFoundSnafu {
                    stage: "friendship-accept-missing",
                    entity: "friendship",
                    id: friendship_id.to_string(),
                })?;

            if result.rows_affected() == 0 {
                return ConflictSnafu {
                    stage: "friendship-accept-not-pending",
                    entity: "friendship",
                    details: format!(
                        "friendship '{friendship_id}' is '{}', not pending",
                        record.status.as_str()
                    ),
                }
                .fail();
            }

            Ok(record)
        })
    }

    fn delete_friendship(&self, friendship_id: FriendshipId) -> StorageResult<()> {
        let database_url = self.database_url.clone();
        self.run_db_call("friendship-delete", async move {
            let mut connection =
                connect_store_connection(&database_url, "friendship-delete-connect").await?;
            let result = sqlx::query("DELETE FROM friendships WHERE id = ?")
                .bind(friendship_id.to_string())
                .execute(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "friendship-delete-apply",
                })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "friendship-delete-missing",
                    entity: "friendship",
                    id: friendship_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }

    fn list_friendships_for(&self, profile_id: ProfileId) -> StorageResult<Vec<FriendshipRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("friendship-list", async move {
            let mut connection = connect_store_connection(&database_url, "friendship-list-connect").await?;
            let rows = sqlx::query_as::<_, FriendshipRow>(
                "SELECT id, requester_id, addressee_id, status, created_at FROM friendships WHERE requester_id = ? OR addressee_id = ? ORDER BY created_at ASC, id ASC",
            )
            .bind(profile_id.to_string())
            .bind(profile_id.to_string())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "friendship-list-query",
            })?;

            rows.into_iter().map(friendship_row_to_record).collect()
        })
    }
}

impl ConversationStore for SqliteStorage {
    fn list_conversation_ids_for(
        &self,
        profile_id: ProfileId,
    ) -> StorageResult<Vec<ConversationId>> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-list-ids", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-list-ids-connect").await?;
            let raw_ids = sqlx::query_scalar::<_, String>(
                "SELECT conversation_id FROM memberships WHERE profile_id = ? ORDER BY conversation_id ASC",
            )
            .bind(profile_id.to_string())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-ids-query",
            })?;

            raw_ids.iter().map(|raw| ConversationId::parse(raw)).collect()
        })
    }

    fn find_conversation_with_member(
        &self,
        conversation_ids: &[ConversationId],
        profile_id: ProfileId,
    ) -> StorageResult<Option<ConversationId>> {
        if conversation_ids.is_empty() {
            return Ok(None);
        }

        let database_url = self.database_url.clone();
        let candidates = conversation_ids
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        self.run_db_call("conversation-find-with-member", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-find-with-member-connect")
                    .await?;
            let placeholders = vec!["?"; candidates.len()].join(", ");
            // Oldest conversation wins if duplicates from an older race ever exist.
            let statement = format!(
                "SELECT m.conversation_id FROM memberships m JOIN conversations c ON c.id = m.conversation_id WHERE m.profile_id = ? AND m.conversation_id IN ({placeholders}) ORDER BY c.created_at ASC, c.id ASC LIMIT 1"
            );

            let mut query = sqlx::query_scalar::<_, String>(&statement).bind(profile_id.to_string());
            for candidate in candidates {
                query = query.bind(candidate);
            }

            let raw = query
                .fetch_optional(&mut connection)
                .await
                .context(SqliteQuerySnafu {
                    stage: "conversation-find-with-member-query",
                })?;

            raw.as_deref().map(ConversationId::parse).transpose()
        })
    }

    fn create_direct_conversation(
        &self,
        first: ProfileId,
        second: ProfileId,
    ) -> StorageResult<ConversationRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-create", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-create-connect").await?;
            let pair_key = PairKey::new(first, second);
            if pair_key.is_self_pair() {
                return InvariantViolationSnafu {
                    stage: "conversation-create-self-pair",
                    details: format!("profile '{first}' cannot hold a conversation with itself"),
                }
                .fail();
            }

            let mut tx = connection.begin().await.context(SqliteQuerySnafu {
                stage: "conversation-create-begin",
            })?;

            let conversation_id = ConversationId::new_v7();
            let now = unix_timestamp_millis();

            sqlx::query("INSERT INTO conversations (id, pair_key, created_at) VALUES (?, ?, ?)")
                .bind(conversation_id.to_string())
                .bind(pair_key.to_string())
                .bind(now)
                .execute(&mut *tx)
                .await
                .map_err(|source| {
                    conflict_or_query_error(
                        source,
                        "conversation-create-insert-conversation",
                        "conversation",
                        format!("a conversation already exists for pair {pair_key}"),
                    )
                })?;

            // Membership rows commit with the conversation, so a pairing is never half-visible.
            for profile_id in [first, second] {
                sqlx::query("INSERT INTO memberships (conversation_id, profile_id) VALUES (?, ?)")
                    .bind(conversation_id.to_string())
                    .bind(profile_id.to_string())
                    .execute(&mut *tx)
                    .await
                    .context(SqliteQuerySnafu {
                        stage: "conversation-create-insert-membership",
                    })?;
            }

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "conversation-create-commit",
            })?;

            Ok(ConversationRecord {
                id: conversation_id,
                created_at_unix_ms: i64_to_u64(now, "conversation-create-created-at")?,
            })
        })
    }

    fn get_conversation(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<ConversationRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-get", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-get-connect").await?;
            let row = sqlx::query_as::<_, ConversationRow>(
                "SELECT id, created_at FROM conversations WHERE id = ?",
            )
            .bind(conversation_id.to_string())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-get-query",
            })?;

            row.map(conversation_row_to_record).transpose()
        })
    }

    fn list_members(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Vec<MembershipRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("conversation-list-members", async move {
            let mut connection =
                connect_store_connection(&database_url, "conversation-list-members-connect").await?;
            let rows = sqlx::query_as::<_, MembershipRow>(
                "SELECT conversation_id, profile_id FROM memberships WHERE conversation_id = ? ORDER BY profile_id ASC",
            )
            .bind(conversation_id.to_string())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-members-query",
            })?;

            rows.into_iter().map(membership_row_to_record).collect()
        })
    }
}

impl MessageStore for SqliteStorage {
    fn append_message(
        &self,
        conversation_id: ConversationId,
        input: NewMessage,
    ) -> StorageResult<MessageRecord> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-append", async move {
            let mut connection = connect_store_connection(&database_url, "message-append-connect").await?;
            ensure_conversation_exists(&mut connection, conversation_id, "message-append-ensure-conversation")
                .await?;

            let message_id = MessageId::new_v7();
            let now = unix_timestamp_millis();

            // Sequence and timestamp are derived in the same statement as the insert, so the
            // conversation's order stays monotonic even when the wall clock steps backwards.
            let (seq, created_at) = sqlx::query_as::<_, (i64, i64)>(
                "INSERT INTO messages (id, conversation_id, sender_id, seq, message_type, content, file_url, file_name, created_at) \
                 SELECT ?, ?, ?, COALESCE(MAX(seq), 0) + 1, ?, ?, ?, ?, MAX(?, COALESCE(MAX(created_at), 0)) \
                 FROM messages WHERE conversation_id = ? \
                 RETURNING seq, created_at",
            )
            .bind(message_id.to_string())
            .bind(conversation_id.to_string())
            .bind(input.sender_id.to_string())
            .bind(input.kind.as_str())
            .bind(input.content.clone())
            .bind(input.file_url.clone())
            .bind(input.file_name.clone())
            .bind(now)
            .bind(conversation_id.to_string())
            .fetch_one(&mut connection)
            .await
            .map_err(|source| {
                conflict_or_query_error(
                    source,
                    "message-append-insert",
                    "message",
                    format!("concurrent append raced on conversation '{conversation_id}'"),
                )
            })?;

            Ok(MessageRecord {
                id: message_id,
                conversation_id,
                sender_id: input.sender_id,
                seq: i64_to_u64(seq, "message-append-seq")?,
                kind: input.kind,
                content: input.content,
                file_url: input.file_url,
                file_name: input.file_name,
                created_at_unix_ms: i64_to_u64(created_at, "message-append-created-at")?,
            })
        })
    }

    fn list_messages(&self, conversation_id: ConversationId) -> StorageResult<Vec<MessageRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-list", async move {
            let mut connection = connect_store_connection(&database_url, "message-list-connect").await?;
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, conversation_id, sender_id, seq, message_type, content, file_url, file_name, created_at FROM messages WHERE conversation_id = ? ORDER BY seq ASC",
            )
            .bind(conversation_id.to_string())
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn list_messages_after(
        &self,
        conversation_id: ConversationId,
        after_seq: u64,
    ) -> StorageResult<Vec<MessageRecord>> {
        let database_url = self.database_url.clone();
        let after_seq = i64::try_from(after_seq).unwrap_or(i64::MAX);
        self.run_db_call("message-list-after", async move {
            let mut connection =
                connect_store_connection(&database_url, "message-list-after-connect").await?;
            let rows = sqlx::query_as::<_, MessageRow>(
                "SELECT id, conversation_id, sender_id, seq, message_type, content, file_url, file_name, created_at FROM messages WHERE conversation_id = ? AND seq > ? ORDER BY seq ASC",
            )
            .bind(conversation_id.to_string())
            .bind(after_seq)
            .fetch_all(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-list-after-query",
            })?;

            rows.into_iter().map(message_row_to_record).collect()
        })
    }

    fn latest_message(
        &self,
        conversation_id: ConversationId,
    ) -> StorageResult<Option<MessageRecord>> {
        let database_url = self.database_url.clone();
        self.run_db_call("message-latest", async move {
            let mut connection = connect_store_connection(&database_url, "message-latest-connect").await?;
            let row = sqlx::query_as::<_, MessageRow>(
                "SELECT id, conversation_id, sender_id, seq, message_type, content, file_url, file_name, created_at FROM messages WHERE conversation_id = ? ORDER BY seq DESC LIMIT 1",
            )
            .bind(conversation_id.to_string())
            .fetch_optional(&mut connection)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-latest-query",
            })?;

            row.map(message_row_to_record).transpose()
        })
    }
}

#[derive(Debug, FromRow)]
struct ProfileRow {
    id: String,
    username: String,
    avatar_url: Option<String>,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct FriendshipRow {
    id: String,
    requester_id: String,
    addressee_id: String,
    status: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    created_at: i64,
}

#[derive(Debug, FromRow)]
struct MembershipRow {
    conversation_id: String,
    profile_id: String,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    sender_id: String,
    seq: i64,
    message_type: String,
    content: Option<String>,
    file_url: Option<String>,
    file_name: Option<String>,
    created_at: i64,
}

fn profile_row_to_record(row: ProfileRow) -> StorageResult<ProfileRecord> {
    Ok(ProfileRecord {
        id: ProfileId::parse(&row.id)?,
        username: row.username,
        avatar_url: row.avatar_url,
        created_at_unix_ms: i64_to_u64(row.created_at, "profile-row-created-at")?,
    })
}

fn friendship_row_to_record(row: FriendshipRow) -> StorageResult<FriendshipRecord> {
    Ok(FriendshipRecord {
        id: FriendshipId::parse(&row.id)?,
        requester_id: ProfileId::parse(&row.requester_id)?,
        addressee_id: ProfileId::parse(&row.addressee_id)?,
        status: friendship_status_from_sql(&row.status)?,
        created_at_unix_ms: i64_to_u64(row.created_at, "friendship-row-created-at")?,
    })
}

fn conversation_row_to_record(row: ConversationRow) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ConversationId::parse(&row.id)?,
        created_at_unix_ms: i64_to_u64(row.created_at, "conversation-row-created-at")?,
    })
}

fn membership_row_to_record(row: MembershipRow) -> StorageResult<MembershipRecord> {
    Ok(MembershipRecord {
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        profile_id: ProfileId::parse(&row.profile_id)?,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        conversation_id: ConversationId::parse(&row.conversation_id)?,
        sender_id: ProfileId::parse(&row.sender_id)?,
        seq: i64_to_u64(row.seq, "message-row-seq")?,
        kind: message_kind_from_sql(&row.message_type)?,
        content: row.content,
        file_url: row.file_url,
        file_name: row.file_name,
        created_at_unix_ms: i64_to_u64(row.created_at, "message-row-created-at")?,
    })
}

async fn connect_store_connection(
    database_url: &str,
    stage: &'static str,
) -> StorageResult<SqliteConnection> {
    let mut connection =
        SqliteConnection::connect(database_url)
            .await
            .context(SqliteConnectSnafu {
                stage,
                database_url: database_url.to_string(),
            })?;

    sqlx::query("PRAGMA foreign_keys = ON;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-foreign-keys",
            pragma: "foreign_keys",
        })?;
    sqlx::query("PRAGMA busy_timeout = 5000;")
        .execute(&mut connection)
        .await
        .context(SqlitePragmaSnafu {
            stage: "sqlite-store-pragma-busy-timeout",
            pragma: "busy_timeout",
        })?;

    Ok(connection)
}

async fn load_friendship(
    connection: &mut SqliteConnection,
    friendship_id: FriendshipId,
    stage: &'static str,
) -> StorageResult<Option<FriendshipRecord>> {
    let row = sqlx::query_as::<_, FriendshipRow>(
        "SELECT id, requester_id, addressee_id, status, created_at FROM friendships WHERE id = ?",
    )
    .bind(friendship_id.to_string())
    .fetch_optional(&mut *connection)
    .await
    .context(SqliteQuerySnafu { stage })?;

    row.map(friendship_row_to_record).transpose()
}

async fn ensure_conversation_exists(
    connection: &mut SqliteConnection,
    conversation_id: ConversationId,
    stage: &'static str,
) -> StorageResult<()> {
    let existing = sqlx::query_scalar::<_, i64>("SELECT 1 FROM conversations WHERE id = ? LIMIT 1")
        .bind(conversation_id.to_string())
        .fetch_optional(&mut *connection)
        .await
        .context(SqliteQuerySnafu { stage })?;

    if existing.is_none() {
        return NotFoundSnafu {
            stage,
            entity: "conversation",
            id: conversation_id.to_string(),
        }
        .fail();
    }

    Ok(())
}

fn conflict_or_query_error(
    source: sqlx::Error,
    stage: &'static str,
    entity: &'static str,
    details: String,
) -> StorageError {
    let is_unique_violation = source
        .as_database_error()
        .is_some_and(|database_error| database_error.is_unique_violation());

    if is_unique_violation {
        StorageError::Conflict {
            stage,
            entity,
            details,
        }
    } else {
        StorageError::SqliteQuery { stage, source }
    }
}

fn friendship_status_from_sql(raw: &str) -> StorageResult<FriendshipStatus> {
    match raw {
        "pending" => Ok(FriendshipStatus::Pending),
        "accepted" => Ok(FriendshipStatus::Accepted),
        _ => InvariantViolationSnafu {
            stage: "friendship-status-from-sql",
            details: format!("unknown friendship status '{raw}'"),
        }
        .fail(),
    }
}

fn message_kind_from_sql(raw: &str) -> StorageResult<MessageKind> {
    MessageKind::parse(raw).context(InvariantViolationSnafu {
        stage: "message-kind-from-sql",
        details: format!("unknown message type '{raw}'"),
    })
}

fn unix_timestamp_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0_i64, |duration| duration.as_millis() as i64)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    format!("sqlite://{database_location}")
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp_storage() -> (tempfile::TempDir, SqliteStorage) {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("store").join("tandem.sqlite3");
        let storage = SqliteStorage::open(path.to_str().unwrap()).await.unwrap();
        (directory, storage)
    }

    fn profile(storage: &SqliteStorage, username: &str) -> ProfileRecord {
        storage
            .create_profile(NewProfile {
                username: username.to_string(),
                avatar_url: None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn username_lookup_is_case_insensitive_and_unique() {
        let (_directory, storage) = open_temp_storage().await;
        let alice = profile(&storage, "Alice");

        let found = storage.find_profile_by_username("aLiCe").unwrap().unwrap();
        assert_eq!(found.id, alice.id);
        assert!(storage.find_profile_by_username("bob").unwrap().is_none());

        let duplicate = storage
            .create_profile(NewProfile {
                username: "ALICE".to_string(),
                avatar_url: None,
            })
            .unwrap_err();
        assert!(duplicate.is_conflict());
    }

    #[tokio::test]
    async fn friendship_pair_is_unique_in_either_direction() {
        let (_directory, storage) = open_temp_storage().await;
        let alice = profile(&storage, "alice");
        let bob = profile(&storage, "bob");

        let created = storage.insert_friendship(alice.id, bob.id).unwrap();
        assert_eq!(created.status, FriendshipStatus::Pending);

        let reverse = storage.insert_friendship(bob.id, alice.id).unwrap_err();
        assert!(reverse.is_conflict());

        let found = storage.find_friendship_between(bob.id, alice.id).unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.requester_id, alice.id);
    }

    #[tokio::test]
    async fn accepting_twice_reports_conflict() {
        let (_directory, storage) = open_temp_storage().await;
        let alice = profile(&storage, "alice");
        let bob = profile(&storage, "bob");
        let created = storage.insert_friendship(alice.id, bob.id).unwrap();

        let accepted = storage.mark_friendship_accepted(created.id).unwrap();
        assert_eq!(accepted.status, FriendshipStatus::Accepted);

        let again = storage.mark_friendship_accepted(created.id).unwrap_err();
        assert!(again.is_conflict());

        let missing = storage.mark_friendship_accepted(FriendshipId::new_v7()).unwrap_err();
        assert!(missing.is_not_found());
    }

    #[tokio::test]
    async fn conversation_creation_writes_both_memberships() {
        let (_directory, storage) = open_temp_storage().await;
        let alice = profile(&storage, "alice");
        let bob = profile(&storage, "bob");

        let conversation = storage.create_direct_conversation(alice.id, bob.id).unwrap();
        let members = storage.list_members(conversation.id).unwrap();
        let mut member_ids = members.iter().map(|member| member.profile_id).collect::<Vec<_>>();
        member_ids.sort();
        let mut expected = vec![alice.id, bob.id];
        expected.sort();
        assert_eq!(member_ids, expected);

        let duplicate = storage.create_direct_conversation(bob.id, alice.id).unwrap_err();
        assert!(duplicate.is_conflict());

        let alice_ids = storage.list_conversation_ids_for(alice.id).unwrap();
        assert_eq!(
            storage
                .find_conversation_with_member(&alice_ids, bob.id)
                .unwrap(),
            Some(conversation.id)
        );
        assert_eq!(
            storage.find_conversation_with_member(&[], bob.id).unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn appended_messages_keep_sequence_and_timestamp_order() {
        let (_directory, storage) = open_temp_storage().await;
        let alice = profile(&storage, "alice");
        let bob = profile(&storage, "bob");
        let conversation = storage.create_direct_conversation(alice.id, bob.id).unwrap();

        for index in 0..5 {
            storage
                .append_message(conversation.id, NewMessage::text(alice.id, format!("m{index}")))
                .unwrap();
        }
        storage
            .append_message(
                conversation.id,
                NewMessage::attachment(bob.id, MessageKind::Image, "https://cdn/x.png", "x.png"),
            )
            .unwrap();

        let history = storage.list_messages(conversation.id).unwrap();
        assert_eq!(history.len(), 6);
        assert!(history.windows(2).all(|pair| pair[0].seq < pair[1].seq));
        assert!(
            history
                .windows(2)
                .all(|pair| pair[0].created_at_unix_ms <= pair[1].created_at_unix_ms)
        );
        assert_eq!(history[0].content.as_deref(), Some("m0"));

        let latest = storage.latest_message(conversation.id).unwrap().unwrap();
        assert_eq!(latest.kind, MessageKind::Image);
        assert_eq!(latest.seq, 6);

        let tail = storage.list_messages_after(conversation.id, 4).unwrap();
        assert_eq!(tail.iter().map(|message| message.seq).collect::<Vec<_>>(), vec![5, 6]);
        assert!(storage.list_messages_after(conversation.id, 6).unwrap().is_empty());
    }

    #[tokio::test]
    async fn append_to_unknown_conversation_is_not_found() {
        let (_directory, storage) = open_temp_storage().await;
        let alice = profile(&storage, "alice");

        let error = storage
            .append_message(ConversationId::new_v7(), NewMessage::text(alice.id, "hi"))
            .unwrap_err();
        assert!(error.is_not_found());
    }
}
