use std::path::PathBuf;

use snafu::Snafu;
use tandem_chat::ChatError;
use tandem_storage::StorageError;

use crate::settings::SettingsError;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AppError {
    #[snafu(display("settings failure on `{stage}`: {source}"))]
    Settings {
        stage: &'static str,
        source: SettingsError,
    },
    #[snafu(display("storage failure on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("{source}"))]
    Chat {
        stage: &'static str,
        source: ChatError,
    },
    #[snafu(display("no acting user; pass --as <username> or set current_username"))]
    NoActingUser { stage: &'static str },
    #[snafu(display("no profile named '{username}'"))]
    UnknownUser {
        stage: &'static str,
        username: String,
    },
    #[snafu(display("'{username}' is not your friend; a conversation needs an accepted friend request"))]
    NotFriends {
        stage: &'static str,
        username: String,
    },
    #[snafu(display("'{username}' is not a member of conversation '{conversation_id}'"))]
    NotAMember {
        stage: &'static str,
        username: String,
        conversation_id: String,
    },
    #[snafu(display("invalid {what} id '{raw}': {source}"))]
    InvalidId {
        stage: &'static str,
        what: &'static str,
        raw: String,
        source: StorageError,
    },
    #[snafu(display("'{raw}' is not an attachment kind; use image, voice or file"))]
    InvalidAttachmentKind { stage: &'static str, raw: String },
    #[snafu(display("failed to read attachment {path:?}: {source}"))]
    ReadAttachment {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to wait for shutdown signal: {source}"))]
    ShutdownSignal {
        stage: &'static str,
        source: std::io::Error,
    },
}

pub type AppResult<T> = Result<T, AppError>;
