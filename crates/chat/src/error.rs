use snafu::Snafu;
use tandem_storage::{FriendshipId, ProfileId, StorageError};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ChatError {
    #[snafu(display("{entity} '{key}' was not found"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        key: String,
    },
    #[snafu(display("a friendship with profile '{counterpart_id}' already exists"))]
    AlreadyConnected {
        stage: &'static str,
        counterpart_id: ProfileId,
    },
    #[snafu(display("friendship '{friendship_id}' is {status}, expected pending"))]
    InvalidState {
        stage: &'static str,
        friendship_id: FriendshipId,
        status: &'static str,
    },
    #[snafu(display("profile '{profile_id}' may not act on friendship '{friendship_id}'"))]
    NotAuthorized {
        stage: &'static str,
        profile_id: ProfileId,
        friendship_id: FriendshipId,
    },
    #[snafu(display("profile '{profile_id}' cannot target itself"))]
    SelfReference {
        stage: &'static str,
        profile_id: ProfileId,
    },
    #[snafu(display("text message content is empty"))]
    EmptyContent { stage: &'static str },
    #[snafu(display("{kind} message has no attachment"))]
    MissingAttachment {
        stage: &'static str,
        kind: &'static str,
    },
    #[snafu(display("failed to upload attachment '{file_name}': {source}"))]
    UploadFailed {
        stage: &'static str,
        file_name: String,
        source: StorageError,
    },
    #[snafu(display("store call failed on `{stage}`: {source}"))]
    TransientIo {
        stage: &'static str,
        source: StorageError,
    },
}

impl ChatError {
    /// True for errors raised before anything was written.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::EmptyContent { .. }
                | Self::MissingAttachment { .. }
                | Self::SelfReference { .. }
                | Self::NotAuthorized { .. }
                | Self::InvalidState { .. }
        )
    }
}

pub type ChatResult<T> = Result<T, ChatError>;
