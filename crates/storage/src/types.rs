use super::ids::{ConversationId, FriendshipId, MessageId, ProfileId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileRecord {
    pub id: ProfileId,
    pub username: String,
    pub avatar_url: Option<String>,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewProfile {
    pub username: String,
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FriendshipStatus {
    Pending,
    Accepted,
}

impl FriendshipStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
        }
    }
}

/// Directional friendship row; `requester_id` is whoever initiated it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendshipRecord {
    pub id: FriendshipId,
    pub requester_id: ProfileId,
    pub addressee_id: ProfileId,
    pub status: FriendshipStatus,
    pub created_at_unix_ms: u64,
}

impl FriendshipRecord {
    pub fn involves(&self, profile_id: ProfileId) -> bool {
        self.requester_id == profile_id || self.addressee_id == profile_id
    }

    /// Returns the side of the row that is not `profile_id`.
    pub fn counterpart_of(&self, profile_id: ProfileId) -> ProfileId {
        if self.requester_id == profile_id {
            self.addressee_id
        } else {
            self.requester_id
        }
    }
}

/// Identity-only record for a 1:1 pairing. Content lives in `messages`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ConversationId,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MembershipRecord {
    pub conversation_id: ConversationId,
    pub profile_id: ProfileId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Text,
    Image,
    Voice,
    File,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Image => "image",
            Self::Voice => "voice",
            Self::File => "file",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "image" => Some(Self::Image),
            "voice" => Some(Self::Voice),
            "file" => Some(Self::File),
            _ => None,
        }
    }

    pub fn is_attachment(&self) -> bool {
        !matches!(self, Self::Text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender_id: ProfileId,
    // Position within the conversation; strictly increasing in append order.
    pub seq: u64,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub created_at_unix_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: ProfileId,
    pub kind: MessageKind,
    pub content: Option<String>,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
}

impl NewMessage {
    pub fn text(sender_id: ProfileId, content: impl Into<String>) -> Self {
        Self {
            sender_id,
            kind: MessageKind::Text,
            content: Some(content.into()),
            file_url: None,
            file_name: None,
        }
    }

    pub fn attachment(
        sender_id: ProfileId,
        kind: MessageKind,
        file_url: impl Into<String>,
        file_name: impl Into<String>,
    ) -> Self {
        Self {
            sender_id,
            kind,
            content: None,
            file_url: Some(file_url.into()),
            file_name: Some(file_name.into()),
        }
    }
}

/// Location of an uploaded object inside a blob store.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlobPath(pub String);

impl BlobPath {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}
