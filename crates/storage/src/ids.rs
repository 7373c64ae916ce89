use std::fmt;
use std::str::FromStr;

use snafu::ResultExt;
use uuid::Uuid;

use super::error::{InvalidIdSnafu, StorageError, StorageResult};

// Every row key shares one shape so sqlite text columns round-trip the same way.
macro_rules! define_storage_id {
    ($name:ident, $id_type:literal) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new(raw: Uuid) -> Self {
                Self(raw)
            }

            pub fn new_v7() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn parse(raw: &str) -> StorageResult<Self> {
                let parsed = Uuid::parse_str(raw.trim()).context(InvalidIdSnafu {
                    stage: "parse-storage-id",
                    id_type: $id_type,
                    raw: raw.to_string(),
                })?;
                Ok(Self(parsed))
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(formatter, "{}", self.0)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self::new(value)
            }
        }

        impl From<$name> for Uuid {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl FromStr for $name {
            type Err = StorageError;

            fn from_str(raw: &str) -> StorageResult<Self> {
                Self::parse(raw)
            }
        }
    };
}

define_storage_id!(ProfileId, "profile-id");
define_storage_id!(FriendshipId, "friendship-id");
define_storage_id!(ConversationId, "conversation-id");
define_storage_id!(MessageId, "message-id");

/// Order-independent key for an unordered pair of profiles.
///
/// `{A, B}` and `{B, A}` map to the same key, which is what the unique
/// columns on `friendships` and `conversations` are built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PairKey {
    low: ProfileId,
    high: ProfileId,
}

impl PairKey {
    pub fn new(left: ProfileId, right: ProfileId) -> Self {
        if left <= right {
            Self {
                low: left,
                high: right,
            }
        } else {
            Self {
                low: right,
                high: left,
            }
        }
    }

    pub fn low(&self) -> ProfileId {
        self.low
    }

    pub fn high(&self) -> ProfileId {
        self.high
    }

    pub fn is_self_pair(&self) -> bool {
        self.low == self.high
    }
}

impl fmt::Display for PairKey {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(formatter, "{}:{}", self.low, self.high)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pair_key_is_order_independent() {
        let alice = ProfileId::new_v7();
        let bob = ProfileId::new_v7();

        assert_eq!(PairKey::new(alice, bob), PairKey::new(bob, alice));
        assert_eq!(
            PairKey::new(alice, bob).to_string(),
            PairKey::new(bob, alice).to_string()
        );
        assert!(!PairKey::new(alice, bob).is_self_pair());
        assert!(PairKey::new(alice, alice).is_self_pair());
    }

    #[test]
    fn invalid_id_reports_id_type() {
        let error = ConversationId::parse("not-a-uuid").unwrap_err();
        match error {
            StorageError::InvalidId { id_type, raw, .. } => {
                assert_eq!(id_type, "conversation-id");
                assert_eq!(raw, "not-a-uuid");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
