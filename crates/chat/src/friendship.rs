use std::sync::Arc;

use snafu::{OptionExt, ResultExt, ensure};
use tandem_storage::{
    FriendshipId, FriendshipRecord, FriendshipStatus, FriendshipStore, ProfileId, ProfileRecord,
    ProfileStore, StorageError,
};

use crate::error::{
    AlreadyConnectedSnafu, ChatError, ChatResult, InvalidStateSnafu, NotAuthorizedSnafu,
    NotFoundSnafu, SelfReferenceSnafu, TransientIoSnafu,
};

/// One friendship as seen from a given user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FriendEntry {
    pub friendship: FriendshipRecord,
    pub counterpart: ProfileRecord,
    /// True when the viewing user sent the request.
    pub is_requester: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FriendList {
    pub accepted: Vec<FriendEntry>,
    pub incoming_pending: Vec<FriendEntry>,
    pub outgoing_pending: Vec<FriendEntry>,
}

/// Tracks request/accept state between pairs of users.
pub struct FriendshipLedger<S> {
    store: Arc<S>,
}

impl<S> FriendshipLedger<S>
where
    S: ProfileStore + FriendshipStore,
{
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    pub fn send_request(&self, from: ProfileId, to_username: &str) -> ChatResult<FriendshipRecord> {
        let requester = self
            .store
            .get_profile(from)
            .context(TransientIoSnafu {
                stage: "friend-request-load-requester",
            })?
            .context(NotFoundSnafu {
                stage: "friend-request-requester-missing",
                entity: "profile",
                key: from.to_string(),
            })?;

        let target = self
            .store
            .find_profile_by_username(to_username)
            .context(TransientIoSnafu {
                stage: "friend-request-resolve-username",
            })?
            .context(NotFoundSnafu {
                stage: "friend-request-username-missing",
                entity: "username",
                key: to_username.trim().to_string(),
            })?;

        ensure!(
            target.id != requester.id,
            SelfReferenceSnafu {
                stage: "friend-request-self",
                profile_id: from,
            }
        );

        // Any existing row blocks a new request, whatever its status or direction.
        let existing = self
            .store
            .find_friendship_between(requester.id, target.id)
            .context(TransientIoSnafu {
                stage: "friend-request-check-existing",
            })?;
        if let Some(existing) = existing {
            tracing::debug!(
                friendship_id = %existing.id,
                status = existing.status.as_str(),
                "friend request rejected; pair already connected"
            );
            return AlreadyConnectedSnafu {
                stage: "friend-request-existing",
                counterpart_id: target.id,
            }
            .fail();
        }

        match self.store.insert_friendship(requester.id, target.id) {
            Ok(created) => {
                tracing::info!(
                    friendship_id = %created.id,
                    requester_id = %created.requester_id,
                    addressee_id = %created.addressee_id,
                    "friend request sent"
                );
                Ok(created)
            }
            Err(error) if error.is_conflict() => {
                tracing::warn!(
                    requester_id = %requester.id,
                    addressee_id = %target.id,
                    "friend request lost an insert race to a concurrent request"
                );
                AlreadyConnectedSnafu {
                    stage: "friend-request-insert-race",
                    counterpart_id: target.id,
                }
                .fail()
            }
            Err(source) => Err(ChatError::TransientIo {
                stage: "friend-request-insert",
                source,
            }),
        }
    }

    pub fn accept(
        &self,
        friendship_id: FriendshipId,
        acting_user: ProfileId,
    ) -> ChatResult<FriendshipRecord> {
        let current = self.load_pending_for_addressee(friendship_id, acting_user, "friend-accept")?;

        match self.store.mark_friendship_accepted(current.id) {
            Ok(accepted) => {
                tracing::info!(friendship_id = %accepted.id, "friend request accepted");
                Ok(accepted)
            }
            Err(error) => Err(map_transition_error(error, friendship_id, "friend-accept-apply")),
        }
    }

    /// Deletes a pending request. Only the addressee may reject.
    pub fn reject(&self, friendship_id: FriendshipId, acting_user: ProfileId) -> ChatResult<()> {
        let current = self.load_pending_for_addressee(friendship_id, acting_user, "friend-reject")?;

        self.store
            .delete_friendship(current.id)
            .map_err(|error| map_transition_error(error, friendship_id, "friend-reject-apply"))?;

        tracing::info!(friendship_id = %friendship_id, "friend request rejected");
        Ok(())
    }

    pub fn list(&self, user: ProfileId) -> ChatResult<FriendList> {
        let rows = self
            .store
            .list_friendships_for(user)
            .context(TransientIoSnafu {
                stage: "friend-list-load-rows",
            })?;

        let mut resolved = Vec::with_capacity(rows.len());
        for row in rows {
            let counterpart_id = row.counterpart_of(user);
            let counterpart = self
                .store
                .get_profile(counterpart_id)
                .context(TransientIoSnafu {
                    stage: "friend-list-load-counterpart",
                })?;

            match counterpart {
                Some(counterpart) => resolved.push((row, counterpart)),
                None => tracing::warn!(
                    friendship_id = %row.id,
                    counterpart_id = %counterpart_id,
                    "skipping friendship whose counterpart profile is missing"
                ),
            }
        }

        Ok(project_friend_list(user, resolved))
    }

    fn load_pending_for_addressee(
        &self,
        friendship_id: FriendshipId,
        acting_user: ProfileId,
        stage: &'static str,
    ) -> ChatResult<FriendshipRecord> {
        let current = self
            .store
            .get_friendship(friendship_id)
            .context(TransientIoSnafu { stage })?
            .context(NotFoundSnafu {
                stage,
                entity: "friendship",
                key: friendship_id.to_string(),
            })?;

        ensure!(
            current.addressee_id == acting_user,
            NotAuthorizedSnafu {
                stage,
                profile_id: acting_user,
                friendship_id,
            }
        );
        ensure!(
            current.status == FriendshipStatus::Pending,
            InvalidStateSnafu {
                stage,
                friendship_id,
                status: current.status.as_str(),
            }
        );

        Ok(current)
    }
}

/// Partitions `user`'s friendship rows by status and by which side `user` is on.
///
/// Input order is kept inside each bucket, so the projection is deterministic
/// for a given set of rows.
pub fn project_friend_list(
    user: ProfileId,
    rows: Vec<(FriendshipRecord, ProfileRecord)>,
) -> FriendList {
    let mut list = FriendList::default();

    for (friendship, counterpart) in rows {
        if !friendship.involves(user) {
            continue;
        }

        let is_requester = friendship.requester_id == user;
        let status = friendship.status;
        let entry = FriendEntry {
            friendship,
            counterpart,
            is_requester,
        };

        match (status, is_requester) {
            (FriendshipStatus::Accepted, _) => list.accepted.push(entry),
            (FriendshipStatus::Pending, true) => list.outgoing_pending.push(entry),
            (FriendshipStatus::Pending, false) => list.incoming_pending.push(entry),
        }
    }

    list
}

fn map_transition_error(
    error: StorageError,
    friendship_id: FriendshipId,
    stage: &'static str,
) -> ChatError {
    match error {
        // A concurrent accept won between our read and our write.
        StorageError::Conflict { .. } => ChatError::InvalidState {
            stage,
            friendship_id,
            status: FriendshipStatus::Accepted.as_str(),
        },
        StorageError::NotFound { .. } => ChatError::NotFound {
            stage,
            entity: "friendship",
            key: friendship_id.to_string(),
        },
        source => ChatError::TransientIo { stage, source },
    }
}

#[cfg(test)]
mod tests {
    use tandem_storage::{NewProfile, SqliteStorage};

    use super::*;

    struct Fixture {
        _directory: tempfile::TempDir,
        store: Arc<SqliteStorage>,
        ledger: FriendshipLedger<SqliteStorage>,
    }

    async fn fixture() -> Fixture {
        let directory = tempfile::tempdir().unwrap();
        let path = directory.path().join("ledger.sqlite3");
        let store = Arc::new(SqliteStorage::open(path.to_str().unwrap()).await.unwrap());
        let ledger = FriendshipLedger::new(Arc::clone(&store));
        Fixture {
            _directory: directory,
            store,
            ledger,
        }
    }

    fn profile(store: &SqliteStorage, username: &str) -> ProfileRecord {
        store
            .create_profile(NewProfile {
                username: username.to_string(),
                avatar_url: None,
            })
            .unwrap()
    }

    #[tokio::test]
    async fn request_to_unknown_username_is_not_found() {
        let fixture = fixture().await;
        let alice = profile(&fixture.store, "alice");

        let error = fixture.ledger.send_request(alice.id, "bob").unwrap_err();
        assert!(matches!(error, ChatError::NotFound { entity: "username", .. }));
    }

    #[tokio::test]
    async fn crossing_requests_leave_exactly_one_row() {
        let fixture = fixture().await;
        let alice = profile(&fixture.store, "alice");
        let bob = profile(&fixture.store, "bob");
        let start = std::sync::Barrier::new(2);

        let (from_alice, from_bob) = std::thread::scope(|scope| {
            let ledger = &fixture.ledger;
            let start = &start;
            let alice_side = scope.spawn(move || {
                start.wait();
                ledger.send_request(alice.id, "bob")
            });
            let bob_side = scope.spawn(move || {
                start.wait();
                ledger.send_request(bob.id, "alice")
            });
            (alice_side.join().unwrap(), bob_side.join().unwrap())
        });

        let outcomes = [&from_alice, &from_bob];
        assert_eq!(outcomes.iter().filter(|outcome| outcome.is_ok()).count(), 1);
        assert!(
            outcomes
                .iter()
                .any(|outcome| matches!(outcome, Err(ChatError::AlreadyConnected { .. })))
        );
        assert_eq!(fixture.store.list_friendships_for(alice.id).unwrap().len(), 1);
        assert_eq!(fixture.store.list_friendships_for(bob.id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn request_to_own_username_is_self_reference() {
        let fixture = fixture().await;
        let bob = profile(&fixture.store, "bob");

        let error = fixture.ledger.send_request(bob.id, "BOB").unwrap_err();
        assert!(matches!(error, ChatError::SelfReference { .. }));
        assert!(error.is_validation());
    }

    #[tokio::test]
    async fn second_request_in_either_direction_is_already_connected() {
        let fixture = fixture().await;
        let alice = profile(&fixture.store, "alice");
        let bob = profile(&fixture.store, "bob");

        let created = fixture.ledger.send_request(alice.id, "bob").unwrap();
        assert_eq!(created.requester_id, alice.id);
        assert_eq!(created.addressee_id, bob.id);
        assert_eq!(created.status, FriendshipStatus::Pending);

        let repeated = fixture.ledger.send_request(alice.id, "bob").unwrap_err();
        assert!(matches!(repeated, ChatError::AlreadyConnected { .. }));

        let reverse = fixture.ledger.send_request(bob.id, "alice").unwrap_err();
        assert!(matches!(reverse, ChatError::AlreadyConnected { counterpart_id, .. } if counterpart_id == alice.id));
    }

    #[tokio::test]
    async fn only_addressee_may_accept_and_only_once() {
        let fixture = fixture().await;
        let alice = profile(&fixture.store, "alice");
        let bob = profile(&fixture.store, "bob");
        let request = fixture.ledger.send_request(alice.id, "bob").unwrap();

        let by_requester = fixture.ledger.accept(request.id, alice.id).unwrap_err();
        assert!(matches!(by_requester, ChatError::NotAuthorized { .. }));

        let accepted = fixture.ledger.accept(request.id, bob.id).unwrap();
        assert_eq!(accepted.status, FriendshipStatus::Accepted);

        let again = fixture.ledger.accept(request.id, bob.id).unwrap_err();
        assert!(matches!(again, ChatError::InvalidState { status: "accepted", .. }));
    }

    #[tokio::test]
    async fn reject_deletes_pending_row_and_allows_new_request() {
        let fixture = fixture().await;
        let alice = profile(&fixture.store, "alice");
        let bob = profile(&fixture.store, "bob");
        let request = fixture.ledger.send_request(alice.id, "bob").unwrap();

        let by_requester = fixture.ledger.reject(request.id, alice.id).unwrap_err();
        assert!(matches!(by_requester, ChatError::NotAuthorized { .. }));

        fixture.ledger.reject(request.id, bob.id).unwrap();
        assert!(fixture.store.get_friendship(request.id).unwrap().is_none());

        let missing = fixture.ledger.reject(request.id, bob.id).unwrap_err();
        assert!(matches!(missing, ChatError::NotFound { .. }));

        fixture.ledger.send_request(bob.id, "alice").unwrap();
    }

    #[tokio::test]
    async fn list_partitions_by_status_and_side() {
        let fixture = fixture().await;
        let alice = profile(&fixture.store, "alice");
        let bob = profile(&fixture.store, "bob");
        let carol = profile(&fixture.store, "carol");
        let dave = profile(&fixture.store, "dave");

        let to_bob = fixture.ledger.send_request(alice.id, "bob").unwrap();
        fixture.ledger.accept(to_bob.id, bob.id).unwrap();
        fixture.ledger.send_request(alice.id, "carol").unwrap();
        fixture.ledger.send_request(dave.id, "alice").unwrap();

        let list = fixture.ledger.list(alice.id).unwrap();
        let names = |entries: &[FriendEntry]| {
            entries
                .iter()
                .map(|entry| entry.counterpart.username.clone())
                .collect::<Vec<_>>()
        };

        assert_eq!(names(&list.accepted), vec!["bob"]);
        assert_eq!(names(&list.outgoing_pending), vec!["carol"]);
        assert_eq!(names(&list.incoming_pending), vec!["dave"]);
        assert!(list.accepted[0].is_requester);
        assert!(!list.incoming_pending[0].is_requester);

        let carol_view = fixture.ledger.list(carol.id).unwrap();
        assert_eq!(names(&carol_view.incoming_pending), vec!["alice"]);
    }
}
