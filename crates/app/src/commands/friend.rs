use clap::Subcommand;
use snafu::ResultExt;
use tandem_chat::FriendEntry;
use tandem_storage::FriendshipId;

use crate::Context;
use crate::error::{AppResult, ChatSnafu, InvalidIdSnafu};

#[derive(Subcommand)]
pub enum FriendAction {
    /// Send a friend request to a username.
    Request { username: String },
    /// Accept a pending request addressed to you.
    Accept { friendship_id: String },
    /// Reject a pending request addressed to you.
    Reject { friendship_id: String },
    /// Show friends and pending requests.
    List,
}

pub fn run(action: FriendAction, context: &Context) -> AppResult<()> {
    let me = context.acting_profile()?;
    let ledger = context.messenger.friendships();

    match action {
        FriendAction::Request { username } => {
            let request = ledger.send_request(me.id, &username).context(ChatSnafu {
                stage: "friend-request",
            })?;
            println!("request {} sent to {}", request.id, username.trim());
        }
        FriendAction::Accept { friendship_id } => {
            let friendship_id = parse_friendship_id(&friendship_id)?;
            ledger.accept(friendship_id, me.id).context(ChatSnafu {
                stage: "friend-accept",
            })?;
            println!("accepted {friendship_id}");
        }
        FriendAction::Reject { friendship_id } => {
            let friendship_id = parse_friendship_id(&friendship_id)?;
            ledger.reject(friendship_id, me.id).context(ChatSnafu {
                stage: "friend-reject",
            })?;
            println!("rejected {friendship_id}");
        }
        FriendAction::List => {
            let list = ledger.list(me.id).context(ChatSnafu {
                stage: "friend-list",
            })?;
            print_section("friends", &list.accepted);
            print_section("incoming requests", &list.incoming_pending);
            print_section("outgoing requests", &list.outgoing_pending);
        }
    }

    Ok(())
}

fn parse_friendship_id(raw: &str) -> AppResult<FriendshipId> {
    FriendshipId::parse(raw).context(InvalidIdSnafu {
        stage: "parse-friendship-id",
        what: "friendship",
        raw: raw.to_string(),
    })
}

fn print_section(title: &str, entries: &[FriendEntry]) {
    println!("{title} ({})", entries.len());
    for entry in entries {
        println!("  {}  {}", entry.friendship.id, entry.counterpart.username);
    }
}
