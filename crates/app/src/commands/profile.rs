use clap::Subcommand;
use snafu::ResultExt;
use tandem_storage::{NewProfile, ProfileStore};

use crate::Context;
use crate::error::{AppResult, StorageSnafu};

#[derive(Subcommand)]
pub enum ProfileAction {
    /// Register a username.
    Create {
        username: String,
        #[arg(long)]
        avatar_url: Option<String>,
    },
    /// Look up a username.
    Show { username: String },
}

pub fn run(action: ProfileAction, context: &Context) -> AppResult<()> {
    match action {
        ProfileAction::Create {
            username,
            avatar_url,
        } => {
            let profile = context
                .store()
                .create_profile(NewProfile {
                    username,
                    avatar_url,
                })
                .context(StorageSnafu {
                    stage: "profile-create",
                })?;
            println!("created profile {} ({})", profile.username, profile.id);
            Ok(())
        }
        ProfileAction::Show { username } => {
            let profile = context.profile_by_username(&username)?;
            println!("{} ({})", profile.username, profile.id);
            if let Some(avatar_url) = profile.avatar_url {
                println!("avatar: {avatar_url}");
            }
            Ok(())
        }
    }
}
