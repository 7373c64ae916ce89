mod commands;
mod error;
mod settings;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use snafu::{OptionExt, ResultExt};
use tandem_chat::Messenger;
use tandem_storage::{FsBlobStore, ProfileRecord, ProfileStore, SqliteStorage};
use tracing_subscriber::EnvFilter;

use crate::error::{AppResult, NoActingUserSnafu, StorageSnafu, UnknownUserSnafu};
use crate::settings::{Settings, SettingsStore};

/// Direct messages between friends, backed by a local SQLite store.
#[derive(Parser)]
#[command(name = "tandem", version, about)]
struct Cli {
    /// Settings file to read instead of the default location.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Act as this username instead of `current_username`.
    #[arg(long = "as", global = true, value_name = "USERNAME")]
    acting_username: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Settings file management.
    Settings {
        #[command(subcommand)]
        action: commands::settings::SettingsAction,
    },
    /// Profile provisioning.
    Profile {
        #[command(subcommand)]
        action: commands::profile::ProfileAction,
    },
    /// Friend requests and the friend list.
    Friend {
        #[command(subcommand)]
        action: commands::friend::FriendAction,
    },
    /// Conversations and messages.
    Chat {
        #[command(subcommand)]
        action: commands::chat::ChatAction,
    },
}

/// Everything a command handler needs once settings are loaded.
pub struct Context {
    pub settings: Arc<Settings>,
    acting_username: Option<String>,
    store: Arc<SqliteStorage>,
    pub messenger: Messenger<SqliteStorage>,
}

impl Context {
    async fn open(
        settings_store: &SettingsStore,
        acting_username: Option<String>,
    ) -> AppResult<Self> {
        let settings = settings_store.settings();
        let database_path = settings.database_path.display().to_string();
        let store = Arc::new(SqliteStorage::open(&database_path).await.context(StorageSnafu {
            stage: "open-storage",
        })?);

        Ok(Self {
            messenger: Messenger::new(Arc::clone(&store)),
            settings,
            acting_username,
            store,
        })
    }

    pub fn store(&self) -> &SqliteStorage {
        &self.store
    }

    pub fn blob_store(&self) -> FsBlobStore {
        FsBlobStore::new(
            self.settings.blob_root.clone(),
            self.settings.blob_public_base_url.clone(),
        )
    }

    pub fn profile_by_username(&self, username: &str) -> AppResult<ProfileRecord> {
        self.store
            .find_profile_by_username(username)
            .context(StorageSnafu {
                stage: "resolve-username",
            })?
            .context(UnknownUserSnafu {
                stage: "resolve-username",
                username: username.trim().to_string(),
            })
    }

    /// Profile of `--as`, falling back to `current_username` from settings.
    pub fn acting_profile(&self) -> AppResult<ProfileRecord> {
        let username = self
            .acting_username
            .as_deref()
            .or(self.settings.current_username.as_deref())
            .context(NoActingUserSnafu {
                stage: "resolve-acting-user",
            })?;
        self.profile_by_username(username)
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let settings_store =
        SettingsStore::new(cli.config.unwrap_or_else(SettingsStore::default_config_path));
    init_logging(&settings_store.settings().log_filter);

    let result = dispatch(settings_store, cli.acting_username, cli.command).await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            tracing::debug!(error = ?error, "command failed");
            eprintln!("error: {error}");
            ExitCode::FAILURE
        }
    }
}

async fn dispatch(
    settings_store: SettingsStore,
    acting_username: Option<String>,
    command: Commands,
) -> AppResult<()> {
    // Settings commands must work before a database exists.
    match command {
        Commands::Settings { action } => commands::settings::run(action, &settings_store),
        Commands::Profile { action } => {
            let context = Context::open(&settings_store, acting_username).await?;
            commands::profile::run(action, &context)
        }
        Commands::Friend { action } => {
            let context = Context::open(&settings_store, acting_username).await?;
            commands::friend::run(action, &context)
        }
        Commands::Chat { action } => {
            let context = Context::open(&settings_store, acting_username).await?;
            commands::chat::run(action, &context).await
        }
    }
}

fn init_logging(default_filter: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}
