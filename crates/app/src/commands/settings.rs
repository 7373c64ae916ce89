use std::path::PathBuf;

use clap::Subcommand;
use snafu::ResultExt;

use crate::error::{AppResult, SettingsSnafu};
use crate::settings::{Settings, SettingsStore};

#[derive(Subcommand)]
pub enum SettingsAction {
    /// Write the settings file, filling unset values with defaults.
    Init {
        /// Username to act as by default.
        #[arg(long)]
        username: Option<String>,
        #[arg(long)]
        database_path: Option<PathBuf>,
        #[arg(long)]
        blob_root: Option<PathBuf>,
        /// Base URL that serves the blob root.
        #[arg(long)]
        blob_url: Option<String>,
    },
    /// Print the effective settings.
    Show,
}

pub fn run(action: SettingsAction, store: &SettingsStore) -> AppResult<()> {
    match action {
        SettingsAction::Init {
            username,
            database_path,
            blob_root,
            blob_url,
        } => {
            let current = store.settings();
            let updated = Settings {
                database_path: database_path.unwrap_or_else(|| current.database_path.clone()),
                blob_root: blob_root.unwrap_or_else(|| current.blob_root.clone()),
                blob_public_base_url: blob_url
                    .unwrap_or_else(|| current.blob_public_base_url.clone()),
                log_filter: current.log_filter.clone(),
                current_username: username.or_else(|| current.current_username.clone()),
            };

            let saved = store.update(updated).context(SettingsSnafu {
                stage: "settings-init-persist",
            })?;
            println!("settings written to {}", store.config_path().display());
            print_settings(&saved);
            Ok(())
        }
        SettingsAction::Show => {
            println!("settings file: {}", store.config_path().display());
            print_settings(&store.settings());
            Ok(())
        }
    }
}

fn print_settings(settings: &Settings) {
    println!("database_path:        {}", settings.database_path.display());
    println!("blob_root:            {}", settings.blob_root.display());
    println!("blob_public_base_url: {}", settings.blob_public_base_url);
    println!("log_filter:           {}", settings.log_filter);
    println!(
        "current_username:     {}",
        settings.current_username.as_deref().unwrap_or("(unset)")
    );
}
