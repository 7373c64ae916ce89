pub mod chat;
pub mod friend;
pub mod profile;
pub mod settings;

use std::collections::HashMap;

use tandem_storage::{MessageKind, MessageRecord, ProfileId, ProfileStore};

use crate::Context;

/// Resolves sender ids to usernames, remembering earlier lookups.
pub(crate) struct SenderNames<'a> {
    context: &'a Context,
    known: HashMap<ProfileId, String>,
}

impl<'a> SenderNames<'a> {
    pub(crate) fn new(context: &'a Context) -> Self {
        Self {
            context,
            known: HashMap::new(),
        }
    }

    pub(crate) fn name_of(&mut self, profile_id: ProfileId) -> String {
        if let Some(name) = self.known.get(&profile_id) {
            return name.clone();
        }

        let name = match self.context.store().get_profile(profile_id) {
            Ok(Some(profile)) => profile.username,
            Ok(None) => profile_id.to_string(),
            Err(error) => {
                tracing::warn!(%profile_id, error = %error, "failed to resolve sender name");
                profile_id.to_string()
            }
        };
        self.known.insert(profile_id, name.clone());
        name
    }
}

pub(crate) fn format_message(message: &MessageRecord, sender: &str) -> String {
    let body = match message.kind {
        MessageKind::Text => message.content.clone().unwrap_or_default(),
        MessageKind::Image | MessageKind::Voice | MessageKind::File => format!(
            "{} {} <{}>",
            tandem_chat::preview(message),
            message.file_name.as_deref().unwrap_or_default(),
            message.file_url.as_deref().unwrap_or_default()
        ),
    };

    format!(
        "#{:<4} {} {}: {}",
        message.seq, message.created_at_unix_ms, sender, body
    )
}
