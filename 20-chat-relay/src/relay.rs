use std::sync::Arc;

use tracing::debug;

use crate::{
    directory::Directory,
    error::ProtocolError,
    files::FileRecord,
    protocol::{Event, SERVER_NAME},
};

/// Turns directory lookups into deliveries. Cloning is cheap; every clone
/// talks to the same [`Directory`].
#[derive(Clone, Default)]
pub struct Relay {
    directory: Arc<Directory>,
}

impl Relay {
    pub fn new(directory: Arc<Directory>) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    /// Sends a timestamped room message to every member, the sender included.
    pub async fn broadcast(&self, room: &str, from: &str, text: &str) -> usize {
        let delivered = self
            .directory
            .fan_out(room, |_| Event::room(room, from, text))
            .await;
        debug!(room, from, delivered, "room broadcast");
        delivered
    }

    pub async fn announce(&self, room: &str, text: &str) -> usize {
        self.directory
            .fan_out(room, |_| Event::info(text))
            .await
    }

    pub async fn announce_file(&self, record: &FileRecord) -> usize {
        let notice = format!(
            "FILE:{}:{}:{}:{}",
            record.id, record.file_name, record.size, record.uploader
        );
        self.broadcast(&record.room, SERVER_NAME, &notice).await
    }

    pub async fn private_message(
        &self,
        from: &str,
        to: &str,
        text: &str,
    ) -> Result<(), ProtocolError> {
        let recipient = self
            .directory
            .lookup(to)
            .await
            .ok_or(ProtocolError::RecipientNotFound)?;
        recipient.outbox().deliver(Event::private(from, text));
        Ok(())
    }

    pub async fn publish_member_list(&self, room: &str) -> usize {
        self.directory
            .fan_out(room, |names| Event::UserList(names.to_vec()))
            .await
    }
}
