use tokio::task::JoinHandle;

use workbench_core::{Conversation, ConversationPersistence, Scope};

/// Sequences persistence writes for one session.
///
/// Each commit runs in the background, but a new commit (or an explicit
/// [`CommitQueue::flush`]) first waits for the previous one, so a later
/// snapshot can never be overwritten by an earlier one.
#[derive(Debug, Default)]
pub struct CommitQueue {
    pending: Option<JoinHandle<()>>,
}

impl CommitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submit(
        &mut self,
        persistence: ConversationPersistence,
        scope: Scope,
        snapshot: Conversation,
    ) {
        self.flush().await;
        self.pending = Some(tokio::spawn(async move {
            if let Err(error) = persistence.save(&scope, &snapshot).await {
                log::error!("[{}] Failed to persist conversation: {}", scope, error);
            }
        }));
    }

    pub async fn flush(&mut self) {
        if let Some(handle) = self.pending.take() {
            if let Err(error) = handle.await {
                log::error!("Persistence task panicked: {}", error);
            }
        }
    }
}
