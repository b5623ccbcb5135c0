use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::model::{Conversation, Message};

/// Receives change notifications from the engine.
///
/// `on_update` fires at most once per processed stream frame with a snapshot
/// of the in-progress assistant message. `branch_id` names the branch the
/// message will be committed to (`None` for `baseMessages`).
pub trait ConversationObserver: Send + Sync {
    fn on_update(&self, _branch_id: Option<&str>, _message: &Message) {}

    fn on_branch_changed(&self, _conversation: &Conversation) {}
}

/// Observer that ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ConversationObserver for NoopObserver {}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    MessageUpdated {
        branch_id: Option<String>,
        message: Message,
    },

    BranchChanged {
        conversation: Conversation,
    },
}

/// Forwards notifications into an unbounded channel as [`SessionEvent`]s.
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    event_tx: mpsc::UnboundedSender<SessionEvent>,
}

impl ChannelObserver {
    pub fn new(event_tx: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self { event_tx }
    }

    pub fn channel() -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        (Self::new(event_tx), event_rx)
    }
}

impl ConversationObserver for ChannelObserver {
    fn on_update(&self, branch_id: Option<&str>, message: &Message) {
        let _ = self.event_tx.send(SessionEvent::MessageUpdated {
            branch_id: branch_id.map(str::to_string),
            message: message.clone(),
        });
    }

    fn on_branch_changed(&self, conversation: &Conversation) {
        let _ = self.event_tx.send(SessionEvent::BranchChanged {
            conversation: conversation.clone(),
        });
    }
}
