pub mod conversation;
pub mod message;
pub(crate) mod timestamp;

pub use conversation::{Branch, Conversation};
pub use message::{Citation, EvaluationResult, Message, Role};
