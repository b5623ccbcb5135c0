use thiserror::Error;
use workbench_core::{BranchError, PersistenceError};

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("A response is still streaming for this conversation")]
    StreamInProgress,

    #[error("No response is streaming")]
    NoActiveStream,

    #[error("The last question has no answer yet; reply to it before asking another")]
    AwaitingReply,

    #[error("The conversation has no unanswered question")]
    NothingToReply,

    #[error(transparent)]
    Branch(#[from] BranchError),

    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    #[error("Stream task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
