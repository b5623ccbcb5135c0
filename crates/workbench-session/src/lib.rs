pub mod assembler;
pub mod commit;
pub mod config;
pub mod error;
pub mod session;
pub mod stream;

pub use assembler::{AssemblerState, FailureReason, ResponseAssembler, StreamOutcome, Transition};
pub use config::SessionConfig;
pub use error::SessionError;
pub use session::{ConversationSession, TurnOutcome};
