pub mod branch;
pub mod citation;
pub mod config;
pub mod error;
pub mod events;
pub mod model;
pub mod paths;
pub mod persistence;
pub mod storage;

pub use branch::{BranchStore, ForkPoint};
pub use citation::{CitationResolver, DocumentContext, DocumentInfo, StaticResolver};
pub use config::WorkbenchConfig;
pub use error::{BranchError, MigrationError, PersistenceError, StorageError};
pub use events::{ChannelObserver, ConversationObserver, NoopObserver, SessionEvent};
pub use model::{Branch, Citation, Conversation, EvaluationResult, Message, Role};
pub use persistence::{migrate_record, ConversationPersistence, Scope};
pub use storage::{JsonFileStore, MemoryStore, PersistentStore};
