//! Key/value storage the conversation records are written to.

mod file;
mod memory;

pub use file::JsonFileStore;
pub use memory::MemoryStore;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageResult;

/// Asynchronous JSON key/value store.
///
/// Implementations must make `set` atomic per key: a reader sees either the
/// previous value or the new one, never a partial write.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    async fn get(&self, key: &str) -> StorageResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> StorageResult<()>;

    /// Returns `true` when a value was removed.
    async fn remove(&self, key: &str) -> StorageResult<bool>;

    /// All keys starting with `prefix`, sorted.
    async fn keys(&self, prefix: &str) -> StorageResult<Vec<String>>;
}
