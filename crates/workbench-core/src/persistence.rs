//! Scope-keyed conversation records and the legacy flat-array migration.
//!
//! Two record shapes exist in storage:
//!
//! - current: `{"baseMessages": [...], "branches": [...], "currentBranchId": ...}`
//!   stored under `conversation/<scope>`;
//! - legacy: a flat array of messages stored under `messages/<scope>`.
//!
//! A legacy record is migrated the first time its scope is loaded and the
//! result is written under the current key. Later loads find the current
//! record first and never migrate again.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::Value;

use crate::branch;
use crate::error::{MigrationError, PersistenceError, Result, StorageError};
use crate::model::{Branch, Conversation, Message};
use crate::storage::PersistentStore;

const RECORD_PREFIX: &str = "conversation/";
const LEGACY_PREFIX: &str = "messages/";

/// What a conversation is about. Each scope owns one record.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Scope {
    #[default]
    Default,
    Module(String),
    Document(String),
}

impl Scope {
    pub fn record_key(&self) -> String {
        format!("{RECORD_PREFIX}{self}")
    }

    pub fn legacy_key(&self) -> String {
        format!("{LEGACY_PREFIX}{self}")
    }

    pub fn doc_id(&self) -> Option<&str> {
        match self {
            Scope::Document(doc_id) => Some(doc_id),
            _ => None,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scope::Default => write!(f, "default"),
            Scope::Module(id) => write!(f, "module:{id}"),
            Scope::Document(id) => write!(f, "doc:{id}"),
        }
    }
}

impl FromStr for Scope {
    type Err = PersistenceError;

    fn from_str(value: &str) -> Result<Self> {
        let value = value.trim();
        if value == "default" {
            return Ok(Scope::Default);
        }

        let scope = match value.split_once(':') {
            Some(("module", id)) if !id.is_empty() => Scope::Module(id.to_string()),
            Some(("doc" | "document", id)) if !id.is_empty() => Scope::Document(id.to_string()),
            _ => return Err(PersistenceError::InvalidScope(value.to_string())),
        };
        Ok(scope)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordShape {
    Current,
    Legacy,
    Unknown,
}

pub fn detect_shape(record: &Value) -> RecordShape {
    match record {
        Value::Object(map) if map.contains_key("baseMessages") || map.contains_key("branches") => {
            RecordShape::Current
        }
        Value::Array(_) => RecordShape::Legacy,
        _ => RecordShape::Unknown,
    }
}

/// Convert a stored record into the current shape.
///
/// A current-shape record is returned unchanged, so applying this twice is
/// the same as applying it once. A legacy array becomes a conversation with
/// an empty prefix and a single version-1 branch at point 0 holding every
/// message; an empty array becomes an empty conversation.
pub fn migrate_record(record: Value) -> std::result::Result<Value, MigrationError> {
    match detect_shape(&record) {
        RecordShape::Current => Ok(record),
        RecordShape::Legacy => {
            let messages: Vec<Message> = serde_json::from_value(record)
                .map_err(|error| MigrationError(format!("unreadable message list: {error}")))?;

            let mut conversation = Conversation::new();
            if !messages.is_empty() {
                let branch = Branch::new(1, 0, None, messages);
                conversation.current_branch_id = Some(branch.branch_id.clone());
                conversation.branches.push(branch);
            }

            serde_json::to_value(&conversation).map_err(|error| MigrationError(error.to_string()))
        }
        RecordShape::Unknown => Err(MigrationError(format!(
            "expected a message array, found {}",
            json_kind(&record)
        ))),
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Reads and writes conversations through a [`PersistentStore`].
///
/// Writes are last-write-wins per scope. Two sessions saving the same scope
/// concurrently are not reconciled.
#[derive(Clone)]
pub struct ConversationPersistence {
    store: Arc<dyn PersistentStore>,
}

impl ConversationPersistence {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<dyn PersistentStore> {
        &self.store
    }

    pub async fn load(&self, scope: &Scope) -> Result<Option<Conversation>> {
        match self.store.get(&scope.record_key()).await {
            Ok(Some(record)) => return decode(scope, record).map(Some),
            Ok(None) => {}
            Err(StorageError::Decode { reason, .. }) => {
                return Err(PersistenceError::Corrupt {
                    scope: scope.to_string(),
                    reason,
                })
            }
            Err(error) => return Err(error.into()),
        }

        let legacy = match self.store.get(&scope.legacy_key()).await {
            Ok(Some(legacy)) => legacy,
            Ok(None) => return Ok(None),
            Err(StorageError::Decode { reason, .. }) => {
                return Ok(skip_legacy(scope, MigrationError(reason)));
            }
            Err(error) => return Err(error.into()),
        };

        let migrated = match migrate_record(legacy) {
            Ok(migrated) => migrated,
            Err(error) => return Ok(skip_legacy(scope, error)),
        };

        let conversation = decode(scope, migrated.clone())?;
        self.store.set(&scope.record_key(), migrated).await?;
        log::info!(
            "[{}] Migrated legacy record into conversation {}",
            scope,
            conversation.id
        );
        Ok(Some(conversation))
    }

    pub async fn save(&self, scope: &Scope, conversation: &Conversation) -> Result<()> {
        let record = serde_json::to_value(conversation)?;
        self.store.set(&scope.record_key(), record).await?;
        log::debug!(
            "[{}] Saved conversation {} ({} branch(es))",
            scope,
            conversation.id,
            conversation.branches.len()
        );
        Ok(())
    }

    /// Remove the scope's conversation in both shapes, so a later load does
    /// not resurrect it from the legacy record.
    pub async fn delete(&self, scope: &Scope) -> Result<bool> {
        let removed_current = self.store.remove(&scope.record_key()).await?;
        let removed_legacy = self.store.remove(&scope.legacy_key()).await?;
        let removed = removed_current || removed_legacy;
        if removed {
            log::info!("[{}] Deleted conversation", scope);
        }
        Ok(removed)
    }

    /// Scopes with a stored conversation in either shape.
    pub async fn list_scopes(&self) -> Result<Vec<Scope>> {
        let mut scopes = Vec::new();
        for prefix in [RECORD_PREFIX, LEGACY_PREFIX] {
            for key in self.store.keys(prefix).await? {
                let Some(fragment) = key.strip_prefix(prefix) else {
                    continue;
                };
                match fragment.parse::<Scope>() {
                    Ok(scope) => scopes.push(scope),
                    Err(error) => log::debug!("Ignoring key {}: {}", key, error),
                }
            }
        }
        scopes.sort();
        scopes.dedup();
        Ok(scopes)
    }
}

/// The legacy record stays where it is for manual recovery.
fn skip_legacy(scope: &Scope, MigrationError(reason): MigrationError) -> Option<Conversation> {
    let error = PersistenceError::Migration {
        scope: scope.to_string(),
        reason,
    };
    log::warn!("{}; treating scope as empty", error);
    None
}

fn decode(scope: &Scope, record: Value) -> Result<Conversation> {
    let corrupt = |reason: String| PersistenceError::Corrupt {
        scope: scope.to_string(),
        reason,
    };

    if detect_shape(&record) != RecordShape::Current {
        return Err(corrupt(format!(
            "expected a conversation object, found {}",
            json_kind(&record)
        )));
    }

    let conversation: Conversation =
        serde_json::from_value(record).map_err(|error| corrupt(error.to_string()))?;
    branch::validate(&conversation).map_err(|error| corrupt(error.to_string()))?;
    Ok(conversation)
}
