use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::message::Message;

/// An alternate continuation diverging from a shared prefix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub branch_id: String,
    /// Monotonic per fork point, starting at 1.
    pub version: u32,
    /// Length of the shared prefix this branch continues from.
    pub branch_point: usize,
    /// Branch whose continuation this one forks from; `None` forks from
    /// `baseMessages`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_branch_id: Option<String>,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl Branch {
    pub fn new(
        version: u32,
        branch_point: usize,
        parent_branch_id: Option<String>,
        messages: Vec<Message>,
    ) -> Self {
        Self {
            branch_id: Uuid::new_v4().to_string(),
            version,
            branch_point,
            parent_branch_id,
            messages,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    #[serde(default = "generate_id")]
    pub id: String,
    #[serde(default)]
    pub base_messages: Vec<Message>,
    #[serde(default)]
    pub branches: Vec<Branch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_branch_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub knowledge_base_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn generate_id() -> String {
    Uuid::new_v4().to_string()
}

impl Default for Conversation {
    fn default() -> Self {
        Self::new()
    }
}

impl Conversation {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            base_messages: Vec::new(),
            branches: Vec::new(),
            current_branch_id: None,
            doc_id: None,
            knowledge_base_id: None,
            title: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_document(mut self, doc_id: impl Into<String>) -> Self {
        self.doc_id = Some(doc_id.into());
        self
    }

    pub fn with_knowledge_base(mut self, knowledge_base_id: impl Into<String>) -> Self {
        self.knowledge_base_id = Some(knowledge_base_id.into());
        self
    }

    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn branch(&self, branch_id: &str) -> Option<&Branch> {
        self.branches.iter().find(|b| b.branch_id == branch_id)
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
