use workbench_core::{Conversation, DocumentContext, Scope, WorkbenchConfig};

/// Per-session settings passed along with every completion request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionConfig {
    pub enable_evaluation: bool,
    /// Document the conversation is about; also used to backfill citations.
    pub document: DocumentContext,
    /// Grounding text sent as the request `context`.
    pub context: Option<String>,
}

impl SessionConfig {
    pub fn from_workbench(config: &WorkbenchConfig, scope: &Scope) -> Self {
        Self {
            enable_evaluation: config.enable_evaluation,
            document: scope
                .doc_id()
                .map(DocumentContext::for_document)
                .unwrap_or_default(),
            context: None,
        }
    }

    pub fn with_document(mut self, document: DocumentContext) -> Self {
        self.document = document;
        self
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Fill document ids the conversation record knows about but the
    /// configuration does not.
    pub(crate) fn adopt_conversation(&mut self, conversation: &Conversation) {
        if self.document.doc_id.is_none() {
            self.document.doc_id = conversation.doc_id.clone();
        }
        if self.document.knowledge_base_id.is_none() {
            self.document.knowledge_base_id = conversation.knowledge_base_id.clone();
        }
    }
}
