use std::pin::Pin;

use async_trait::async_trait;
use futures::{stream, Stream};
use serde::Serialize;
use serde_json::{json, Value};
use workbench_core::Message;

use crate::error::{Result, TransportError};
use crate::frame::Frame;

pub type FrameStream = Pin<Box<dyn Stream<Item = std::result::Result<Frame, TransportError>> + Send>>;

/// What the completion service receives for one turn.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionRequest {
    /// Visible history followed by the new user message.
    pub messages: Vec<Message>,
    /// Extra grounding text, such as the current page of the document.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub knowledge_base_id: Option<String>,
    pub enable_evaluation: bool,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    pub fn with_document(mut self, doc_id: Option<String>, knowledge_base_id: Option<String>) -> Self {
        self.doc_id = doc_id;
        self.knowledge_base_id = knowledge_base_id;
        self
    }

    pub fn with_evaluation(mut self, enable_evaluation: bool) -> Self {
        self.enable_evaluation = enable_evaluation;
        self
    }

    /// Wire body. Messages are reduced to `{role, content}`.
    pub fn to_body(&self) -> Value {
        let messages: Vec<Value> = self
            .messages
            .iter()
            .map(|message| {
                json!({
                    "role": message.role.as_str(),
                    "content": message.content,
                })
            })
            .collect();

        let mut body = json!({
            "messages": messages,
            "enableEvaluation": self.enable_evaluation,
        });
        if let Some(context) = &self.context {
            body["context"] = json!(context);
        }
        if let Some(doc_id) = &self.doc_id {
            body["docId"] = json!(doc_id);
        }
        if let Some(knowledge_base_id) = &self.knowledge_base_id {
            body["knowledgeBaseId"] = json!(knowledge_base_id);
        }
        body
    }
}

/// Remote model completion service.
#[async_trait]
pub trait CompletionService: Send + Sync {
    /// Open a stream for one answer.
    ///
    /// A service that rejects the request before streaming starts returns a
    /// stream holding a single [`Frame::Error`]. `Err` is reserved for
    /// failing to reach the service at all.
    async fn open_stream(&self, request: &CompletionRequest) -> Result<FrameStream>;
}

/// Stream holding a single synthesized error frame.
pub fn error_stream(message: impl Into<String>) -> FrameStream {
    let frame = Frame::error(message);
    Box::pin(stream::iter(vec![Ok(frame)]))
}
