//! Frame-by-frame construction of one assistant message.
//!
//! [`ResponseAssembler::apply`] is a pure transition: it updates the working
//! message and reports what happened. Notifying observers is left to the
//! stream driver.

use std::fmt;
use std::sync::Arc;

use workbench_core::citation;
use workbench_core::{CitationResolver, DocumentContext, Message};
use workbench_llm::{Frame, TransportError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    /// The model sent an error frame.
    Model(String),
    Transport(TransportError),
    Cancelled,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::Model(message) => write!(f, "model error: {message}"),
            FailureReason::Transport(error) => write!(f, "transport error: {error}"),
            FailureReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AssemblerState {
    Idle,
    Streaming,
    Completed,
    Failed(FailureReason),
}

impl AssemblerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, AssemblerState::Completed | AssemblerState::Failed(_))
    }
}

/// Result of feeding one frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    /// The working message changed; observers should see a snapshot.
    Updated,
    Completed,
    Failed(FailureReason),
    /// The assembler had already finished.
    Ignored,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamOutcome {
    Completed(Message),
    Failed {
        partial: Message,
        reason: FailureReason,
    },
}

impl StreamOutcome {
    pub fn message(&self) -> &Message {
        match self {
            StreamOutcome::Completed(message) => message,
            StreamOutcome::Failed { partial, .. } => partial,
        }
    }

    pub fn into_message(self) -> Message {
        match self {
            StreamOutcome::Completed(message) => message,
            StreamOutcome::Failed { partial, .. } => partial,
        }
    }
}

pub struct ResponseAssembler {
    state: AssemblerState,
    message: Message,
    document: DocumentContext,
    resolver: Option<Arc<dyn CitationResolver>>,
}

impl fmt::Debug for ResponseAssembler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseAssembler")
            .field("state", &self.state)
            .field("message", &self.message)
            .field("document", &self.document)
            .finish_non_exhaustive()
    }
}

impl Default for ResponseAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseAssembler {
    pub fn new() -> Self {
        Self {
            state: AssemblerState::Idle,
            message: Message::assistant(""),
            document: DocumentContext::default(),
            resolver: None,
        }
    }

    /// Document used to backfill citations that arrive without one.
    pub fn with_document(mut self, document: DocumentContext) -> Self {
        self.document = document;
        self
    }

    pub fn with_resolver(mut self, resolver: Option<Arc<dyn CitationResolver>>) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn state(&self) -> &AssemblerState {
        &self.state
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn apply(&mut self, frame: Frame) -> Transition {
        if self.state.is_terminal() {
            log::debug!("Ignoring frame after stream finished: {:?}", frame);
            return Transition::Ignored;
        }
        self.state = AssemblerState::Streaming;

        match frame {
            Frame::Content { delta } => {
                self.message.content.push_str(&delta);
                Transition::Updated
            }
            Frame::Citations { citations } => {
                self.message.citations = citation::merge_with_context(
                    &self.message.citations,
                    &citations,
                    &self.document,
                    self.resolver.as_deref(),
                );
                Transition::Updated
            }
            Frame::Evaluation { evaluation } => {
                self.message.set_evaluation(evaluation);
                Transition::Updated
            }
            Frame::Done => {
                self.state = AssemblerState::Completed;
                Transition::Completed
            }
            Frame::Error { message } => self.fail(FailureReason::Model(message)),
        }
    }

    /// Move to `Failed` for a reason that did not arrive as a frame.
    pub fn fail(&mut self, reason: FailureReason) -> Transition {
        if self.state.is_terminal() {
            return Transition::Ignored;
        }
        log::warn!("Response failed: {}", reason);
        self.state = AssemblerState::Failed(reason.clone());
        Transition::Failed(reason)
    }

    /// The transport closed. Without a `Done` frame the answer is cut short,
    /// so the message fails as a transport error and keeps what arrived.
    pub fn end_of_stream(&mut self) -> Transition {
        self.fail(FailureReason::Transport(TransportError::Stream(
            "stream closed before [DONE]".to_string(),
        )))
    }

    /// Consume the assembler. A stream that never reached a terminal state
    /// is reported as cancelled.
    pub fn into_outcome(self) -> StreamOutcome {
        match self.state {
            AssemblerState::Completed => StreamOutcome::Completed(self.message),
            AssemblerState::Failed(reason) => StreamOutcome::Failed {
                partial: self.message,
                reason,
            },
            AssemblerState::Idle | AssemblerState::Streaming => StreamOutcome::Failed {
                partial: self.message,
                reason: FailureReason::Cancelled,
            },
        }
    }
}
