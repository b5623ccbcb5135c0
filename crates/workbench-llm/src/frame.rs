use workbench_core::{Citation, EvaluationResult};

/// One parsed unit of the streaming protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Content { delta: String },
    Citations { citations: Vec<Citation> },
    Evaluation { evaluation: EvaluationResult },
    Error { message: String },
    Done,
}

impl Frame {
    pub fn content(delta: impl Into<String>) -> Self {
        Frame::Content {
            delta: delta.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Frame::Error {
            message: message.into(),
        }
    }

    /// `Done` and `Error` end the stream.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Frame::Done | Frame::Error { .. })
    }
}
