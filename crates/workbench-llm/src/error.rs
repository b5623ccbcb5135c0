use thiserror::Error;

/// A malformed frame. Recovered locally: the frame is skipped and parsing
/// continues.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Line is not valid UTF-8")]
    InvalidUtf8,

    #[error("Payload is not valid JSON: {0}")]
    InvalidJson(String),

    #[error("Unexpected payload shape: {0}")]
    UnexpectedShape(String),

    #[error("Invalid evaluation: {0}")]
    InvalidEvaluation(String),
}

/// Network failure before or during streaming.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Stream interrupted: {0}")]
    Stream(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            TransportError::Timeout
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else if error.is_builder() {
            TransportError::InvalidRequest(error.to_string())
        } else {
            TransportError::Stream(error.to_string())
        }
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
