pub mod error;
pub mod frame;
pub mod http;
pub mod parser;
pub mod provider;

pub use error::{ProtocolError, TransportError};
pub use frame::Frame;
pub use http::HttpCompletionService;
pub use parser::{frame_stream, parse_payload, FrameParser};
pub use provider::{error_stream, CompletionRequest, CompletionService, FrameStream};
