pub mod handler;

pub use handler::{consume_frame_stream, run_completion};
