//! Incremental decoding of the CLI's `stream-json` output.

mod line_buffer;
mod parser;
mod record;

pub use line_buffer::LineBuffer;
pub use parser::{InitInfo, StreamMessage, StreamParser, TurnOutcome, is_resume_failure};
