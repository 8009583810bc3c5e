//! Interaction layer: talking to the assistant CLI.
//!
//! - `local_agents`: how the CLI is located and launched
//! - `stream`: decoding its newline-delimited JSON output

pub mod local_agents;
pub mod stream;

pub use local_agents::claude_code::{AgentLauncher, ClaudeCliLauncher, LaunchRequest};
pub use stream::{
    InitInfo, LineBuffer, StreamMessage, StreamParser, TurnOutcome, is_resume_failure,
};
