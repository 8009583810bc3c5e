//! Launchers for locally installed assistant CLIs.

pub mod claude_code;
