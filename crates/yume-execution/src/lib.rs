//! Execution layer: child processes and outbound delivery.
//!
//! - `supervisor`: one `ProcessSlot` per session; spawn, kill and interrupt
//! - `debouncer`: turns process exits into a stable idle signal
//! - `batcher`: coalesces outbound events into frames
//! - `tracing_layer`: forwards warnings and errors to the UI bridge

pub mod batcher;
pub mod debouncer;
pub mod supervisor;
pub mod tracing_layer;

pub use batcher::OutboundBatcher;
pub use debouncer::StreamingDebouncer;
pub use tracing_layer::{DiagnosticEvent, DiagnosticLayer};
pub use supervisor::{
    InterruptOutcome, ProcessEvent, ProcessEventSink, ProcessSlot, SubmitOutcome,
    SupervisorSettings,
};
