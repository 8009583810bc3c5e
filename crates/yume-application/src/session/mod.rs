//! Per-session state and its lifecycle.
//!
//! A [`SessionContext`] aggregates everything one conversation owns: the
//! session entity, token tracker, process slot, outbound batcher, debouncer
//! and title task. The [`SessionRegistry`] maps ids to contexts and evicts
//! idle ones.

mod context;
mod pump;
mod registry;

pub use context::SessionContext;
pub use registry::SessionRegistry;
