//! Completion-based I/O.
//!
//! Receives and sends run on pooled [`engine::Engine`]s. Parameter and
//! shutdown requests use one-off device-control round trips instead.

pub mod cancel;
pub mod cell;
pub mod control;
pub mod engine;
pub mod pool;
pub mod slot;
