//! Observability subsystem.
//!
//! Every component emits `tracing` events with structured fields
//! (`address = %addr`, `id = %id`); `logging.rs` turns them into output.

pub mod logging;
