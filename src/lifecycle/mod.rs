//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Start (server.rs):
//!     reserve → resolve config → bind listener → spawn run task
//!
//! Run task:
//!     handler(listener) inside fault.rs containment
//!     → outcome (listener-closed errors count as success)
//!     → remove socket file → running = false → notify waiters
//!
//! Stop (server.rs):
//!     close listener → wait for run task outcome
//! ```
//!
//! # Design Decisions
//! - One run at a time per server; concurrent starts are rejected, not queued
//! - Cancellation is closing the listener; there is no cancellation token
//! - No timeout on stop: a handler that ignores the closed listener blocks it

mod fault;
pub mod handler;
pub mod server;

pub use handler::{DatagramHandler, HandlerResult, StreamHandler};
pub use server::Server;
