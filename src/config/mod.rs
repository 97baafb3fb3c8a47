//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! "host:port" string ──→ resolve.rs (split, service lookup, host lookup)
//! config file (TOML/JSON) ──→ loader.rs (parse & deserialize)
//!                                   │
//!                                   ▼
//!                        resolve::apply_defaults
//!                                   │
//!                                   ▼
//!                    Configuration (owned by the server, copied out on read)
//! ```
//!
//! # Design Decisions
//! - All fields have defaults to allow minimal configs
//! - Inconsistent values are repaired, never rejected; only unparsable ports fail

pub mod loader;
pub mod resolve;
pub mod schema;

pub use loader::{load_config, ConfigError};
pub use resolve::{apply_defaults, parse_address, parse_file_mode_with_default};
pub use schema::{Configuration, Mode, DEFAULT_SOCKET_MODE};
