//! Transport-level server runtime.
//!
//! Runs one caller-supplied handler over a TCP, UDP, unix-domain or
//! socket-activated listener, optionally terminating TLS, with race-free
//! start/stop/wait and containment of handler panics.
//!
//! ```text
//!   Configuration ──▶ net::ListenerFactory ──▶ Listener ──▶ lifecycle::Server
//!   ("host:port",      tcp/udp/unix/systemd     Stream |       runs handler once,
//!    file, struct)     + TLS                    Datagram       stop closes listener
//! ```

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod net;
pub mod observability;

pub use config::{Configuration, Mode};
pub use error::{errors, BoxError, Error, Errors, Result, Sentinel, SharedError};
pub use lifecycle::{DatagramHandler, HandlerResult, Server, StreamHandler};
pub use net::{
    is_listener_closed, Connection, DatagramEndpoint, Listener, ListenerFactory, PeerAddr, StreamListener,
    TlsConfig,
};
