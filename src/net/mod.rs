//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Configuration
//!     → factory.rs (dispatch on mode)
//!         tcp/udp      → bind host:port
//!         unix         → bind path, chmod socket file
//!         systemd      → activation.rs (inherited descriptors)
//!     → tls.rs (optional, stream listeners only)
//!     → listener.rs (StreamListener | DatagramEndpoint)
//!     → handed to the server handler
//! ```
//!
//! # Design Decisions
//! - Stream and datagram transports stay distinct types; `Listener` is the
//!   only place they meet
//! - Closing is observable by the handler as a recognisable accept error
//! - TLS is optional and handled transparently

pub mod activation;
pub mod factory;
pub mod listener;
pub mod tls;

pub use activation::{Activation, InheritedFile, ListenEnv, Platform, SystemPlatform};
pub use factory::ListenerFactory;
pub use listener::{
    is_listener_closed, Connection, DatagramEndpoint, Listener, ListenerCloser, ListenerClosed,
    LocalAddr, PeerAddr, ProxyProtocol, StreamListener,
};
pub use tls::{default_tls_config, TlsConfig};
