//! Error registry and crate error type.
//!
//! # Responsibilities
//! - Fixed catalog of sentinel failures compared by kind, never by text
//! - One registry accessor shared by reference for the whole process
//! - Crate-wide `Error` that carries sentinels next to I/O, TLS and handler failures
//!
//! # Design Decisions
//! - Sentinels are a `Copy` enum; equality is enum equality
//! - Errors captured by the lifecycle are shared as `Arc<Error>` so every waiter
//!   observes the same value

use std::sync::Arc;
use thiserror::Error;

use crate::net::listener::ListenerClosed;

/// Boxed error returned by caller-supplied handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Error value shared between the lifecycle controller and its callers.
pub type SharedError = Arc<Error>;

/// Result alias for operations of this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Sentinel failures of the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Error)]
pub enum Sentinel {
    /// Start requested while the instance is already running.
    #[error("server is already running")]
    AlreadyRunning,

    /// A start-with-configuration call received no configuration.
    #[error("server configuration is missing")]
    NoConfiguration,

    /// `LISTEN_PID` is missing, not numeric, or names another process.
    #[error("environment variable LISTEN_PID is empty or contains an invalid value")]
    ListenSystemdPid,

    /// `LISTEN_FDS` is missing or not numeric.
    #[error("environment variable LISTEN_FDS is empty or contains an invalid value")]
    ListenSystemdFds,

    /// A named inherited socket was requested but no such name was declared.
    #[error("inherited socket with the requested name was not found")]
    ListenSystemdNotFound,

    /// `LISTEN_FDNAMES` length disagrees with `LISTEN_FDS`.
    #[error("number of LISTEN_FDNAMES entries does not match LISTEN_FDS")]
    ListenSystemdQuantityNotMatch,

    /// A TLS operation was requested without a TLS configuration.
    #[error("TLS configuration is missing")]
    TlsIsNil,

    /// Stream serve invoked without a stream handler.
    #[error("stream handler is not set")]
    ServerHandlerIsNotSet,

    /// Datagram serve invoked without a datagram handler.
    #[error("datagram handler is not set")]
    ServerHandlerUdpIsNotSet,
}

/// Registry of sentinel failures.
///
/// There is exactly one instance, obtained through [`errors`].
#[derive(Debug)]
pub struct Errors {
    _private: (),
}

static REGISTRY: Errors = Errors { _private: () };

/// The process-wide error registry.
pub fn errors() -> &'static Errors {
    &REGISTRY
}

impl Errors {
    pub fn already_running(&self) -> Sentinel {
        Sentinel::AlreadyRunning
    }

    pub fn no_configuration(&self) -> Sentinel {
        Sentinel::NoConfiguration
    }

    pub fn listen_systemd_pid(&self) -> Sentinel {
        Sentinel::ListenSystemdPid
    }

    pub fn listen_systemd_fds(&self) -> Sentinel {
        Sentinel::ListenSystemdFds
    }

    pub fn listen_systemd_not_found(&self) -> Sentinel {
        Sentinel::ListenSystemdNotFound
    }

    pub fn listen_systemd_quantity_not_match(&self) -> Sentinel {
        Sentinel::ListenSystemdQuantityNotMatch
    }

    pub fn tls_is_nil(&self) -> Sentinel {
        Sentinel::TlsIsNil
    }

    pub fn server_handler_is_not_set(&self) -> Sentinel {
        Sentinel::ServerHandlerIsNotSet
    }

    pub fn server_handler_udp_is_not_set(&self) -> Sentinel {
        Sentinel::ServerHandlerUdpIsNotSet
    }

    /// All catalog entries, in declaration order.
    pub fn all(&self) -> [Sentinel; 9] {
        [
            Sentinel::AlreadyRunning,
            Sentinel::NoConfiguration,
            Sentinel::ListenSystemdPid,
            Sentinel::ListenSystemdFds,
            Sentinel::ListenSystemdNotFound,
            Sentinel::ListenSystemdQuantityNotMatch,
            Sentinel::TlsIsNil,
            Sentinel::ServerHandlerIsNotSet,
            Sentinel::ServerHandlerUdpIsNotSet,
        ]
    }
}

/// Errors produced by the runtime.
#[derive(Debug, Error)]
pub enum Error {
    /// One of the registry failures.
    #[error(transparent)]
    Sentinel(#[from] Sentinel),

    /// Address could not be split or its port resolved.
    #[error("invalid address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Socket or file operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TLS material was rejected.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// The handler returned an error.
    #[error("handler failed: {0}")]
    Handler(#[source] BoxError),

    /// The handler panicked; the panic was contained at the accept-loop boundary.
    #[error("handler panicked: {message}\n{trace}")]
    Panic { message: String, trace: String },

    /// The facility is not available on this platform.
    #[error("not supported on this platform: {0}")]
    Unsupported(&'static str),

    /// A start or run was dropped before it completed, e.g. with its runtime.
    #[error("cancelled: {0}")]
    Cancelled(&'static str),
}

impl Error {
    /// The sentinel kind of this error, if it is one.
    pub fn sentinel(&self) -> Option<Sentinel> {
        match self {
            Error::Sentinel(kind) => Some(*kind),
            _ => None,
        }
    }

    /// Check whether this error is the given sentinel.
    pub fn is(&self, kind: Sentinel) -> bool {
        self.sentinel() == Some(kind)
    }

    /// Whether the error was caused by closing the listener the handler was serving.
    pub fn is_listener_closed(&self) -> bool {
        match self {
            Error::Io(e) => crate::net::listener::is_listener_closed(e),
            Error::Handler(e) => chain_has_listener_closed(e.as_ref()),
            _ => false,
        }
    }
}

impl PartialEq<Sentinel> for Error {
    fn eq(&self, other: &Sentinel) -> bool {
        self.is(*other)
    }
}

fn chain_has_listener_closed(err: &(dyn std::error::Error + 'static)) -> bool {
    std::iter::successors(Some(err), |e| e.source()).any(|e| {
        e.is::<ListenerClosed>()
            || e
                .downcast_ref::<std::io::Error>()
                .is_some_and(crate::net::listener::is_listener_closed)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_is_a_singleton() {
        assert!(std::ptr::eq(errors(), errors()));
        assert_eq!(errors().all().len(), 9);
    }

    #[test]
    fn sentinels_compare_by_kind() {
        let err = Error::from(errors().already_running());
        assert!(err.is(Sentinel::AlreadyRunning));
        assert!(err == Sentinel::AlreadyRunning);
        assert!(!err.is(Sentinel::NoConfiguration));

        let io = Error::Io(std::io::Error::other("server is already running"));
        assert!(!io.is(Sentinel::AlreadyRunning));
    }

    #[test]
    fn sentinel_messages_are_stable() {
        assert_eq!(
            errors().already_running().to_string(),
            "server is already running"
        );
        assert!(errors().listen_systemd_pid().to_string().contains("LISTEN_PID"));
        assert!(errors().listen_systemd_fds().to_string().contains("LISTEN_FDS"));
        assert_eq!(
            Error::from(Sentinel::TlsIsNil).to_string(),
            Sentinel::TlsIsNil.to_string()
        );
    }

    #[test]
    fn handler_error_with_closed_listener_in_chain() {
        let closed = std::io::Error::new(std::io::ErrorKind::NotConnected, ListenerClosed);
        let err = Error::Handler(Box::new(closed));
        assert!(err.is_listener_closed());

        let other = Error::Handler("boom".into());
        assert!(!other.is_listener_closed());
    }
}
