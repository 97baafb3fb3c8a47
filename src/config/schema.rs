//! Configuration schema definitions.
//!
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Socket file permissions applied when none are configured.
pub const DEFAULT_SOCKET_MODE: u32 = 0o666;

/// Transport selection.
///
/// Parsing is lenient: input is lower-cased, `socket` is an alias of `unix`,
/// and anything unrecognised falls back to `tcp`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(from = "String", into = "String")]
pub enum Mode {
    #[default]
    Tcp,
    Tcp4,
    Tcp6,
    Udp,
    Udp4,
    Udp6,
    Unix,
    UnixPacket,
    Systemd,
}

impl Mode {
    /// Resolve a raw mode string to a canonical member.
    pub fn parse_lenient(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "tcp4" => Mode::Tcp4,
            "tcp6" => Mode::Tcp6,
            "udp" => Mode::Udp,
            "udp4" => Mode::Udp4,
            "udp6" => Mode::Udp6,
            "unix" | "socket" => Mode::Unix,
            "unixpacket" => Mode::UnixPacket,
            "systemd" => Mode::Systemd,
            _ => Mode::Tcp,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Tcp => "tcp",
            Mode::Tcp4 => "tcp4",
            Mode::Tcp6 => "tcp6",
            Mode::Udp => "udp",
            Mode::Udp4 => "udp4",
            Mode::Udp6 => "udp6",
            Mode::Unix => "unix",
            Mode::UnixPacket => "unixpacket",
            Mode::Systemd => "systemd",
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Mode::Tcp | Mode::Tcp4 | Mode::Tcp6)
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, Mode::Udp | Mode::Udp4 | Mode::Udp6)
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Mode::Unix | Mode::UnixPacket)
    }

    /// Address family restriction implied by the mode.
    pub(crate) fn family(&self) -> Family {
        match self {
            Mode::Tcp4 | Mode::Udp4 => Family::V4,
            Mode::Tcp6 | Mode::Udp6 => Family::V6,
            _ => Family::Any,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Family {
    Any,
    V4,
    V6,
}

impl From<String> for Mode {
    fn from(raw: String) -> Self {
        Mode::parse_lenient(&raw)
    }
}

impl From<&str> for Mode {
    fn from(raw: &str) -> Self {
        Mode::parse_lenient(raw)
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.as_str().to_string()
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical server parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct Configuration {
    /// Stable instance identifier; generated per run when empty.
    pub id: String,

    /// Externally visible address; derived from host and port when empty.
    pub address: String,

    /// Bind host. Empty binds on all interfaces.
    pub host: String,

    /// Bind port.
    pub port: u16,

    /// Unix socket path, or the inherited socket name in systemd mode.
    pub socket: String,

    /// Octal permission bits of the unix socket file (e.g. "0666").
    pub socket_mode: String,

    /// Transport selection.
    pub mode: Mode,

    /// PEM certificate chain path.
    pub tls_public_key_pem: String,

    /// PEM private key path.
    pub tls_private_key_pem: String,

    /// Enable PROXY-protocol header consumption (performed by the handler).
    pub proxy_protocol: bool,

    /// Bound on reading the PROXY-protocol header, 0 means no timeout.
    pub proxy_protocol_read_header_timeout_ms: u64,
}

impl Configuration {
    /// Render the bind target of this configuration.
    ///
    /// ```text
    /// tcp/udp family  -> "host:port"
    /// unix family     -> "unix:<path>"
    /// systemd         -> "systemd"
    /// ```
    pub fn host_port(&self) -> String {
        match self.mode {
            Mode::Unix | Mode::UnixPacket => format!("unix:{}", self.socket),
            Mode::Systemd => Mode::Systemd.as_str().to_string(),
            _ => join_host_port(&self.host, self.port),
        }
    }

    /// Header read timeout, `None` when unbounded.
    pub fn proxy_protocol_read_header_timeout(&self) -> Option<Duration> {
        match self.proxy_protocol_read_header_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Whether a certificate/key pair is configured.
    pub fn has_tls_files(&self) -> bool {
        !self.tls_public_key_pem.is_empty() && !self.tls_private_key_pem.is_empty()
    }
}

/// Join host and port, bracketing IPv6 literals.
pub(crate) fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
