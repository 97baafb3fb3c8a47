//! Address parsing and configuration defaulting.
//!
//! # Responsibilities
//! - Split `host:port`, resolving service names (":http") to port numbers
//! - Canonicalise the host through the system resolver when possible
//! - Fill defaults and repair inconsistent values
//!
//! # Design Decisions
//! - Pure apart from name lookups; nothing is bound here
//! - Host lookup failures are silent, the literal host is kept

use std::net::ToSocketAddrs;

use crate::config::schema::{join_host_port, Configuration, Mode, DEFAULT_SOCKET_MODE};
use crate::error::{Error, Result};

/// Well-known services used when `/etc/services` has no entry.
const BUILTIN_SERVICES: &[(&str, u16)] = &[
    ("domain", 53),
    ("ftp", 21),
    ("ftps", 990),
    ("gopher", 70),
    ("http", 80),
    ("https", 443),
    ("imap2", 143),
    ("imap3", 220),
    ("imaps", 993),
    ("pop3", 110),
    ("pop3s", 995),
    ("smtp", 25),
    ("ssh", 22),
    ("submissions", 465),
    ("telnet", 23),
];

const SERVICES_FILE: &str = "/etc/services";

/// Parse an address string into a defaulted configuration.
///
/// An input that cannot be split into host and port is taken as a bare host.
pub fn parse_address(address: &str, mode: &str) -> Result<Configuration> {
    let address = address.trim();
    let mut conf = Configuration {
        mode: Mode::parse_lenient(mode),
        ..Default::default()
    };

    match split_host_port(address) {
        Some((host, port)) => {
            conf.port = lookup_port(port).map_err(|reason| Error::InvalidAddress {
                address: address.to_string(),
                reason,
            })?;
            conf.host = lookup_host(host).unwrap_or_else(|| host.to_string());
        }
        None => conf.host = address.to_string(),
    }

    apply_defaults(&mut conf);
    Ok(conf)
}

/// Fill defaults and repair inconsistent values in place.
pub fn apply_defaults(conf: &mut Configuration) {
    if conf.socket_mode.is_empty() {
        conf.socket_mode = format!("{:04o}", DEFAULT_SOCKET_MODE);
    }
    if conf.mode.is_unix() && conf.socket.is_empty() {
        conf.mode = Mode::Tcp;
    }
    if conf.address.is_empty() && (conf.mode.is_tcp() || conf.mode.is_udp()) {
        conf.address = if conf.port == 0 {
            conf.host.clone()
        } else {
            join_host_port(&conf.host, conf.port)
        };
    }
}

/// Octal permission string to mode bits, falling back to `0666`.
pub fn parse_file_mode_with_default(mode: &str) -> u32 {
    let digits = mode.trim();
    let digits = digits.strip_prefix("0o").unwrap_or(digits);
    match u32::from_str_radix(digits, 8) {
        Ok(bits) => bits,
        Err(_) => DEFAULT_SOCKET_MODE,
    }
}

/// Split `host:port`, accepting bracketed IPv6 hosts. Returns `None` when
/// the input has no port segment.
fn split_host_port(address: &str) -> Option<(&str, &str)> {
    if let Some(rest) = address.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        let port = tail.strip_prefix(':')?;
        return Some((host, port));
    }
    let (host, port) = address.rsplit_once(':')?;
    if host.contains(':') {
        // Unbracketed IPv6 literal.
        return None;
    }
    Some((host, port))
}

fn lookup_port(service: &str) -> std::result::Result<u16, String> {
    if service.is_empty() {
        return Ok(0);
    }
    if service.bytes().all(|b| b.is_ascii_digit()) {
        return service
            .parse::<u16>()
            .map_err(|_| format!("invalid port {service:?}"));
    }
    let name = service.to_ascii_lowercase();
    services_file_port(&name)
        .or_else(|| {
            BUILTIN_SERVICES
                .iter()
                .find(|(known, _)| *known == name)
                .map(|(_, port)| *port)
        })
        .ok_or_else(|| format!("unknown port {service:?}"))
}

/// Look up a tcp service in `/etc/services`.
fn services_file_port(name: &str) -> Option<u16> {
    let content = std::fs::read_to_string(SERVICES_FILE).ok()?;
    content.lines().find_map(|line| {
        let line = line.split('#').next().unwrap_or_default();
        let mut fields = line.split_whitespace();
        let service = fields.next()?;
        let (port, proto) = fields.next()?.split_once('/')?;
        if proto != "tcp" {
            return None;
        }
        let aliases_match = fields.any(|alias| alias == name);
        if service == name || aliases_match {
            port.parse().ok()
        } else {
            None
        }
    })
}

fn lookup_host(host: &str) -> Option<String> {
    if host.is_empty() {
        return None;
    }
    (host, 0u16)
        .to_socket_addrs()
        .ok()?
        .next()
        .map(|addr| addr.ip().to_string())
}
