//! Listener construction from a canonical configuration.
//!
//! # Responsibilities
//! - Bind TCP and UDP sockets, honouring the address family of the mode
//! - Create unix-domain sockets with the configured permission bits
//! - Delegate `systemd` mode to socket activation
//! - Apply TLS to stream listeners

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;

use tokio::net::{TcpListener, UdpSocket};

use crate::config::schema::Family;
use crate::config::{parse_file_mode_with_default, Configuration, Mode};
use crate::error::{Error, Result, Sentinel};
use crate::net::activation::{Activation, Platform, SystemPlatform};
use crate::net::listener::{DatagramEndpoint, Listener, ProxyProtocol, StreamListener};
use crate::net::tls::{self, default_tls_config, TlsConfig};

/// Builds listeners and endpoints for every supported mode.
#[derive(Clone)]
pub struct ListenerFactory {
    platform: Arc<dyn Platform>,
}

impl ListenerFactory {
    pub fn new() -> Self {
        Self::with_platform(Arc::new(SystemPlatform))
    }

    /// Use a custom platform for socket activation.
    pub fn with_platform(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    pub fn activation(&self) -> Activation {
        Activation::new(Arc::clone(&self.platform))
    }

    /// Bind the listener or endpoint described by `conf`.
    pub async fn new_listener(&self, conf: &Configuration) -> Result<Listener> {
        let listener = match conf.mode {
            Mode::Tcp | Mode::Tcp4 | Mode::Tcp6 => {
                let addr = bind_addr(conf).await?;
                Listener::Stream(TcpListener::bind(addr).await?.into())
            }
            Mode::Udp | Mode::Udp4 | Mode::Udp6 => {
                let addr = bind_addr(conf).await?;
                Listener::Datagram(DatagramEndpoint::from(UdpSocket::bind(addr).await?))
            }
            Mode::Unix | Mode::UnixPacket => Listener::Stream(bind_unix(conf)?),
            Mode::Systemd => self.activation().select(&conf.socket)?,
        };

        let listener = match listener {
            Listener::Stream(l) if conf.proxy_protocol => Listener::Stream(l.with_proxy_protocol(ProxyProtocol {
                read_header_timeout: conf.proxy_protocol_read_header_timeout(),
            })),
            other => other,
        };

        tracing::info!(
            address = %listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            mode = %conf.mode,
            "Listener bound"
        );
        Ok(listener)
    }

    /// Like [`new_listener`](Self::new_listener), with TLS on stream listeners.
    ///
    /// Without an explicit `tls`, the configuration's certificate and key
    /// files are loaded; with neither, fails with `TlsIsNil`.
    pub async fn new_listener_tls(&self, conf: &Configuration, tls: Option<TlsConfig>) -> Result<Listener> {
        let tls = match tls {
            Some(tls) => tls,
            None if conf.has_tls_files() => {
                default_tls_config(&conf.tls_public_key_pem, &conf.tls_private_key_pem)?
            }
            None => return Err(Sentinel::TlsIsNil.into()),
        };

        match self.new_listener(conf).await? {
            Listener::Stream(l) => Ok(Listener::Stream(tls::wrap(l, Some(tls))?)),
            datagram => Ok(datagram),
        }
    }
}

impl Default for ListenerFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve the bind address. An empty host means every interface of the
/// mode's family.
async fn bind_addr(conf: &Configuration) -> Result<SocketAddr> {
    let family = conf.mode.family();
    let host = conf.host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        let ip = match family {
            Family::V6 => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
            Family::Any | Family::V4 => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        return Ok(SocketAddr::new(ip, conf.port));
    }

    let mut candidates = tokio::net::lookup_host((host, conf.port)).await?;
    candidates
        .find(|addr| match family {
            Family::Any => true,
            Family::V4 => addr.is_ipv4(),
            Family::V6 => addr.is_ipv6(),
        })
        .ok_or_else(|| Error::InvalidAddress {
            address: conf.host_port(),
            reason: format!("no {} address for host", conf.mode),
        })
}

#[cfg(unix)]
fn bind_unix(conf: &Configuration) -> Result<StreamListener> {
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    let path = Path::new(&conf.socket);
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Removed stale socket file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let listener = tokio::net::UnixListener::bind(path)?;
    let mode = parse_file_mode_with_default(&conf.socket_mode);
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)) {
        drop(listener);
        let _ = std::fs::remove_file(path);
        return Err(e.into());
    }

    Ok(StreamListener::from(listener).with_socket_path(path))
}

#[cfg(not(unix))]
fn bind_unix(_conf: &Configuration) -> Result<StreamListener> {
    Err(Error::Unsupported("unix domain sockets"))
}
