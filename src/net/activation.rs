//! Socket activation: listeners inherited from a supervising process.
//!
//! # Responsibilities
//! - Validate `LISTEN_PID`, `LISTEN_FDS` and `LISTEN_FDNAMES`
//! - Map inherited descriptors (numbered from 3) to named files
//! - Convert inherited descriptors into stream listeners or datagram endpoints
//!
//! # Design Decisions
//! - Everything the OS provides goes through [`Platform`], so the protocol
//!   logic is testable without touching the process environment
//! - Converting a descriptor duplicates it. The inherited descriptor stays
//!   open, so converting the same one twice yields two working listeners
//! - Only descriptors in `3..3 + LISTEN_FDS` are ever converted

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use crate::error::{Result, Sentinel};
use crate::net::listener::{Listener, StreamListener};
use crate::net::tls::{self, TlsConfig};

/// First inherited descriptor; 0-2 are the standard streams.
pub const LISTEN_FDS_START: i32 = 3;

/// Upper bound accepted for `LISTEN_FDS`.
pub const MAX_LISTEN_FDS: usize = 1 << 16;

pub const LISTEN_PID: &str = "LISTEN_PID";
pub const LISTEN_FDS: &str = "LISTEN_FDS";
pub const LISTEN_FDNAMES: &str = "LISTEN_FDNAMES";

/// An inherited descriptor and the name the supervisor gave it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InheritedFile {
    pub fd: i32,
    pub name: String,
}

impl InheritedFile {
    pub fn new(fd: i32, name: impl Into<String>) -> Self {
        Self {
            fd,
            name: name.into(),
        }
    }
}

/// Descriptor count and names recovered from the environment.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ListenEnv {
    pub fds: usize,
    /// Empty when the supervisor declared no names.
    pub names: Vec<String>,
}

/// Operating-system facilities used by socket activation.
pub trait Platform: Send + Sync + 'static {
    fn env_var(&self, key: &str) -> Option<String>;

    fn pid(&self) -> u32;

    fn inherited_file(&self, fd: i32, name: &str) -> InheritedFile {
        InheritedFile::new(fd, name)
    }

    /// Turn an inherited descriptor into a listener.
    ///
    /// The descriptor is duplicated, never taken over; the caller's copy
    /// stays open and valid.
    fn listener(&self, file: InheritedFile) -> io::Result<Listener>;
}

/// The real process environment and descriptor table.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPlatform;

impl Platform for SystemPlatform {
    fn env_var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn pid(&self) -> u32 {
        std::process::id()
    }

    #[cfg(unix)]
    fn listener(&self, file: InheritedFile) -> io::Result<Listener> {
        use socket2::{Domain, Socket, Type};
        use std::os::fd::BorrowedFd;

        if file.fd < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("inherited descriptor {} ({}) is negative", file.fd, file.name),
            ));
        }
        // SAFETY: the borrow lives only for the duplication below. A
        // descriptor that is not open makes the dup fail with EBADF.
        let owned = unsafe { BorrowedFd::borrow_raw(file.fd) }.try_clone_to_owned()?;
        let socket = Socket::from(owned);
        let kind = socket.r#type()?;
        let domain = socket.local_addr()?.domain();

        tracing::debug!(fd = file.fd, name = %file.name, ?kind, ?domain, "Adopting inherited socket");

        if kind == Type::STREAM {
            if domain == Domain::UNIX {
                let listener = std::os::unix::net::UnixListener::from(socket);
                Ok(Listener::Stream(StreamListener::from_unix(listener)?))
            } else {
                let listener = std::net::TcpListener::from(socket);
                Ok(Listener::Stream(StreamListener::from_tcp(listener)?))
            }
        } else if kind == Type::DGRAM && domain != Domain::UNIX {
            let socket = std::net::UdpSocket::from(socket);
            Ok(Listener::Datagram(
                crate::net::listener::DatagramEndpoint::from_udp(socket)?,
            ))
        } else {
            Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("inherited descriptor {} ({}) is not a supported socket", file.fd, file.name),
            ))
        }
    }

    #[cfg(not(unix))]
    fn listener(&self, _file: InheritedFile) -> io::Result<Listener> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "socket activation is not supported on this platform",
        ))
    }
}

/// Socket-activation protocol over a [`Platform`].
#[derive(Clone)]
pub struct Activation {
    platform: Arc<dyn Platform>,
}

impl Activation {
    pub fn new(platform: Arc<dyn Platform>) -> Self {
        Self { platform }
    }

    pub fn system() -> Self {
        Self::new(Arc::new(SystemPlatform))
    }

    /// Read and validate the activation environment.
    ///
    /// Checks run in order: pid, descriptor count, then name count.
    pub fn read_listen_env(&self) -> Result<ListenEnv> {
        let env = self.read_counts()?;
        if !env.names.is_empty() && env.names.len() != env.fds {
            return Err(Sentinel::ListenSystemdQuantityNotMatch.into());
        }
        Ok(env)
    }

    /// Named handles for every inherited descriptor, in descriptor order.
    ///
    /// Fails with `ListenSystemdNotFound` when the supervisor declared no names.
    pub fn load_inherited_files(&self) -> Result<Vec<InheritedFile>> {
        let env = self.read_listen_env()?;
        if env.names.is_empty() {
            return Err(Sentinel::ListenSystemdNotFound.into());
        }
        Ok(env
            .names
            .iter()
            .enumerate()
            .map(|(i, name)| self.platform.inherited_file(fd_at(i), name))
            .collect())
    }

    /// Every inherited descriptor as a listener. Names are ignored, even
    /// when they disagree with the descriptor count.
    pub fn listeners_without_names(&self) -> Result<Vec<Listener>> {
        let env = self.read_counts()?;
        (0..env.fds)
            .map(|i| -> Result<Listener> {
                let name = env.names.get(i).map(String::as_str).unwrap_or_default();
                let file = self.platform.inherited_file(fd_at(i), name);
                self.adopt(&env, file)
            })
            .collect()
    }

    /// Inherited listeners grouped by declared name.
    pub fn listeners_with_names(&self) -> Result<HashMap<String, Vec<Listener>>> {
        let env = self.read_listen_env()?;
        let mut grouped: HashMap<String, Vec<Listener>> = HashMap::new();
        for file in self.load_inherited_files()? {
            let name = file.name.clone();
            let listener = self.adopt(&env, file)?;
            grouped.entry(name).or_default().push(listener);
        }
        Ok(grouped)
    }

    /// [`listeners_without_names`](Self::listeners_without_names) with TLS
    /// applied. Datagram descriptors are rejected with `InvalidInput`.
    pub fn listeners_without_names_tls(&self, tls: Option<TlsConfig>) -> Result<Vec<StreamListener>> {
        let tls = tls.ok_or(Sentinel::TlsIsNil)?;
        self.listeners_without_names()?
            .into_iter()
            .map(|listener| -> Result<StreamListener> {
                tls::wrap(listener.into_stream()?, Some(Arc::clone(&tls)))
            })
            .collect()
    }

    /// [`listeners_with_names`](Self::listeners_with_names) with TLS applied.
    pub fn listeners_with_names_tls(
        &self,
        tls: Option<TlsConfig>,
    ) -> Result<HashMap<String, Vec<StreamListener>>> {
        let tls = tls.ok_or(Sentinel::TlsIsNil)?;
        let mut grouped = HashMap::new();
        for (name, listeners) in self.listeners_with_names()? {
            let wrapped = listeners
                .into_iter()
                .map(|listener| -> Result<StreamListener> {
                    tls::wrap(listener.into_stream()?, Some(Arc::clone(&tls)))
                })
                .collect::<Result<Vec<_>>>()?;
            grouped.insert(name, wrapped);
        }
        Ok(grouped)
    }

    /// Select one inherited listener.
    ///
    /// An empty `name` picks the first declared descriptor.
    pub fn select(&self, name: &str) -> Result<Listener> {
        let env = self.read_counts()?;
        let file = if name.is_empty() {
            if env.fds == 0 {
                return Err(Sentinel::ListenSystemdNotFound.into());
            }
            let first = env.names.first().map(String::as_str).unwrap_or_default();
            self.platform.inherited_file(LISTEN_FDS_START, first)
        } else {
            self.load_inherited_files()?
                .into_iter()
                .find(|file| file.name == name)
                .ok_or(Sentinel::ListenSystemdNotFound)?
        };

        tracing::debug!(fd = file.fd, name = %file.name, "Selected inherited socket");
        self.adopt(&env, file)
    }

    /// Convert `file`, refusing descriptors the supervisor did not pass.
    fn adopt(&self, env: &ListenEnv, file: InheritedFile) -> Result<Listener> {
        let passed = LISTEN_FDS_START..fd_at(env.fds);
        if !passed.contains(&file.fd) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "descriptor {} ({}) is outside the inherited range {passed:?}",
                    file.fd, file.name
                ),
            )
            .into());
        }
        Ok(self.platform.listener(file)?)
    }

    /// Pid and count validation without the name-count check.
    fn read_counts(&self) -> Result<ListenEnv> {
        let pid = self.platform.pid();
        self.platform
            .env_var(LISTEN_PID)
            .and_then(|raw| raw.trim().parse::<u32>().ok())
            .filter(|listen_pid| *listen_pid == pid)
            .ok_or(Sentinel::ListenSystemdPid)?;

        let fds = self
            .platform
            .env_var(LISTEN_FDS)
            .and_then(|raw| raw.trim().parse::<usize>().ok())
            .filter(|fds| *fds <= MAX_LISTEN_FDS)
            .ok_or(Sentinel::ListenSystemdFds)?;

        let names = match self.platform.env_var(LISTEN_FDNAMES) {
            Some(raw) if !raw.is_empty() => raw.split(':').map(str::to_string).collect(),
            _ => Vec::new(),
        };

        Ok(ListenEnv { fds, names })
    }
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation").finish_non_exhaustive()
    }
}

impl Default for Activation {
    fn default() -> Self {
        Self::system()
    }
}

/// Descriptor number of the `index`-th inherited file. `index` never exceeds
/// [`MAX_LISTEN_FDS`], so the sum fits in an `i32`.
fn fd_at(index: usize) -> i32 {
    LISTEN_FDS_START + index.min(MAX_LISTEN_FDS) as i32
}
