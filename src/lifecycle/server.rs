//! Server lifecycle controller.
//!
//! # Responsibilities
//! - Reject concurrent starts; at most one run is active per server
//! - Bind a listener per run and hand it to the registered handler
//! - Stop by closing the listener, then wait for the handler to return
//! - Record the outcome of each run for `wait` and `error`
//!
//! # Concurrency
//! ```text
//!  caller                         run task
//!  ──────                         ────────
//!  start ─ reserve(running, run) ─ bind ─ spawn ──▶ handler(listener)
//!  stop  ─ closer.close() ────────────────────────▶ accept fails, handler returns
//!                                                   remove socket file
//!                                                   running = false
//!  wait/stop ◀───────────── done (watch) ──────────── send outcome
//! ```
//! The run record is installed when the start is reserved, so `stop` and
//! `wait` issued while the listener is still binding act on that run. A stop
//! requested during the bind closes the listener as soon as it is launched.
//!
//! The state mutex is never held across an `.await`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::runtime::Handle;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::{apply_defaults, parse_address, Configuration, Mode};
use crate::error::{Error, Result, Sentinel, SharedError};
use crate::lifecycle::fault::Contained;
use crate::lifecycle::handler::{self, DatagramHandler, HandlerResult, StreamHandler};
use crate::net::{
    Activation, DatagramEndpoint, Listener, ListenerCloser, ListenerFactory, PeerAddr, StreamListener,
    TlsConfig,
};

type Outcome = std::result::Result<(), SharedError>;

enum Security {
    Plain,
    Tls(Option<TlsConfig>),
}

enum Invocation {
    Stream(StreamHandler, StreamListener),
    Datagram(DatagramHandler, DatagramEndpoint),
}

impl Invocation {
    fn contained(self) -> Contained {
        match self {
            Invocation::Stream(handler, listener) => Contained::invoke(&*handler, listener),
            Invocation::Datagram(handler, endpoint) => Contained::invoke(&*handler, endpoint),
        }
    }
}

/// Per-run handles shared with `stop` and `wait`.
///
/// `closer` and `local_addr` stay empty until the listener is bound.
#[derive(Clone)]
struct Run {
    closer: Option<ListenerCloser>,
    stopping: Arc<AtomicBool>,
    done: watch::Receiver<Option<Outcome>>,
    local_addr: Option<PeerAddr>,
}

#[derive(Default)]
struct State {
    stream_handler: Option<StreamHandler>,
    datagram_handler: Option<DatagramHandler>,
    conf: Option<Configuration>,
    id: String,
    last_error: Option<SharedError>,
    run: Option<Run>,
}

struct Inner {
    factory: ListenerFactory,
    running: AtomicBool,
    state: Mutex<State>,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A start that holds `running` but has not launched its run task yet.
///
/// Dropped unsettled (the start future was cancelled mid-bind), it releases
/// the server and restores the previous run.
struct Reservation {
    inner: Arc<Inner>,
    done: Arc<watch::Sender<Option<Outcome>>>,
    stopping: Arc<AtomicBool>,
    previous: Option<Run>,
    settled: bool,
}

impl Reservation {
    fn release(&mut self, err: SharedError) {
        self.settled = true;
        {
            let mut state = self.inner.lock();
            state.last_error = Some(Arc::clone(&err));
            state.run = self.previous.take();
            self.inner.running.store(false, Ordering::Release);
        }
        self.done.send_replace(Some(Err(err)));
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.settled {
            tracing::warn!("Start cancelled before the listener was launched");
            self.release(Arc::new(Error::Cancelled("start dropped while binding")));
        }
    }
}

/// Completes a run when the run task ends, including when the task is
/// dropped with its runtime before the handler returned.
struct RunGuard {
    inner: Arc<Inner>,
    id: String,
    socket_path: Option<PathBuf>,
    done: Arc<watch::Sender<Option<Outcome>>>,
    outcome: Option<Outcome>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            tracing::warn!(id = %self.id, "Run task dropped before the handler returned");
            Err(Arc::new(Error::Cancelled("run task dropped before the handler returned")))
        });
        remove_socket_file(self.socket_path.as_deref());
        {
            let mut state = self.inner.lock();
            if let Err(e) = &outcome {
                state.last_error = Some(Arc::clone(e));
            }
            self.inner.running.store(false, Ordering::Release);
        }
        self.done.send_replace(Some(outcome));
        tracing::info!(id = %self.id, "Server stopped");
    }
}

/// A transport server: one handler, one listener per run.
///
/// Cloning is cheap and every clone drives the same server.
///
/// ```no_run
/// # async fn demo() {
/// use transport_server::Server;
/// use tokio::io::AsyncWriteExt;
///
/// let server = Server::new();
/// server.handler(|mut listener| async move {
///     loop {
///         let (mut conn, _) = listener.accept().await?;
///         tokio::spawn(async move { conn.write_all(b"hello\n").await });
///     }
/// });
/// server.listen_and_serve("127.0.0.1:8080").await.unwrap();
/// server.stop().await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<Inner>,
}

impl Server {
    pub fn new() -> Self {
        Self::with_factory(ListenerFactory::new())
    }

    /// Build listeners with a custom factory (e.g. a fake activation platform).
    pub fn with_factory(factory: ListenerFactory) -> Self {
        Self {
            inner: Arc::new(Inner {
                factory,
                running: AtomicBool::new(false),
                state: Mutex::new(State::default()),
            }),
        }
    }

    /// Register the stream handler, replacing any datagram handler.
    ///
    /// Ignored while running.
    pub fn handler<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn(StreamListener) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        if self.is_running() {
            tracing::warn!(id = %self.id(), "Handler registration ignored while running");
            return self;
        }
        let mut state = self.lock();
        state.stream_handler = Some(handler::stream_handler(f));
        state.datagram_handler = None;
        drop(state);
        self
    }

    /// Register the datagram handler, replacing any stream handler.
    ///
    /// Ignored while running.
    pub fn datagram_handler<F, Fut>(&self, f: F) -> &Self
    where
        F: Fn(DatagramEndpoint) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        if self.is_running() {
            tracing::warn!(id = %self.id(), "Handler registration ignored while running");
            return self;
        }
        let mut state = self.lock();
        state.datagram_handler = Some(handler::datagram_handler(f));
        state.stream_handler = None;
        drop(state);
        self
    }

    /// Start serving on `address` (`host:port`, service names allowed).
    pub async fn listen_and_serve(&self, address: &str) -> Outcome {
        let reservation = self.reserve()?;
        let conf = parse_address(address, "");
        self.start(reservation, conf, Security::Plain).await
    }

    /// Start serving TLS on `address`. Without `tls`, the certificate and key
    /// files build the default TLS configuration.
    pub async fn listen_and_serve_tls(
        &self,
        address: &str,
        cert_file: &str,
        key_file: &str,
        tls: Option<TlsConfig>,
    ) -> Outcome {
        let reservation = self.reserve()?;
        let conf = parse_address(address, "").map(|mut conf| {
            conf.tls_public_key_pem = cert_file.to_string();
            conf.tls_private_key_pem = key_file.to_string();
            conf
        });
        self.start(reservation, conf, Security::Tls(tls)).await
    }

    pub async fn listen_and_serve_with_config(&self, conf: Option<Configuration>) -> Outcome {
        let reservation = self.reserve()?;
        let conf = conf.ok_or_else(|| Sentinel::NoConfiguration.into());
        self.start(reservation, conf, Security::Plain).await
    }

    pub async fn listen_and_serve_tls_with_config(
        &self,
        conf: Option<Configuration>,
        tls: Option<TlsConfig>,
    ) -> Outcome {
        let reservation = self.reserve()?;
        let conf = conf.ok_or_else(|| Sentinel::NoConfiguration.into());
        self.start(reservation, conf, Security::Tls(tls)).await
    }

    /// Serve a pre-opened stream listener.
    ///
    /// The configuration is derived from the listener's local address.
    /// Must be called within a tokio runtime.
    pub fn serve(&self, listener: StreamListener) -> Outcome {
        let reservation = self.reserve()?;
        let listener = Listener::Stream(listener);
        let conf = configuration_from(&listener);
        self.launch(reservation, conf, listener)
    }

    /// Serve a pre-opened datagram endpoint.
    pub fn serve_datagram(&self, endpoint: DatagramEndpoint) -> Outcome {
        let reservation = self.reserve()?;
        let listener = Listener::Datagram(endpoint);
        let conf = configuration_from(&listener);
        self.launch(reservation, conf, listener)
    }

    /// Close the listener and wait until the handler has returned and the
    /// socket file is gone. Returns the outcome of the run.
    ///
    /// A stop issued while a start is still binding stops that run once it
    /// is launched. Must not be awaited from inside the handler.
    pub async fn stop(&self) -> Outcome {
        let done = {
            let state = self.lock();
            let Some(run) = state.run.as_ref() else {
                return Ok(());
            };
            if !run.stopping.swap(true, Ordering::AcqRel) {
                tracing::info!(id = %state.id, "Stopping server");
                if let Some(closer) = &run.closer {
                    closer.close();
                }
            }
            run.done.clone()
        };
        wait_done(done).await
    }

    /// Wait for the current run to finish, including a run that is still
    /// binding. Returns immediately if the server was never started.
    pub async fn wait(&self) -> Outcome {
        let done = self.lock().run.as_ref().map(|run| run.done.clone());
        match done {
            Some(done) => wait_done(done).await,
            None => Ok(()),
        }
    }

    /// Clear the last recorded error.
    pub fn clean(&self) -> &Self {
        self.lock().last_error = None;
        self
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Instance ID; empty before the first start.
    pub fn id(&self) -> String {
        self.lock().id.clone()
    }

    pub fn error(&self) -> Option<SharedError> {
        self.lock().last_error.clone()
    }

    /// Configuration of the current or last run.
    pub fn configuration(&self) -> Option<Configuration> {
        self.lock().conf.clone()
    }

    /// Bound address of the current or last run.
    pub fn local_addr(&self) -> Option<PeerAddr> {
        self.lock().run.as_ref().and_then(|run| run.local_addr.clone())
    }

    /// Socket activation over the same platform as this server's factory.
    pub fn activation(&self) -> Activation {
        self.inner.factory.activation()
    }

    pub async fn new_listener(&self, conf: &Configuration) -> Result<Listener> {
        self.inner.factory.new_listener(conf).await
    }

    pub async fn new_listener_tls(&self, conf: &Configuration, tls: Option<TlsConfig>) -> Result<Listener> {
        self.inner.factory.new_listener_tls(conf, tls).await
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.inner.lock()
    }

    /// Claim `running` and install a pending run record.
    ///
    /// A rejected start is recorded as the last error; the active run is
    /// left untouched.
    fn reserve(&self) -> std::result::Result<Reservation, SharedError> {
        let mut state = self.lock();
        if self
            .inner
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::debug!(id = %state.id, "Start rejected, already running");
            let err: SharedError = Arc::new(Sentinel::AlreadyRunning.into());
            state.last_error = Some(Arc::clone(&err));
            return Err(err);
        }

        let (done, done_rx) = watch::channel(None);
        let stopping = Arc::new(AtomicBool::new(false));
        let previous = state.run.replace(Run {
            closer: None,
            stopping: Arc::clone(&stopping),
            done: done_rx,
            local_addr: None,
        });
        Ok(Reservation {
            inner: Arc::clone(&self.inner),
            done: Arc::new(done),
            stopping,
            previous,
            settled: false,
        })
    }

    /// Record a start failure and release the reservation.
    fn abort(&self, mut reservation: Reservation, err: Error) -> SharedError {
        let err = Arc::new(err);
        tracing::error!(error = %err, "Server failed to start");
        reservation.release(Arc::clone(&err));
        err
    }

    async fn start(&self, reservation: Reservation, conf: Result<Configuration>, security: Security) -> Outcome {
        match self.bind(conf, security).await {
            Ok((conf, listener)) => self.launch(reservation, conf, listener),
            Err(e) => Err(self.abort(reservation, e)),
        }
    }

    async fn bind(&self, conf: Result<Configuration>, security: Security) -> Result<(Configuration, Listener)> {
        let mut conf = conf?;
        apply_defaults(&mut conf);
        let listener = match security {
            Security::Plain => self.inner.factory.new_listener(&conf).await?,
            Security::Tls(tls) => self.inner.factory.new_listener_tls(&conf, tls).await?,
        };
        Ok((conf, listener))
    }

    fn prepare(&self, listener: Listener) -> Result<Invocation> {
        let state = self.lock();
        match listener {
            Listener::Stream(l) => state
                .stream_handler
                .clone()
                .map(|h| Invocation::Stream(h, l))
                .ok_or_else(|| Sentinel::ServerHandlerIsNotSet.into()),
            Listener::Datagram(d) => state
                .datagram_handler
                .clone()
                .map(|h| Invocation::Datagram(h, d))
                .ok_or_else(|| Sentinel::ServerHandlerUdpIsNotSet.into()),
        }
    }

    /// Spawn the run task for a reserved start.
    fn launch(&self, mut reservation: Reservation, mut conf: Configuration, listener: Listener) -> Outcome {
        let socket_path = listener.socket_path().map(Path::to_path_buf);
        let closer = listener.closer();
        let local_addr = listener.local_addr().ok();

        let invocation = match self.prepare(listener) {
            Ok(invocation) => invocation,
            Err(e) => {
                remove_socket_file(socket_path.as_deref());
                return Err(self.abort(reservation, e));
            }
        };
        let Ok(runtime) = Handle::try_current() else {
            drop(invocation);
            remove_socket_file(socket_path.as_deref());
            return Err(self.abort(
                reservation,
                Error::Unsupported("serving outside of a tokio runtime"),
            ));
        };

        if conf.id.is_empty() {
            conf.id = Uuid::new_v4().to_string();
        }
        let id = conf.id.clone();

        tracing::info!(
            id = %id,
            address = %conf.host_port(),
            mode = %conf.mode,
            "Server started"
        );
        {
            let mut state = self.lock();
            state.id = id.clone();
            state.conf = Some(conf);
            state.run = Some(Run {
                closer: Some(closer.clone()),
                stopping: Arc::clone(&reservation.stopping),
                done: reservation.done.subscribe(),
                local_addr,
            });
            if reservation.stopping.load(Ordering::Acquire) {
                tracing::info!(id = %id, "Stop requested while binding");
                closer.close();
            }
        }
        reservation.settled = true;

        let mut guard = RunGuard {
            inner: Arc::clone(&self.inner),
            id,
            socket_path,
            done: Arc::clone(&reservation.done),
            outcome: None,
        };
        runtime.spawn(async move {
            let outcome = match invocation.contained().await {
                Ok(()) => Ok(()),
                Err(e) if e.is_listener_closed() => {
                    tracing::debug!(id = %guard.id, "Handler returned after listener close");
                    Ok(())
                }
                Err(e) => {
                    tracing::error!(id = %guard.id, error = %e, "Server handler failed");
                    Err(Arc::new(e))
                }
            };
            guard.outcome = Some(outcome);
        });
        Ok(())
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("Server")
            .field("id", &state.id)
            .field("running", &self.is_running())
            .field("conf", &state.conf)
            .field("last_error", &state.last_error)
            .finish_non_exhaustive()
    }
}

async fn wait_done(mut done: watch::Receiver<Option<Outcome>>) -> Outcome {
    match done.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or(Ok(())),
        Err(_) => Err(Arc::new(Error::Cancelled("run ended without reporting an outcome"))),
    }
}

/// Configuration matching a pre-opened listener.
fn configuration_from(listener: &Listener) -> Configuration {
    let mut conf = Configuration::default();
    match listener.local_addr() {
        Ok(PeerAddr::Inet(addr)) => {
            conf.host = addr.ip().to_string();
            conf.port = addr.port();
            conf.mode = if listener.is_datagram() { Mode::Udp } else { Mode::Tcp };
        }
        Ok(PeerAddr::Unix(Some(path))) => {
            conf.mode = Mode::Unix;
            conf.socket = path.to_string_lossy().into_owned();
        }
        _ => {}
    }
    apply_defaults(&mut conf);
    conf
}

fn remove_socket_file(path: Option<&Path>) {
    let Some(path) = path else {
        return;
    };
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "Socket file removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "Failed to remove socket file"),
    }
}
