//! Socket activation over a fake platform.

mod common;

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{digest_streams, hex_digest, tcp_exchange, tls_exchange, TlsFiles, MESSAGE};
use transport_server::net::activation::{LISTEN_FDNAMES, LISTEN_FDS, LISTEN_PID};
use transport_server::net::{default_tls_config, Activation, InheritedFile, Platform};
use transport_server::{
    Configuration, DatagramEndpoint, Error, Listener, ListenerFactory, Mode, Sentinel, Server, StreamListener,
};

const PID: u32 = 4242;

/// Environment from a map; descriptors become fresh loopback sockets.
/// Names starting with `udp` produce datagram endpoints. A non-zero `delay`
/// blocks every conversion, standing in for a slow bind.
#[derive(Default)]
struct FakePlatform {
    env: HashMap<&'static str, String>,
    adopted: Mutex<Vec<InheritedFile>>,
    delay: Duration,
}

impl FakePlatform {
    fn new(vars: &[(&'static str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            env: vars.iter().map(|(k, v)| (*k, v.to_string())).collect(),
            adopted: Mutex::default(),
            delay: Duration::ZERO,
        })
    }

    fn slow(fds: usize, names: &str, delay: Duration) -> Arc<Self> {
        let mut platform = Arc::into_inner(Self::activated(fds, names)).unwrap();
        platform.delay = delay;
        Arc::new(platform)
    }

    fn activated(fds: usize, names: &str) -> Arc<Self> {
        Self::new(&[
            (LISTEN_PID, &PID.to_string()),
            (LISTEN_FDS, &fds.to_string()),
            (LISTEN_FDNAMES, names),
        ])
    }

    fn adopted(&self) -> Vec<InheritedFile> {
        self.adopted.lock().unwrap().clone()
    }
}

impl Platform for FakePlatform {
    fn env_var(&self, key: &str) -> Option<String> {
        self.env.get(key).cloned()
    }

    fn pid(&self) -> u32 {
        PID
    }

    fn listener(&self, file: InheritedFile) -> io::Result<Listener> {
        std::thread::sleep(self.delay);
        let datagram = file.name.starts_with("udp");
        self.adopted.lock().unwrap().push(file);
        if datagram {
            let socket = std::net::UdpSocket::bind("127.0.0.1:0")?;
            Ok(Listener::Datagram(DatagramEndpoint::from_udp(socket)?))
        } else {
            let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
            Ok(Listener::Stream(StreamListener::from_tcp(listener)?))
        }
    }
}

fn activation(platform: &Arc<FakePlatform>) -> Activation {
    Activation::new(Arc::clone(platform) as Arc<dyn Platform>)
}

fn server(platform: &Arc<FakePlatform>) -> Server {
    Server::with_factory(ListenerFactory::with_platform(Arc::clone(platform) as Arc<dyn Platform>))
}

fn systemd_conf(socket: &str) -> Configuration {
    Configuration {
        socket: socket.to_string(),
        mode: Mode::Systemd,
        ..Default::default()
    }
}

fn sentinel_of(result: transport_server::Result<impl Sized>) -> Option<Sentinel> {
    result.err().and_then(|e| e.sentinel())
}

#[test]
fn environment_is_validated_in_order() {
    let pid = PID.to_string();
    let cases: Vec<(Vec<(&'static str, &str)>, Sentinel)> = vec![
        (vec![], Sentinel::ListenSystemdPid),
        (vec![(LISTEN_PID, "abc"), (LISTEN_FDS, "1")], Sentinel::ListenSystemdPid),
        (vec![(LISTEN_PID, "1"), (LISTEN_FDS, "1")], Sentinel::ListenSystemdPid),
        (vec![(LISTEN_PID, &pid)], Sentinel::ListenSystemdFds),
        (vec![(LISTEN_PID, &pid), (LISTEN_FDS, "many")], Sentinel::ListenSystemdFds),
        (
            vec![(LISTEN_PID, &pid), (LISTEN_FDS, "2"), (LISTEN_FDNAMES, "only")],
            Sentinel::ListenSystemdQuantityNotMatch,
        ),
    ];
    for (vars, expected) in cases {
        let platform = FakePlatform::new(&vars);
        assert_eq!(
            sentinel_of(activation(&platform).read_listen_env()),
            Some(expected),
            "vars: {vars:?}"
        );
    }

    let env = activation(&FakePlatform::activated(2, "web:admin"))
        .read_listen_env()
        .unwrap();
    assert_eq!(env.fds, 2);
    assert_eq!(env.names, vec!["web", "admin"]);
}

#[test]
fn inherited_files_are_numbered_from_three() {
    let platform = FakePlatform::activated(3, "web:web:admin");
    let files = activation(&platform).load_inherited_files().unwrap();
    assert_eq!(
        files,
        vec![
            InheritedFile::new(3, "web"),
            InheritedFile::new(4, "web"),
            InheritedFile::new(5, "admin"),
        ]
    );
    // Loading files does not adopt descriptors.
    assert!(platform.adopted().is_empty());

    let unnamed = FakePlatform::activated(2, "");
    assert_eq!(
        sentinel_of(activation(&unnamed).load_inherited_files()),
        Some(Sentinel::ListenSystemdNotFound)
    );
}

#[tokio::test]
async fn listeners_without_names_ignore_name_count() {
    let platform = FakePlatform::activated(2, "only");
    let listeners = activation(&platform).listeners_without_names().unwrap();
    assert_eq!(listeners.len(), 2);
    let fds: Vec<i32> = platform.adopted().iter().map(|f| f.fd).collect();
    assert_eq!(fds, vec![3, 4]);
}

#[tokio::test]
async fn listeners_with_names_are_grouped() {
    let platform = FakePlatform::activated(4, "web:web:admin:udp-metrics");
    let grouped = activation(&platform).listeners_with_names().unwrap();
    assert_eq!(grouped["web"].len(), 2);
    assert_eq!(grouped["admin"].len(), 1);
    assert!(grouped["udp-metrics"][0].is_datagram());
}

#[tokio::test]
async fn select_adopts_only_the_requested_descriptor() {
    let platform = FakePlatform::activated(3, "web:admin:web");
    activation(&platform).select("admin").unwrap();
    assert_eq!(platform.adopted(), vec![InheritedFile::new(4, "admin")]);

    let platform = FakePlatform::activated(2, "web:admin");
    activation(&platform).select("").unwrap();
    assert_eq!(platform.adopted(), vec![InheritedFile::new(3, "web")]);

    let platform = FakePlatform::activated(1, "s2");
    assert_eq!(
        sentinel_of(activation(&platform).select("s1")),
        Some(Sentinel::ListenSystemdNotFound)
    );
    assert!(platform.adopted().is_empty());

    let platform = FakePlatform::activated(0, "");
    assert_eq!(
        sentinel_of(activation(&platform).select("")),
        Some(Sentinel::ListenSystemdNotFound)
    );
}

#[tokio::test]
async fn tls_variants_require_configuration_and_streams() {
    let files = TlsFiles::ecdsa();
    let tls = default_tls_config(files.cert_path(), files.key_path()).unwrap();

    let platform = FakePlatform::activated(2, "");
    assert_eq!(
        sentinel_of(activation(&platform).listeners_without_names_tls(None)),
        Some(Sentinel::TlsIsNil)
    );
    // Nothing is adopted when TLS is missing.
    assert!(platform.adopted().is_empty());

    let wrapped = activation(&platform)
        .listeners_without_names_tls(Some(Arc::clone(&tls)))
        .unwrap();
    assert_eq!(wrapped.len(), 2);
    assert!(wrapped.iter().all(StreamListener::is_tls));

    let platform = FakePlatform::activated(2, "web:web");
    let grouped = activation(&platform)
        .listeners_with_names_tls(Some(Arc::clone(&tls)))
        .unwrap();
    assert!(grouped["web"].iter().all(StreamListener::is_tls));

    let platform = FakePlatform::activated(2, "web:udp-metrics");
    match activation(&platform).listeners_with_names_tls(Some(tls)) {
        Err(Error::Io(e)) => assert_eq!(e.kind(), io::ErrorKind::InvalidInput),
        Err(other) => panic!("unexpected error: {other}"),
        Ok(_) => panic!("datagram endpoint wrapped in TLS"),
    }
}

#[tokio::test]
async fn server_serves_selected_socket() {
    let platform = FakePlatform::activated(2, "admin:digest");
    let server = server(&platform);
    server.handler(digest_streams);

    server
        .listen_and_serve_with_config(Some(systemd_conf("digest")))
        .await
        .unwrap();
    assert_eq!(platform.adopted(), vec![InheritedFile::new(4, "digest")]);

    let addr = server.local_addr().unwrap().as_inet().unwrap();
    assert_eq!(tcp_exchange(addr, MESSAGE.as_bytes()).await, hex_digest(MESSAGE.as_bytes()));

    server.stop().await.unwrap();
    assert!(server.error().is_none());
}

#[tokio::test]
async fn server_reports_unknown_socket_name() {
    let platform = FakePlatform::activated(1, "s2");
    let server = server(&platform);
    server.handler(digest_streams);

    let err = server
        .listen_and_serve_with_config(Some(systemd_conf("s1")))
        .await
        .unwrap_err();
    assert!(err.is(Sentinel::ListenSystemdNotFound));
    assert!(!server.is_running());
}

#[tokio::test]
async fn server_serves_inherited_socket_over_tls() {
    let files = TlsFiles::ecdsa();
    let tls = default_tls_config(files.cert_path(), files.key_path()).unwrap();
    let platform = FakePlatform::activated(1, "");
    let server = server(&platform);
    server.handler(digest_streams);

    server
        .listen_and_serve_tls_with_config(Some(systemd_conf("")), Some(tls))
        .await
        .unwrap();

    let addr = server.local_addr().unwrap().as_inet().unwrap();
    assert_eq!(tls_exchange(addr, MESSAGE.as_bytes()).await, hex_digest(MESSAGE.as_bytes()));

    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stop_and_wait_during_bind_act_on_the_new_run() {
    let platform = FakePlatform::slow(1, "digest", Duration::from_millis(300));
    let server = server(&platform);
    server.handler(digest_streams);

    let starting = {
        let server = server.clone();
        tokio::spawn(async move {
            server
                .listen_and_serve_with_config(Some(systemd_conf("digest")))
                .await
        })
    };
    tokio::time::timeout(Duration::from_secs(5), async {
        while !server.is_running() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();

    // The listener is still binding; waiting blocks on the pending run.
    let waiter = {
        let server = server.clone();
        tokio::spawn(async move { server.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    tokio::time::timeout(Duration::from_secs(5), server.stop())
        .await
        .unwrap()
        .unwrap();
    starting.await.unwrap().unwrap();
    assert!(!server.is_running());
    assert!(server.error().is_none());
    assert_eq!(platform.adopted(), vec![InheritedFile::new(3, "digest")]);

    tokio::time::timeout(Duration::from_secs(5), waiter)
        .await
        .unwrap()
        .unwrap()
        .unwrap();
}
