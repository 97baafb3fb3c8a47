//! Digest echo server.
//!
//! Replies to every message with the SHA-512 hex digest of the bytes it
//! received, over any transport the runtime supports.
//!
//! ```text
//! transport-server --address 127.0.0.1:8080
//! transport-server --mode udp --address :9000
//! transport-server --mode unix --address /run/digest.sock
//! transport-server --tls-cert cert.pem --tls-key key.pem --address :https
//! transport-server --config server.toml
//! ```

use std::path::PathBuf;

use clap::Parser;
use sha2::{Digest, Sha512};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use transport_server::config::{apply_defaults, load_config, parse_address};
use transport_server::observability::logging;
use transport_server::{Configuration, DatagramEndpoint, HandlerResult, Mode, Server, StreamListener};

const MAX_MESSAGE: usize = 64 * 1024;

#[derive(Parser, Debug)]
#[command(name = "transport-server")]
#[command(about = "SHA-512 digest echo over TCP, UDP, unix or inherited sockets", long_about = None)]
struct Cli {
    /// TOML or JSON configuration file; overrides address and mode
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// host:port, or the socket path in unix modes
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    address: String,

    /// tcp, tcp4, tcp6, udp, udp4, udp6, unix, unixpacket, socket or systemd
    #[arg(short, long, default_value = "tcp")]
    mode: String,

    #[arg(long, requires = "tls_key")]
    tls_cert: Option<String>,

    #[arg(long, requires = "tls_cert")]
    tls_key: Option<String>,

    /// Default log filter when RUST_LOG is unset
    #[arg(long, default_value = "transport_server=info")]
    log: String,
}

fn configuration(cli: &Cli) -> Result<Configuration, Box<dyn std::error::Error>> {
    let mut conf = match &cli.config {
        Some(path) => load_config(path)?,
        None => {
            let mode = Mode::parse_lenient(&cli.mode);
            if mode.is_unix() {
                let mut conf = Configuration {
                    socket: cli.address.clone(),
                    mode,
                    ..Default::default()
                };
                apply_defaults(&mut conf);
                conf
            } else {
                parse_address(&cli.address, &cli.mode)?
            }
        }
    };
    if let (Some(cert), Some(key)) = (&cli.tls_cert, &cli.tls_key) {
        conf.tls_public_key_pem = cert.clone();
        conf.tls_private_key_pem = key.clone();
    }
    Ok(conf)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    logging::init(&cli.log);

    tracing::info!("transport-server v{} starting", env!("CARGO_PKG_VERSION"));

    let conf = configuration(&cli)?;
    let server = Server::new();
    if conf.mode.is_udp() {
        server.datagram_handler(digest_datagrams);
    } else {
        server.handler(digest_streams);
    }

    if conf.has_tls_files() {
        server.listen_and_serve_tls_with_config(Some(conf), None).await?;
    } else {
        server.listen_and_serve_with_config(Some(conf)).await?;
    }

    tracing::info!(
        id = %server.id(),
        address = %server.local_addr().map(|a| a.to_string()).unwrap_or_default(),
        "Listening for connections"
    );

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupt received, stopping");
            server.stop().await?;
        }
        outcome = server.wait() => outcome?,
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

fn hex_digest(data: &[u8]) -> String {
    format!("{:x}", Sha512::digest(data))
}

async fn digest_streams(mut listener: StreamListener) -> HandlerResult {
    loop {
        let (mut conn, peer) = listener.accept().await?;
        tokio::spawn(async move {
            let mut buf = vec![0u8; MAX_MESSAGE];
            let n = match conn.read(&mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(peer_addr = %peer, error = %e, "Read failed");
                    return;
                }
            };
            if let Err(e) = conn.write_all(hex_digest(&buf[..n]).as_bytes()).await {
                tracing::debug!(peer_addr = %peer, error = %e, "Write failed");
            }
            let _ = conn.shutdown().await;
        });
    }
}

async fn digest_datagrams(endpoint: DatagramEndpoint) -> HandlerResult {
    let mut buf = vec![0u8; MAX_MESSAGE];
    loop {
        let (n, peer) = endpoint.recv_from(&mut buf).await?;
        endpoint.send_to(hex_digest(&buf[..n]).as_bytes(), peer).await?;
    }
}
