//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Load a PEM certificate chain and private key
//! - Build the default server configuration (TLS 1.2 minimum, strong suites)
//! - Wrap stream listeners with a TLS acceptor

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::crypto::ring::{cipher_suite, kx_group};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

use crate::error::{Result, Sentinel};
use crate::net::listener::StreamListener;

/// Shared server-side TLS configuration.
pub type TlsConfig = Arc<ServerConfig>;

/// Crypto provider restricted to AEAD suites with forward secrecy.
/// Key exchange groups are ordered strongest first.
pub fn default_crypto_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: vec![
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        kx_groups: vec![kx_group::SECP384R1, kx_group::SECP256R1, kx_group::X25519],
        ..rustls::crypto::ring::default_provider()
    }
}

/// Build the default server configuration from PEM files.
///
/// Load failures are returned as-is.
pub fn default_tls_config(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<TlsConfig> {
    let certs = load_certs(cert_path.as_ref())?;
    let key = load_private_key(key_path.as_ref())?;

    let config = ServerConfig::builder_with_provider(Arc::new(default_crypto_provider()))
        .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    tracing::debug!(
        cert = %cert_path.as_ref().display(),
        "TLS configuration loaded"
    );
    Ok(Arc::new(config))
}

/// Wrap a stream listener so that every accepted connection is TLS.
pub fn wrap(listener: StreamListener, tls: Option<TlsConfig>) -> Result<StreamListener> {
    let tls = tls.ok_or(Sentinel::TlsIsNil)?;
    Ok(listener.with_tls(TlsAcceptor::from(tls)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<io::Result<Vec<_>>>()?;
    if certs.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no certificates found in {}", path.display()),
        )
        .into());
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no private key found in {}", path.display()),
        )
        .into()
    })
}
