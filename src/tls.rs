//! TLS termination for the gateway's listening socket.
//!
//! Loads a PEM certificate chain and private key and builds a
//! [`tokio_rustls::TlsAcceptor`]. Serving plaintext is only permitted when
//! the operator explicitly sets `gateway.insecure` in config — see
//! [`crate::config::Config::validate`].

use anyhow::{ensure, Context, Result};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::ServerConfig;
use tokio_rustls::TlsAcceptor;

fn load_cert_chain(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening cert file {}", path.display()))?,
    );
    rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .with_context(|| format!("reading cert chain from {}", path.display()))
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(path).with_context(|| format!("opening key file {}", path.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("reading private key from {}", path.display()))?
        .context("no private key found in key file")
}

/// Build a [`TlsAcceptor`] from a cert/key pair on disk.
pub fn acceptor_from_files(cert_path: &str, key_path: &str) -> Result<TlsAcceptor> {
    let cert_chain = load_cert_chain(Path::new(cert_path))?;
    ensure!(!cert_chain.is_empty(), "cert file contains no certificates");
    let private_key = load_private_key(Path::new(key_path))?;

    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(cert_chain, private_key)
        .context("building TLS server config")?;

    Ok(TlsAcceptor::from(std::sync::Arc::new(config)))
}
