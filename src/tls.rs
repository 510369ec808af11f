//! TLS context construction and the loopback-bypass policy (spec §4.4/§6).
//!
//! Spec names "TLS primitives (session context, BIO-pair, cert/DH
//! parameters)" as an external collaborator the original delegates to
//! OpenSSL for. In Rust there is no separate binding layer to delegate
//! to — `rustls` *is* that collaborator — so this module builds the
//! `rustls` client/server configs directly from `Config::cert_chain_pem`.
//!
//! `Config::dh_params_pem`'s existence is still validated (spec requires
//! both paths unless encryption is disabled), but it goes unused by the
//! `rustls` backend: TLS 1.3 negotiates ephemeral key exchange
//! parameters per-handshake and has no file-based static DH parameter
//! concept the way the OpenSSL original did. See `DESIGN.md`.
//!
//! `cert_chain_pem` is read once and used for two roles simultaneously:
//! the node's own identity certificate + private key, *and* the shared
//! trust anchor peers are validated against. This models a closed
//! cluster of peers that all trust the same (commonly self-signed)
//! certificate bundle, which is the natural reading of spec's "TLS-cert
//! validation reporting" non-goal: chirp performs real cryptographic
//! chain validation via `rustls`, but does not layer any further
//! per-peer authorization policy on top.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::Config;
use crate::error::{Error, ErrorKind, Result, ResultWrappedExt};

/// Holds the acceptor/connector pair used to wrap plain sockets for
/// every non-loopback connection (spec §4.4 "Optional TLS").
#[derive(Clone)]
pub struct TlsContext {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
}

impl TlsContext {
    /// Builds a [`TlsContext`] from `config`. Returns `Ok(None)` when
    /// encryption is disabled entirely.
    pub fn build(config: &Config) -> Result<Option<TlsContext>> {
        if config.disable_encryption {
            return Ok(None);
        }
        let cert_path = config
            .cert_chain_pem
            .as_ref()
            .ok_or_else(|| Error::simple(ErrorKind::ValueError))?;

        let certs = load_certs(cert_path)?;
        let key = load_private_key(cert_path)?;

        let mut roots = RootCertStore::empty();
        for cert in &certs {
            // ignore parse errors from non-leaf entries; at least the
            // leaf must parse for a usable trust anchor
            let _ = roots.add(cert);
        }

        let client_verifier = rustls::server::AllowAnyAuthenticatedClient::new(roots.clone());
        let server_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(Arc::new(client_verifier))
            .with_single_cert(certs.clone(), key.clone())
            .wrapped(ErrorKind::TlsError)?;

        let client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_root_certificates(roots)
            .with_single_cert(certs, key)
            .wrapped(ErrorKind::TlsError)?;

        log::debug!("tls context built from {:?}", cert_path);
        Ok(Some(TlsContext {
            acceptor: TlsAcceptor::from(Arc::new(server_config)),
            connector: TlsConnector::from(Arc::new(client_config)),
        }))
    }
}

fn load_certs(path: &Path) -> Result<Vec<Certificate>> {
    let file = File::open(path).wrapped(ErrorKind::TlsError)?;
    let mut reader = BufReader::new(file);
    let raw = rustls_pemfile::certs(&mut reader).wrapped(ErrorKind::TlsError)?;
    if raw.is_empty() {
        return Err(Error::simple_msg(
            ErrorKind::TlsError,
            "no certificates found in CERT_CHAIN_PEM",
        ));
    }
    Ok(raw.into_iter().map(Certificate).collect())
}

fn load_private_key(path: &Path) -> Result<PrivateKey> {
    let file = File::open(path).wrapped(ErrorKind::TlsError)?;
    let mut reader = BufReader::new(file);
    let pkcs8 = rustls_pemfile::pkcs8_private_keys(&mut reader).wrapped(ErrorKind::TlsError)?;
    if let Some(key) = pkcs8.into_iter().next() {
        return Ok(PrivateKey(key));
    }
    let file = File::open(path).wrapped(ErrorKind::TlsError)?;
    let mut reader = BufReader::new(file);
    let rsa = rustls_pemfile::rsa_private_keys(&mut reader).wrapped(ErrorKind::TlsError)?;
    rsa.into_iter()
        .next()
        .map(PrivateKey)
        .ok_or_else(|| Error::simple_msg(ErrorKind::TlsError, "no private key found in CERT_CHAIN_PEM"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_is_skipped_when_encryption_disabled() {
        let cfg = Config::builder().disable_encryption(true).build();
        assert!(TlsContext::build(&cfg).unwrap().is_none());
    }
}
