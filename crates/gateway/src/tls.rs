//! Static certificate loading and rustls server configuration.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
    sync::Arc,
};

use rustls::{
    ServerConfig,
    crypto::ring,
    pki_types::{CertificateDer, PrivateKeyDer},
    server::{ClientHello, ResolvesServerCert},
    sign::CertifiedKey,
};

use crate::error::TlsError;

/// The only application protocol offered to regular clients.
pub const HTTP1_ALPN: &[u8] = b"http/1.1";

/// Parse a PEM certificate chain. `origin` names the source in errors.
pub fn parse_cert_chain(
    mut pem: impl Read,
    origin: &str,
) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let mut reader = BufReader::new(&mut pem);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Pem {
            origin: origin.to_owned(),
            source,
        })?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates(origin.to_owned()));
    }
    Ok(certs)
}

/// Parse the first PKCS#8, PKCS#1 or SEC1 private key in a PEM stream.
pub fn parse_private_key(
    mut pem: impl Read,
    origin: &str,
) -> Result<PrivateKeyDer<'static>, TlsError> {
    let mut reader = BufReader::new(&mut pem);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|source| TlsError::Pem {
            origin: origin.to_owned(),
            source,
        })?
        .ok_or_else(|| TlsError::NoPrivateKey(origin.to_owned()))
}

/// Build a signing-ready key pair from already parsed material.
pub fn certified_key(
    chain: Vec<CertificateDer<'static>>,
    key: &PrivateKeyDer<'_>,
) -> Result<CertifiedKey, TlsError> {
    let signing_key = ring::sign::any_supported_type(key)?;
    Ok(CertifiedKey::new(chain, signing_key))
}

/// Load a certificate chain and its private key from PEM files.
pub fn load_key_pair(cert: &Path, key: &Path) -> Result<CertifiedKey, TlsError> {
    let chain = parse_cert_chain(open(cert)?, &cert.display().to_string())?;
    let key = parse_private_key(open(key)?, &key.display().to_string())?;
    certified_key(chain, &key)
}

fn open(path: &Path) -> Result<File, TlsError> {
    File::open(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Serves one fixed key pair regardless of SNI.
#[derive(Debug)]
pub struct StaticCertResolver {
    key: Arc<CertifiedKey>,
}

impl StaticCertResolver {
    pub fn new(key: CertifiedKey) -> Self {
        Self { key: Arc::new(key) }
    }
}

impl ResolvesServerCert for StaticCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(Arc::clone(&self.key))
    }
}

/// Make ring the process-wide rustls provider unless one is already set.
///
/// Outgoing HTTPS clients (the ACME client) build their configs from the
/// process default, and with more than one provider compiled in rustls
/// cannot pick one by itself.
pub fn install_default_provider() {
    // Err only means another provider was installed first.
    let _ = ring::default_provider().install_default();
}

/// A TLS 1.2/1.3 server config over the ring provider.
pub fn server_config(
    resolver: Arc<dyn ResolvesServerCert>,
    alpn: &[&[u8]],
) -> Result<Arc<ServerConfig>, TlsError> {
    let mut config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_cert_resolver(resolver);
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(Arc::new(config))
}
