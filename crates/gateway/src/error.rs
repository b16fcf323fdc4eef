use std::{io, path::PathBuf};

use thiserror::Error;

/// Errors that stop [`Gateway::start`](crate::Gateway::start) as a whole.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("no server engines configured")]
    NoTransports,
    #[error("gateway already started")]
    AlreadyStarted,
    #[error("gateway has been closed")]
    Closed,
    #[error("start must be called from within a tokio runtime")]
    NoRuntime,
    #[error("proxy mode selected but no forward proxy is available")]
    NoProxy,
    #[error("forward proxy failed to start: {0:#}")]
    Proxy(anyhow::Error),
}

/// An error that stops a single listener from being bound.
///
/// These never leave the listener's own task; they are logged with the
/// endpoint and sibling listeners carry on.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("'cert' and 'key' options must be set for TLS servers")]
    MissingTlsMaterial,
    #[error("certificate error: {0}")]
    Tls(#[from] TlsError),
    #[error("no raw TCP transport is available")]
    NoRawTransport,
    #[error("failed to remove stale socket {path}: {source}")]
    StaleSocket {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to set mode {mode:o} on {path}: {source}")]
    Permissions {
        path: PathBuf,
        mode: u32,
        #[source]
        source: io::Error,
    },
    #[error("gateway is closing")]
    Closing,
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Certificate and key loading failures.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("no certificates found in {0}")]
    NoCertificates(String),
    #[error("no private key found in {0}")]
    NoPrivateKey(String),
    #[error("invalid PEM in {origin}: {source}")]
    Pem {
        origin: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Automatic certificate acquisition failures. Logged only: a failed order
/// fails the handshakes that asked for it, nothing else.
#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),
    #[error("certificate generation failed: {0}")]
    Rcgen(#[from] rcgen::Error),
    #[error("order for {domain} ended as {status}")]
    Order { domain: String, status: String },
    #[error("no TLS-ALPN-01 challenge offered for {0}")]
    NoChallenge(String),
    #[error("timed out waiting on the ACME server for {0}")]
    Timeout(String),
    #[error("{0} is not in the configured ACME domain list")]
    DomainNotAllowed(String),
    #[error("certificate cache I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("invalid account credentials: {0}")]
    Credentials(#[from] serde_json::Error),
    #[error(transparent)]
    Tls(#[from] TlsError),
}
