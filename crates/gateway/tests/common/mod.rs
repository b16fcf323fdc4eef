#![allow(clippy::unwrap_used, clippy::expect_used, dead_code)]

use std::{
    future::Future,
    io,
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::Duration,
};

use {
    axum::{Router, routing::get},
    tokio::{
        io::{AsyncReadExt, AsyncWriteExt},
        net::TcpStream,
    },
    tokio_rustls::{
        TlsConnector,
        client::TlsStream,
        rustls::{self, RootCertStore, pki_types::ServerName},
    },
    webirc_config::{GatewayConfig, ServerConfig},
    webirc_gateway::{Gateway, ScriptEngine, Transport, hooks::Hooks, tls},
};

pub const WAIT: Duration = Duration::from_secs(10);

/// Fails the test instead of hanging it.
pub async fn within<F: Future>(fut: F) -> F::Output {
    tokio::time::timeout(WAIT, fut)
        .await
        .expect("timed out")
}

/// Minimal HTTP transport mounting one route.
pub struct EchoTransport;

impl Transport for EchoTransport {
    fn name(&self) -> &str {
        "websocket"
    }

    fn init(&self, _gateway: &Arc<Gateway>, router: Router) -> Router {
        router.route("/webirc/websocket/", get(|| async { "echo" }))
    }
}

pub fn plain_server() -> ServerConfig {
    ServerConfig {
        bind: "127.0.0.1".into(),
        port: 0,
        ..ServerConfig::default()
    }
}

pub fn config_with(servers: Vec<ServerConfig>) -> GatewayConfig {
    GatewayConfig {
        transports: vec!["websocket".into()],
        servers,
        ..GatewayConfig::default()
    }
}

/// Write a throwaway self-signed pair for `localhost`.
pub fn write_key_pair(dir: &Path) -> (PathBuf, PathBuf) {
    write_named_pair(dir, "localhost", "gateway")
}

/// Write a self-signed pair for `host` as `<stem>.crt` and `<stem>.key`.
pub fn write_named_pair(dir: &Path, host: &str, stem: &str) -> (PathBuf, PathBuf) {
    let generated = rcgen::generate_simple_self_signed(vec![host.into()]).unwrap();
    let cert = dir.join(format!("{stem}.crt"));
    let key = dir.join(format!("{stem}.key"));
    std::fs::write(&cert, generated.cert.pem()).unwrap();
    std::fs::write(&key, generated.key_pair.serialize_pem()).unwrap();
    (cert, key)
}

/// TLS handshake with `addr` presenting `server_name`, trusting only the
/// certificate in `trusted`. Offers h2 and http/1.1.
pub async fn tls_connect(
    addr: SocketAddr,
    server_name: &str,
    trusted: &Path,
) -> io::Result<TlsStream<TcpStream>> {
    let pem = std::fs::read(trusted).unwrap();
    let mut roots = RootCertStore::empty();
    for cert in tls::parse_cert_chain(pem.as_slice(), "trusted").unwrap() {
        roots.add(cert).unwrap();
    }
    let mut config = rustls::ClientConfig::builder_with_provider(Arc::new(
        rustls::crypto::ring::default_provider(),
    ))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let tcp = TcpStream::connect(addr).await?;
    let name = ServerName::try_from(server_name.to_owned()).unwrap();
    TlsConnector::from(Arc::new(config)).connect(name, tcp).await
}

/// Send one HTTP/1.1 `GET` over an established stream and return the raw
/// response.
pub async fn http1_get(stream: &mut TlsStream<TcpStream>, host: &str, path: &str) -> String {
    let request = format!("GET {path} HTTP/1.1\r\nHost: {host}\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await.unwrap();

    let mut response = Vec::new();
    match stream.read_to_end(&mut response).await {
        Ok(_) => {},
        // Servers may close without close_notify after `Connection: close`.
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {},
        Err(e) => panic!("reading response failed: {e}"),
    }
    String::from_utf8_lossy(&response).into_owned()
}

/// Script engine that records every call.
#[derive(Default)]
pub struct RecordingEngine {
    pub calls: Mutex<Vec<String>>,
    pub loaded: Mutex<Vec<(PathBuf, String)>>,
}

impl RecordingEngine {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ScriptEngine for RecordingEngine {
    fn start_workers(&self, workers: usize) {
        self.calls.lock().unwrap().push(format!("workers:{workers}"));
    }

    fn attach_hooks(&self, _hooks: &Hooks) {
        self.calls.lock().unwrap().push("attach".into());
    }

    fn load_script(&self, module_dir: &Path, source: &str) -> anyhow::Result<()> {
        self.loaded
            .lock()
            .unwrap()
            .push((module_dir.to_path_buf(), source.to_owned()));
        Ok(())
    }
}
