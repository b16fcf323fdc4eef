//! Listener binding: one endpoint config in, one supervised listener out.

use std::{fmt, io, net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use {
    axum::Router,
    axum_server::tls_rustls::RustlsConfig,
    tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
    tracing::{debug, error, info, warn},
};

use {
    crate::{
        Gateway,
        acme::ACME_TLS_ALPN,
        collaborators::RawTransport,
        error::ListenerError,
        shutdown::WaitGroup,
        tls::{self, HTTP1_ALPN, StaticCertResolver},
    },
    webirc_config::{GatewayConfig, ServerConfig},
};

/// How long a closed listener waits for in-flight requests before its close
/// counts as confirmed anyway.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

// ── Binding resolution ───────────────────────────────────────────────────────

/// The binding strategy chosen for one endpoint. Resolved once, up front.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Binding {
    /// `tcp:` prefix. The bound socket goes to the raw transport adapter.
    RawTcp { addr: String },
    /// TLS with a fixed key pair.
    StaticTls {
        addr: String,
        cert: Option<PathBuf>,
        key: Option<PathBuf>,
    },
    /// TLS with certificates obtained over ACME and cached in `cache_dir`.
    AcmeTls { addr: String, cache_dir: PathBuf },
    /// `unix:` prefix.
    Unix { path: PathBuf, mode: u32 },
    Plain { addr: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerKind {
    RawTcp,
    StaticTls,
    AcmeTls,
    Unix,
    Plain,
}

impl fmt::Display for ListenerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::RawTcp => "tcp",
            Self::StaticTls => "tls",
            Self::AcmeTls => "acme-tls",
            Self::Unix => "unix",
            Self::Plain => "http",
        })
    }
}

impl Binding {
    /// Precedence: `tcp:` prefix, TLS without a cache dir, TLS with a cache
    /// dir, `unix:` prefix, plain. File paths resolve against the config file.
    pub fn resolve(server: &ServerConfig, config: &GatewayConfig) -> Self {
        let addr = || join_host_port(&server.bind, server.port);
        let non_empty = |v: &Option<String>| {
            v.as_deref()
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
        };

        if let Some(host) = strip_prefix_ci(&server.bind, "tcp:") {
            return Self::RawTcp {
                addr: join_host_port(host, server.port),
            };
        }

        if server.tls {
            return match non_empty(&server.letsencrypt_cache) {
                None => Self::StaticTls {
                    addr: addr(),
                    cert: non_empty(&server.cert).map(|p| config.resolve_path(p)),
                    key: non_empty(&server.key).map(|p| config.resolve_path(p)),
                },
                Some(cache) => Self::AcmeTls {
                    addr: addr(),
                    cache_dir: config.resolve_path(cache),
                },
            };
        }

        if let Some(path) = strip_prefix_ci(&server.bind, "unix:") {
            return Self::Unix {
                path: PathBuf::from(path),
                mode: server.bind_mode,
            };
        }

        Self::Plain { addr: addr() }
    }

    pub fn kind(&self) -> ListenerKind {
        match self {
            Self::RawTcp { .. } => ListenerKind::RawTcp,
            Self::StaticTls { .. } => ListenerKind::StaticTls,
            Self::AcmeTls { .. } => ListenerKind::AcmeTls,
            Self::Unix { .. } => ListenerKind::Unix,
            Self::Plain { .. } => ListenerKind::Plain,
        }
    }
}

/// `host:port`, bracketing IPv6 literals.
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

fn strip_prefix_ci<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix).then(|| &s[prefix.len()..])
}

// ── Tracked listeners ────────────────────────────────────────────────────────

/// Snapshot of one tracked listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub id: u64,
    /// The endpoint as configured, e.g. `0.0.0.0:443`.
    pub endpoint: String,
    pub kind: ListenerKind,
    /// Bound address, for TCP-based listeners.
    pub local_addr: Option<SocketAddr>,
}

struct ActiveListener {
    info: ListenerInfo,
    shutdown: CancellationToken,
}

/// Every listener currently accepting connections.
///
/// Each entry holds one count on the gateway's close barrier, released when
/// its serving task confirms the close.
#[derive(Default)]
pub(crate) struct ListenerSet {
    closing: bool,
    listeners: Vec<ActiveListener>,
    next_id: u64,
}

impl ListenerSet {
    /// Register a bound listener. Fails once closing has begun, in which case
    /// the caller must drop the listener without serving.
    pub(crate) fn track(
        &mut self,
        barrier: &WaitGroup,
        endpoint: String,
        kind: ListenerKind,
        local_addr: Option<SocketAddr>,
    ) -> Result<(u64, CancellationToken), ListenerError> {
        if self.closing {
            return Err(ListenerError::Closing);
        }
        self.next_id += 1;
        let shutdown = CancellationToken::new();
        self.listeners.push(ActiveListener {
            info: ListenerInfo {
                id: self.next_id,
                endpoint,
                kind,
                local_addr,
            },
            shutdown: shutdown.clone(),
        });
        barrier.add(1);
        Ok((self.next_id, shutdown))
    }

    pub(crate) fn untrack(&mut self, id: u64) {
        self.listeners.retain(|l| l.info.id != id);
    }

    /// Mark the set closing and hand back every shutdown handle exactly once.
    pub(crate) fn close_all(&mut self) -> Vec<(ListenerInfo, CancellationToken)> {
        self.closing = true;
        self.listeners
            .drain(..)
            .map(|l| (l.info, l.shutdown))
            .collect()
    }

    pub(crate) fn is_closing(&self) -> bool {
        self.closing
    }

    pub(crate) fn snapshot(&self) -> Vec<ListenerInfo> {
        self.listeners.iter().map(|l| l.info.clone()).collect()
    }
}

// ── Binding and serving ──────────────────────────────────────────────────────

enum Bound {
    Raw(TcpListener, Arc<dyn RawTransport>),
    Tls(TcpListener, RustlsConfig),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
    Plain(TcpListener),
}

impl Bound {
    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Raw(l, _) | Self::Tls(l, _) | Self::Plain(l) => l.local_addr().ok(),
            #[cfg(unix)]
            Self::Unix(_) => None,
        }
    }
}

/// Releases one bind-progress count when dropped.
struct Settled<'a>(&'a WaitGroup);

impl Drop for Settled<'_> {
    fn drop(&mut self) {
        self.0.done();
    }
}

/// Bind and serve one endpoint until it is closed or fails.
pub(crate) async fn run(gateway: Arc<Gateway>, server: ServerConfig, router: Router) {
    let settled = Settled(gateway.bind_progress());
    let endpoint = server.label();
    let binding = Binding::resolve(&server, &gateway.config());
    let kind = binding.kind();

    let bound = match bind(&gateway, binding).await {
        Ok(bound) => bound,
        Err(e) => {
            error!(endpoint = %endpoint, kind = %kind, error = %e, "listener not started");
            return;
        },
    };

    let local_addr = bound.local_addr();
    let (id, shutdown) = match gateway.track_listener(endpoint.clone(), kind, local_addr) {
        Ok(tracked) => tracked,
        Err(e) => {
            debug!(endpoint = %endpoint, error = %e, "dropping listener bound during shutdown");
            return;
        },
    };
    drop(settled);

    match local_addr {
        Some(addr) => info!(endpoint = %endpoint, kind = %kind, %addr, "listening"),
        None => info!(endpoint = %endpoint, kind = %kind, "listening"),
    }

    let serving = serve(Arc::clone(&gateway), bound, router, shutdown.clone());
    let result = tokio::select! {
        result = serving => result,
        () = closed_with_grace(&shutdown) => {
            debug!(endpoint = %endpoint, "close grace period elapsed");
            Ok(())
        },
    };

    if shutdown.is_cancelled() {
        info!(endpoint = %endpoint, "listener closed");
    } else {
        match result {
            Ok(()) => warn!(endpoint = %endpoint, "listener stopped unexpectedly"),
            Err(e) => error!(endpoint = %endpoint, error = %e, "listener failed"),
        }
    }
    gateway.listener_finished(id);
}

async fn closed_with_grace(shutdown: &CancellationToken) {
    shutdown.cancelled().await;
    tokio::time::sleep(CLOSE_GRACE).await;
}

async fn bind(gateway: &Gateway, binding: Binding) -> Result<Bound, ListenerError> {
    match binding {
        Binding::RawTcp { addr } => {
            let raw = gateway
                .collaborators()
                .raw_transport
                .clone()
                .ok_or(ListenerError::NoRawTransport)?;
            Ok(Bound::Raw(TcpListener::bind(&addr).await?, raw))
        },
        Binding::StaticTls { addr, cert, key } => {
            let (Some(cert), Some(key)) = (cert, key) else {
                return Err(ListenerError::MissingTlsMaterial);
            };
            let pair = tls::load_key_pair(&cert, &key)?;
            let resolver = Arc::new(StaticCertResolver::new(pair));
            let config = tls::server_config(resolver, &[HTTP1_ALPN])?;
            Ok(Bound::Tls(
                TcpListener::bind(&addr).await?,
                RustlsConfig::from_config(config),
            ))
        },
        Binding::AcmeTls { addr, cache_dir } => {
            let resolver = gateway.acme().get(&cache_dir);
            let config = tls::server_config(resolver, &[HTTP1_ALPN, ACME_TLS_ALPN])?;
            Ok(Bound::Tls(
                TcpListener::bind(&addr).await?,
                RustlsConfig::from_config(config),
            ))
        },
        Binding::Unix { path, mode } => bind_unix(path, mode),
        Binding::Plain { addr } => Ok(Bound::Plain(TcpListener::bind(&addr).await?)),
    }
}

#[cfg(unix)]
fn bind_unix(path: PathBuf, mode: u32) -> Result<Bound, ListenerError> {
    use std::os::unix::fs::PermissionsExt;

    match std::fs::remove_file(&path) {
        Ok(()) => debug!(path = %path.display(), "removed stale socket"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {},
        Err(source) => return Err(ListenerError::StaleSocket { path, source }),
    }

    let listener = tokio::net::UnixListener::bind(&path)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode))
        .map_err(|source| ListenerError::Permissions { path, mode, source })?;
    Ok(Bound::Unix(listener))
}

#[cfg(not(unix))]
fn bind_unix(_path: PathBuf, _mode: u32) -> Result<Bound, ListenerError> {
    Err(io::Error::new(io::ErrorKind::Unsupported, "unix sockets are unavailable").into())
}

async fn serve(
    gateway: Arc<Gateway>,
    bound: Bound,
    router: Router,
    shutdown: CancellationToken,
) -> io::Result<()> {
    match bound {
        Bound::Raw(listener, raw) => {
            raw.serve(gateway, listener, shutdown).await;
            Ok(())
        },
        Bound::Tls(listener, config) => {
            let handle = axum_server::Handle::new();
            let serving = axum_server::from_tcp_rustls(listener.into_std()?, config)
                .handle(handle.clone())
                .serve(router.into_make_service_with_connect_info::<SocketAddr>());
            tokio::pin!(serving);
            tokio::select! {
                result = &mut serving => result,
                () = shutdown.cancelled() => {
                    handle.graceful_shutdown(Some(CLOSE_GRACE));
                    serving.await
                },
            }
        },
        #[cfg(unix)]
        Bound::Unix(listener) => {
            axum::serve(listener, router.into_make_service())
                .with_graceful_shutdown(shutdown.cancelled_owned())
                .await
        },
        Bound::Plain(listener) => {
            axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(shutdown.cancelled_owned())
            .await
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn server(bind: &str) -> ServerConfig {
        ServerConfig {
            bind: bind.into(),
            port: 8080,
            ..ServerConfig::default()
        }
    }

    fn config_at(path: &str) -> GatewayConfig {
        GatewayConfig {
            config_file: Some(PathBuf::from(path)),
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn tcp_prefix_wins_over_tls() {
        let mut s = server("TCP:127.0.0.1");
        s.tls = true;
        assert_eq!(
            Binding::resolve(&s, &GatewayConfig::default()),
            Binding::RawTcp {
                addr: "127.0.0.1:8080".into()
            }
        );
    }

    #[test]
    fn static_tls_paths_resolve_against_config() {
        let mut s = server("0.0.0.0");
        s.tls = true;
        s.cert = Some("certs/gw.crt".into());
        s.key = Some("/abs/gw.key".into());

        assert_eq!(
            Binding::resolve(&s, &config_at("/etc/webirc/webircgateway.toml")),
            Binding::StaticTls {
                addr: "0.0.0.0:8080".into(),
                cert: Some(PathBuf::from("/etc/webirc/certs/gw.crt")),
                key: Some(PathBuf::from("/abs/gw.key")),
            }
        );
    }

    #[test]
    fn empty_tls_material_counts_as_missing() {
        let mut s = server("0.0.0.0");
        s.tls = true;
        s.cert = Some(String::new());
        s.letsencrypt_cache = Some(String::new());

        let binding = Binding::resolve(&s, &GatewayConfig::default());
        assert!(matches!(binding, Binding::StaticTls { cert: None, key: None, .. }));
    }

    #[test]
    fn cache_dir_selects_acme() {
        let mut s = server("0.0.0.0");
        s.tls = true;
        s.cert = Some("ignored.crt".into());
        s.letsencrypt_cache = Some("certs".into());

        assert_eq!(
            Binding::resolve(&s, &config_at("/srv/gw/webircgateway.toml")).kind(),
            ListenerKind::AcmeTls
        );
    }

    #[test]
    fn unix_prefix_is_case_insensitive() {
        let mut s = server("Unix:/run/webirc.sock");
        s.bind_mode = 0o770;
        assert_eq!(
            Binding::resolve(&s, &GatewayConfig::default()),
            Binding::Unix {
                path: PathBuf::from("/run/webirc.sock"),
                mode: 0o770,
            }
        );
    }

    #[test]
    fn plain_brackets_ipv6() {
        assert_eq!(
            Binding::resolve(&server("::1"), &GatewayConfig::default()),
            Binding::Plain {
                addr: "[::1]:8080".into()
            }
        );
        assert_eq!(join_host_port("[::]", 80), "[::]:80");
        assert_eq!(join_host_port("localhost", 80), "localhost:80");
    }

    #[test]
    fn prefix_shorter_than_input() {
        assert_eq!(strip_prefix_ci("tc", "tcp:"), None);
        assert_eq!(strip_prefix_ci("tcp:", "tcp:"), Some(""));
    }

    #[test]
    fn closing_set_rejects_new_listeners() {
        let barrier = WaitGroup::new();
        let mut set = ListenerSet::default();

        let (_, token) = set
            .track(&barrier, "a:1".into(), ListenerKind::Plain, None)
            .unwrap();
        assert_eq!(barrier.pending(), 1);

        let closed = set.close_all();
        assert_eq!(closed.len(), 1);
        assert!(!token.is_cancelled(), "close_all leaves cancelling to the caller");
        assert!(set.close_all().is_empty());

        assert!(matches!(
            set.track(&barrier, "b:2".into(), ListenerKind::Plain, None),
            Err(ListenerError::Closing)
        ));
        assert_eq!(barrier.pending(), 1);
    }
}
