use std::{
    collections::HashSet,
    fmt,
    net::SocketAddr,
    path::Path,
    str::FromStr,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError, RwLock,
        atomic::{AtomicBool, Ordering},
    },
};

use {
    axum::Router,
    tokio_util::sync::CancellationToken,
    tower_http::services::ServeDir,
    tracing::{debug, info, warn},
};

use {
    crate::{
        acme::AcmeManager,
        collaborators::Collaborators,
        error::{GatewayError, ListenerError},
        hooks::{GatewayClosing, Hooks},
        listener::{self, ListenerInfo, ListenerKind, ListenerSet},
        registry::SessionRegistry,
        server,
        shutdown::WaitGroup,
    },
    webirc_config::{GatewayConfig, load_config},
};

/// What the process does once started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RunMode {
    /// Serve the configured listeners.
    #[default]
    Gateway,
    /// Only run the forward proxy.
    Proxy,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Gateway => "gateway",
            Self::Proxy => "proxy",
        })
    }
}

impl FromStr for RunMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "gateway" => Ok(Self::Gateway),
            "proxy" => Ok(Self::Proxy),
            other => Err(format!("unknown run mode '{other}'")),
        }
    }
}

/// The process-wide orchestrator. Shared behind an `Arc`.
pub struct Gateway {
    mode: RunMode,
    config: RwLock<Arc<GatewayConfig>>,
    collaborators: Collaborators,
    hooks: Arc<Hooks>,
    sessions: Arc<SessionRegistry>,
    acme: AcmeManager,
    listeners: Mutex<ListenerSet>,
    /// One count for the started gateway plus one per tracked listener.
    close_barrier: WaitGroup,
    /// One count per launched binder until it is tracked or gives up.
    bind_progress: WaitGroup,
    started: AtomicBool,
    closed: AtomicBool,
    script_hooks_attached: AtomicBool,
}

impl Gateway {
    pub fn new(mode: RunMode, config: GatewayConfig, collaborators: Collaborators) -> Arc<Self> {
        let hooks = Arc::new(Hooks::new());
        Arc::new(Self {
            mode,
            acme: AcmeManager::new(&config.acme),
            config: RwLock::new(Arc::new(config)),
            collaborators,
            sessions: Arc::new(SessionRegistry::new(Arc::clone(&hooks))),
            hooks,
            listeners: Mutex::new(ListenerSet::default()),
            close_barrier: WaitGroup::new(),
            bind_progress: WaitGroup::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            script_hooks_attached: AtomicBool::new(false),
        })
    }

    // ── Lifecycle ────────────────────────────────────────────────────────────

    /// Start serving. Must be called from within a tokio runtime; returns as
    /// soon as every binder is launched, without waiting for them to bind.
    pub fn start(self: &Arc<Self>) -> Result<(), GatewayError> {
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| GatewayError::NoRuntime)?;
        {
            let listeners = self.lock_listeners();
            if listeners.is_closing() {
                return Err(GatewayError::Closed);
            }
            if self.started.swap(true, Ordering::SeqCst) {
                return Err(GatewayError::AlreadyStarted);
            }
            self.close_barrier.add(1);
        }

        let result = match self.mode {
            RunMode::Gateway => self.start_gateway(&runtime),
            RunMode::Proxy => self.start_proxy(),
        };
        if result.is_err() {
            self.close_barrier.done();
            self.started.store(false, Ordering::SeqCst);
        }
        result
    }

    fn start_gateway(
        self: &Arc<Self>,
        runtime: &tokio::runtime::Handle,
    ) -> Result<(), GatewayError> {
        let config = self.config();

        let mut router = Router::new();
        if let Some(webroot) = config.webroot.as_deref().filter(|w| !w.is_empty()) {
            let webroot = config.resolve_path(webroot);
            info!(path = %webroot.display(), "serving static files");
            router = router.fallback_service(ServeDir::new(webroot));
        }

        let (router, registered) = self.register_transports(&config, router);
        if registered == 0 {
            warn!("no server engines configured");
            return Err(GatewayError::NoTransports);
        }
        let router = router.merge(server::routes(Arc::clone(self)));

        self.maybe_start_identd(&config);
        self.load_scripting(&config);

        self.bind_progress.add(config.servers.len());
        for server in &config.servers {
            let gateway = Arc::clone(self);
            runtime.spawn(listener::run(gateway, server.clone(), router.clone()));
        }
        info!(
            listeners = config.servers.len(),
            transports = registered,
            "gateway started"
        );
        Ok(())
    }

    fn start_proxy(&self) -> Result<(), GatewayError> {
        let config = self.config();
        let proxy = self.collaborators.proxy.as_ref().ok_or(GatewayError::NoProxy)?;
        let addr = listener::join_host_port(&config.proxy.bind, config.proxy.port);
        proxy.start(&addr).map_err(GatewayError::Proxy)?;
        info!(addr = %addr, "forward proxy started");
        Ok(())
    }

    fn register_transports(
        self: &Arc<Self>,
        config: &GatewayConfig,
        mut router: Router,
    ) -> (Router, usize) {
        let mut registered = 0;
        let mut seen = HashSet::new();
        for name in &config.transports {
            if !seen.insert(name.to_ascii_lowercase()) {
                warn!(transport = %name, "server engine listed more than once, ignoring repeat");
                continue;
            }
            match self.collaborators.transport(name) {
                Some(transport) => {
                    debug!(transport = %name, "registering transport");
                    router = transport.init(self, router);
                    registered += 1;
                },
                None => warn!(transport = %name, "invalid server engine"),
            }
        }
        (router, registered)
    }

    fn maybe_start_identd(&self, config: &GatewayConfig) {
        if !config.identd {
            return;
        }
        let Some(identd) = &self.collaborators.identd else {
            warn!("identd enabled but no identd server is available");
            return;
        };
        match identd.run() {
            Ok(()) => info!("identd server started"),
            Err(e) => warn!(error = %e, "failed to start identd server"),
        }
    }

    fn load_scripting(&self, config: &GatewayConfig) {
        let Some(path) = config.scripting.path.as_deref().filter(|p| !p.is_empty()) else {
            return;
        };
        if config.scripting.workers == 0 {
            return;
        }
        let Some(engine) = &self.collaborators.script_engine else {
            warn!("scripting configured but no script engine is available");
            return;
        };

        info!(workers = config.scripting.workers, "starting script workers");
        engine.start_workers(config.scripting.workers);
        if !self.script_hooks_attached.swap(true, Ordering::SeqCst) {
            engine.attach_hooks(&self.hooks);
        }

        let path = config.resolve_path(path);
        let source = match std::fs::read_to_string(&path) {
            Ok(source) => source,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "failed to read script");
                return;
            },
        };
        let module_dir = path.parent().unwrap_or(Path::new("."));
        match engine.load_script(module_dir, &source) {
            Ok(()) => info!(path = %path.display(), "script loaded"),
            Err(e) => warn!(path = %path.display(), error = %e, "failed to load script"),
        }
    }

    /// Re-read the config file and reload scripting. Listeners and sessions
    /// are left alone; endpoint changes need a restart.
    pub fn reload(&self) {
        let current = self.config();
        let Some(path) = current.config_file.clone() else {
            info!("no config file to reload");
            return;
        };

        let fresh = match load_config(&path) {
            Ok(fresh) => fresh,
            Err(e) => {
                warn!(
                    path = %path.display(),
                    error = %e,
                    "config reload failed, keeping current config"
                );
                return;
            },
        };
        if fresh.servers != current.servers {
            warn!("server endpoints changed, restart to apply");
        }

        let fresh = Arc::new(fresh);
        *self.config.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&fresh);
        info!(path = %path.display(), "config reloaded");

        self.load_scripting(&fresh);
    }

    /// Dispatch `gateway.closing`, close every tracked listener, then release
    /// the close barrier. Repeated calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            debug!("close already requested");
            return;
        }

        // Observers may set `halt`, but closing always proceeds.
        self.hooks.dispatch(&mut GatewayClosing::default());

        let (closed, started) = {
            let mut listeners = self.lock_listeners();
            (listeners.close_all(), self.started.load(Ordering::SeqCst))
        };
        for (listener, shutdown) in &closed {
            debug!(endpoint = %listener.endpoint, kind = %listener.kind, "closing listener");
            shutdown.cancel();
        }
        info!(listeners = closed.len(), "gateway closing");

        if started {
            self.close_barrier.done();
        }
    }

    /// Resolves once [`close`](Self::close) has run and every closed listener
    /// has stopped serving.
    pub async fn wait_close(&self) {
        self.close_barrier.wait().await;
    }

    /// Resolves once every launched binder has been tracked or has given up.
    pub async fn wait_ready(&self) {
        self.bind_progress.wait().await;
    }

    // ── Accessors ────────────────────────────────────────────────────────────

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// The active configuration. Swapped wholesale on reload.
    pub fn config(&self) -> Arc<GatewayConfig> {
        Arc::clone(&self.config.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn hooks(&self) -> &Arc<Hooks> {
        &self.hooks
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn acme(&self) -> &AcmeManager {
        &self.acme
    }

    pub fn collaborators(&self) -> &Collaborators {
        &self.collaborators
    }

    /// Listeners currently accepting connections.
    pub fn listeners(&self) -> Vec<ListenerInfo> {
        self.lock_listeners().snapshot()
    }

    // ── Listener bookkeeping ─────────────────────────────────────────────────

    pub(crate) fn bind_progress(&self) -> &WaitGroup {
        &self.bind_progress
    }

    pub(crate) fn track_listener(
        &self,
        endpoint: String,
        kind: ListenerKind,
        local_addr: Option<SocketAddr>,
    ) -> Result<(u64, CancellationToken), ListenerError> {
        self.lock_listeners()
            .track(&self.close_barrier, endpoint, kind, local_addr)
    }

    /// Called once by a tracked listener's task when it stops serving.
    pub(crate) fn listener_finished(&self, id: u64) {
        self.lock_listeners().untrack(id);
        self.close_barrier.done();
    }

    fn lock_listeners(&self) -> MutexGuard<'_, ListenerSet> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
