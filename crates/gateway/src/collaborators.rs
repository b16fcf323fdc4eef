//! Seams for the components the gateway drives but does not implement:
//! transport adapters, the raw TCP adapter, scripting, identd and the
//! forward proxy.

use std::{path::Path, sync::Arc};

use {
    async_trait::async_trait, axum::Router, tokio::net::TcpListener,
    tokio_util::sync::CancellationToken,
};

use crate::{Gateway, hooks::Hooks};

/// An HTTP-based transport adapter (websocket, sockjs, kiwiirc, ...).
pub trait Transport: Send + Sync {
    /// Name matched against the `transports` config list.
    fn name(&self) -> &str;

    /// Mount the adapter's routes on the shared router.
    fn init(&self, gateway: &Arc<Gateway>, router: Router) -> Router;
}

/// Adapter for `tcp:` endpoints. Owns the accept loop of the socket it is
/// handed and must stop accepting once `shutdown` is cancelled.
#[async_trait]
pub trait RawTransport: Send + Sync {
    async fn serve(
        &self,
        gateway: Arc<Gateway>,
        listener: TcpListener,
        shutdown: CancellationToken,
    );
}

pub trait ScriptEngine: Send + Sync {
    fn start_workers(&self, workers: usize);

    /// Subscribe the engine's observers. Called once per gateway.
    fn attach_hooks(&self, hooks: &Hooks);

    /// Load (or reload) a script. `module_dir` is the directory the script
    /// lives in, for resolving its own imports.
    fn load_script(&self, module_dir: &Path, source: &str) -> anyhow::Result<()>;
}

pub trait IdentdServer: Send + Sync {
    fn run(&self) -> anyhow::Result<()>;
}

pub trait ForwardProxy: Send + Sync {
    fn start(&self, addr: &str) -> anyhow::Result<()>;
}

/// Everything handed to [`Gateway::new`] from the outside.
#[derive(Clone, Default)]
pub struct Collaborators {
    pub transports: Vec<Arc<dyn Transport>>,
    pub raw_transport: Option<Arc<dyn RawTransport>>,
    pub script_engine: Option<Arc<dyn ScriptEngine>>,
    pub identd: Option<Arc<dyn IdentdServer>>,
    pub proxy: Option<Arc<dyn ForwardProxy>>,
}

impl Collaborators {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn with_raw_transport(mut self, raw: Arc<dyn RawTransport>) -> Self {
        self.raw_transport = Some(raw);
        self
    }

    pub fn with_script_engine(mut self, engine: Arc<dyn ScriptEngine>) -> Self {
        self.script_engine = Some(engine);
        self
    }

    pub fn with_identd(mut self, identd: Arc<dyn IdentdServer>) -> Self {
        self.identd = Some(identd);
        self
    }

    pub fn with_proxy(mut self, proxy: Arc<dyn ForwardProxy>) -> Self {
        self.proxy = Some(proxy);
        self
    }

    /// Look up a transport by its configured name (case-insensitive).
    pub fn transport(&self, name: &str) -> Option<&Arc<dyn Transport>> {
        self.transports
            .iter()
            .find(|t| t.name().eq_ignore_ascii_case(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Named(&'static str);

    impl Transport for Named {
        fn name(&self) -> &str {
            self.0
        }

        fn init(&self, _gateway: &Arc<Gateway>, router: Router) -> Router {
            router
        }
    }

    #[test]
    fn transport_lookup_ignores_case() {
        let collaborators = Collaborators::new()
            .with_transport(Arc::new(Named("websocket")))
            .with_transport(Arc::new(Named("sockjs")));

        assert!(collaborators.transport("WebSocket").is_some());
        assert!(collaborators.transport("sockjs").is_some());
        assert!(collaborators.transport("kiwiirc").is_none());
    }
}
