//! Gateway core: listener lifecycle, TLS and ACME certificates, the session
//! registry and lifecycle hooks.
//!
//! Lifecycle:
//! 1. Build a [`Gateway`] from a loaded config and the [`Collaborators`]
//!    (transport adapters, scripting, identd, forward proxy)
//! 2. [`Gateway::start`] mounts transports and built-in routes on one router
//!    and launches one binder task per configured server
//! 3. Transport adapters register sessions in the [`SessionRegistry`]
//! 4. [`Gateway::close`] closes every tracked listener; [`Gateway::wait_close`]
//!    resolves once they have all stopped
//!
//! Wire protocols, the IRC client itself, scripting, identd and proxying live
//! behind the traits in [`collaborators`].

pub mod acme;
pub mod collaborators;
pub mod error;
pub mod gateway;
pub mod hooks;
pub mod listener;
pub mod net;
pub mod registry;
pub mod server;
pub mod shutdown;
pub mod tls;

pub use {
    collaborators::{
        Collaborators, ForwardProxy, IdentdServer, RawTransport, ScriptEngine, Transport,
    },
    error::{GatewayError, ListenerError},
    gateway::{Gateway, RunMode},
    hooks::{GatewayClosing, HookEvent, Hooks, SessionStateChanged, StatusLine},
    listener::{Binding, ListenerInfo, ListenerKind},
    registry::{Session, SessionId, SessionRegistry, SessionState, SessionStatus, Upstream},
};
