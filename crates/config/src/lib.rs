//! Gateway configuration: schema types, file discovery and loading.
//!
//! Config files may be TOML, YAML or JSON (picked by extension) and support
//! `${ENV_VAR}` placeholders in any value.

pub mod env_subst;
pub mod loader;
pub mod schema;

pub use {
    loader::{clear_config_dir, discover_and_load, find_config_file, load_config, set_config_dir},
    schema::{
        AcmeConfig, GatewayConfig, LogLevel, LoggingConfig, ProxyConfig, ScriptingConfig,
        ServerConfig,
    },
};
