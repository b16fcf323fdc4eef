mod logging;

use std::{path::PathBuf, sync::Arc};

use {
    clap::{Parser, ValueEnum},
    tracing::{info, warn},
    tracing_appender::non_blocking::WorkerGuard,
    tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt},
    webirc_config::GatewayConfig,
    webirc_gateway::{Collaborators, Gateway, RunMode},
};

#[derive(Parser)]
#[command(name = "webirc", version, about = "IRC gateway for web clients")]
struct Cli {
    /// Config file. Searched for in the usual locations when omitted.
    #[arg(long, env = "WEBIRC_CONFIG")]
    config: Option<PathBuf>,

    /// Directory to search for the config file instead of the defaults.
    #[arg(long, env = "WEBIRC_CONFIG_DIR", conflicts_with = "config")]
    config_dir: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Mode::Gateway)]
    run_mode: Mode,

    /// Log level (trace, debug, info, warn, error). Overrides the config file.
    #[arg(long)]
    log_level: Option<String>,

    /// Output logs as JSON instead of human-readable.
    #[arg(long, default_value_t = false)]
    json_logs: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum Mode {
    Gateway,
    Proxy,
}

impl From<Mode> for RunMode {
    fn from(mode: Mode) -> Self {
        match mode {
            Mode::Gateway => Self::Gateway,
            Mode::Proxy => Self::Proxy,
        }
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<GatewayConfig> {
    if let Some(path) = &cli.config {
        return webirc_config::load_config(path);
    }
    if let Some(dir) = &cli.config_dir {
        webirc_config::set_config_dir(dir.clone());
    }
    Ok(webirc_config::discover_and_load())
}

fn init_telemetry(cli: &Cli, config: &GatewayConfig) -> WorkerGuard {
    let level = cli
        .log_level
        .as_deref()
        .unwrap_or(config.log_level.as_directive());
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let (writer, guard) =
        logging::bounded_writer(config.logging.channel_capacity, std::io::stderr());

    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_writer(writer),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_ansi(false)
                    .with_writer(writer),
            )
            .init();
    }
    guard
}

/// SIGHUP reloads; SIGINT and SIGTERM close the gateway.
#[cfg(unix)]
async fn handle_signals(gateway: Arc<Gateway>) -> std::io::Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut hangup = signal(SignalKind::hangup())?;
    let mut terminate = signal(SignalKind::terminate())?;
    loop {
        tokio::select! {
            _ = hangup.recv() => {
                info!("received SIGHUP, reloading config");
                gateway.reload();
            },
            _ = terminate.recv() => {
                info!("received SIGTERM, closing");
                gateway.close();
                return Ok(());
            },
            result = tokio::signal::ctrl_c() => {
                result?;
                info!("received SIGINT, closing");
                gateway.close();
                return Ok(());
            },
        }
    }
}

#[cfg(not(unix))]
async fn handle_signals(gateway: Arc<Gateway>) -> std::io::Result<()> {
    tokio::signal::ctrl_c().await?;
    info!("received interrupt, closing");
    gateway.close();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let config = load_config(&cli)?;
    // Dropping the guard flushes queued log lines.
    let _logs = init_telemetry(&cli, &config);

    let mode = RunMode::from(cli.run_mode);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        mode = %mode,
        config = ?config.config_file,
        "webircgateway starting"
    );

    // Transport adapters, scripting and identd are supplied by embedders.
    let gateway = Gateway::new(mode, config, Collaborators::new());
    run(&gateway).await
}

async fn run(gateway: &Arc<Gateway>) -> anyhow::Result<()> {
    gateway.start()?;

    let signals = {
        let gateway = Arc::clone(gateway);
        tokio::spawn(async move {
            if let Err(e) = handle_signals(gateway).await {
                warn!(error = %e, "signal handling unavailable");
            }
        })
    };

    gateway.wait_close().await;
    signals.abort();
    info!("gateway closed");
    Ok(())
}
