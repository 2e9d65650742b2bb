use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use streambroker::broker::Broker;
use streambroker::config::{CliOverrides, Config, LogFormat};
use streambroker::driver::AdbTransport;
use streambroker::state::AppState;
use streambroker::web;

/// Log level override accepted on the command line; threaded into
/// `Config::log.level` via `apply_cli_overrides`.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "streambroker")]
#[command(version, about = "WebRTC broker for scrcpy-protocol Android displays", long_about = None)]
struct CliArgs {
    /// Path to the TOML config file
    #[arg(short = 'c', long, value_name = "FILE", default_value = "streambroker.toml")]
    config: PathBuf,

    /// Signaling listen address (overrides config file)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<IpAddr>,

    /// Signaling listen port (overrides config file)
    #[arg(short = 'p', long, value_name = "PORT")]
    port: Option<u16>,

    /// adb serial of the device to drive (overrides config file)
    #[arg(short = 's', long, value_name = "SERIAL")]
    serial: Option<String>,

    /// STUN server URI (overrides config file)
    #[arg(long, value_name = "URI")]
    stun_server: Option<String>,

    /// Log level (error, warn, info, debug, trace); overrides config file
    #[arg(short = 'l', long, value_name = "LEVEL")]
    log_level: Option<LogLevel>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    let mut config = Config::load(&args.config)?;
    config.apply_cli_overrides(&CliOverrides {
        signaling_port: args.port,
        bind_address: args.address,
        adb_serial: args.serial,
        log_level: args.log_level.map(LogLevel::as_str).map(str::to_owned),
        stun_server: args.stun_server,
    });

    init_logging(&config.log.level, config.log.format);
    tracing::info!("starting streambroker v{}", env!("CARGO_PKG_VERSION"));

    let transport = Arc::new(AdbTransport::new("adb"));
    let broker = Broker::new(config.clone(), transport);

    let state = AppState::new(Arc::clone(&broker), config.clone());
    let router = web::create_router(state);

    let bind_addr = SocketAddr::new(config.server.bind_address, config.server.signaling_port);
    let std_listener = streambroker::utils::bind_tcp_listener(bind_addr)?;
    let listener = tokio::net::TcpListener::from_std(std_listener)?;
    tracing::info!(%bind_addr, "signaling endpoint listening");

    tokio::spawn(Arc::clone(&broker).run_housekeeping());

    let server = axum::serve(listener, router).with_graceful_shutdown(shutdown_signal());
    server.await?;

    broker.shutdown().await;
    tracing::info!("streambroker exited cleanly");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received, draining broker");
}

fn init_logging(level: &str, format: LogFormat) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("streambroker={level},tower_http={level}"))
    });

    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}
