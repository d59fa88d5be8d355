use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use doorbell_hub::auth::TokenService;
use doorbell_hub::config::ConfigStore;
use doorbell_hub::push::PushService;
use doorbell_hub::signaling::SignalingBroker;
use doorbell_hub::state::AppState;
use doorbell_hub::store::{self, CaptureStore, FcmDeviceStore, NotificationStore};
use doorbell_hub::web;

/// Log level for the application
#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

/// Doorbell hub command line arguments
#[derive(Parser, Debug)]
#[command(name = "doorbell-hub")]
#[command(version, about = "Doorbell camera hub", long_about = None)]
struct CliArgs {
    /// Listen address (overrides database config)
    #[arg(short = 'a', long, value_name = "ADDRESS")]
    address: Option<String>,

    /// HTTP port (overrides database config)
    #[arg(short = 'p', long, value_name = "PORT")]
    http_port: Option<u16>,

    /// Data directory path (default: /etc/doorbell-hub)
    #[arg(short = 'd', long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Issue a session token for the given subject ("rpi" or a user id),
    /// print it, and exit
    #[arg(long, value_name = "SUBJECT")]
    issue_token: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short = 'l', long, value_name = "LEVEL", default_value = "info")]
    log_level: LogLevel,

    /// Increase verbosity (-v for debug, -vv for trace)
    #[arg(short = 'v', long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = CliArgs::parse();

    init_logging(args.log_level, args.verbose);

    tracing::info!("Starting doorbell-hub v{}", env!("CARGO_PKG_VERSION"));

    let data_dir = args.data_dir.unwrap_or_else(get_data_dir);
    tracing::info!("Data directory: {}", data_dir.display());
    tokio::fs::create_dir_all(&data_dir).await?;

    // Configuration store (also owns the database pool)
    let db_path = data_dir.join("doorbell-hub.db");
    let config_store = ConfigStore::open(&db_path).await?;
    store::init_schema(config_store.pool()).await?;

    let mut config = (*config_store.get()).clone();

    if let Some(addr) = args.address {
        config.web.bind_address = addr;
    }
    if let Some(port) = args.http_port {
        config.web.http_port = port;
    }

    if config.jwt.access.key.is_empty() {
        tracing::warn!("JWT access key is empty; sessions are not secure until one is configured");
    }

    let tokens = TokenService::new(&config.jwt)?;

    // Token provisioning mode: print and exit
    if let Some(subject) = args.issue_token {
        let (access, refresh) = tokens.issue(&subject)?;
        println!("access:  {}", access);
        println!("refresh: {}", refresh);
        return Ok(());
    }

    // Capture directory (rebase a relative path under the data dir)
    if !PathBuf::from(&config.capture_dir).is_absolute() {
        let capture_dir = data_dir.join(&config.capture_dir);
        config.capture_dir = capture_dir.to_string_lossy().to_string();
    }
    tokio::fs::create_dir_all(&config.capture_dir).await?;
    {
        let resolved = config.clone();
        config_store.update(|c| *c = resolved).await?;
    }

    // Persistence stores share the config pool
    let pool = config_store.pool().clone();
    let notifications = NotificationStore::new(pool.clone());
    let captures = CaptureStore::new(pool.clone());
    let fcm_devices = FcmDeviceStore::new(pool);

    let push = PushService::with_http_sender(fcm_devices.clone(), &config.fcm, &config.timeouts);

    let broker = Arc::new(SignalingBroker::new());

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let state = AppState::new(
        config_store,
        tokens,
        notifications,
        captures,
        fcm_devices,
        push,
        broker,
        shutdown_tx.clone(),
    );

    let app = web::create_router(state);

    let addr: SocketAddr = format!("{}:{}", config.web.bind_address, config.web.http_port)
        .parse()
        .map_err(|_| {
            anyhow::anyhow!(
                "invalid bind address {}:{}",
                config.web.bind_address,
                config.web.http_port
            )
        })?;

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Starting HTTP server on {}", addr);

    let shutdown_signal = async move {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install CTRL+C handler");
        tracing::info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}

/// Initialize logging with tracing
fn init_logging(level: LogLevel, verbose_count: u8) {
    let effective_level = match verbose_count {
        0 => level,
        1 => LogLevel::Debug,
        _ => LogLevel::Trace,
    };

    let filter = match effective_level {
        LogLevel::Error => "doorbell_hub=error,tower_http=error",
        LogLevel::Warn => "doorbell_hub=warn,tower_http=warn",
        LogLevel::Info => "doorbell_hub=info,tower_http=info",
        LogLevel::Debug => "doorbell_hub=debug,tower_http=debug",
        LogLevel::Trace => "doorbell_hub=trace,tower_http=debug",
    };

    // Environment variable takes highest priority
    let env_filter =
        tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| filter.into());

    if let Err(err) = tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
    {
        eprintln!("failed to initialize tracing: {}", err);
    }
}

/// Get the application data directory
fn get_data_dir() -> PathBuf {
    if let Ok(path) = std::env::var("DOORBELL_HUB_DATA_DIR") {
        return PathBuf::from(path);
    }

    PathBuf::from("/etc/doorbell-hub")
}
