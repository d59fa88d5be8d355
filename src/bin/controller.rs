use std::path::PathBuf;

use clap::{Parser, ValueEnum};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use doorbell_hub::config::ControllerConfig;
use doorbell_hub::controller::DoorbellController;

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

/// Doorbell controller command line arguments
#[derive(Parser, Debug)]
#[command(name = "doorbell-controller")]
#[command(version, about = "On-device doorbell controller", long_about = None)]
struct CliArgs {
    /// Path to the controller configuration file
    #[arg(short = 'c', long, value_name = "FILE", default_value = "settings.json")]
    config: PathBuf,

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

    tracing::info!(
        "Starting doorbell-controller v{}",
        env!("CARGO_PKG_VERSION")
    );

    let config = ControllerConfig::load(&args.config)?;
    tracing::info!(
        "Configuration loaded from {} (device {})",
        args.config.display(),
        config.device_id
    );

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            tokio::signal::ctrl_c()
                .await
                .expect("Failed to install CTRL+C handler");
            tracing::info!("Shutdown signal received");
            let _ = shutdown_tx.send(());
        });
    }

    let controller = DoorbellController::with_hardware(config, shutdown_tx)?;
    controller.run().await?;

    tracing::info!("Controller shutdown complete");
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
        LogLevel::Error => "doorbell_hub=error",
        LogLevel::Warn => "doorbell_hub=warn",
        LogLevel::Info => "doorbell_hub=info",
        LogLevel::Debug => "doorbell_hub=debug",
        LogLevel::Trace => "doorbell_hub=trace",
    };

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
