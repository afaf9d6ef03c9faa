//! Powermon collector binary
//!
//! - Loads the TOML config (path argument, `--config`, `POWERMON_CONFIG` or OS default)
//! - Registers the collector on first run and saves the issued token
//! - `--test` reads the meter once and prints the reading
//! - Runs the service until Ctrl-C / SIGTERM, then stops it with a 10 s budget

use anyhow::{bail, Context, Result};
use clap::Parser;
use powermon_collector::client::RegistrationRequest;
use powermon_collector::{CollectorConfig, CollectorService, DeviceReader, UploadClient, VERSION};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Power Collector - PZEM meter edge agent
#[derive(Parser, Debug)]
#[command(name = "powermon-collector", version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, env = "POWERMON_CONFIG")]
    config: Option<PathBuf>,

    /// Configuration file, same as --config
    #[arg(value_name = "CONFIG")]
    path: Option<PathBuf>,

    /// Read the meter once, print the reading and exit
    #[arg(long)]
    test: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // .env first so clap sees POWERMON_CONFIG from it
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config_path = match cli.path.or(cli.config) {
        Some(path) => path,
        None => CollectorConfig::config_file_path()?,
    };
    let mut config = CollectorConfig::load(Some(config_path.as_path()))
        .await
        .with_context(|| format!("Failed to load configuration from {}", config_path.display()))?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.logging.level))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("Power Collector v{} starting...", VERSION);

    if cli.test {
        return run_self_test(&config).await;
    }

    if config.needs_registration() {
        register(&mut config, &config_path).await?;
    }

    let service = CollectorService::open(&config, VERSION)
        .await
        .context("Failed to create collector service")?;
    service.start().await.context("Failed to start collector service")?;
    info!("Collector service running. Press Ctrl+C to stop.");

    let signal = wait_for_signal().await?;
    info!("Received {}, stopping collector...", signal);

    match tokio::time::timeout(STOP_TIMEOUT, service.stop()).await {
        Ok(Ok(())) => info!("Collector stopped gracefully"),
        Ok(Err(e)) => error!("Error while stopping collector: {}", e),
        Err(_) => warn!("Collector did not stop within {:?}, exiting anyway", STOP_TIMEOUT),
    }
    Ok(())
}

async fn run_self_test(config: &CollectorConfig) -> Result<()> {
    info!("Running in test mode...");
    let port = config.serial.port.clone();
    let baud = config.serial.baud_rate;
    let timeout = config.serial_timeout();
    let address = config.serial.address;

    let reading = tokio::task::spawn_blocking(move || {
        let mut device = DeviceReader::open(&port, baud, timeout)?.with_address(address);
        device.test_connection()
    })
    .await?
    .context("Device test failed")?;

    println!("Test successful. {}", reading);
    Ok(())
}

/// First run: trade the registration code for a token and persist it
async fn register(config: &mut CollectorConfig, config_path: &std::path::Path) -> Result<()> {
    if config.auth.registration_code.is_empty() {
        bail!("No token and no registration code configured");
    }
    if config.collector.id.is_empty() {
        config.collector.id = uuid::Uuid::new_v4().to_string();
        info!("Generated collector ID: {}", config.collector.id);
    }

    info!("Registering collector with server...");
    let mut client = UploadClient::new(&config.client_settings(), VERSION)?;
    let request = RegistrationRequest {
        registration_code: config.auth.registration_code.clone(),
        collector_id: config.collector.id.clone(),
        name: config.collector.name.clone(),
        description: config.collector.description.clone(),
        location: config.collector.location.clone(),
        version: VERSION.to_string(),
    };
    let registration = client
        .register(&request)
        .await
        .context("Failed to register collector")?;

    config.apply_registration(&registration);
    config
        .save(config_path)
        .await
        .context("Failed to save configuration after registration")?;

    match &registration.token_expires {
        Some(expires) => info!("Collector registered (token expires {})", expires),
        None => info!("Collector registered"),
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() -> Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut terminate = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for Ctrl+C")?;
            Ok("SIGINT")
        }
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> Result<&'static str> {
    tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl+C")?;
    Ok("Ctrl+C")
}
