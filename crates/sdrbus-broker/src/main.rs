use std::path::PathBuf;

use clap::Parser;
use tracing::{error, info};

use sdrbus_broker::config::BrokerConfig;
use sdrbus_broker::{event_loop, signal, Broker};

#[derive(Parser, Debug)]
#[command(name = "sdrbus-broker", about = "sdrbus message bus and plugin host")]
struct Args {
    /// Path to the broker's TOML configuration file.
    #[arg(short, long, default_value = "config/broker.toml")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match std::fs::read_to_string(&args.config) {
        Ok(raw) => BrokerConfig::from_str(&raw).map_err(|e| {
            error!(path = %args.config.display(), error = %e, "failed to parse broker config");
            e
        })?,
        Err(e) => {
            info!(
                path = %args.config.display(),
                error = %e,
                "config file not found, using defaults"
            );
            BrokerConfig::from_str("[broker]\n")?
        }
    };

    info!(socket = %config.broker.socket_path, "sdrbus-broker starting");

    signal::install();

    let broker = Broker::new(config);
    let listener = event_loop::bind(broker.socket_path())?;
    info!(socket = broker.socket_path(), "listening");

    broker.feeds().ensure("cli-control");
    broker.autoload_addons();

    event_loop::run(&broker, listener)?;

    info!("broker shutting down, unlinking socket");
    let _ = std::fs::remove_file(broker.socket_path());

    Ok(())
}
