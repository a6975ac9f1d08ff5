mod config;
mod logging;
mod server;

use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::info;
use whipcast_sfu::Relay;

use config::Config;
use server::WhipcastServer;

#[derive(Parser, Debug)]
#[command(name = "whipcast")]
#[command(about = "WHIP/WHEP video relay", long_about = None)]
struct Args {
    /// Configuration file (YAML, TOML or JSON); environment variables
    /// prefixed with WHIPCAST_ override its values
    #[arg(short, long, env = "WHIPCAST_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration
    let config = match args.config.as_deref() {
        Some(path) => Config::from_file(path)?,
        None => Config::from_env()?,
    };

    // 2. Validate configuration (fail fast on misconfigurations)
    if let Err(errors) = config.validate() {
        for e in &errors {
            eprintln!("Config validation error: {e}");
        }
        return Err(anyhow::anyhow!(
            "Configuration validation failed with {} error(s)",
            errors.len()
        ));
    }

    // 3. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Whipcast relay starting...");
    info!("HTTP address: {}", config.http_address());
    info!(
        codec = %config.relay.codec.mime_type,
        payload_type = config.relay.codec.payload_type,
        "Video codec"
    );

    // 4. Start the relay and serve
    let relay = Arc::new(Relay::with_webrtc(config.relay.clone()));
    WhipcastServer::new(config, relay).start().await
}
