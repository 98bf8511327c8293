use anyhow::Result;
use clap::Parser;
use fwcrypt_core::config::config_path;
use fwcrypt_web::{ServerConfig, WebServer};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "fwcrypt-web")]
#[command(about = "Firmware cryptographic analysis API server")]
struct Args {
    /// Server configuration file (defaults to $FWCRYPT_CONFIG)
    #[arg(short, long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let path: Option<PathBuf> = config_path(args.config.as_deref());
    let config = ServerConfig::load_or_default(path.as_deref())?;
    if config.api_keys.is_empty() {
        log::warn!("No API keys configured; only /health will answer");
    }
    let server = WebServer::new(config, path)?;
    server.run().await
}
