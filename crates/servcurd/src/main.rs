use anyhow::Result;
use clap::Parser;
use servcurd::DaemonConfig;
use tracing::Level;

#[tokio::main]
async fn main() -> Result<()> {
    let config = DaemonConfig::parse();
    let level = if config.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    servcur_core::init_tracing(config.log_json, level);

    servcurd::server::run(config).await
}
