use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Use JSON logs in production (MSIM_LOG_JSON=1), human-readable otherwise
    let json_logs = std::env::var("MSIM_LOG_JSON").unwrap_or_default() == "1";
    let filter = EnvFilter::from_default_env().add_directive("msim_server=info".parse()?);
    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = msim_server::config::ServerConfig::parse();
    tracing::info!("Starting MSIM server on port {}", config.port);
    let (range_start, range_end) = config.file_port_range();
    tracing::info!("File transfer port range: {range_start}-{range_end}");

    let server = msim_server::server::Server::new(config);
    server.run().await
}
