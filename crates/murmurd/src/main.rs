//! murmurd: delay-tolerant opportunistic peer-to-peer messaging daemon.

use clap::Parser;
use murmurd::config::AppConfig;
use murmurd::Daemon;
use std::process::ExitCode;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> ExitCode {
    let config = AppConfig::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("murmurd=info".parse().unwrap()))
        .init();

    info!("murmurd v{}", env!("CARGO_PKG_VERSION"));

    let tcp_port = config.tcp_port;
    let daemon = match Daemon::new(config) {
        Ok(daemon) => daemon,
        Err(err) => {
            error!("failed to initialize daemon: {err}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = daemon.shutdown_handle();
    tokio::spawn(async move {
        tokio::signal::ctrl_c().await.ok();
        info!("received shutdown signal");
        let _ = shutdown.send(());
    });

    if let Err(err) = daemon.run(tcp_port).await {
        error!("daemon error: {err}");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
