use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;

use depoy::cli::{generate_config_template, Cli, Command};
use depoy::{Config, Error, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Config { output }) = cli.command {
        let template = generate_config_template();
        match output {
            Some(path) => std::fs::write(&path, template)
                .map_err(|e| Error::Config(format!("cannot write {path}: {e}")))?,
            None => print!("{template}"),
        }
        return Ok(());
    }

    let config = Config::load(&cli.config)?;
    depoy::telemetry::init(&config.gateway.log_level);

    let gateway = config.build()?;
    tracing::info!(
        routes = gateway.routes().len(),
        addr = %gateway.addr,
        "configuration loaded"
    );

    let (shutdown_tx, _) = watch::channel(false);
    {
        let shutdown_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown signal received");
                let _ = shutdown_tx.send(true);
            }
        });
    }

    if let Some(admin_addr) = config.gateway.admin_addr {
        let gateway = Arc::clone(&gateway);
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let shutdown = async move {
                let _ = shutdown_rx.changed().await;
            };
            if let Err(err) = depoy::admin::run(admin_addr, gateway, shutdown).await {
                tracing::error!(%err, "admin listener failed");
            }
        });
    }

    let mut shutdown_rx = shutdown_tx.subscribe();
    let shutdown = async move {
        let _ = shutdown_rx.changed().await;
    };
    let result = Arc::clone(&gateway).run(shutdown).await;
    gateway.stop();
    result
}
