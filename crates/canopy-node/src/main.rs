use anyhow::Result;
use canopy_node::config::{Cli, NodeConfig};
use canopy_node::{console, reactor};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = NodeConfig::from_cli(&cli)?;

    let mut node = reactor::spawn(cfg).await?;
    let console_task = tokio::spawn(console::run(
        node.commands.clone(),
        node.subscribe_shutdown(),
    ));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("interrupt received, shutting down");
            node.shutdown();
            let _ = (&mut node.task).await;
        }
        outcome = &mut node.task => {
            if let Err(err) = outcome {
                tracing::error!(%err, "node task failed");
            }
        }
    }
    console_task.abort();
    Ok(())
}
