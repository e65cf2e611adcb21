use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use node_app::{format_event, Args};
use node_mesh::Node;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Chat goes to stdout, logs to stderr
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = args.node_config()?;
    let node = Node::new(config).context("create node")?;
    node.start().await.context("start node")?;
    node.join(&args.group).await.context("join group")?;
    info!(
        "{} ({}) joined {} at {}",
        node.name(),
        node.uuid(),
        args.group,
        node.endpoint().await.unwrap_or_default()
    );

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    let text = line.trim();
                    if text.is_empty() {
                        continue;
                    }
                    if let Err(e) = node.shout_str(&args.group, text).await {
                        warn!("shout failed: {e}");
                    }
                }
                Ok(None) => {
                    info!("end of input");
                    break;
                }
                Err(e) => {
                    warn!("stdin read failed: {e}");
                    break;
                }
            },
            event = node.recv() => match event {
                Ok(event) => println!("{}", format_event(&event)),
                Err(e) => {
                    warn!("node closed: {e}");
                    break;
                }
            },
        }
    }

    node.stop().await;
    info!("stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("ctrl-c handler failed: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(e) => {
                warn!("SIGTERM handler failed: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received ctrl-c"),
        _ = terminate => info!("received SIGTERM"),
    }
}
