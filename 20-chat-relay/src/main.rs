use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::info;

use chat_relay::{
    cli::Cli,
    directory::Directory,
    files::{FileServer, FileStore},
    relay::Relay,
    server::{ChatServer, shutdown_on, wait_for_shutdown},
};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let store = FileStore::open(&cli.storage_dir)
        .await
        .with_context(|| format!("failed to prepare {}", cli.storage_dir.display()))?;
    let relay = Relay::new(Arc::new(Directory::new()));

    let listener = TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind chat listener on {}", cli.listen))?;
    let chat = ChatServer::new(listener, relay.clone()).with_outbox_capacity(cli.outbox_capacity);

    let listener = TcpListener::bind(cli.file_listen)
        .await
        .with_context(|| format!("failed to bind file listener on {}", cli.file_listen))?;
    let files = FileServer::new(listener, Arc::new(store), relay);

    info!("chat listening on {}", chat.local_addr()?);
    info!("files listening on {}", files.local_addr()?);

    let shutdown = shutdown_on(tokio::signal::ctrl_c());
    tokio::try_join!(
        chat.run_until(wait_for_shutdown(shutdown.clone())),
        files.run_until(wait_for_shutdown(shutdown)),
    )?;

    Ok(())
}
