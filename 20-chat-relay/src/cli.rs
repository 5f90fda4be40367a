use std::{net::SocketAddr, path::PathBuf};

use clap::Parser;

use crate::server::DEFAULT_OUTBOX_CAPACITY;

/// Multi-room chat relay with a side channel for file exchange.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Socket address for chat connections. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:5555")]
    pub listen: SocketAddr,

    /// Socket address for file uploads and downloads.
    #[arg(long, default_value = "127.0.0.1:6000")]
    pub file_listen: SocketAddr,

    /// Directory that uploaded files are written to. Created if missing.
    #[arg(long, default_value = "server_files")]
    pub storage_dir: PathBuf,

    /// Events a session may have queued before fan-out to it is dropped.
    #[arg(long, default_value_t = DEFAULT_OUTBOX_CAPACITY)]
    pub outbox_capacity: usize,
}
