use std::{net::SocketAddr, path::PathBuf};

use clap::{Args, Parser, Subcommand};

use crate::{session::DEFAULT_QUEUE_CAPACITY, transfer::DEFAULT_CHUNK_SIZE};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the relay, accepting TCP connections.
    Serve(ServeArgs),
    /// Connect to a relay from the terminal.
    Client(ClientArgs),
}

#[derive(Args, Debug, Clone)]
pub struct ServeArgs {
    /// Socket address to bind. Use port 0 for an ephemeral port.
    #[arg(long, default_value = "127.0.0.1:8088")]
    pub listen: SocketAddr,

    /// Directory where completed uploads are stored, one subdirectory per room.
    #[arg(long, default_value = "uploads")]
    pub uploads_dir: PathBuf,

    /// Persist message history as JSON files in this directory.
    #[arg(long)]
    pub history_dir: Option<PathBuf>,

    /// Envelopes buffered per client before a slow client is dropped.
    #[arg(long, default_value_t = DEFAULT_QUEUE_CAPACITY)]
    pub queue_capacity: usize,

    /// Seconds of inbound silence before a connection is closed.
    #[arg(long, default_value_t = 300, value_parser = clap::value_parser!(u64).range(1..))]
    pub idle_timeout_secs: u64,
}

#[derive(Args, Debug, Clone)]
pub struct ClientArgs {
    /// Address of the relay to connect to.
    #[arg(long, default_value = "127.0.0.1:8088")]
    pub server: SocketAddr,

    #[arg(long)]
    pub username: String,

    #[arg(long)]
    pub password: String,

    /// Create the account instead of logging in.
    #[arg(long)]
    pub register: bool,

    /// Where files received from other members are written.
    #[arg(long, default_value = "downloads")]
    pub downloads_dir: PathBuf,

    /// Bytes per chunk when sending files.
    #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE)]
    pub chunk_size: usize,
}
