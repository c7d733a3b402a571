//! Command-line interface definitions.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Veles: multi-user TCP VPN with peer-to-peer routing.
#[derive(Parser, Debug)]
#[command(name = "veles", version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file path.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log level filter (overrides config).
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the VPN server.
    Serve(ServeArgs),
    /// Connect to a VPN server.
    Connect(ConnectArgs),
    /// Generate a pre-shared key.
    GenKey(GenKeyArgs),
}

#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Tunnel listen address.
    #[arg(long)]
    pub listen: Option<SocketAddr>,

    /// Admin HTTP surface address.
    #[arg(long)]
    pub admin: Option<SocketAddr>,

    /// Disable the TLS wrapper (plain TCP tunnel).
    #[arg(long)]
    pub no_tls: bool,

    /// TLS certificate path (PEM).
    #[arg(long)]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key path (PEM).
    #[arg(long)]
    pub tls_key: Option<PathBuf>,

    /// Pre-shared key file.
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// TUN device name to request.
    #[arg(long)]
    pub tun_name: Option<String>,
}

#[derive(Parser, Debug)]
pub struct ConnectArgs {
    /// Server endpoint, host:port.
    #[arg(long, env = "VELES_SERVER")]
    pub server: Option<String>,

    /// Request per-record encryption.
    #[arg(long)]
    pub encrypt: bool,

    /// Disable the TLS wrapper (plain TCP tunnel).
    #[arg(long)]
    pub no_tls: bool,

    /// Pre-shared key file.
    #[arg(long)]
    pub key_file: Option<PathBuf>,

    /// Run indefinitely instead of the development safety timeout.
    #[arg(long)]
    pub no_timeout: bool,

    /// Extension IPC port on loopback.
    #[arg(long)]
    pub ipc_port: Option<u16>,

    /// TUN device name to request (Linux only).
    #[arg(long)]
    pub tun_name: Option<String>,
}

#[derive(Parser, Debug)]
pub struct GenKeyArgs {
    /// Write the key here instead of stdout.
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}
