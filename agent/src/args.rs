use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Address to bind the agent RPC server on
    #[arg(long, default_value = "0.0.0.0:7646")]
    pub address: SocketAddr,

    /// URL the control plane's RPC endpoint is reachable at
    #[arg(long)]
    pub control_plane_url: String,

    /// TLS name the control plane's certificate is expected to carry
    #[arg(long, default_value = "localhost")]
    pub control_plane_name: String,

    /// Identifier this host registered under
    #[arg(long)]
    pub host_id: String,

    /// Path to the root CA certificate
    #[arg(long)]
    pub ca_cert: PathBuf,

    /// Path to this agent's certificate
    #[arg(long)]
    pub cert: PathBuf,

    /// Path to this agent's private key
    #[arg(long)]
    pub key: PathBuf,

    /// Directory app working copies live in
    #[arg(long, default_value = "/var/lib/paasdeploy")]
    pub workdir: PathBuf,

    /// Seconds between heartbeats
    #[arg(long, default_value_t = 30)]
    pub heartbeat_interval: u64,
}
