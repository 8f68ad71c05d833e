use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// Address the HTTP surface (webhooks, SSE) binds on
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub api_address: SocketAddr,

    /// Address the agent control channel binds on
    #[arg(long, default_value = "0.0.0.0:7645")]
    pub rpc_address: SocketAddr,

    /// Path of the SQLite database
    #[arg(long, default_value = "deployer.sqlite")]
    pub db_path: PathBuf,

    /// Deployment workers draining the queue
    #[arg(long, default_value_t = 4)]
    pub workers: usize,

    /// Prefix built images are tagged with
    #[arg(long, default_value = "paasdeploy.local")]
    pub registry_prefix: String,

    /// Operator master key the CA material is sealed under
    #[arg(long)]
    pub master_key: String,

    /// Hostname the control plane's server certificate is issued for
    #[arg(long, default_value = "localhost")]
    pub hostname: String,

    /// Shared secret push webhooks are signed with
    #[arg(long)]
    pub webhook_secret: String,

    /// Seconds without a heartbeat before a host goes offline
    #[arg(long, default_value_t = 90)]
    pub liveness_window_secs: u64,

    /// Heartbeat interval handed to registering agents
    #[arg(long, default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// Agent used for apps without an assigned host
    #[arg(long, default_value = "127.0.0.1")]
    pub local_agent_address: String,

    #[arg(long, default_value_t = 7646)]
    pub local_agent_port: u16,

    /// TLS name the local agent's certificate carries
    #[arg(long, default_value = "localhost")]
    pub local_agent_name: String,

    /// Grace period workers get to reach a terminal state on shutdown
    #[arg(long, default_value_t = 30)]
    pub shutdown_grace_secs: u64,
}
