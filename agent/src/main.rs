use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use paasdeploy_agent::args::Args;
use paasdeploy_agent::docker::Engine;
use paasdeploy_agent::executor::{logs::LogRouter, Executor};
use paasdeploy_agent::heartbeat::{self, HeartbeatConfig};
use paasdeploy_agent::server::AgentService;
use paasdeploy_proto::agent::agent_server::AgentServer;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, ClientTlsConfig, Identity, Server, ServerTlsConfig};
use tracing::{info, trace};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let fmt_layer = fmt::layer();
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    trace!(args = ?args, "parsed args");

    let ca_pem = tokio::fs::read(&args.ca_cert)
        .await
        .context("reading root CA certificate")?;
    let cert_pem = tokio::fs::read(&args.cert)
        .await
        .context("reading agent certificate")?;
    let key_pem = tokio::fs::read(&args.key)
        .await
        .context("reading agent private key")?;

    let ca = Certificate::from_pem(ca_pem);
    let identity = Identity::from_pem(cert_pem, key_pem);

    let engine = Engine::connect().context("connecting to the container engine")?;
    let router = LogRouter::new();
    let executor = std::sync::Arc::new(Executor::new(
        engine.clone(),
        router,
        args.workdir.clone(),
    ));

    let shutdown = CancellationToken::new();

    let heartbeat_handle = tokio::spawn(heartbeat::run(
        HeartbeatConfig {
            control_plane_url: args.control_plane_url.clone(),
            host_id: args.host_id.clone(),
            interval: Duration::from_secs(args.heartbeat_interval),
            tls: ClientTlsConfig::new()
                .ca_certificate(ca.clone())
                .identity(identity.clone())
                .domain_name(args.control_plane_name.clone()),
        },
        engine.clone(),
        executor.active(),
        shutdown.clone(),
    ));

    let service = AgentService::new(engine, executor);

    info!(%args.address, version = paasdeploy_agent::VERSION, "agent listening");

    let server = Server::builder()
        .tls_config(
            ServerTlsConfig::new()
                .identity(identity)
                .client_ca_root(ca),
        )
        .context("configuring server TLS")?
        .add_service(AgentServer::new(service))
        .serve_with_shutdown(args.address, {
            let shutdown = shutdown.clone();
            async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("shutting down");
                shutdown.cancel();
            }
        });

    server.await.context("agent server failed")?;
    shutdown.cancel();
    let _ = heartbeat_handle.await;

    Ok(())
}
