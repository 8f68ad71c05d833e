use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use paasdeploy_deployer::agent::client::{AgentPool, TlsMaterial};
use paasdeploy_deployer::agent::registry::{self, ControlPlaneService};
use paasdeploy_deployer::args::Args;
use paasdeploy_deployer::deployment::{AgentTarget, DeploymentManager, WorkerContext};
use paasdeploy_deployer::events::EventBus;
use paasdeploy_deployer::handlers;
use paasdeploy_deployer::health::{self, SamplerContext};
use paasdeploy_deployer::notify::{self, Notifier};
use paasdeploy_deployer::persistence::Persistence;
use paasdeploy_deployer::webhook::WebhookIngest;
use paasdeploy_pki::{CertAuthority, SealedBundle};
use paasdeploy_proto::agent::control_plane_server::ControlPlaneServer;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Certificate, Identity, Server, ServerTlsConfig};
use tracing::{info, trace, warn};
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

    let persistence = Persistence::new(&args.db_path)
        .await
        .context("opening database")?;

    // rows left running by a crash can never finish
    let recovered = persistence
        .fail_orphaned_running("interrupted by control plane restart")
        .await?;
    if !recovered.is_empty() {
        warn!(count = recovered.len(), "failed orphaned running deployments");
    }

    let ca = load_or_create_ca(&persistence, &args.master_key).await?;
    let server_cert = ca
        .issue_server(&args.hostname)
        .context("issuing control plane server certificate")?;
    let client_cert = ca
        .issue_agent("control-plane", &args.hostname)
        .context("issuing control plane client certificate")?;

    let bus = EventBus::new();
    let pool = AgentPool::new(TlsMaterial {
        ca_pem: ca.root_cert_pem().as_bytes().to_vec(),
        cert_pem: client_cert.cert_pem.into_bytes(),
        key_pem: client_cert.key_pem.into_bytes(),
    });

    let shutdown = CancellationToken::new();
    let local_agent = AgentTarget {
        address: args.local_agent_address.clone(),
        port: args.local_agent_port,
        server_name: args.local_agent_name.clone(),
    };

    let pool_sweeper = pool.start_sweeper(shutdown.clone());
    let liveness_sweeper = registry::start_liveness_sweeper(
        persistence.clone(),
        bus.clone(),
        Duration::from_secs(args.liveness_window_secs),
        shutdown.clone(),
    );
    let sampler = health::start_sampler(
        SamplerContext {
            persistence: persistence.clone(),
            pool: pool.clone(),
            bus: bus.clone(),
            local_agent: local_agent.clone(),
        },
        shutdown.clone(),
    );

    let notifier = Notifier::new(persistence.clone());
    let notify_task = notify::start(notifier, bus.clone(), shutdown.clone());

    let manager = DeploymentManager::start(
        WorkerContext {
            persistence: persistence.clone(),
            pool: pool.clone(),
            bus: bus.clone(),
            registry_prefix: args.registry_prefix.clone(),
            local_agent,
        },
        args.workers,
        shutdown.clone(),
    );

    let registry_service = ControlPlaneService::new(
        persistence.clone(),
        bus.clone(),
        Duration::from_secs(args.heartbeat_interval_secs),
    );

    info!(rpc = %args.rpc_address, api = %args.api_address, "control plane listening");

    let rpc_shutdown = shutdown.clone();
    let rpc_server = Server::builder()
        .tls_config(
            ServerTlsConfig::new()
                .identity(Identity::from_pem(&server_cert.cert_pem, &server_cert.key_pem))
                .client_ca_root(Certificate::from_pem(ca.root_cert_pem())),
        )
        .context("configuring rpc TLS")?
        .add_service(ControlPlaneServer::new(registry_service))
        .serve_with_shutdown(args.rpc_address, async move {
            rpc_shutdown.cancelled().await;
        });
    let rpc_handle = tokio::spawn(rpc_server);

    let ingest = Arc::new(WebhookIngest::new(
        persistence.clone(),
        args.webhook_secret.clone(),
    ));
    let router = handlers::make_router(persistence.clone(), ingest, bus.clone());
    let api_shutdown = shutdown.clone();
    let api_server = axum::Server::bind(&args.api_address)
        .serve(router.into_make_service())
        .with_graceful_shutdown(async move {
            api_shutdown.cancelled().await;
        });
    let api_handle = tokio::spawn(api_server);

    tokio::signal::ctrl_c()
        .await
        .context("listening for shutdown signal")?;
    info!("shutting down");
    shutdown.cancel();

    // workers get a grace period to record terminal states
    let grace = Duration::from_secs(args.shutdown_grace_secs);
    if tokio::time::timeout(grace, manager.join()).await.is_err() {
        warn!("workers did not stop within the grace period");
    }

    let _ = tokio::join!(
        rpc_handle,
        api_handle,
        pool_sweeper,
        liveness_sweeper,
        sampler,
        notify_task
    );

    Ok(())
}

/// The sealed CA bundle is created once at install time; later starts open
/// it with the operator master key.
async fn load_or_create_ca(
    persistence: &Persistence,
    master_key: &str,
) -> anyhow::Result<CertAuthority> {
    match persistence.load_ca_bundle().await? {
        Some(raw) => {
            let sealed: SealedBundle =
                serde_json::from_str(&raw).context("parsing sealed CA bundle")?;
            CertAuthority::open(&sealed, master_key).context("opening sealed CA bundle")
        }
        None => {
            info!("no certificate authority yet, generating one");
            let ca = CertAuthority::generate().context("generating root CA")?;
            let sealed = ca.seal(master_key).context("sealing root CA")?;
            persistence
                .store_ca_bundle(&serde_json::to_string(&sealed)?)
                .await?;
            Ok(ca)
        }
    }
}
