//! The worker pool that drains the deployment queue.

mod worker;

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::agent::client::AgentPool;
use crate::events::EventBus;
use crate::persistence::Persistence;

/// Where a deployment executes: a registered host's agent, or the agent
/// running next to the control plane for apps without an assigned host.
#[derive(Clone, Debug)]
pub struct AgentTarget {
    pub address: String,
    pub port: u16,
    pub server_name: String,
}

/// Shared, immutable wiring every worker gets a copy of. Workers own no
/// state of their own: mutual exclusion lives in the claim primitive.
#[derive(Clone)]
pub struct WorkerContext {
    pub persistence: Persistence,
    pub pool: Arc<AgentPool>,
    pub bus: Arc<EventBus>,
    pub registry_prefix: String,
    pub local_agent: AgentTarget,
}

pub struct DeploymentManager {
    handles: Vec<JoinHandle<()>>,
}

impl DeploymentManager {
    /// Spawn `workers` claim loops. Each drains the queue independently;
    /// the store guarantees no two ever hold the same deployment or the
    /// same app.
    pub fn start(ctx: WorkerContext, workers: usize, shutdown: CancellationToken) -> Self {
        info!(workers, "starting deployment workers");

        let handles = (0..workers.max(1))
            .map(|index| tokio::spawn(worker::run(index, ctx.clone(), shutdown.clone())))
            .collect();

        Self { handles }
    }

    /// Wait for every worker to finish its grace period and exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}
