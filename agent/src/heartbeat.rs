//! Registration and heartbeat loop against the control plane.

use std::time::Duration;

use paasdeploy_proto::agent::control_plane_client::ControlPlaneClient;
use paasdeploy_proto::agent::{
    agent_command, AgentState, HeartbeatRequest, RegisterRequest, SystemInfoRequest,
};
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, ClientTlsConfig, Endpoint};
use tracing::{error, info, warn};

use crate::docker::Engine;
use crate::error::{Error, Result};
use crate::executor::ActiveDeployments;
use crate::update;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub struct HeartbeatConfig {
    pub control_plane_url: String,
    pub host_id: String,
    pub interval: Duration,
    pub tls: ClientTlsConfig,
}

/// Register, then heartbeat until cancelled. Registration failures back off
/// exponentially; a failed heartbeat drops the channel and re-registers.
pub async fn run(
    config: HeartbeatConfig,
    engine: Engine,
    active: ActiveDeployments,
    shutdown: CancellationToken,
) {
    let http = reqwest::Client::new();

    'session: loop {
        let mut backoff = INITIAL_BACKOFF;
        let (mut client, interval) = loop {
            if shutdown.is_cancelled() {
                return;
            }

            match register(&config, &engine).await {
                Ok(session) => break session,
                Err(e) => {
                    warn!(error = %e, "registration failed, backing off {}s", backoff.as_secs());
                    tokio::select! {
                        _ = shutdown.cancelled() => return,
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    backoff = next_backoff(backoff);
                }
            }
        };

        info!(interval_secs = interval.as_secs(), "registered with control plane");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = ticker.tick() => {}
            }

            let request = HeartbeatRequest {
                host_id: config.host_id.clone(),
                agent_version: crate::VERSION.to_string(),
                state: if active.is_busy() {
                    AgentState::Busy
                } else {
                    AgentState::Idle
                } as i32,
                active_deployments: active.ids(),
                container_count: match engine.list_containers(false).await {
                    Ok(containers) => containers.len() as u32,
                    Err(_) => 0,
                },
            };

            let response = match client.heartbeat(request).await {
                Ok(response) => response.into_inner(),
                Err(e) => {
                    warn!(error = %e, "heartbeat failed, re-registering");
                    continue 'session;
                }
            };

            for command in response.commands {
                match command.command {
                    Some(agent_command::Command::UpdateAgent(update)) => {
                        info!(version = %update.version, "update command received");
                        // Succeeding means the process was replaced; reaching
                        // the error arm means the update was abandoned.
                        if let Err(e) =
                            update::self_update(&http, &update.download_url, &update.version).await
                        {
                            error!(error = %e, "agent update abandoned");
                        }
                    }
                    None => {}
                }
            }
        }
    }
}

async fn register(
    config: &HeartbeatConfig,
    engine: &Engine,
) -> Result<(ControlPlaneClient<Channel>, Duration)> {
    let channel = Endpoint::from_shared(config.control_plane_url.clone())
        .map_err(Error::Transport)?
        .tls_config(config.tls.clone())?
        .connect_timeout(CONNECT_TIMEOUT)
        .timeout(RPC_TIMEOUT)
        .connect()
        .await?;

    let mut client = ControlPlaneClient::new(channel);

    let system_info = engine.system_info(SystemInfoRequest {}).await.ok();
    let response = client
        .register(RegisterRequest {
            host_id: config.host_id.clone(),
            agent_version: crate::VERSION.to_string(),
            system_info,
        })
        .await?
        .into_inner();

    if !response.accepted {
        return Err(Error::RegistrationRejected);
    }

    let interval = if response.heartbeat_interval_secs > 0 {
        Duration::from_secs(response.heartbeat_interval_secs as u64)
    } else {
        config.interval
    };

    Ok((client, interval))
}

fn next_backoff(current: Duration) -> Duration {
    (current * 2).min(MAX_BACKOFF)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{next_backoff, INITIAL_BACKOFF};

    #[test]
    fn backoff_doubles_to_cap() {
        let mut backoff = INITIAL_BACKOFF;
        let mut schedule = Vec::new();
        for _ in 0..7 {
            schedule.push(backoff.as_secs());
            backoff = next_backoff(backoff);
        }
        assert_eq!(schedule, vec![1, 2, 4, 8, 16, 30, 30]);
    }

    #[test]
    fn backoff_never_exceeds_cap() {
        assert_eq!(next_backoff(Duration::from_secs(30)), Duration::from_secs(30));
        assert_eq!(next_backoff(Duration::from_secs(29)), Duration::from_secs(30));
    }
}
