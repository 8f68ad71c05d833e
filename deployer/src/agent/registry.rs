//! Control-plane side of the agent channel: registration, heartbeats,
//! pending-command delivery and host liveness.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use paasdeploy_common::event::{AgentUpdateEvent, Event, ProvisionEvent};
use paasdeploy_common::host::{HostStatus, UpdateJobStatus};
use paasdeploy_proto::agent::control_plane_server::ControlPlane;
use paasdeploy_proto::agent::{
    agent_command, AgentCommand, HeartbeatRequest, HeartbeatResponse, RegisterRequest,
    RegisterResponse, UpdateAgent,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::events::EventBus;
use crate::persistence::Persistence;

/// Jobs delivered but unconfirmed after this long are failed.
pub const UPDATE_DEADLINE: Duration = Duration::from_secs(300);

pub struct ControlPlaneService {
    persistence: Persistence,
    bus: Arc<EventBus>,
    heartbeat_interval: Duration,
}

impl ControlPlaneService {
    pub fn new(persistence: Persistence, bus: Arc<EventBus>, heartbeat_interval: Duration) -> Self {
        Self {
            persistence,
            bus,
            heartbeat_interval,
        }
    }

    fn emit_online_transition(&self, host_id: Uuid, previous: HostStatus) {
        if previous != HostStatus::Online {
            self.bus.publish(Event::Provision(ProvisionEvent {
                host_id,
                status: HostStatus::Online,
                message: None,
                timestamp: Utc::now(),
            }));
        }
    }
}

#[tonic::async_trait]
impl ControlPlane for ControlPlaneService {
    #[instrument(skip(self, request))]
    async fn register(
        &self,
        request: tonic::Request<RegisterRequest>,
    ) -> Result<tonic::Response<RegisterResponse>, tonic::Status> {
        let request = request.into_inner();
        let host_id = Uuid::parse_str(&request.host_id)
            .map_err(|_| tonic::Status::invalid_argument("malformed host id"))?;

        let system_info = request
            .system_info
            .as_ref()
            .map(|info| {
                serde_json::json!({
                    "hostname": info.hostname,
                    "os": info.os,
                    "arch": info.arch,
                    "kernel_version": info.kernel_version,
                    "docker_version": info.docker_version,
                    "cpus": info.cpus,
                    "memory_total_bytes": info.memory_total_bytes,
                })
            });

        let previous = self
            .persistence
            .record_registration(host_id, &request.agent_version, system_info.as_ref(), Utc::now())
            .await
            .map_err(|e| tonic::Status::internal(e.to_string()))?;

        match previous {
            Some(previous) => {
                info!(%host_id, version = %request.agent_version, "agent registered");
                self.emit_online_transition(host_id, previous.status);

                Ok(tonic::Response::new(RegisterResponse {
                    accepted: true,
                    heartbeat_interval_secs: self.heartbeat_interval.as_secs() as u32,
                }))
            }
            None => {
                warn!(%host_id, "registration from unknown host");
                Ok(tonic::Response::new(RegisterResponse {
                    accepted: false,
                    heartbeat_interval_secs: 0,
                }))
            }
        }
    }

    #[instrument(skip(self, request))]
    async fn heartbeat(
        &self,
        request: tonic::Request<HeartbeatRequest>,
    ) -> Result<tonic::Response<HeartbeatResponse>, tonic::Status> {
        let request = request.into_inner();
        let host_id = Uuid::parse_str(&request.host_id)
            .map_err(|_| tonic::Status::invalid_argument("malformed host id"))?;

        debug!(
            %host_id,
            state = request.state,
            active = request.active_deployments.len(),
            containers = request.container_count,
            "heartbeat"
        );

        let previous = self
            .persistence
            .record_heartbeat(host_id, &request.agent_version, Utc::now())
            .await
            .map_err(|e| tonic::Status::internal(e.to_string()))?
            .ok_or_else(|| tonic::Status::not_found("unknown host"))?;

        self.emit_online_transition(host_id, previous.status);

        // a heartbeat from the requested version closes the update loop
        if let Some(job) = self
            .persistence
            .complete_update_for_version(host_id, &request.agent_version)
            .await
            .map_err(|e| tonic::Status::internal(e.to_string()))?
        {
            info!(%host_id, version = %job.requested_version, "agent update confirmed");
            self.bus.publish(Event::AgentUpdate(AgentUpdateEvent {
                host_id,
                status: UpdateJobStatus::Updated,
                version: Some(job.requested_version),
                timestamp: Utc::now(),
            }));
        }

        // deliver at most one pending command per heartbeat
        let mut commands = Vec::new();
        if let Some(job) = self
            .persistence
            .next_enqueued_update(host_id)
            .await
            .map_err(|e| tonic::Status::internal(e.to_string()))?
        {
            self.persistence
                .mark_update_delivered(job.id)
                .await
                .map_err(|e| tonic::Status::internal(e.to_string()))?;

            self.bus.publish(Event::AgentUpdate(AgentUpdateEvent {
                host_id,
                status: UpdateJobStatus::Delivered,
                version: Some(job.requested_version.clone()),
                timestamp: Utc::now(),
            }));

            commands.push(AgentCommand {
                command: Some(agent_command::Command::UpdateAgent(UpdateAgent {
                    download_url: job.download_url,
                    version: job.requested_version,
                })),
            });
        }

        Ok(tonic::Response::new(HeartbeatResponse { commands }))
    }
}

/// Background liveness loop: hosts silent past the window go offline, and
/// delivered update jobs past their deadline are failed. Runs at a third of
/// the window so a missed heartbeat is noticed promptly.
pub fn start_liveness_sweeper(
    persistence: Persistence,
    bus: Arc<EventBus>,
    liveness_window: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let tick = liveness_window / 3;
        let mut ticker = tokio::time::interval(tick.max(Duration::from_secs(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            match persistence
                .mark_stale_offline(chrono::Duration::from_std(liveness_window).unwrap_or_else(|_| chrono::Duration::seconds(90)))
                .await
            {
                Ok(flipped) => {
                    for host in flipped {
                        warn!(host_id = %host.id, "host went offline");
                        bus.publish(Event::Provision(ProvisionEvent {
                            host_id: host.id,
                            status: HostStatus::Offline,
                            message: Some("no heartbeat within the liveness window".to_string()),
                            timestamp: Utc::now(),
                        }));
                    }
                }
                Err(e) => error!(error = %e, "liveness sweep failed"),
            }

            match persistence
                .fail_stale_updates(chrono::Duration::from_std(UPDATE_DEADLINE).unwrap_or_else(|_| chrono::Duration::seconds(300)))
                .await
            {
                Ok(failed) => {
                    for job in failed {
                        warn!(host_id = %job.host_id, version = %job.requested_version, "agent update timed out");
                        bus.publish(Event::AgentUpdate(AgentUpdateEvent {
                            host_id: job.host_id,
                            status: UpdateJobStatus::Error,
                            version: Some(job.requested_version),
                            timestamp: Utc::now(),
                        }));
                    }
                }
                Err(e) => error!(error = %e, "update-job sweep failed"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use paasdeploy_common::event::Event;
    use paasdeploy_common::host::{HostStatus, UpdateJobStatus};
    use paasdeploy_proto::agent::control_plane_server::ControlPlane;
    use paasdeploy_proto::agent::{agent_command, HeartbeatRequest, RegisterRequest};

    use super::ControlPlaneService;
    use crate::events::{EventBus, TopicFilter};
    use crate::persistence::{NewHost, Persistence};

    async fn service() -> (ControlPlaneService, Persistence, std::sync::Arc<EventBus>) {
        let persistence = Persistence::new_in_memory().await.unwrap();
        let bus = EventBus::new();
        let service = ControlPlaneService::new(
            persistence.clone(),
            bus.clone(),
            Duration::from_secs(30),
        );
        (service, persistence, bus)
    }

    fn heartbeat(host_id: &str, version: &str) -> tonic::Request<HeartbeatRequest> {
        tonic::Request::new(HeartbeatRequest {
            host_id: host_id.to_string(),
            agent_version: version.to_string(),
            state: 1,
            active_deployments: vec![],
            container_count: 0,
        })
    }

    #[tokio::test]
    async fn register_marks_host_online_and_emits() {
        let (service, persistence, bus) = service().await;
        let host = persistence
            .create_host(NewHost {
                name: None,
                address: "10.0.0.7".to_string(),
                port: 7646,
                ssh_user: None,
                acme_email: None,
            })
            .await
            .unwrap();

        let sub = bus.subscribe(TopicFilter::parse(&format!("provision.{}", host.id)));

        let response = service
            .register(tonic::Request::new(RegisterRequest {
                host_id: host.id.to_string(),
                agent_version: "0.3.0".to_string(),
                system_info: None,
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(response.accepted);
        assert_eq!(response.heartbeat_interval_secs, 30);
        assert_eq!(
            persistence.get_host(host.id).await.unwrap().unwrap().status,
            HostStatus::Online
        );

        match sub.next().await.unwrap() {
            Event::Provision(event) => assert_eq!(event.status, HostStatus::Online),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_host_is_rejected() {
        let (service, _, _) = service().await;

        let response = service
            .register(tonic::Request::new(RegisterRequest {
                host_id: uuid::Uuid::new_v4().to_string(),
                agent_version: "0.3.0".to_string(),
                system_info: None,
            }))
            .await
            .unwrap()
            .into_inner();

        assert!(!response.accepted);
    }

    #[tokio::test]
    async fn update_command_travels_the_heartbeat_loop() {
        let (service, persistence, bus) = service().await;
        let host = persistence
            .create_host(NewHost {
                name: None,
                address: "10.0.0.7".to_string(),
                port: 7646,
                ssh_user: None,
                acme_email: None,
            })
            .await
            .unwrap();

        let sub = bus.subscribe(TopicFilter::parse(&format!("agent_update.{}", host.id)));

        let job = persistence
            .enqueue_agent_update(host.id, "0.4.0", "https://dl.example.com/agent-0.4.0")
            .await
            .unwrap();

        // heartbeat from the old binary picks the command up
        let response = service
            .heartbeat(heartbeat(&host.id.to_string(), "0.3.0"))
            .await
            .unwrap()
            .into_inner();
        assert_eq!(response.commands.len(), 1);
        match &response.commands[0].command {
            Some(agent_command::Command::UpdateAgent(update)) => {
                assert_eq!(update.version, "0.4.0");
                assert_eq!(update.download_url, "https://dl.example.com/agent-0.4.0");
            }
            None => panic!("expected an update command"),
        }

        match sub.next().await.unwrap() {
            Event::AgentUpdate(event) => assert_eq!(event.status, UpdateJobStatus::Delivered),
            other => panic!("unexpected event {other:?}"),
        }

        // the command is delivered exactly once
        let again = service
            .heartbeat(heartbeat(&host.id.to_string(), "0.3.0"))
            .await
            .unwrap()
            .into_inner();
        assert!(again.commands.is_empty());

        // heartbeat from the new binary confirms the rollout
        service
            .heartbeat(heartbeat(&host.id.to_string(), "0.4.0"))
            .await
            .unwrap();

        match sub.next().await.unwrap() {
            Event::AgentUpdate(event) => {
                assert_eq!(event.status, UpdateJobStatus::Updated);
                assert_eq!(event.version.as_deref(), Some("0.4.0"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        let job = {
            use sqlx::Row as _;
            let row = sqlx::query("SELECT status FROM agent_update_jobs WHERE id = ?")
                .bind(job.id.to_string())
                .fetch_one(persistence.pool())
                .await
                .unwrap();
            row.try_get::<String, _>("status").unwrap()
        };
        assert_eq!(job, "updated");
    }
}
