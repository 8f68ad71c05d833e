//! Periodic container health sampling.
//!
//! Every active app is inspected on an interval; only state transitions are
//! published, so a steadily healthy fleet is silent. Stats samples are
//! most-recent-wins and flow on their own topic.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use paasdeploy_common::container::{ContainerStatus, HealthVerdict};
use paasdeploy_common::event::{Event, HealthEvent, StatsEvent};
use paasdeploy_proto::agent::{ContainerRequest, ContainerState, HealthState};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};
use uuid::Uuid;

use crate::agent::client::AgentPool;
use crate::deployment::AgentTarget;
use crate::events::EventBus;
use crate::persistence::Persistence;

pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Sample {
    pub container: ContainerStatus,
    pub health: HealthVerdict,
}

/// Remembers the last sample per app and reports only changes.
#[derive(Default)]
pub struct SampleTracker {
    last: HashMap<Uuid, Sample>,
}

impl SampleTracker {
    /// Record a sample. Returns the sample when it differs from the previous
    /// one (or is the first); identical consecutive samples coalesce to
    /// nothing.
    pub fn observe(&mut self, app_id: Uuid, sample: Sample) -> Option<Sample> {
        match self.last.insert(app_id, sample) {
            Some(previous) if previous == sample => None,
            _ => Some(sample),
        }
    }

    pub fn forget(&mut self, app_id: Uuid) {
        self.last.remove(&app_id);
    }
}

pub struct SamplerContext {
    pub persistence: Persistence,
    pub pool: Arc<AgentPool>,
    pub bus: Arc<EventBus>,
    pub local_agent: AgentTarget,
}

/// Background sampling loop over all active apps.
pub fn start_sampler(ctx: SamplerContext, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut tracker = SampleTracker::default();
        let mut ticker = tokio::time::interval(SAMPLE_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let apps = match ctx.persistence.list_active_apps().await {
                Ok(apps) => apps,
                Err(e) => {
                    error!(error = %e, "could not list apps for sampling");
                    continue;
                }
            };

            for app in apps {
                sample_app(&ctx, &mut tracker, app.id, &app.name, app.host_id).await;
            }
        }
    })
}

async fn sample_app(
    ctx: &SamplerContext,
    tracker: &mut SampleTracker,
    app_id: Uuid,
    app_name: &str,
    host_id: Option<Uuid>,
) {
    let target = match host_id {
        None => ctx.local_agent.clone(),
        Some(host_id) => match ctx.persistence.get_host(host_id).await {
            Ok(Some(host)) => AgentTarget {
                server_name: host.name.clone().unwrap_or_else(|| host.address.clone()),
                address: host.address,
                port: host.port,
            },
            _ => return,
        },
    };

    let Ok(client) = ctx
        .pool
        .client(&target.address, target.port, &target.server_name)
        .await
    else {
        return;
    };

    let mut inspect_client = client.clone();
    let inspect = match inspect_client
        .inspect_container(crate::agent::client::with_deadline(ContainerRequest {
            name: app_name.to_string(),
        }))
        .await
    {
        Ok(response) => response.into_inner(),
        Err(e) => {
            debug!(app = %app_name, error = %e, "inspect failed");
            ctx.pool.flag_unhealthy(&target.address, target.port).await;
            return;
        }
    };

    let sample = Sample {
        container: ContainerState::try_from(inspect.state)
            .unwrap_or(ContainerState::Unspecified)
            .into(),
        health: HealthState::try_from(inspect.health)
            .unwrap_or(HealthState::Unspecified)
            .into(),
    };

    if let Some(changed) = tracker.observe(app_id, sample) {
        ctx.bus.publish(Event::Health(HealthEvent {
            app_id,
            container: changed.container,
            health: changed.health,
            timestamp: Utc::now(),
        }));
    }

    // stats only make sense for a live container
    if sample.container == ContainerStatus::Running {
        let mut stats_client = client.clone();
        if let Ok(response) = stats_client
            .get_container_stats(crate::agent::client::with_deadline(ContainerRequest {
                name: app_name.to_string(),
            }))
            .await
        {
            let stats = response.into_inner();
            ctx.bus.publish(Event::Stats(StatsEvent {
                app_id,
                cpu_percent: stats.cpu_percent,
                memory_used_bytes: stats.memory_used_bytes,
                memory_limit_bytes: stats.memory_limit_bytes,
                timestamp: Utc::now(),
            }));
        }
    }
}

#[cfg(test)]
mod tests {
    use paasdeploy_common::container::{ContainerStatus, HealthVerdict};
    use uuid::Uuid;

    use super::{Sample, SampleTracker};

    const RUNNING_HEALTHY: Sample = Sample {
        container: ContainerStatus::Running,
        health: HealthVerdict::Healthy,
    };
    const RUNNING_UNHEALTHY: Sample = Sample {
        container: ContainerStatus::Running,
        health: HealthVerdict::Unhealthy,
    };
    const GONE: Sample = Sample {
        container: ContainerStatus::NotFound,
        health: HealthVerdict::None,
    };

    #[test]
    fn identical_samples_coalesce() {
        let mut tracker = SampleTracker::default();
        let app = Uuid::new_v4();

        assert_eq!(tracker.observe(app, RUNNING_HEALTHY), Some(RUNNING_HEALTHY));
        assert_eq!(tracker.observe(app, RUNNING_HEALTHY), None);
        assert_eq!(tracker.observe(app, RUNNING_HEALTHY), None);
    }

    #[test]
    fn transitions_emit() {
        let mut tracker = SampleTracker::default();
        let app = Uuid::new_v4();

        tracker.observe(app, RUNNING_HEALTHY);
        assert_eq!(
            tracker.observe(app, RUNNING_UNHEALTHY),
            Some(RUNNING_UNHEALTHY)
        );
        assert_eq!(tracker.observe(app, GONE), Some(GONE));
        // flapping back emits again
        assert_eq!(tracker.observe(app, RUNNING_HEALTHY), Some(RUNNING_HEALTHY));
    }

    #[test]
    fn apps_are_tracked_independently() {
        let mut tracker = SampleTracker::default();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        assert!(tracker.observe(a, RUNNING_HEALTHY).is_some());
        assert!(tracker.observe(b, RUNNING_HEALTHY).is_some());
        assert!(tracker.observe(a, RUNNING_HEALTHY).is_none());

        tracker.forget(a);
        assert!(tracker.observe(a, RUNNING_HEALTHY).is_some());
    }
}
