//! Thin wrapper around the engine API, shaped after the RPC surface the
//! control plane drives.

use std::collections::HashMap;
use std::path::Path;

use bollard::container::{
    InspectContainerOptions, ListContainersOptions, LogsOptions, RemoveContainerOptions,
    StatsOptions, StopContainerOptions,
};
use bollard::image::{BuildImageOptions, ListImagesOptions, PruneImagesOptions, RemoveImageOptions};
use bollard::models::{ContainerStateStatusEnum, HealthStatusEnum};
use bollard::network::{CreateNetworkOptions, ListNetworksOptions};
use bollard::volume::{CreateVolumeOptions, ListVolumesOptions, RemoveVolumeOptions};
use bollard::Docker;
use chrono::DateTime;
use futures::StreamExt;
use paasdeploy_proto::agent::{
    ContainerState, ContainerStatsResponse, ContainerSummary, HealthState, ImageSummary,
    InspectContainerResponse, NetworkSummary, SystemInfoRequest, SystemInfoResponse,
    SystemMetricsResponse, VolumeSummary,
};
use tracing::{debug, warn};

use crate::error::{Error, Result};

#[derive(Clone)]
pub struct Engine {
    docker: Docker,
}

impl Engine {
    pub fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }

    pub async fn system_info(&self, _request: SystemInfoRequest) -> Result<SystemInfoResponse> {
        let info = self.docker.info().await?;
        let version = self.docker.version().await?;

        Ok(SystemInfoResponse {
            hostname: info.name.unwrap_or_default(),
            os: info.operating_system.unwrap_or_default(),
            arch: info.architecture.unwrap_or_default(),
            kernel_version: info.kernel_version.unwrap_or_default(),
            docker_version: version.version.unwrap_or_default(),
            cpus: info.ncpu.unwrap_or_default() as u32,
            memory_total_bytes: info.mem_total.unwrap_or_default() as u64,
        })
    }

    pub async fn system_metrics(&self) -> Result<SystemMetricsResponse> {
        let info = self.docker.info().await?;
        let usage = self.docker.df().await?;

        Ok(SystemMetricsResponse {
            containers_running: info.containers_running.unwrap_or_default() as u32,
            containers_total: info.containers.unwrap_or_default() as u32,
            images_total: info.images.unwrap_or_default() as u32,
            layers_size_bytes: usage.layers_size.unwrap_or_default() as u64,
            load_average: load_average(),
        })
    }

    pub async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSummary>> {
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all,
                ..Default::default()
            }))
            .await?;

        Ok(containers
            .into_iter()
            .map(|c| ContainerSummary {
                id: c.id.unwrap_or_default(),
                name: c
                    .names
                    .unwrap_or_default()
                    .first()
                    .map(|n| n.trim_start_matches('/').to_string())
                    .unwrap_or_default(),
                image: c.image.unwrap_or_default(),
                state: c.state.unwrap_or_default(),
                status: c.status.unwrap_or_default(),
                created_at: c.created.map(|secs| ::prost_types::Timestamp {
                    seconds: secs,
                    nanos: 0,
                }),
            })
            .collect())
    }

    /// Inspect one container; a 404 from the engine becomes a `not_found`
    /// sample instead of an error so the health sampler can act on it.
    pub async fn inspect_container(&self, name: &str) -> Result<InspectContainerResponse> {
        let inspect = match self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => {
                return Ok(InspectContainerResponse {
                    name: name.to_string(),
                    state: ContainerState::NotFound as i32,
                    health: HealthState::None as i32,
                    ip_address: String::new(),
                    image: String::new(),
                    exit_code: 0,
                    started_at: None,
                });
            }
            Err(e) => return Err(e.into()),
        };

        let state = inspect.state.as_ref();
        let container_state = match state.and_then(|s| s.status) {
            Some(ContainerStateStatusEnum::RUNNING) => ContainerState::Running,
            Some(ContainerStateStatusEnum::PAUSED) => ContainerState::Paused,
            Some(ContainerStateStatusEnum::RESTARTING) => ContainerState::Restarting,
            _ => ContainerState::Exited,
        };
        let health = match state
            .and_then(|s| s.health.as_ref())
            .and_then(|h| h.status)
        {
            Some(HealthStatusEnum::HEALTHY) => HealthState::Healthy,
            Some(HealthStatusEnum::UNHEALTHY) => HealthState::Unhealthy,
            Some(HealthStatusEnum::STARTING) => HealthState::Starting,
            _ => HealthState::None,
        };

        let ip_address = inspect
            .network_settings
            .as_ref()
            .and_then(|settings| settings.networks.as_ref())
            .and_then(|networks| networks.get(paasdeploy_common::OVERLAY_NETWORK))
            .and_then(|endpoint| endpoint.ip_address.clone())
            .unwrap_or_default();

        let started_at = state
            .and_then(|s| s.started_at.as_deref())
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| paasdeploy_proto::agent::timestamp(dt.into()));

        Ok(InspectContainerResponse {
            name: inspect
                .name
                .map(|n| n.trim_start_matches('/').to_string())
                .unwrap_or_else(|| name.to_string()),
            state: container_state as i32,
            health: health as i32,
            ip_address,
            image: inspect
                .config
                .and_then(|config| config.image)
                .unwrap_or_default(),
            exit_code: state.and_then(|s| s.exit_code).unwrap_or_default(),
            started_at,
        })
    }

    pub async fn start_container(&self, name: &str) -> Result<()> {
        self.docker
            .start_container(name, None::<bollard::container::StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    pub async fn stop_container(&self, name: &str, timeout_secs: u32) -> Result<()> {
        self.docker
            .stop_container(
                name,
                Some(StopContainerOptions {
                    t: timeout_secs as i64,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn restart_container(&self, name: &str) -> Result<()> {
        self.docker
            .restart_container(name, None::<bollard::container::RestartContainerOptions>)
            .await?;
        Ok(())
    }

    pub async fn remove_container(&self, name: &str, force: bool) -> Result<()> {
        self.docker
            .remove_container(
                name,
                Some(RemoveContainerOptions {
                    force,
                    ..Default::default()
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn container_logs(&self, name: &str, tail: u32) -> Result<Vec<String>> {
        let tail = if tail == 0 {
            "all".to_string()
        } else {
            tail.to_string()
        };

        let mut stream = self.docker.logs(
            name,
            Some(LogsOptions::<String> {
                stdout: true,
                stderr: true,
                tail,
                ..Default::default()
            }),
        );

        let mut lines = Vec::new();
        while let Some(output) = stream.next().await {
            let output = output?;
            let text = String::from_utf8_lossy(&output.into_bytes()).into_owned();
            lines.extend(text.lines().map(str::to_string));
        }

        Ok(lines)
    }

    pub async fn container_stats(&self, name: &str) -> Result<ContainerStatsResponse> {
        let mut stream = self.docker.stats(
            name,
            Some(StatsOptions {
                stream: false,
                one_shot: false,
            }),
        );

        let stats = match stream.next().await {
            Some(stats) => stats?,
            None => {
                return Err(Error::InputOutput(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "stats stream ended without a sample",
                )))
            }
        };

        let cpu_delta = stats.cpu_stats.cpu_usage.total_usage as f64
            - stats.precpu_stats.cpu_usage.total_usage as f64;
        let system_delta = stats.cpu_stats.system_cpu_usage.unwrap_or_default() as f64
            - stats.precpu_stats.system_cpu_usage.unwrap_or_default() as f64;
        let online_cpus = stats.cpu_stats.online_cpus.unwrap_or(1).max(1) as f64;
        let cpu_percent = if system_delta > 0.0 {
            cpu_delta / system_delta * online_cpus * 100.0
        } else {
            0.0
        };

        let (rx, tx) = stats
            .networks
            .as_ref()
            .map(|networks| {
                networks
                    .values()
                    .fold((0u64, 0u64), |(rx, tx), n| (rx + n.rx_bytes, tx + n.tx_bytes))
            })
            .unwrap_or_default();

        Ok(ContainerStatsResponse {
            cpu_percent,
            memory_used_bytes: stats.memory_stats.usage.unwrap_or_default(),
            memory_limit_bytes: stats.memory_stats.limit.unwrap_or_default(),
            network_rx_bytes: rx,
            network_tx_bytes: tx,
        })
    }

    pub async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let images = self
            .docker
            .list_images(Some(ListImagesOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await?;

        Ok(images
            .into_iter()
            .map(|image| ImageSummary {
                id: image.id,
                tags: image.repo_tags,
                size_bytes: image.size as u64,
                created_at: Some(::prost_types::Timestamp {
                    seconds: image.created,
                    nanos: 0,
                }),
            })
            .collect())
    }

    pub async fn remove_image(&self, reference: &str, force: bool) -> Result<()> {
        self.docker
            .remove_image(
                reference,
                Some(RemoveImageOptions {
                    force,
                    ..Default::default()
                }),
                None,
            )
            .await?;
        Ok(())
    }

    pub async fn prune_images(&self) -> Result<u64> {
        let pruned = self
            .docker
            .prune_images(None::<PruneImagesOptions<String>>)
            .await?;
        Ok(pruned.space_reclaimed.unwrap_or_default() as u64)
    }

    /// Delete every tag of `repository` except `keep_tag`, then prune
    /// dangling layers. Failures on individual tags are logged and skipped
    /// so one busy image never blocks the rest of the cleanup.
    pub async fn cleanup_images(&self, repository: &str, keep_tag: &str) -> Result<(Vec<String>, u64)> {
        let prefix = format!("{repository}:");
        let mut removed = Vec::new();

        for image in self.list_images().await? {
            for tag in image
                .tags
                .iter()
                .filter(|tag| tag.starts_with(&prefix) && tag.as_str() != keep_tag)
            {
                match self.remove_image(tag, false).await {
                    Ok(()) => removed.push(tag.clone()),
                    Err(e) => warn!(tag, error = %e, "could not remove stale image tag"),
                }
            }
        }

        let reclaimed = self.prune_images().await?;
        debug!(reclaimed, ?removed, "image cleanup finished");

        Ok((removed, reclaimed))
    }

    /// Create the named network when it does not exist yet; an engine
    /// conflict means another deployment won the race, which is fine.
    pub async fn ensure_network(&self, name: &str, driver: &str) -> Result<()> {
        let result = self
            .docker
            .create_network(CreateNetworkOptions::<String> {
                name: name.to_string(),
                driver: driver.to_string(),
                ..Default::default()
            })
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 409, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn remove_network(&self, name: &str) -> Result<()> {
        self.docker.remove_network(name).await?;
        Ok(())
    }

    pub async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        let networks = self
            .docker
            .list_networks(None::<ListNetworksOptions<String>>)
            .await?;

        Ok(networks
            .into_iter()
            .map(|network| NetworkSummary {
                id: network.id.unwrap_or_default(),
                name: network.name.unwrap_or_default(),
                driver: network.driver.unwrap_or_default(),
            })
            .collect())
    }

    pub async fn create_volume(&self, name: &str) -> Result<()> {
        self.docker
            .create_volume(CreateVolumeOptions::<String> {
                name: name.to_string(),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    pub async fn remove_volume(&self, name: &str, force: bool) -> Result<()> {
        self.docker
            .remove_volume(name, Some(RemoveVolumeOptions { force }))
            .await?;
        Ok(())
    }

    pub async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        let response = self
            .docker
            .list_volumes(None::<ListVolumesOptions<String>>)
            .await?;

        Ok(response
            .volumes
            .unwrap_or_default()
            .into_iter()
            .map(|volume| VolumeSummary {
                name: volume.name,
                driver: volume.driver,
                mountpoint: volume.mountpoint,
            })
            .collect())
    }

    /// Build an image from a context directory, feeding each line of engine
    /// output to `on_line`. Returns once the build finished or failed.
    pub async fn build_image<F>(
        &self,
        context_dir: &Path,
        dockerfile: &str,
        tag: &str,
        buildargs: HashMap<String, String>,
        target: Option<String>,
        mut on_line: F,
    ) -> Result<()>
    where
        F: FnMut(String),
    {
        let context = pack_context(context_dir)?;

        let options = BuildImageOptions::<String> {
            dockerfile: dockerfile.to_string(),
            t: tag.to_string(),
            buildargs,
            target: target.unwrap_or_default(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(hyper::Body::from(context)));

        while let Some(update) = stream.next().await {
            let update = update.map_err(|e| Error::Build(e.to_string()))?;

            if let Some(error) = update.error {
                return Err(Error::Build(error));
            }
            if let Some(line) = update.stream {
                let line = line.trim_end();
                if !line.is_empty() {
                    on_line(line.to_string());
                }
            }
        }

        Ok(())
    }
}

/// Tar up a build context the way the engine expects it.
fn pack_context(dir: &Path) -> Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    builder.append_dir_all(".", dir)?;
    Ok(builder.into_inner()?)
}

fn load_average() -> f64 {
    std::fs::read_to_string("/proc/loadavg")
        .ok()
        .and_then(|raw| {
            raw.split_whitespace()
                .next()
                .and_then(|first| first.parse().ok())
        })
        .unwrap_or_default()
}
