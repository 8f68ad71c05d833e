//! The agent-side deployment pipeline: git sync, image build, compose up,
//! health check.

pub mod logs;

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use paasdeploy_common::app::AppContract;
use paasdeploy_common::compose::ComposeFile;
use paasdeploy_common::deployment::Stage;
use paasdeploy_common::OVERLAY_NETWORK;
use paasdeploy_proto::agent::{DeployRequest, DeployResponse, DeployStage, HealthProbeResponse};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::docker::Engine;
use crate::error::{Error, Result};
use logs::{LogRouter, StageLog};

/// Wait at least this long before the first health probe, whatever the
/// contract's start period says.
const MIN_START_DELAY: Duration = Duration::from_secs(15);

const HEALTH_ATTEMPTS: u32 = 10;
const HEALTH_RETRY_DELAY: Duration = Duration::from_secs(5);
const HEALTH_DEADLINE: Duration = Duration::from_secs(120);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const COMPOSE_FILE: &str = "docker-compose.yml";

/// Deployment ids currently executing on this host, reported in heartbeats.
#[derive(Clone, Default)]
pub struct ActiveDeployments(Arc<Mutex<HashSet<Uuid>>>);

impl ActiveDeployments {
    pub fn insert(&self, id: Uuid) {
        self.0.lock().unwrap().insert(id);
    }

    pub fn remove(&self, id: Uuid) {
        self.0.lock().unwrap().remove(&id);
    }

    pub fn ids(&self) -> Vec<String> {
        self.0.lock().unwrap().iter().map(Uuid::to_string).collect()
    }

    pub fn is_busy(&self) -> bool {
        !self.0.lock().unwrap().is_empty()
    }
}

pub struct Executor {
    engine: Engine,
    router: Arc<LogRouter>,
    active: ActiveDeployments,
    workdir_root: PathBuf,
    http: reqwest::Client,
}

impl Executor {
    pub fn new(engine: Engine, router: Arc<LogRouter>, workdir_root: PathBuf) -> Self {
        Self {
            engine,
            router,
            active: ActiveDeployments::default(),
            workdir_root,
            http: reqwest::Client::new(),
        }
    }

    pub fn active(&self) -> ActiveDeployments {
        self.active.clone()
    }

    pub fn router(&self) -> Arc<LogRouter> {
        self.router.clone()
    }

    /// Run a deployment end to end. Failures are folded into the response so
    /// the control plane always learns which stage broke and why.
    #[instrument(skip(self, request), fields(deployment_id = %request.deployment_id, app = %request.app_name))]
    pub async fn execute(&self, request: DeployRequest) -> DeployResponse {
        let id = match Uuid::parse_str(&request.deployment_id) {
            Ok(id) => id,
            Err(_) => {
                return DeployResponse {
                    success: false,
                    failed_stage: DeployStage::Unspecified as i32,
                    error: format!("malformed deployment id '{}'", request.deployment_id),
                    image_tag: String::new(),
                }
            }
        };

        self.router.begin(id);
        self.active.insert(id);

        let result = self.run_pipeline(id, &request).await;

        self.active.remove(id);
        self.router.finish(id);

        match result {
            Ok(()) => {
                info!("deployment succeeded");
                DeployResponse {
                    success: true,
                    failed_stage: DeployStage::Unspecified as i32,
                    error: String::new(),
                    image_tag: request.image_tag,
                }
            }
            Err(e) => {
                error!(error = %e, stage = %e.stage(), "deployment failed");
                DeployResponse {
                    success: false,
                    failed_stage: DeployStage::from(e.stage()) as i32,
                    error: e.to_string(),
                    image_tag: String::new(),
                }
            }
        }
    }

    async fn run_pipeline(&self, id: Uuid, request: &DeployRequest) -> Result<()> {
        let workdir = self.workdir_root.join(&request.app_name);
        let app_dir = if request.subdir.is_empty() {
            workdir.clone()
        } else {
            workdir.join(&request.subdir)
        };

        // git_sync
        let log = StageLog::new(self.router.clone(), id, Stage::GitSync);
        let sync = self.git_sync(&workdir, request, &log).await;
        let contract = match sync {
            Ok(()) => self.read_contract(&app_dir, &request.app_name).await,
            Err(e) => Err(e),
        };
        log.close().await;
        let contract = contract?;

        // build
        let log = StageLog::new(self.router.clone(), id, Stage::Build);
        let built = self.build(&app_dir, &contract, &request.image_tag, &log).await;
        log.close().await;
        built?;

        // deploy
        let log = StageLog::new(self.router.clone(), id, Stage::Deploy);
        let deployed = self.deploy(&workdir, request, &contract, &log).await;
        log.close().await;
        deployed?;

        // health_check
        let log = StageLog::new(self.router.clone(), id, Stage::HealthCheck);
        let healthy = self.health_check(request, &contract, &log).await;
        log.close().await;
        healthy?;

        // complete
        let log = StageLog::new(self.router.clone(), id, Stage::Complete);
        log.info(format!("{} is live at {}", request.app_name, request.image_tag));
        log.close().await;

        Ok(())
    }

    async fn git_sync(&self, workdir: &Path, request: &DeployRequest, log: &StageLog) -> Result<()> {
        if workdir.join(".git").exists() {
            log.info(format!("fetching {}", request.branch));
            git(workdir, &["fetch", "origin", &request.branch], log).await?;
        } else {
            tokio::fs::create_dir_all(workdir).await?;
            log.info(format!("cloning {}", request.repo_url));
            git(workdir, &["clone", &request.repo_url, "."], log).await?;
            git(workdir, &["fetch", "origin", &request.branch], log).await?;
        }

        log.info(format!("resetting to {}", request.commit_sha));
        git(workdir, &["reset", "--hard", &request.commit_sha], log).await?;

        Ok(())
    }

    async fn read_contract(&self, app_dir: &Path, app_name: &str) -> Result<AppContract> {
        let path = app_dir.join(paasdeploy_common::APP_CONTRACT_FILE);

        match tokio::fs::read_to_string(&path).await {
            Ok(raw) => Ok(AppContract::from_json(&raw)?),
            // A repo without a contract file deploys with pure defaults.
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppContract::from_json(
                &serde_json::json!({ "name": app_name }).to_string(),
            )?),
            Err(e) => Err(e.into()),
        }
    }

    async fn build(
        &self,
        app_dir: &Path,
        contract: &AppContract,
        image_tag: &str,
        log: &StageLog,
    ) -> Result<()> {
        let context_dir = app_dir.join(&contract.build.context);
        log.info(format!("building {image_tag}"));

        self.engine
            .build_image(
                &context_dir,
                &contract.build.dockerfile,
                image_tag,
                contract.build.args.clone().into_iter().collect(),
                contract.build.target.clone(),
                |line| log.info(line),
            )
            .await
    }

    async fn deploy(
        &self,
        workdir: &Path,
        request: &DeployRequest,
        contract: &AppContract,
        log: &StageLog,
    ) -> Result<()> {
        let configured: BTreeMap<String, String> = request
            .env
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let env = contract.merged_env(&configured);

        let compose = ComposeFile::new(&request.app_name, &request.image_tag, contract, &env);
        let compose_path = workdir.join(COMPOSE_FILE);
        tokio::fs::write(&compose_path, compose.to_yaml()?).await?;

        self.engine.ensure_network(OVERLAY_NETWORK, "bridge").await?;

        log.info("recreating containers");
        let mut command = Command::new("docker");
        command
            .args(["compose", "-f"])
            .arg(&compose_path)
            .args(["-p", &request.app_name])
            .args(["up", "-d", "--force-recreate", "--remove-orphans"]);

        stream_command(command, log)
            .await
            .map_err(|e| Error::ContainerStart(e.to_string()))
    }

    async fn health_check(
        &self,
        request: &DeployRequest,
        contract: &AppContract,
        log: &StageLog,
    ) -> Result<()> {
        let start_period = contract
            .healthcheck
            .start_period_duration()
            .unwrap_or(Duration::from_secs(10));
        let delay = MIN_START_DELAY.max(start_period);

        log.info(format!("waiting {}s before first probe", delay.as_secs()));
        tokio::time::sleep(delay).await;

        let deadline = tokio::time::Instant::now() + HEALTH_DEADLINE;
        let mut last_error = String::new();

        for attempt in 1..=HEALTH_ATTEMPTS {
            if tokio::time::Instant::now() >= deadline {
                break;
            }

            match self.probe_once(&request.app_name, contract.port, &contract.healthcheck.path).await {
                Ok(status) if (200..300).contains(&status) => {
                    log.info(format!("healthy after {attempt} attempt(s)"));
                    return Ok(());
                }
                Ok(status) => {
                    last_error = format!("status {status}");
                }
                Err(e) => {
                    last_error = e;
                }
            }

            log.warn(format!(
                "probe {attempt}/{HEALTH_ATTEMPTS} failed: {last_error}"
            ));
            tokio::time::sleep(HEALTH_RETRY_DELAY).await;
        }

        Err(Error::HealthCheck(format!(
            "{} never became healthy: {last_error}",
            request.app_name
        )))
    }

    async fn probe_once(
        &self,
        app_name: &str,
        port: u16,
        path: &str,
    ) -> std::result::Result<u16, String> {
        let inspect = self
            .engine
            .inspect_container(app_name)
            .await
            .map_err(|e| e.to_string())?;
        if inspect.ip_address.is_empty() {
            return Err(format!("{app_name} has no address on {OVERLAY_NETWORK}"));
        }

        let url = format!("http://{}:{port}{path}", inspect.ip_address);
        let response = self
            .http
            .get(&url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?;

        Ok(response.status().as_u16())
    }

    /// One-shot health probe for the control plane's `HealthProbe` call.
    pub async fn probe_app(&self, app_name: &str, port: u16, path: &str) -> HealthProbeResponse {
        match self.probe_once(app_name, port, path).await {
            Ok(status) => HealthProbeResponse {
                healthy: (200..300).contains(&status),
                status_code: status as u32,
                message: String::new(),
            },
            Err(message) => HealthProbeResponse {
                healthy: false,
                status_code: 0,
                message,
            },
        }
    }

    /// Stop an app's compose project. Used by the control plane's rollback
    /// path after a failed deployment.
    pub async fn compose_down(&self, app_name: &str) -> Result<()> {
        let compose_path = self.workdir_root.join(app_name).join(COMPOSE_FILE);

        let mut command = Command::new("docker");
        command.args(["compose"]);
        if compose_path.exists() {
            command.arg("-f").arg(&compose_path);
        }
        command.args(["-p", app_name, "down"]);

        let output = command.output().await?;
        if !output.status.success() {
            return Err(Error::ContainerStart(format!(
                "compose down failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(())
    }

    /// Rewrite the routing labels in an app's compose file and reapply it.
    pub async fn update_domains(&self, app_name: &str, domains: &[String], port: u16) -> Result<()> {
        let compose_path = self.workdir_root.join(app_name).join(COMPOSE_FILE);
        let raw = tokio::fs::read_to_string(&compose_path).await?;
        let mut compose: ComposeFile = serde_yaml::from_str(&raw)?;

        if let Some(service) = compose.services.get_mut(app_name) {
            service.labels = paasdeploy_common::compose::router_labels(app_name, port, domains);
        }
        tokio::fs::write(&compose_path, compose.to_yaml()?).await?;

        let output = Command::new("docker")
            .args(["compose", "-f"])
            .arg(&compose_path)
            .args(["-p", app_name, "up", "-d", "--force-recreate"])
            .output()
            .await?;
        if !output.status.success() {
            return Err(Error::ContainerStart(format!(
                "compose up failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }

        Ok(())
    }
}

async fn git(dir: &Path, args: &[&str], log: &StageLog) -> Result<()> {
    let mut command = Command::new("git");
    command.args(args).current_dir(dir);

    stream_command(command, log)
        .await
        .map_err(|e| Error::GitSync(e.to_string()))
}

/// Run a command, forwarding every output line to the stage log. Both
/// streams are drained concurrently so a chatty child never stalls.
async fn stream_command(mut command: Command, log: &StageLog) -> std::io::Result<()> {
    command.stdout(Stdio::piped()).stderr(Stdio::piped());
    let mut child = command.spawn()?;

    let stdout = child.stdout.take().expect("stdout was piped");
    let stderr = child.stderr.take().expect("stderr was piped");

    let drain_out = async {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log.info(line);
        }
    };
    let drain_err = async {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            log.info(line);
        }
    };

    let (status, _, _) = tokio::join!(child.wait(), drain_out, drain_err);
    let status = status?;

    if status.success() {
        Ok(())
    } else {
        warn!(code = ?status.code(), "command exited non-zero");
        Err(std::io::Error::new(
            std::io::ErrorKind::Other,
            format!("exited with {status}"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::ActiveDeployments;

    #[test]
    fn active_set_tracks_busy_state() {
        let active = ActiveDeployments::default();
        assert!(!active.is_busy());

        let id = Uuid::new_v4();
        active.insert(id);
        assert!(active.is_busy());
        assert_eq!(active.ids(), vec![id.to_string()]);

        active.remove(id);
        assert!(!active.is_busy());
    }
}
