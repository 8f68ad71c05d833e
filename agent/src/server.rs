//! The tonic service the control plane dials.

use std::pin::Pin;
use std::sync::Arc;

use bollard::exec::{CreateExecOptions, StartExecResults};
use futures::{Stream, StreamExt};
use paasdeploy_proto::agent::{
    agent_server::Agent, exec_request, ActionResponse, CleanupImagesRequest,
    CleanupImagesResponse, ComposeDownRequest, ContainerLogsRequest, ContainerLogsResponse,
    ContainerRequest, ContainerStatsResponse, CreateVolumeRequest, DeployLogEntry,
    DeployLogsRequest, DeployRequest, DeployResponse, EnsureNetworkRequest, ExecOutput,
    ExecRequest, HealthProbeRequest, HealthProbeResponse, InspectContainerResponse,
    ListContainersRequest, ListContainersResponse, ListImagesRequest, ListImagesResponse,
    ListNetworksRequest, ListNetworksResponse, ListVolumesRequest, ListVolumesResponse,
    NetworkRequest, PruneImagesRequest, PruneImagesResponse, RemoveContainerRequest,
    RemoveImageRequest, RemoveVolumeRequest, StopContainerRequest, SystemInfoRequest,
    SystemInfoResponse, SystemMetricsRequest, SystemMetricsResponse, UpdateDomainsRequest,
};
use tokio::io::AsyncWriteExt;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::docker::Engine;
use crate::executor::Executor;

pub struct AgentService {
    engine: Engine,
    executor: Arc<Executor>,
}

impl AgentService {
    pub fn new(engine: Engine, executor: Arc<Executor>) -> Self {
        Self { engine, executor }
    }
}

fn ok_action() -> Response<ActionResponse> {
    Response::new(ActionResponse {
        success: true,
        message: String::new(),
    })
}

#[tonic::async_trait]
impl Agent for AgentService {
    async fn get_system_info(
        &self,
        request: Request<SystemInfoRequest>,
    ) -> Result<Response<SystemInfoResponse>, Status> {
        let info = self.engine.system_info(request.into_inner()).await?;
        Ok(Response::new(info))
    }

    async fn get_system_metrics(
        &self,
        _request: Request<SystemMetricsRequest>,
    ) -> Result<Response<SystemMetricsResponse>, Status> {
        Ok(Response::new(self.engine.system_metrics().await?))
    }

    async fn list_containers(
        &self,
        request: Request<ListContainersRequest>,
    ) -> Result<Response<ListContainersResponse>, Status> {
        let containers = self.engine.list_containers(request.into_inner().all).await?;
        Ok(Response::new(ListContainersResponse { containers }))
    }

    async fn inspect_container(
        &self,
        request: Request<ContainerRequest>,
    ) -> Result<Response<InspectContainerResponse>, Status> {
        let inspect = self
            .engine
            .inspect_container(&request.into_inner().name)
            .await?;
        Ok(Response::new(inspect))
    }

    async fn start_container(
        &self,
        request: Request<ContainerRequest>,
    ) -> Result<Response<ActionResponse>, Status> {
        self.engine
            .start_container(&request.into_inner().name)
            .await?;
        Ok(ok_action())
    }

    async fn stop_container(
        &self,
        request: Request<StopContainerRequest>,
    ) -> Result<Response<ActionResponse>, Status> {
        let request = request.into_inner();
        self.engine
            .stop_container(&request.name, request.timeout_secs)
            .await?;
        Ok(ok_action())
    }

    async fn restart_container(
        &self,
        request: Request<ContainerRequest>,
    ) -> Result<Response<ActionResponse>, Status> {
        self.engine
            .restart_container(&request.into_inner().name)
            .await?;
        Ok(ok_action())
    }

    async fn remove_container(
        &self,
        request: Request<RemoveContainerRequest>,
    ) -> Result<Response<ActionResponse>, Status> {
        let request = request.into_inner();
        self.engine
            .remove_container(&request.name, request.force)
            .await?;
        Ok(ok_action())
    }

    async fn get_container_logs(
        &self,
        request: Request<ContainerLogsRequest>,
    ) -> Result<Response<ContainerLogsResponse>, Status> {
        let request = request.into_inner();
        let lines = self.engine.container_logs(&request.name, request.tail).await?;
        Ok(Response::new(ContainerLogsResponse { lines }))
    }

    async fn get_container_stats(
        &self,
        request: Request<ContainerRequest>,
    ) -> Result<Response<ContainerStatsResponse>, Status> {
        let stats = self
            .engine
            .container_stats(&request.into_inner().name)
            .await?;
        Ok(Response::new(stats))
    }

    type ExecContainerStream =
        Pin<Box<dyn Stream<Item = Result<ExecOutput, Status>> + Send + 'static>>;

    async fn exec_container(
        &self,
        request: Request<Streaming<ExecRequest>>,
    ) -> Result<Response<Self::ExecContainerStream>, Status> {
        let mut frames = request.into_inner();

        let start = match frames.message().await? {
            Some(ExecRequest {
                input: Some(exec_request::Input::Start(start)),
            }) => start,
            _ => return Err(Status::invalid_argument("first exec frame must be a start")),
        };

        let docker = self.engine.docker().clone();
        let exec = docker
            .create_exec(
                &start.container,
                CreateExecOptions::<String> {
                    attach_stdin: Some(true),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(start.tty),
                    cmd: Some(start.cmd),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| Status::internal(e.to_string()))?;

        match docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Status::internal(e.to_string()))?
        {
            StartExecResults::Attached { output, mut input } => {
                tokio::spawn(async move {
                    while let Ok(Some(frame)) = frames.message().await {
                        if let Some(exec_request::Input::Stdin(bytes)) = frame.input {
                            if input.write_all(&bytes).await.is_err() {
                                break;
                            }
                        }
                    }
                });

                let output = output.map(|chunk| match chunk {
                    Ok(log) => Ok(ExecOutput {
                        data: log.into_bytes().to_vec(),
                    }),
                    Err(e) => Err(Status::internal(e.to_string())),
                });

                Ok(Response::new(Box::pin(output)))
            }
            StartExecResults::Detached => Err(Status::internal("exec attached no streams")),
        }
    }

    async fn list_images(
        &self,
        _request: Request<ListImagesRequest>,
    ) -> Result<Response<ListImagesResponse>, Status> {
        let images = self.engine.list_images().await?;
        Ok(Response::new(ListImagesResponse { images }))
    }

    async fn remove_image(
        &self,
        request: Request<RemoveImageRequest>,
    ) -> Result<Response<ActionResponse>, Status> {
        let request = request.into_inner();
        self.engine
            .remove_image(&request.reference, request.force)
            .await?;
        Ok(ok_action())
    }

    async fn prune_images(
        &self,
        _request: Request<PruneImagesRequest>,
    ) -> Result<Response<PruneImagesResponse>, Status> {
        let reclaimed_bytes = self.engine.prune_images().await?;
        Ok(Response::new(PruneImagesResponse { reclaimed_bytes }))
    }

    async fn cleanup_images(
        &self,
        request: Request<CleanupImagesRequest>,
    ) -> Result<Response<CleanupImagesResponse>, Status> {
        let request = request.into_inner();
        let (removed, reclaimed_bytes) = self
            .engine
            .cleanup_images(&request.repository, &request.keep_tag)
            .await?;
        Ok(Response::new(CleanupImagesResponse {
            removed,
            reclaimed_bytes,
        }))
    }

    async fn ensure_network(
        &self,
        request: Request<EnsureNetworkRequest>,
    ) -> Result<Response<ActionResponse>, Status> {
        let request = request.into_inner();
        let driver = if request.driver.is_empty() {
            "bridge".to_string()
        } else {
            request.driver
        };
        self.engine.ensure_network(&request.name, &driver).await?;
        Ok(ok_action())
    }

    async fn remove_network(
        &self,
        request: Request<NetworkRequest>,
    ) -> Result<Response<ActionResponse>, Status> {
        self.engine
            .remove_network(&request.into_inner().name)
            .await?;
        Ok(ok_action())
    }

    async fn list_networks(
        &self,
        _request: Request<ListNetworksRequest>,
    ) -> Result<Response<ListNetworksResponse>, Status> {
        let networks = self.engine.list_networks().await?;
        Ok(Response::new(ListNetworksResponse { networks }))
    }

    async fn create_volume(
        &self,
        request: Request<CreateVolumeRequest>,
    ) -> Result<Response<ActionResponse>, Status> {
        self.engine
            .create_volume(&request.into_inner().name)
            .await?;
        Ok(ok_action())
    }

    async fn remove_volume(
        &self,
        request: Request<RemoveVolumeRequest>,
    ) -> Result<Response<ActionResponse>, Status> {
        let request = request.into_inner();
        self.engine.remove_volume(&request.name, request.force).await?;
        Ok(ok_action())
    }

    async fn list_volumes(
        &self,
        _request: Request<ListVolumesRequest>,
    ) -> Result<Response<ListVolumesResponse>, Status> {
        let volumes = self.engine.list_volumes().await?;
        Ok(Response::new(ListVolumesResponse { volumes }))
    }

    #[instrument(skip(self, request))]
    async fn execute_deploy(
        &self,
        request: Request<DeployRequest>,
    ) -> Result<Response<DeployResponse>, Status> {
        let request = request.into_inner();
        info!(app = %request.app_name, commit = %request.commit_sha, "deploy requested");

        // The pipeline runs on its own task so a dropped call (client gone,
        // deadline hit) never leaves a half-finished container behind.
        let executor = self.executor.clone();
        let response = tokio::spawn(async move { executor.execute(request).await })
            .await
            .map_err(|e| Status::internal(format!("deploy task panicked: {e}")))?;

        Ok(Response::new(response))
    }

    type StreamDeployLogsStream =
        Pin<Box<dyn Stream<Item = Result<DeployLogEntry, Status>> + Send + 'static>>;

    async fn stream_deploy_logs(
        &self,
        request: Request<DeployLogsRequest>,
    ) -> Result<Response<Self::StreamDeployLogsStream>, Status> {
        let id = Uuid::parse_str(&request.into_inner().deployment_id)
            .map_err(|_| Status::invalid_argument("malformed deployment id"))?;

        let receiver = self.executor.router().subscribe(id);
        let stream = ReceiverStream::new(receiver).map(|item| Ok(DeployLogEntry::from(item)));

        Ok(Response::new(Box::pin(stream)))
    }

    async fn compose_down(
        &self,
        request: Request<ComposeDownRequest>,
    ) -> Result<Response<ActionResponse>, Status> {
        self.executor
            .compose_down(&request.into_inner().app_name)
            .await?;
        Ok(ok_action())
    }

    async fn update_domains(
        &self,
        request: Request<UpdateDomainsRequest>,
    ) -> Result<Response<ActionResponse>, Status> {
        let request = request.into_inner();
        self.executor
            .update_domains(&request.app_name, &request.domains, request.port as u16)
            .await?;
        Ok(ok_action())
    }

    async fn health_probe(
        &self,
        request: Request<HealthProbeRequest>,
    ) -> Result<Response<HealthProbeResponse>, Status> {
        let request = request.into_inner();
        let response = self
            .executor
            .probe_app(&request.app_name, request.port as u16, &request.path)
            .await;
        Ok(Response::new(response))
    }
}
