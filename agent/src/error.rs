use paasdeploy_common::deployment::Stage;
use tonic::Status;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("git sync failed: {0}")]
    GitSync(String),
    #[error("invalid app contract: {0}")]
    Contract(#[from] paasdeploy_common::app::ContractError),
    #[error("image build failed: {0}")]
    Build(String),
    #[error("container start failed: {0}")]
    ContainerStart(String),
    #[error("health check failed: {0}")]
    HealthCheck(String),
    #[error("engine error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("compose generation failed: {0}")]
    Compose(#[from] serde_yaml::Error),
    #[error("i/o error: {0}")]
    InputOutput(#[from] std::io::Error),
    #[error("control plane unreachable: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("registration rejected by control plane")]
    RegistrationRejected,
    #[error("self-update failed: {0}")]
    Update(String),
}

impl Error {
    /// Which pipeline stage a failure is attributed to on the deployment row.
    pub fn stage(&self) -> Stage {
        match self {
            Error::GitSync(_) | Error::Contract(_) => Stage::GitSync,
            Error::Build(_) => Stage::Build,
            Error::HealthCheck(_) => Stage::HealthCheck,
            _ => Stage::Deploy,
        }
    }
}

impl From<Error> for Status {
    fn from(error: Error) -> Self {
        match &error {
            Error::Contract(_) => Status::invalid_argument(error.to_string()),
            Error::GitSync(_) | Error::Build(_) | Error::HealthCheck(_) => {
                Status::failed_precondition(error.to_string())
            }
            Error::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }) => Status::not_found(error.to_string()),
            _ => Status::internal(error.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
