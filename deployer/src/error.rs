use paasdeploy_common::deployment::Status;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("certificate authority error: {0}")]
    Pki(#[from] paasdeploy_pki::PkiError),
    #[error("agent rpc failed: {0}")]
    Rpc(#[from] tonic::Status),
    #[error("agent unreachable: {0}")]
    Transport(#[from] tonic::transport::Error),
    #[error("invalid app contract: {0}")]
    Contract(#[from] paasdeploy_common::app::ContractError),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("a deployment is already pending for this app")]
    DeploymentPending,
    #[error("an agent update is already in flight for this host")]
    UpdateInFlight,
    #[error("illegal deployment transition {from} -> {to}")]
    IllegalTransition { from: Status, to: Status },
    #[error("{0} not found")]
    NotFound(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
