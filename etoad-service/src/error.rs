// Service Errors
// Error taxonomy shared by the engine, registry and gRPC layer

use crate::capability::CapabilityError;
use crate::config::ConfigError;
use crate::protocol::ParseError;

use thiserror::Error;

pub type ServiceResult<T> = Result<T, ServiceError>;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("execution not found: {0}")]
    NotFound(String),

    #[error("invalid protocol: {0}")]
    Parse(#[from] ParseError),

    #[error("result unavailable: {0}")]
    Unavailable(String),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Failure local to one step; recorded on its StepResult and in the
/// termination message, never returned from a query
#[derive(Debug, Clone, PartialEq, Error)]
pub enum StepError {
    #[error("unresolved dependency: {0}")]
    UnresolvedDependency(String),

    #[error("empty selection: {0}")]
    EmptySelection(String),

    #[error("capability failure: {0}")]
    CapabilityFailure(#[from] CapabilityError),
}

impl From<ServiceError> for tonic::Status {
    fn from(err: ServiceError) -> Self {
        match &err {
            ServiceError::NotFound(_) => tonic::Status::not_found(err.to_string()),
            ServiceError::Parse(_) => tonic::Status::invalid_argument(err.to_string()),
            ServiceError::Unavailable(_) => tonic::Status::unavailable(err.to_string()),
            ServiceError::Config(_) | ServiceError::Io(_) | ServiceError::Transport(_) => {
                tonic::Status::internal(err.to_string())
            }
        }
    }
}
