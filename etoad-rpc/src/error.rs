use thiserror::Error;
use tonic::Code;

pub type RpcResult<T> = Result<T, RpcError>;

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid request: {0}")]
    InvalidArgument(String),

    #[error("unavailable: {0}")]
    Unavailable(String),

    #[error("malformed response: {0}")]
    Malformed(String),

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("server error: {0}")]
    Status(tonic::Status),
}

impl RpcError {
    /// The job exists but has no result yet
    pub fn is_unavailable(&self) -> bool {
        matches!(self, RpcError::Unavailable(_))
    }
}

impl From<tonic::Status> for RpcError {
    fn from(status: tonic::Status) -> Self {
        let message = status.message().to_string();
        match status.code() {
            Code::NotFound => RpcError::NotFound(message),
            Code::InvalidArgument => RpcError::InvalidArgument(message),
            Code::Unavailable => RpcError::Unavailable(message),
            _ => RpcError::Status(status),
        }
    }
}
