pub mod client;
pub mod error;

pub use client::{EtoadRpcClient, JobListing, DEFAULT_ENDPOINT};
pub use error::{RpcError, RpcResult};

// Re-export types needed by clients
pub use etoad_service::{ExecutionInfo, ExecutionStatus, IntermediatePayload};
pub use etoad_service;
