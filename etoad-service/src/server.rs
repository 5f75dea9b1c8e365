// gRPC Server
// Etoad service implementation over the execution registry

use crate::config::ServiceConfig;
use crate::error::ServiceResult;
use crate::execution::{parse_execution_id, ExecutionRegistry};
use crate::grpc::proto::{
    etoad_server::{Etoad, EtoadServer},
    CancelJobResponse, ExecutionRequest, IntermediateResponse, ListJobsRequest, ListJobsResponse,
    RunJobRequest, RunJobResponse, RunJobResultResponse,
};
use crate::grpc::proto;

use futures::{Stream, StreamExt};
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use tonic::{transport::Server, Request, Response, Status};
use tracing::{debug, info};

type ResponseStream<T> = Pin<Box<dyn Stream<Item = Result<T, Status>> + Send>>;

pub struct EtoadService {
    registry: Arc<ExecutionRegistry>,
}

impl EtoadService {
    pub fn new(registry: Arc<ExecutionRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<ExecutionRegistry> {
        &self.registry
    }

    pub fn into_server(self) -> EtoadServer<Self> {
        EtoadServer::new(self)
    }
}

#[tonic::async_trait]
impl Etoad for EtoadService {
    async fn run_job(
        &self,
        request: Request<RunJobRequest>,
    ) -> Result<Response<RunJobResponse>, Status> {
        let req = request.into_inner();
        if req.job_file.trim().is_empty() {
            return Err(Status::invalid_argument("job_file is required"));
        }

        let id = self.registry.submit_file(Path::new(&req.job_file))?;
        Ok(Response::new(RunJobResponse {
            execution_id: id.to_string(),
        }))
    }

    type RunJobInfoStream = ResponseStream<proto::ExecutionInfo>;

    async fn run_job_info(
        &self,
        request: Request<ExecutionRequest>,
    ) -> Result<Response<Self::RunJobInfoStream>, Status> {
        let id = parse_execution_id(&request.into_inner().execution_id)?;
        debug!(execution_id = %id, "status stream opened");

        let stream = self
            .registry
            .stream_status(&id)?
            .map(|info| Ok(proto::ExecutionInfo::from(info)));
        Ok(Response::new(Box::pin(stream)))
    }

    type RunJobIntermediateStream = ResponseStream<IntermediateResponse>;

    async fn run_job_intermediate(
        &self,
        request: Request<ExecutionRequest>,
    ) -> Result<Response<Self::RunJobIntermediateStream>, Status> {
        let id = parse_execution_id(&request.into_inner().execution_id)?;
        debug!(execution_id = %id, "intermediate stream opened");

        let stream = self
            .registry
            .stream_intermediate(&id)?
            .map(|payload| Ok(IntermediateResponse::from(payload)));
        Ok(Response::new(Box::pin(stream)))
    }

    async fn run_job_result(
        &self,
        request: Request<ExecutionRequest>,
    ) -> Result<Response<RunJobResultResponse>, Status> {
        let id = parse_execution_id(&request.into_inner().execution_id)?;
        let (status, termination_message) = self.registry.result(&id)?;

        Ok(Response::new(RunJobResultResponse {
            termination_message,
            status: status.to_wire(),
        }))
    }

    async fn cancel_job(
        &self,
        request: Request<ExecutionRequest>,
    ) -> Result<Response<CancelJobResponse>, Status> {
        let id = parse_execution_id(&request.into_inner().execution_id)?;
        let status = self.registry.cancel(&id)?;

        Ok(Response::new(CancelJobResponse {
            status: status.to_wire(),
        }))
    }

    async fn list_jobs(
        &self,
        _request: Request<ListJobsRequest>,
    ) -> Result<Response<ListJobsResponse>, Status> {
        let jobs = self
            .registry
            .list()
            .into_iter()
            .map(proto::JobSummary::from)
            .collect();
        Ok(Response::new(ListJobsResponse { jobs }))
    }
}

/// Serve until the process is stopped
pub async fn serve(config: &ServiceConfig) -> ServiceResult<()> {
    let registry = Arc::new(ExecutionRegistry::from_config(config)?);
    let _pruner = registry.spawn_pruner(config.registry.prune_interval());
    let service = EtoadService::new(registry);

    info!(
        addr = %config.server.listen_addr,
        protocol_dir = %config.server.protocol_dir.display(),
        "etoad gRPC server listening"
    );

    Server::builder()
        .add_service(service.into_server())
        .serve(config.server.listen_addr)
        .await?;

    Ok(())
}
