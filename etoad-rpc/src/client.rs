// Etoad RPC Client
// Typed wrapper over the generated gRPC client

use crate::error::{RpcError, RpcResult};

use etoad_service::grpc::proto::{
    self, etoad_client::EtoadClient, ExecutionRequest, ListJobsRequest, RunJobRequest,
};
use etoad_service::{ExecutionInfo, ExecutionStatus, IntermediatePayload};
use futures::stream::{BoxStream, StreamExt};
use std::time::Duration;
use tonic::transport::Channel;
use tracing::debug;

pub const DEFAULT_ENDPOINT: &str = "http://[::1]:50052";

/// One row of the server's job table
#[derive(Debug, Clone, PartialEq)]
pub struct JobListing {
    pub execution_id: String,
    pub protocol_name: String,
    pub status: ExecutionStatus,
    pub submitted_at_unix: i64,
}

fn status(value: i32) -> RpcResult<ExecutionStatus> {
    ExecutionStatus::from_wire(value)
        .ok_or_else(|| RpcError::Malformed(format!("unknown execution status {}", value)))
}

fn execution_info(info: proto::ExecutionInfo) -> RpcResult<ExecutionInfo> {
    Ok(ExecutionInfo {
        status: status(info.status)?,
        progress: info.progress,
        step_index: info.step_index.map(|i| i as usize),
        step_name: info.step_name,
        message: info.message,
    })
}

fn intermediate(response: proto::IntermediateResponse) -> IntermediatePayload {
    IntermediatePayload {
        step_name: response.step_name,
        step_index: response.step_index as usize,
        status: response.status,
        payload: response.payload.into(),
    }
}

fn execution(id: &str) -> ExecutionRequest {
    ExecutionRequest {
        execution_id: id.to_string(),
    }
}

#[derive(Debug, Clone)]
pub struct EtoadRpcClient {
    inner: EtoadClient<Channel>,
}

impl EtoadRpcClient {
    pub async fn connect(endpoint: impl Into<String>) -> RpcResult<Self> {
        let endpoint = endpoint.into();
        debug!(%endpoint, "connecting");
        let channel = Channel::from_shared(endpoint)
            .map_err(|e| RpcError::InvalidArgument(e.to_string()))?
            .connect()
            .await?;
        Ok(Self::from_channel(channel))
    }

    pub fn from_channel(channel: Channel) -> Self {
        Self {
            inner: EtoadClient::new(channel),
        }
    }

    /// Submit a job file; returns the execution identifier
    pub async fn run_job(&mut self, job_file: &str) -> RpcResult<String> {
        let response = self
            .inner
            .run_job(RunJobRequest {
                job_file: job_file.to_string(),
            })
            .await?;
        Ok(response.into_inner().execution_id)
    }

    /// Status updates until the job is terminal
    pub async fn watch_status(
        &mut self,
        execution_id: &str,
    ) -> RpcResult<BoxStream<'static, RpcResult<ExecutionInfo>>> {
        let stream = self
            .inner
            .run_job_info(execution(execution_id))
            .await?
            .into_inner()
            .map(|item| -> RpcResult<ExecutionInfo> { execution_info(item?) });
        Ok(stream.boxed())
    }

    pub async fn watch_intermediate(
        &mut self,
        execution_id: &str,
    ) -> RpcResult<BoxStream<'static, RpcResult<IntermediatePayload>>> {
        let stream = self
            .inner
            .run_job_intermediate(execution(execution_id))
            .await?
            .into_inner()
            .map(|item| -> RpcResult<IntermediatePayload> { Ok(intermediate(item?)) });
        Ok(stream.boxed())
    }

    /// Most recent status. Drains the replayed backlog, waiting at most `settle`
    /// for each further update of a job that is still running.
    pub async fn status(&mut self, execution_id: &str, settle: Duration) -> RpcResult<ExecutionInfo> {
        let mut stream = self.watch_status(execution_id).await?;
        let mut latest = match stream.next().await {
            Some(info) => info?,
            None => return Err(RpcError::Malformed("empty status stream".to_string())),
        };
        while !latest.status.is_terminal() {
            match tokio::time::timeout(settle, stream.next()).await {
                Ok(Some(info)) => latest = info?,
                Ok(None) | Err(_) => break,
            }
        }
        Ok(latest)
    }

    /// Terminal status and termination message
    pub async fn result(&mut self, execution_id: &str) -> RpcResult<(ExecutionStatus, String)> {
        let response = self
            .inner
            .run_job_result(execution(execution_id))
            .await?
            .into_inner();
        Ok((status(response.status)?, response.termination_message))
    }

    pub async fn cancel(&mut self, execution_id: &str) -> RpcResult<ExecutionStatus> {
        let response = self
            .inner
            .cancel_job(execution(execution_id))
            .await?
            .into_inner();
        status(response.status)
    }

    pub async fn list(&mut self) -> RpcResult<Vec<JobListing>> {
        let response = self.inner.list_jobs(ListJobsRequest {}).await?.into_inner();
        response
            .jobs
            .into_iter()
            .map(|job| {
                Ok(JobListing {
                    status: status(job.status)?,
                    execution_id: job.execution_id,
                    protocol_name: job.protocol_name,
                    submitted_at_unix: job.submitted_at_unix,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use etoad_service::{EtoadService, ExecutionRegistry, FileProtocolLoader, SimulatedCapability};
    use std::sync::Arc;
    use tokio::net::TcpListener;
    use tokio_stream::wrappers::TcpListenerStream;

    const PROTOCOL: &str = r#"{
        "Protocol Name": "ocp",
        "Sample Volume": 1.0,
        "Total Volume": 5.0,
        "Discard Sample": true,
        "Purge": 0,
        "Wash": {},
        "Steps": [
            { "name": "OCP", "technique": "OCP" },
            { "name": "SWV", "technique": "SWV" }
        ]
    }"#;

    /// Serve on an ephemeral port; the temp dir holds `ocp.json`
    async fn spawn_server() -> (EtoadRpcClient, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ocp.json"), PROTOCOL).unwrap();

        let registry = ExecutionRegistry::new(Arc::new(
            SimulatedCapability::new()
                .with_payloads(2)
                .with_delay(Duration::from_millis(5)),
        ))
        .with_loader(Arc::new(FileProtocolLoader::new(dir.path())));
        let service = EtoadService::new(Arc::new(registry));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            tonic::transport::Server::builder()
                .add_service(service.into_server())
                .serve_with_incoming(TcpListenerStream::new(listener))
                .await
                .unwrap();
        });

        let client = EtoadRpcClient::connect(format!("http://{}", addr)).await.unwrap();
        (client, dir)
    }

    #[tokio::test]
    async fn test_submit_watch_and_fetch_result() {
        let (mut client, _dir) = spawn_server().await;
        let id = client.run_job("ocp.json").await.unwrap();

        let payloads: Vec<_> = client
            .watch_intermediate(&id)
            .await
            .unwrap()
            .map(|p| p.unwrap())
            .collect()
            .await;
        let labels: Vec<&str> = payloads.iter().map(|p| p.status.as_str()).collect();
        assert_eq!(
            labels,
            vec!["OCP iteration 1/2", "OCP iteration 2/2", "SWV iteration 1/2", "SWV iteration 2/2"]
        );

        let latest = client.status(&id, Duration::from_millis(50)).await.unwrap();
        assert_eq!(latest.status, ExecutionStatus::Succeeded);

        let (status, message) = client.result(&id).await.unwrap();
        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(message, "protocol 'ocp' completed: 2 of 2 steps succeeded, 0 skipped");

        let jobs = client.list().await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].execution_id, id);
    }

    #[tokio::test]
    async fn test_errors_map_to_rpc_taxonomy() {
        let (mut client, _dir) = spawn_server().await;

        let err = client.result("00000000-0000-4000-8000-000000000000").await.unwrap_err();
        assert!(matches!(err, RpcError::NotFound(_)));

        let err = client.run_job("missing.yaml").await.unwrap_err();
        assert!(matches!(err, RpcError::InvalidArgument(_)));

        let err = client.watch_status("garbage").await.err().unwrap();
        assert!(matches!(err, RpcError::NotFound(_)));
    }
}
