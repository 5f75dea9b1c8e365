// Execution Registry
// Process-wide table of executions keyed by identifier, with retention pruning

use crate::capability::{MeasurementCapability, SimulatedCapability};
use crate::config::ServiceConfig;
use crate::error::{ServiceError, ServiceResult};
use crate::execution::engine::ProtocolEngine;
use crate::execution::job::JobExecutor;
use crate::execution::record::{
    ExecutionId, ExecutionInfo, ExecutionRecord, ExecutionStatus, IntermediatePayload,
};
use crate::protocol::{FileProtocolLoader, ProtocolDefinition, ProtocolLoader};

use chrono::{DateTime, Utc};
use futures::stream::{BoxStream, StreamExt};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// One row of `list()`
#[derive(Debug, Clone, PartialEq)]
pub struct JobSummary {
    pub id: ExecutionId,
    pub protocol_name: String,
    pub status: ExecutionStatus,
    pub submitted_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobSummary {
    /// Terminal and finished at least `retention` before `now`
    pub fn is_expired(&self, now: DateTime<Utc>, retention: Duration) -> bool {
        self.status.is_terminal()
            && self
                .completed_at
                .and_then(|done| now.signed_duration_since(done).to_std().ok())
                .is_some_and(|age| age >= retention)
    }
}

/// Parse a client-supplied identifier; anything unparseable cannot exist
pub fn parse_execution_id(raw: &str) -> ServiceResult<ExecutionId> {
    raw.parse()
        .map_err(|_| ServiceError::NotFound(raw.to_string()))
}

pub struct ExecutionRegistry {
    jobs: RwLock<HashMap<ExecutionId, Arc<JobExecutor>>>,
    capability: Arc<dyn MeasurementCapability>,
    loader: Arc<dyn ProtocolLoader>,
    /// `None` keeps finished executions forever
    retention: Option<Duration>,
}

impl ExecutionRegistry {
    pub fn new(capability: Arc<dyn MeasurementCapability>) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            capability,
            loader: Arc::new(FileProtocolLoader::default()),
            retention: None,
        }
    }

    /// Registry backed by the simulated capability and the configured protocol directory
    pub fn from_config(config: &ServiceConfig) -> ServiceResult<Self> {
        let capability = SimulatedCapability::from_config(&config.simulation)?;
        Ok(Self::new(Arc::new(capability))
            .with_loader(Arc::new(FileProtocolLoader::new(&config.server.protocol_dir)))
            .with_retention(config.registry.retention()))
    }

    pub fn with_loader(mut self, loader: Arc<dyn ProtocolLoader>) -> Self {
        self.loader = loader;
        self
    }

    pub fn with_retention(mut self, retention: Option<Duration>) -> Self {
        self.retention = retention;
        self
    }

    /// Register a new execution and start it on a background task
    pub fn submit(&self, protocol: ProtocolDefinition) -> ExecutionId {
        let protocol = Arc::new(protocol);
        let executor = {
            let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
            let mut id = ExecutionId::new();
            while jobs.contains_key(&id) {
                id = ExecutionId::new();
            }
            let executor = Arc::new(JobExecutor::new(id, Arc::clone(&protocol)));
            jobs.insert(id, Arc::clone(&executor));
            executor
        };

        let id = executor.id();
        info!(execution_id = %id, protocol = %protocol.name, steps = protocol.steps.len(), "job submitted");
        tokio::spawn(executor.run(ProtocolEngine::new(Arc::clone(&self.capability))));
        id
    }

    /// Load a job file and submit it; a parse error creates no execution
    pub fn submit_file(&self, path: &Path) -> ServiceResult<ExecutionId> {
        let protocol = self.loader.load(path)?;
        Ok(self.submit(protocol))
    }

    fn executor(&self, id: &ExecutionId) -> ServiceResult<Arc<JobExecutor>> {
        self.jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(id)
            .cloned()
            .ok_or_else(|| ServiceError::NotFound(id.to_string()))
    }

    pub fn get(&self, id: &ExecutionId) -> ServiceResult<ExecutionRecord> {
        Ok(self.executor(id)?.snapshot())
    }

    pub fn stream_status(&self, id: &ExecutionId) -> ServiceResult<BoxStream<'static, ExecutionInfo>> {
        Ok(self.executor(id)?.status_stream().boxed())
    }

    pub fn stream_intermediate(
        &self,
        id: &ExecutionId,
    ) -> ServiceResult<BoxStream<'static, IntermediatePayload>> {
        Ok(self.executor(id)?.intermediate_stream().boxed())
    }

    pub fn result(&self, id: &ExecutionId) -> ServiceResult<(ExecutionStatus, String)> {
        self.executor(id)?.result()
    }

    pub fn cancel(&self, id: &ExecutionId) -> ServiceResult<ExecutionStatus> {
        Ok(self.executor(id)?.request_cancel())
    }

    /// All executions, oldest submission first
    pub fn list(&self) -> Vec<JobSummary> {
        let mut summaries: Vec<JobSummary> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|executor| executor.summary())
            .collect();
        summaries.sort_by_key(|s| s.submitted_at);
        summaries
    }

    pub fn len(&self) -> usize {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for an execution to reach a terminal status
    pub async fn wait(&self, id: &ExecutionId) -> ServiceResult<ExecutionRecord> {
        let executor = self.executor(id)?;
        let mut status = executor.status_stream().boxed();
        while status.next().await.is_some() {}
        Ok(executor.snapshot())
    }

    /// Drop terminal executions that finished more than `retention` before `now`
    pub fn prune(&self, now: DateTime<Utc>) -> usize {
        let Some(retention) = self.retention else {
            return 0;
        };

        // Terminal states are final, so expiry found under the read lock still holds
        let expired: Vec<ExecutionId> = self
            .jobs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, executor)| executor.summary().is_expired(now, retention))
            .map(|(id, _)| *id)
            .collect();
        if expired.is_empty() {
            return 0;
        }

        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let removed = expired.iter().filter(|id| jobs.remove(*id).is_some()).count();
        if removed > 0 {
            debug!(removed, remaining = jobs.len(), "pruned finished executions");
        }
        removed
    }

    /// Periodically prune; the task ends once the registry is dropped
    pub fn spawn_pruner(self: &Arc<Self>, interval: Duration) -> Option<JoinHandle<()>> {
        self.retention?;
        let registry: Weak<Self> = Arc::downgrade(self);

        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                registry.prune(Utc::now());
            }
        }))
    }
}
