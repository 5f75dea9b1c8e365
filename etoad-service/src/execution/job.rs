// Job Executor
// Owns one execution: lifecycle state, the record snapshot and the observer logs

use crate::error::{ServiceError, ServiceResult};
use crate::execution::engine::{ProtocolEngine, RunOutcome};
use crate::execution::events::{EventSender, ExecutionEvent};
use crate::execution::log::AppendLog;
use crate::execution::record::{
    ExecutionId, ExecutionInfo, ExecutionRecord, ExecutionStatus, IntermediatePayload,
};
use crate::execution::registry::JobSummary;
use crate::protocol::{ProtocolDefinition, StepPayload, StepResult, StepStatus};

use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockWriteGuard};
use tracing::{info, warn};

pub struct JobExecutor {
    id: ExecutionId,
    protocol: Arc<ProtocolDefinition>,
    record: RwLock<ExecutionRecord>,
    info_log: Arc<AppendLog<ExecutionInfo>>,
    intermediate_log: Arc<AppendLog<IntermediatePayload>>,
    cancel: Arc<AtomicBool>,
}

impl JobExecutor {
    pub fn new(id: ExecutionId, protocol: Arc<ProtocolDefinition>) -> Self {
        let record = ExecutionRecord::new(id, &protocol.name, &protocol.step_names());
        let info_log = Arc::new(AppendLog::new());
        info_log.push(record.info(Some("queued".to_string())));

        Self {
            id,
            protocol,
            record: RwLock::new(record),
            info_log,
            intermediate_log: Arc::new(AppendLog::new()),
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> ExecutionId {
        self.id
    }

    pub fn protocol(&self) -> &ProtocolDefinition {
        &self.protocol
    }

    pub fn snapshot(&self) -> ExecutionRecord {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Identity and lifecycle fields only; no step results are copied
    pub fn summary(&self) -> JobSummary {
        let record = self.record.read().unwrap_or_else(PoisonError::into_inner);
        JobSummary {
            id: record.id,
            protocol_name: record.protocol_name.clone(),
            status: record.status,
            submitted_at: record.submitted_at,
            completed_at: record.completed_at,
        }
    }

    pub fn status(&self) -> ExecutionStatus {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .status
    }

    fn record_mut(&self) -> RwLockWriteGuard<'_, ExecutionRecord> {
        self.record.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Ask the job to stop. A queued job is cancelled on the spot, a running job
    /// stops at its next step boundary, a finished job is left alone.
    pub fn request_cancel(&self) -> ExecutionStatus {
        let mut record = self.record_mut();
        let current = record.status;
        match current {
            status if status.is_terminal() => status,
            ExecutionStatus::Queued => {
                self.cancel.store(true, Ordering::SeqCst);
                record.status = ExecutionStatus::Cancelled;
                record.termination_message = Some("cancelled before start".to_string());
                record.completed_at = Some(Utc::now());
                self.info_log.push(record.info(record.termination_message.clone()));
                drop(record);
                self.seal();
                info!(execution_id = %self.id, "queued job cancelled");
                ExecutionStatus::Cancelled
            }
            status => {
                self.cancel.store(true, Ordering::SeqCst);
                info!(execution_id = %self.id, "cancellation requested");
                status
            }
        }
    }

    /// Move `Queued` to `Running`; false if the job was cancelled first
    pub fn start(&self) -> bool {
        let mut record = self.record_mut();
        if record.status != ExecutionStatus::Queued {
            return false;
        }
        record.status = ExecutionStatus::Running;
        self.info_log.push(record.info(Some("running".to_string())));
        true
    }

    /// Record the engine outcome and close both logs
    pub fn finish(&self, outcome: RunOutcome) {
        let mut record = self.record_mut();
        if record.status.is_terminal() {
            return;
        }
        record.status = outcome.status;
        record.termination_message = Some(outcome.termination_message.clone());
        record.completed_at = Some(Utc::now());
        self.info_log.push(record.info(Some(outcome.termination_message)));
        drop(record);
        self.seal();
    }

    fn seal(&self) {
        self.info_log.seal();
        self.intermediate_log.seal();
    }

    /// Drive the protocol to completion on the calling task
    pub async fn run(self: Arc<Self>, engine: ProtocolEngine) {
        if !self.start() {
            return;
        }
        info!(execution_id = %self.id, protocol = %self.protocol.name, "job started");

        let engine = engine.with_cancel_flag(Arc::clone(&self.cancel));
        let outcome = engine.execute(&self.protocol, self.as_ref()).await;

        info!(execution_id = %self.id, status = %outcome.status, "job finished");
        self.finish(outcome);
    }

    /// Every status change from submission on; ends after the terminal entry
    pub fn status_stream(&self) -> impl Stream<Item = ExecutionInfo> + Send + 'static {
        self.info_log.cursor().into_stream()
    }

    /// Payloads in step order then emission order; ends when the job is terminal
    pub fn intermediate_stream(&self) -> impl Stream<Item = IntermediatePayload> + Send + 'static {
        self.intermediate_log.cursor().into_stream()
    }

    /// Terminal status and termination message
    pub fn result(&self) -> ServiceResult<(ExecutionStatus, String)> {
        let record = self.record.read().unwrap_or_else(PoisonError::into_inner);
        match (&record.termination_message, record.status.is_terminal()) {
            (Some(message), true) => Ok((record.status, message.clone())),
            _ => Err(ServiceError::Unavailable(format!(
                "execution {} is {}",
                self.id, record.status
            ))),
        }
    }

    fn update_step(
        &self,
        index: usize,
        next: StepStatus,
        message: String,
        apply: impl FnOnce(&mut StepResult),
    ) {
        let mut record = self.record_mut();
        let Some(step) = record.steps.get_mut(index) else {
            warn!(execution_id = %self.id, index, "event for unknown step");
            return;
        };
        if !step.status.can_transition_to(next) {
            warn!(
                execution_id = %self.id,
                step = %step.step_name,
                from = %step.status,
                to = %next,
                "ignoring backwards step transition"
            );
            return;
        }
        step.status = next;
        apply(step);
        self.info_log.push(record.info(Some(message)));
    }
}

impl EventSender for JobExecutor {
    fn send_event(&self, event: ExecutionEvent) {
        match event {
            // Overall status is driven by start() and finish()
            ExecutionEvent::ProtocolStarted { .. } | ExecutionEvent::ProtocolCompleted { .. } => {}

            ExecutionEvent::StepStarted {
                step_name,
                step_index,
                parameters,
            } => self.update_step(
                step_index,
                StepStatus::Running,
                format!("step '{}' started", step_name),
                |step| {
                    step.parameters = parameters;
                    step.started_at = Some(Utc::now());
                },
            ),

            ExecutionEvent::IntermediatePayload {
                step_name,
                step_index,
                label,
                payload,
            } => {
                // The record and the log share one buffer
                let payload = Bytes::from(payload);
                {
                    let mut record = self.record_mut();
                    if let Some(step) = record.steps.get_mut(step_index) {
                        step.payloads.push(StepPayload {
                            label: label.clone(),
                            data: payload.clone(),
                        });
                    }
                }
                self.intermediate_log.push(IntermediatePayload {
                    step_name,
                    step_index,
                    status: label,
                    payload,
                });
            }

            ExecutionEvent::StepCompleted {
                step_name,
                step_index,
                status,
                outputs,
                error,
                ..
            } => {
                let message = match &error {
                    Some(error) => format!("step '{}' failed: {}", step_name, error),
                    None => format!("step '{}' {}", step_name, status),
                };
                self.update_step(step_index, status, message, |step| {
                    step.outputs = outputs;
                    step.error = error;
                    step.completed_at = Some(Utc::now());
                })
            }

            ExecutionEvent::StepSkipped {
                step_name,
                step_index,
                parameters,
                reason,
            } => self.update_step(
                step_index,
                StepStatus::Skipped,
                format!("step '{}' skipped: {}", step_name, reason),
                |step| {
                    step.parameters = parameters;
                    step.completed_at = Some(Utc::now());
                },
            ),

            ExecutionEvent::StepFailed {
                step_name,
                step_index,
                error,
            } => self.update_step(
                step_index,
                StepStatus::Failed,
                format!("step '{}' failed: {}", step_name, error),
                |step| {
                    step.error = Some(error);
                    step.completed_at = Some(Utc::now());
                },
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SimulatedCapability;
    use crate::execution::fixtures::{ferrocyanide, peak_outputs, protocol};
    use futures::StreamExt;
    use std::time::Duration;

    fn executor(definition: ProtocolDefinition) -> Arc<JobExecutor> {
        Arc::new(JobExecutor::new(ExecutionId::new(), Arc::new(definition)))
    }

    #[tokio::test]
    async fn test_successful_run_updates_record_and_logs() {
        let job = executor(ferrocyanide());
        let capability = SimulatedCapability::new()
            .with_payloads(2)
            .with_outputs("SWV", peak_outputs());
        let status = job.status_stream();

        job.clone().run(ProtocolEngine::new(Arc::new(capability))).await;

        let record = job.snapshot();
        assert_eq!(record.status, ExecutionStatus::Succeeded);
        assert!(record.steps.iter().all(|s| s.status == StepStatus::Succeeded));
        assert_eq!(record.steps[0].payloads.len(), 2);
        assert!(record.completed_at.is_some());

        let infos: Vec<ExecutionInfo> = status.collect().await;
        assert_eq!(infos.first().map(|i| i.status), Some(ExecutionStatus::Queued));
        assert_eq!(infos.last().map(|i| i.status), Some(ExecutionStatus::Succeeded));
        assert_eq!(infos.last().map(|i| i.progress), Some(1.0));

        let payloads: Vec<IntermediatePayload> = job.intermediate_stream().collect().await;
        let order: Vec<(usize, String)> = payloads
            .into_iter()
            .map(|p| (p.step_index, p.status))
            .collect();
        assert_eq!(
            order,
            vec![
                (0, "SWV iteration 1/2".to_string()),
                (0, "SWV iteration 2/2".to_string()),
                (1, "CV iteration 1/2".to_string()),
                (1, "CV iteration 2/2".to_string()),
            ]
        );

        let (status, message) = job.result().unwrap();
        assert_eq!(status, ExecutionStatus::Succeeded);
        assert_eq!(Some(message), record.termination_message);
    }

    #[tokio::test]
    async fn test_failure_at_last_step_leaves_nothing_running() {
        let job = executor(ferrocyanide());
        let capability = SimulatedCapability::new()
            .with_outputs("SWV", peak_outputs())
            .with_failure("CV", "compliance voltage exceeded");

        job.clone().run(ProtocolEngine::new(Arc::new(capability))).await;

        let record = job.snapshot();
        assert_eq!(record.status, ExecutionStatus::Failed);
        assert_eq!(record.steps[0].status, StepStatus::Succeeded);
        assert_eq!(record.steps[1].status, StepStatus::Failed);
        assert!(record.steps[1]
            .error
            .as_deref()
            .unwrap()
            .contains("compliance voltage exceeded"));

        let infos: Vec<ExecutionInfo> = job.status_stream().collect().await;
        assert_eq!(infos.last().map(|i| i.status), Some(ExecutionStatus::Failed));
    }

    #[tokio::test]
    async fn test_payload_bytes_shared_between_record_and_log() {
        let job = executor(protocol(r#"{ "A": { "technique": "OCP" } }"#));
        let capability = SimulatedCapability::new().with_payloads(1);

        job.clone().run(ProtocolEngine::new(Arc::new(capability))).await;

        let record = job.snapshot();
        let logged: Vec<IntermediatePayload> = job.intermediate_stream().collect().await;
        assert_eq!(logged.len(), 1);
        assert_eq!(record.steps[0].payloads[0].data.as_ptr(), logged[0].payload.as_ptr());

        let summary = job.summary();
        assert_eq!(summary.status, ExecutionStatus::Succeeded);
        assert_eq!(summary.completed_at, record.completed_at);
    }

    #[tokio::test]
    async fn test_remaining_steps_stay_pending_after_failure() {
        let job = executor(protocol(
            r#"{ "A": { "technique": "OCP" }, "B": { "technique": "SWV" } }"#,
        ));
        let capability = SimulatedCapability::new().with_failure("A", "no contact");

        job.clone().run(ProtocolEngine::new(Arc::new(capability))).await;

        let record = job.snapshot();
        assert_eq!(record.steps[0].status, StepStatus::Failed);
        assert_eq!(record.steps[1].status, StepStatus::Pending);
        assert_eq!(record.progress(), 0.5);
    }

    #[tokio::test]
    async fn test_cancel_while_queued() {
        let job = executor(ferrocyanide());
        assert_eq!(job.request_cancel(), ExecutionStatus::Cancelled);

        let capability = Arc::new(SimulatedCapability::new().with_recording());
        job.clone().run(ProtocolEngine::new(capability.clone())).await;

        assert!(capability.invocations().is_empty());
        assert_eq!(job.status(), ExecutionStatus::Cancelled);
        assert_eq!(
            job.result().unwrap(),
            (ExecutionStatus::Cancelled, "cancelled before start".to_string())
        );
        assert_eq!(job.status_stream().count().await, 2);
    }

    #[tokio::test]
    async fn test_cancel_running_job_finishes_in_flight_step() {
        let job = executor(protocol(
            r#"{ "A": { "technique": "OCP" }, "B": { "technique": "SWV" } }"#,
        ));
        let capability = Arc::new(
            SimulatedCapability::new()
                .with_payloads(1)
                .with_delay(Duration::from_millis(50))
                .with_recording(),
        );
        let handle = tokio::spawn(job.clone().run(ProtocolEngine::new(capability.clone())));

        // Wait until A is running, then cancel
        let mut status = Box::pin(job.status_stream());
        while let Some(info) = status.next().await {
            if info.step_name.as_deref() == Some("A") {
                break;
            }
        }
        assert_eq!(job.request_cancel(), ExecutionStatus::Running);
        handle.await.unwrap();

        let record = job.snapshot();
        assert_eq!(record.status, ExecutionStatus::Cancelled);
        assert_eq!(record.steps[0].status, StepStatus::Succeeded);
        assert_eq!(record.steps[1].status, StepStatus::Pending);
        assert_eq!(capability.invocations(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_result_unavailable_until_terminal() {
        let job = executor(ferrocyanide());
        assert!(matches!(job.result(), Err(ServiceError::Unavailable(_))));
        assert!(job.start());
        assert!(matches!(job.result(), Err(ServiceError::Unavailable(_))));
        // A second start is refused
        assert!(!job.start());
    }

    #[test]
    fn test_backwards_transition_is_ignored() {
        let job = executor(ferrocyanide());
        job.send_event(ExecutionEvent::step_failed("SWV", 0, "boom"));
        job.send_event(ExecutionEvent::step_started("SWV", 0, Default::default()));

        assert_eq!(job.snapshot().steps[0].status, StepStatus::Failed);
    }

    #[test]
    fn test_cancel_on_terminal_job_is_noop() {
        let job = executor(ferrocyanide());
        job.request_cancel();
        assert_eq!(job.request_cancel(), ExecutionStatus::Cancelled);
    }
}
