// Protocol Engine
// Walks the steps in order, resolving parameters and invoking the capability

use crate::capability::{Invocation, MeasurementCapability, PayloadSink};
use crate::error::StepError;
use crate::execution::events::{EventSender, ExecutionEvent};
use crate::execution::record::ExecutionStatus;
use crate::execution::resolver::ParameterResolver;
use crate::execution::store::StepOutputStore;
use crate::protocol::{ParameterMap, ProtocolDefinition, StepSpec, SKIP_KEYWORD, STOP_KEYWORD};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Result of one protocol run
#[derive(Debug)]
pub struct RunOutcome {
    pub status: ExecutionStatus,
    pub termination_message: String,
    /// Outputs of every step that succeeded
    pub outputs: StepOutputStore,
    pub duration: Duration,
}

/// What a step's resolved parameters ask the engine to do
enum Control {
    Run,
    Skip(String),
    Stop,
}

/// Only values pulled in by update rules are checked, in rule order
fn control(step: &StepSpec, parameters: &ParameterMap) -> Control {
    for rule in &step.update_rules {
        match parameters.get(&rule.target) {
            Some(value) if value.is_keyword(STOP_KEYWORD) => return Control::Stop,
            Some(value) if value.is_keyword(SKIP_KEYWORD) => {
                return Control::Skip(format!("parameter '{}' is {}", rule.target, SKIP_KEYWORD))
            }
            _ => {}
        }
    }
    Control::Run
}

pub struct ProtocolEngine {
    capability: Arc<dyn MeasurementCapability>,
    cancel: Arc<AtomicBool>,
}

impl ProtocolEngine {
    pub fn new(capability: Arc<dyn MeasurementCapability>) -> Self {
        Self {
            capability,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Share a cancellation flag; it is checked before each step starts
    pub fn with_cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Run every step of `protocol`, reporting progress to `events`
    pub async fn execute(&self, protocol: &ProtocolDefinition, events: &dyn EventSender) -> RunOutcome {
        let start = Instant::now();
        let total = protocol.steps.len();
        let mut store = StepOutputStore::new();
        let mut succeeded = 0;
        let mut skipped = 0;
        let mut termination = None;

        info!(protocol = %protocol.name, steps = total, "protocol started");
        events.send_event(ExecutionEvent::protocol_started(&protocol.name, total));

        for (index, step) in protocol.steps.iter().enumerate() {
            if self.cancel.load(Ordering::SeqCst) {
                info!(protocol = %protocol.name, step = %step.name, "cancellation observed");
                termination = Some((
                    ExecutionStatus::Cancelled,
                    format!("cancelled before step '{}'", step.name),
                ));
                break;
            }

            let parameters = match ParameterResolver::resolve_step(step, &store) {
                Ok(parameters) => parameters,
                Err(err) => {
                    warn!(step = %step.name, error = %err, "parameter resolution failed");
                    events.send_event(ExecutionEvent::step_failed(&step.name, index, err.to_string()));
                    termination = Some((
                        ExecutionStatus::Failed,
                        format!("step '{}' failed: {}", step.name, err),
                    ));
                    break;
                }
            };

            match control(step, &parameters) {
                Control::Run => {}
                Control::Skip(reason) => {
                    debug!(step = %step.name, %reason, "step skipped");
                    events.send_event(ExecutionEvent::step_skipped(&step.name, index, parameters, reason));
                    skipped += 1;
                    continue;
                }
                Control::Stop => {
                    info!(step = %step.name, "protocol stopped by keyword");
                    termination = Some((
                        ExecutionStatus::Succeeded,
                        format!("protocol stopped at step '{}'", step.name),
                    ));
                    break;
                }
            }

            debug!(step = %step.name, index, technique = %step.technique, "step started");
            events.send_event(ExecutionEvent::step_started(&step.name, index, parameters.clone()));

            let step_start = Instant::now();
            let sink = PayloadSink::new(events, &step.name, index);
            let invocation = Invocation::new(step, parameters, &protocol.settings);

            match self.capability.invoke(invocation, &sink).await {
                Ok(outputs) => {
                    debug!(step = %step.name, outputs = outputs.len(), "step succeeded");
                    events.send_event(ExecutionEvent::step_succeeded(
                        &step.name,
                        index,
                        outputs.clone(),
                        step_start.elapsed(),
                    ));
                    store.insert(&step.name, outputs);
                    succeeded += 1;
                }
                Err(err) => {
                    let err = StepError::from(err);
                    warn!(step = %step.name, error = %err, "step failed");
                    events.send_event(ExecutionEvent::step_errored(
                        &step.name,
                        index,
                        err.to_string(),
                        step_start.elapsed(),
                    ));
                    termination = Some((
                        ExecutionStatus::Failed,
                        format!("step '{}' failed: {}", step.name, err),
                    ));
                    break;
                }
            }
        }

        let (status, termination_message) = termination.unwrap_or_else(|| {
            (
                ExecutionStatus::Succeeded,
                format!(
                    "protocol '{}' completed: {} of {} steps succeeded, {} skipped",
                    protocol.name, succeeded, total, skipped
                ),
            )
        });
        let duration = start.elapsed();

        info!(
            protocol = %protocol.name,
            %status,
            duration_ms = duration.as_millis() as u64,
            "protocol finished"
        );
        events.send_event(ExecutionEvent::protocol_completed(
            &protocol.name,
            status == ExecutionStatus::Succeeded,
            duration,
        ));

        RunOutcome {
            status,
            termination_message,
            outputs: store,
            duration,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::SimulatedCapability;
    use crate::execution::events::{progress_channel, ProgressReceiver, ProgressSender};
    use crate::execution::fixtures::{ferrocyanide, peak_outputs, protocol, CancellingCapability};
    use crate::protocol::{StepStatus, Value};

    fn drain(rx: &mut ProgressReceiver) -> Vec<ExecutionEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn started_steps(events: &[ExecutionEvent]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| match event {
                ExecutionEvent::StepStarted { step_name, .. } => Some(step_name.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_derived_parameter_reaches_capability() {
        let capability = SimulatedCapability::new().with_outputs("SWV", peak_outputs());
        let engine = ProtocolEngine::new(Arc::new(capability));
        let (tx, mut rx) = progress_channel();

        let outcome = engine.execute(&ferrocyanide(), &tx).await;
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        assert_eq!(
            outcome.termination_message,
            "protocol 'ferrocyanide' completed: 2 of 2 steps succeeded, 0 skipped"
        );
        assert!(outcome.outputs.get("SWV").is_some());

        let events = drain(&mut rx);
        assert_eq!(started_steps(&events), vec!["SWV", "CV"]);
        let cv_parameters = events.iter().find_map(|event| match event {
            ExecutionEvent::StepStarted {
                step_name,
                parameters,
                ..
            } if step_name == "CV" => Some(parameters.clone()),
            _ => None,
        });
        let cv_parameters = cv_parameters.unwrap();
        assert_eq!(cv_parameters.get("E_1"), Some(&Value::Number(0.3)));
        assert_eq!(cv_parameters.get("scan_rate"), Some(&Value::Number(0.1)));
    }

    #[tokio::test]
    async fn test_unresolved_dependency_fails_step() {
        // SWV yields no "Peak Picking" output
        let engine = ProtocolEngine::new(Arc::new(SimulatedCapability::new()));
        let (tx, mut rx) = progress_channel();

        let outcome = engine.execute(&ferrocyanide(), &tx).await;
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert!(outcome.termination_message.starts_with("step 'CV' failed: unresolved dependency"));

        let events = drain(&mut rx);
        assert_eq!(started_steps(&events), vec!["SWV"]);
        assert!(events
            .iter()
            .any(|e| matches!(e, ExecutionEvent::StepFailed { step_index: 1, .. })));
    }

    #[tokio::test]
    async fn test_capability_failure_stops_run() {
        let capability = SimulatedCapability::new().with_failure("SWV", "no signal");
        let engine = ProtocolEngine::new(Arc::new(capability));

        let outcome = engine.execute(&ferrocyanide(), &None::<ProgressSender>).await;
        assert_eq!(outcome.status, ExecutionStatus::Failed);
        assert_eq!(
            outcome.termination_message,
            "step 'SWV' failed: capability failure: instrument error: no signal"
        );
        assert!(outcome.outputs.is_empty());
    }

    #[tokio::test]
    async fn test_skip_keyword_skips_step_and_continues() {
        let definition = protocol(
            r#"{
            "A": { "technique": "OCP" },
            "B": {
                "technique": "SWV",
                "update_parameters": [
                    { "parameter": "mode", "from measurement": "A", "key": "next" }
                ]
            },
            "C": { "technique": "CV" }
        }"#,
        );
        let mut outputs = crate::protocol::AnalysisOutputs::new();
        outputs.insert("next".to_string(), Value::from(SKIP_KEYWORD));
        let capability = Arc::new(
            SimulatedCapability::new()
                .with_outputs("A", outputs)
                .with_recording(),
        );
        let engine = ProtocolEngine::new(capability.clone());
        let (tx, mut rx) = progress_channel();

        let outcome = engine.execute(&definition, &tx).await;
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        assert!(outcome.termination_message.ends_with("2 of 3 steps succeeded, 1 skipped"));
        assert!(outcome.outputs.get("B").is_none());
        assert_eq!(capability.invocations(), vec!["A".to_string(), "C".to_string()]);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(
            e,
            ExecutionEvent::StepSkipped { step_name, .. } if step_name == "B"
        )));
    }

    #[tokio::test]
    async fn test_static_keyword_values_are_plain_parameters() {
        let definition = protocol(
            r#"{ "A": { "technique": "OCP", "parameters": { "mode": "SKIP", "end": "STOP" } } }"#,
        );
        let capability = Arc::new(SimulatedCapability::new().with_recording());
        let engine = ProtocolEngine::new(capability.clone());

        let outcome = engine.execute(&definition, &None::<ProgressSender>).await;
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        assert!(outcome.termination_message.ends_with("1 of 1 steps succeeded, 0 skipped"));
        assert_eq!(capability.invocations(), vec!["A".to_string()]);
    }

    #[tokio::test]
    async fn test_derived_stop_keyword_ends_run() {
        let definition = protocol(
            r#"{
            "OCP": { "technique": "OCP" },
            "SWV": {
                "technique": "SWV",
                "update_parameters": [
                    { "parameter": "mode", "from measurement": "OCP", "key": "next" }
                ]
            },
            "CV": { "technique": "CV" }
        }"#,
        );
        let mut outputs = crate::protocol::AnalysisOutputs::new();
        outputs.insert("next".to_string(), Value::from(STOP_KEYWORD));
        let capability = Arc::new(
            SimulatedCapability::new()
                .with_outputs("OCP", outputs)
                .with_recording(),
        );
        let engine = ProtocolEngine::new(capability.clone());

        let outcome = engine.execute(&definition, &None::<ProgressSender>).await;
        assert_eq!(outcome.status, ExecutionStatus::Succeeded);
        assert_eq!(outcome.termination_message, "protocol stopped at step 'SWV'");
        assert_eq!(capability.invocations(), vec!["OCP".to_string()]);
    }

    #[tokio::test]
    async fn test_cancel_observed_at_next_boundary() {
        let definition = protocol(
            r#"{
            "A": { "technique": "OCP" },
            "B": { "technique": "SWV" },
            "C": { "technique": "CV" }
        }"#,
        );
        let flag = Arc::new(AtomicBool::new(false));
        let capability = CancellingCapability {
            step: "B".to_string(),
            flag: flag.clone(),
            delay: Duration::from_millis(5),
        };
        let engine = ProtocolEngine::new(Arc::new(capability)).with_cancel_flag(flag);
        let (tx, mut rx) = progress_channel();

        let outcome = engine.execute(&definition, &tx).await;
        assert_eq!(outcome.status, ExecutionStatus::Cancelled);
        assert_eq!(outcome.termination_message, "cancelled before step 'C'");

        // B finished its in-flight work; C never started
        let events = drain(&mut rx);
        assert_eq!(started_steps(&events), vec!["A", "B"]);
        assert!(events.iter().any(|e| matches!(
            e,
            ExecutionEvent::StepCompleted { step_index: 1, status: StepStatus::Succeeded, .. }
        )));
    }

    #[test]
    fn test_first_derived_keyword_wins() {
        let definition = protocol(
            r#"{
            "A": { "technique": "OCP" },
            "B": {
                "technique": "CV",
                "update_parameters": [
                    { "parameter": "first", "from measurement": "A", "key": "k1" },
                    { "parameter": "second", "from measurement": "A", "key": "k2" }
                ]
            }
        }"#,
        );
        let step = &definition.steps[1];
        let mut parameters = ParameterMap::new();
        parameters.insert("first".to_string(), Value::from(SKIP_KEYWORD));
        parameters.insert("second".to_string(), Value::from(STOP_KEYWORD));
        assert!(matches!(
            control(step, &parameters),
            Control::Skip(reason) if reason == "parameter 'first' is SKIP"
        ));

        parameters.insert("first".to_string(), Value::Number(0.1));
        assert!(matches!(control(step, &parameters), Control::Stop));

        parameters.insert("second".to_string(), Value::from("stop"));
        parameters.insert("static".to_string(), Value::from(STOP_KEYWORD));
        assert!(matches!(control(step, &parameters), Control::Run));
    }
}
