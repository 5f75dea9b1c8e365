// Execution Events
// Progress events emitted by the protocol engine while it walks the steps

use crate::protocol::{AnalysisOutputs, ParameterMap, StepStatus};

use std::time::Duration;
use tokio::sync::mpsc;

/// Sender for execution progress events
pub type ProgressSender = mpsc::UnboundedSender<ExecutionEvent>;

/// Receiver for execution progress events
pub type ProgressReceiver = mpsc::UnboundedReceiver<ExecutionEvent>;

/// Create a new progress channel
pub fn progress_channel() -> (ProgressSender, ProgressReceiver) {
    mpsc::unbounded_channel()
}

#[derive(Debug, Clone)]
pub enum ExecutionEvent {
    ProtocolStarted {
        protocol_name: String,
        total_steps: usize,
    },

    /// Parameters are resolved and the capability is about to be invoked
    StepStarted {
        step_name: String,
        step_index: usize,
        parameters: ParameterMap,
    },

    /// Payload forwarded from the capability while the step runs
    IntermediatePayload {
        step_name: String,
        step_index: usize,
        label: String,
        payload: Vec<u8>,
    },

    StepCompleted {
        step_name: String,
        step_index: usize,
        status: StepStatus,
        outputs: AnalysisOutputs,
        error: Option<String>,
        duration: Duration,
    },

    /// Step will not run because a resolved parameter was SKIP
    StepSkipped {
        step_name: String,
        step_index: usize,
        parameters: ParameterMap,
        reason: String,
    },

    /// Parameter resolution failed before the step started
    StepFailed {
        step_name: String,
        step_index: usize,
        error: String,
    },

    ProtocolCompleted {
        protocol_name: String,
        success: bool,
        duration: Duration,
    },
}

impl ExecutionEvent {
    pub fn protocol_started(name: impl Into<String>, total_steps: usize) -> Self {
        Self::ProtocolStarted {
            protocol_name: name.into(),
            total_steps,
        }
    }

    pub fn protocol_completed(name: impl Into<String>, success: bool, duration: Duration) -> Self {
        Self::ProtocolCompleted {
            protocol_name: name.into(),
            success,
            duration,
        }
    }

    pub fn step_started(
        step_name: impl Into<String>,
        step_index: usize,
        parameters: ParameterMap,
    ) -> Self {
        Self::StepStarted {
            step_name: step_name.into(),
            step_index,
            parameters,
        }
    }

    pub fn intermediate(
        step_name: impl Into<String>,
        step_index: usize,
        label: impl Into<String>,
        payload: Vec<u8>,
    ) -> Self {
        Self::IntermediatePayload {
            step_name: step_name.into(),
            step_index,
            label: label.into(),
            payload,
        }
    }

    pub fn step_succeeded(
        step_name: impl Into<String>,
        step_index: usize,
        outputs: AnalysisOutputs,
        duration: Duration,
    ) -> Self {
        Self::StepCompleted {
            step_name: step_name.into(),
            step_index,
            status: StepStatus::Succeeded,
            outputs,
            error: None,
            duration,
        }
    }

    /// A running step whose capability invocation failed
    pub fn step_errored(
        step_name: impl Into<String>,
        step_index: usize,
        error: impl Into<String>,
        duration: Duration,
    ) -> Self {
        Self::StepCompleted {
            step_name: step_name.into(),
            step_index,
            status: StepStatus::Failed,
            outputs: AnalysisOutputs::new(),
            error: Some(error.into()),
            duration,
        }
    }

    pub fn step_skipped(
        step_name: impl Into<String>,
        step_index: usize,
        parameters: ParameterMap,
        reason: impl Into<String>,
    ) -> Self {
        Self::StepSkipped {
            step_name: step_name.into(),
            step_index,
            parameters,
            reason: reason.into(),
        }
    }

    pub fn step_failed(
        step_name: impl Into<String>,
        step_index: usize,
        error: impl Into<String>,
    ) -> Self {
        Self::StepFailed {
            step_name: step_name.into(),
            step_index,
            error: error.into(),
        }
    }

    /// Step index the event belongs to, if any
    pub fn step_index(&self) -> Option<usize> {
        match self {
            Self::StepStarted { step_index, .. }
            | Self::IntermediatePayload { step_index, .. }
            | Self::StepCompleted { step_index, .. }
            | Self::StepSkipped { step_index, .. }
            | Self::StepFailed { step_index, .. } => Some(*step_index),
            Self::ProtocolStarted { .. } | Self::ProtocolCompleted { .. } => None,
        }
    }
}

/// Helper trait for sending events, ignoring errors (fire-and-forget)
pub trait EventSender: Send + Sync {
    fn send_event(&self, event: ExecutionEvent);
}

impl EventSender for ProgressSender {
    fn send_event(&self, event: ExecutionEvent) {
        let _ = self.send(event);
    }
}

impl EventSender for Option<ProgressSender> {
    fn send_event(&self, event: ExecutionEvent) {
        if let Some(sender) = self {
            let _ = sender.send(event);
        }
    }
}

/// Forward every event to two sinks
impl<A: EventSender, B: EventSender> EventSender for (A, B) {
    fn send_event(&self, event: ExecutionEvent) {
        self.0.send_event(event.clone());
        self.1.send_event(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_progress_channel() {
        let (tx, mut rx) = progress_channel();

        tx.send_event(ExecutionEvent::protocol_started("ferro", 2));
        tx.send_event(ExecutionEvent::step_started("SWV", 0, ParameterMap::new()));

        let event1 = rx.recv().await.unwrap();
        assert!(matches!(event1, ExecutionEvent::ProtocolStarted { total_steps: 2, .. }));

        let event2 = rx.recv().await.unwrap();
        assert_eq!(event2.step_index(), Some(0));
    }

    #[test]
    fn test_step_errored_construction() {
        let event = ExecutionEvent::step_errored("CV", 1, "potentiostat offline", Duration::from_secs(2));

        if let ExecutionEvent::StepCompleted {
            step_name,
            status,
            error,
            outputs,
            ..
        } = event
        {
            assert_eq!(step_name, "CV");
            assert_eq!(status, StepStatus::Failed);
            assert_eq!(error.as_deref(), Some("potentiostat offline"));
            assert!(outputs.is_empty());
        } else {
            panic!("wrong event type");
        }
    }

    #[test]
    fn test_optional_sender() {
        let sender: Option<ProgressSender> = None;
        // Should not panic
        sender.send_event(ExecutionEvent::protocol_started("ferro", 1));
    }

    #[tokio::test]
    async fn test_pair_sender_fans_out() {
        let (tx1, mut rx1) = progress_channel();
        let (tx2, mut rx2) = progress_channel();

        (tx1, tx2).send_event(ExecutionEvent::step_failed("CV", 1, "no peaks"));

        assert!(matches!(rx1.recv().await, Some(ExecutionEvent::StepFailed { .. })));
        assert!(matches!(rx2.recv().await, Some(ExecutionEvent::StepFailed { .. })));
    }
}
