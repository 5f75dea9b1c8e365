// Measurement Capability
// Interface to the instrument + analysis layer that performs a single step

pub mod simulated;

pub use simulated::SimulatedCapability;

use crate::execution::events::{EventSender, ExecutionEvent};
use crate::protocol::{AnalysisOutputs, ParameterMap, RunSettings, StepSpec, TaskKind, Value};

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum CapabilityError {
    #[error("instrument error: {0}")]
    Instrument(String),

    #[error("analysis error: {0}")]
    Analysis(String),

    #[error("unsupported technique '{0}'")]
    UnsupportedTechnique(String),
}

/// Everything the capability needs to run one step
#[derive(Debug, Clone)]
pub struct Invocation {
    pub step_name: String,
    pub task: TaskKind,
    pub technique: String,
    /// Static parameters with update rules applied
    pub parameters: ParameterMap,
    pub analysis: Value,
    pub settings: RunSettings,
}

impl Invocation {
    pub fn new(step: &StepSpec, parameters: ParameterMap, settings: &RunSettings) -> Self {
        Self {
            step_name: step.name.clone(),
            task: step.task,
            technique: step.technique.clone(),
            parameters,
            analysis: step.analysis.clone(),
            settings: settings.clone(),
        }
    }
}

/// Forwards intermediate payloads of the running step as progress events
pub struct PayloadSink<'a> {
    events: &'a dyn EventSender,
    step_name: &'a str,
    step_index: usize,
}

impl<'a> PayloadSink<'a> {
    pub fn new(events: &'a dyn EventSender, step_name: &'a str, step_index: usize) -> Self {
        Self {
            events,
            step_name,
            step_index,
        }
    }

    pub fn emit(&self, label: impl Into<String>, payload: Vec<u8>) {
        self.events.send_event(ExecutionEvent::intermediate(
            self.step_name,
            self.step_index,
            label,
            payload,
        ));
    }
}

#[async_trait]
pub trait MeasurementCapability: Send + Sync {
    /// Run one step. Payloads go to `sink` as they arrive; the return value is the
    /// step's named analysis outputs.
    async fn invoke(
        &self,
        invocation: Invocation,
        sink: &PayloadSink<'_>,
    ) -> Result<AnalysisOutputs, CapabilityError>;
}
