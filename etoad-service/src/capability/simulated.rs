// Simulated Capability
// Returns configured analysis outputs and synthetic payloads without any hardware

use crate::capability::{CapabilityError, Invocation, MeasurementCapability, PayloadSink};
use crate::config::{ConfigError, SimulationConfig};
use crate::error::{ServiceError, ServiceResult};
use crate::protocol::{AnalysisOutputs, ProtocolFormat, TaskKind, Value};

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Samples per synthetic payload
const SAMPLES_PER_PAYLOAD: usize = 16;

#[derive(Debug, Default)]
pub struct SimulatedCapability {
    /// Outputs keyed by step name or technique; step names win
    outputs: HashMap<String, AnalysisOutputs>,
    failures: HashMap<String, CapabilityError>,
    /// Accepted techniques; empty accepts any
    techniques: HashSet<String>,
    payloads_per_step: u32,
    delay: Duration,
    /// Only kept once `with_recording` is called
    invoked: Option<Mutex<Vec<String>>>,
}

impl SimulatedCapability {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &SimulationConfig) -> ServiceResult<Self> {
        let mut capability = Self::new()
            .with_payloads(config.payloads_per_step)
            .with_delay(config.step_delay())
            .with_techniques(config.techniques.iter().cloned());

        if let Some(path) = &config.outputs_file {
            for (key, outputs) in load_outputs_file(path)? {
                capability = capability.with_outputs(key, outputs);
            }
        }

        Ok(capability)
    }

    /// Outputs returned for a step name or technique
    pub fn with_outputs(mut self, key: impl Into<String>, outputs: AnalysisOutputs) -> Self {
        self.outputs.insert(key.into(), outputs);
        self
    }

    /// Make a step name or technique fail with an instrument error
    pub fn with_failure(mut self, key: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures
            .insert(key.into(), CapabilityError::Instrument(message.into()));
        self
    }

    /// Make a step name or technique fail after measuring, while analysing
    pub fn with_analysis_failure(mut self, key: impl Into<String>, message: impl Into<String>) -> Self {
        self.failures
            .insert(key.into(), CapabilityError::Analysis(message.into()));
        self
    }

    /// Restrict measurements to these techniques
    pub fn with_techniques(mut self, techniques: impl IntoIterator<Item = String>) -> Self {
        self.techniques.extend(techniques);
        self
    }

    /// Keep the step names of every invocation, see `invocations`
    pub fn with_recording(mut self) -> Self {
        self.invoked = Some(Mutex::new(Vec::new()));
        self
    }

    pub fn with_payloads(mut self, payloads_per_step: u32) -> Self {
        self.payloads_per_step = payloads_per_step;
        self
    }

    /// Pause before each payload (and once per step when there are none)
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Step names in invocation order; empty unless recording
    pub fn invocations(&self) -> Vec<String> {
        self.invoked
            .as_ref()
            .map(|invoked| invoked.lock().unwrap_or_else(PoisonError::into_inner).clone())
            .unwrap_or_default()
    }

    fn lookup<'a, T>(map: &'a HashMap<String, T>, invocation: &Invocation) -> Option<&'a T> {
        map.get(&invocation.step_name)
            .or_else(|| map.get(&invocation.technique))
    }

    fn record_invocation(&self, step_name: &str) {
        if let Some(invoked) = &self.invoked {
            invoked
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push(step_name.to_string());
        }
    }
}

#[async_trait]
impl MeasurementCapability for SimulatedCapability {
    async fn invoke(
        &self,
        invocation: Invocation,
        sink: &PayloadSink<'_>,
    ) -> Result<AnalysisOutputs, CapabilityError> {
        self.record_invocation(&invocation.step_name);
        debug!(
            step = %invocation.step_name,
            task = %invocation.task,
            technique = %invocation.technique,
            "simulated invocation"
        );

        if invocation.task == TaskKind::Dilute {
            tokio::time::sleep(self.delay).await;
            let mut outputs = AnalysisOutputs::new();
            outputs.insert("dilution".to_string(), Value::Bool(true));
            return Ok(outputs);
        }

        if !self.techniques.is_empty() && !self.techniques.contains(&invocation.technique) {
            return Err(CapabilityError::UnsupportedTechnique(invocation.technique));
        }

        let total = self.payloads_per_step;
        if total == 0 {
            tokio::time::sleep(self.delay).await;
        }
        for iteration in 1..=total {
            tokio::time::sleep(self.delay).await;
            sink.emit(
                format!("{} iteration {}/{}", invocation.technique, iteration, total),
                synthetic_payload(iteration),
            );
        }

        if let Some(err) = Self::lookup(&self.failures, &invocation) {
            return Err(err.clone());
        }

        Ok(Self::lookup(&self.outputs, &invocation)
            .cloned()
            .unwrap_or_default())
    }
}

/// Little-endian f64 samples of a decaying sine
fn synthetic_payload(iteration: u32) -> Vec<u8> {
    (0..SAMPLES_PER_PAYLOAD)
        .map(|i| {
            let t = i as f64 / SAMPLES_PER_PAYLOAD as f64;
            (t * std::f64::consts::TAU * iteration as f64).sin() * (-t).exp()
        })
        .flat_map(f64::to_le_bytes)
        .collect()
}

/// Technique (or step name) -> analysis outputs, from a JSON or YAML file
fn load_outputs_file(path: &Path) -> ServiceResult<HashMap<String, AnalysisOutputs>> {
    let source = std::fs::read_to_string(path)?;
    let parsed: Result<HashMap<String, HashMap<String, Value>>, String> =
        match ProtocolFormat::from_path(path).map_err(ServiceError::from)? {
            ProtocolFormat::Json => serde_json::from_str(&source).map_err(|e| e.to_string()),
            ProtocolFormat::Yaml => serde_yaml::from_str(&source).map_err(|e| e.to_string()),
        };

    parsed.map_err(|e| {
        ServiceError::Config(ConfigError::Validation(format!(
            "simulation outputs file '{}': {}",
            path.display(),
            e
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::events::{progress_channel, ExecutionEvent};
    use crate::protocol::{ParameterMap, RunSettings, WashSettings};

    use std::io::Write;

    fn invocation(step: &str, task: TaskKind, technique: &str) -> Invocation {
        Invocation {
            step_name: step.to_string(),
            task,
            technique: technique.to_string(),
            parameters: ParameterMap::new(),
            analysis: Value::Null,
            settings: RunSettings {
                sample_volume: 1.0,
                total_volume: 2.0,
                discard_sample: false,
                purge: 0.0,
                wash: WashSettings {
                    wash_volume: 5.0,
                    washing_cycles: 3,
                },
            },
        }
    }

    fn outputs(key: &str, value: f64) -> AnalysisOutputs {
        let mut outputs = AnalysisOutputs::new();
        outputs.insert(key.to_string(), Value::Number(value));
        outputs
    }

    #[tokio::test]
    async fn test_emits_payloads_then_returns_outputs() {
        let capability = SimulatedCapability::new()
            .with_payloads(2)
            .with_outputs("SWV", outputs("E_peak", 0.2));
        let (tx, mut rx) = progress_channel();
        let sink = PayloadSink::new(&tx, "first", 0);

        let result = capability
            .invoke(invocation("first", TaskKind::Measure, "SWV"), &sink)
            .await
            .unwrap();
        assert_eq!(result.get("E_peak"), Some(&Value::Number(0.2)));

        let mut labels = Vec::new();
        while let Ok(ExecutionEvent::IntermediatePayload { label, payload, .. }) = rx.try_recv() {
            assert_eq!(payload.len(), SAMPLES_PER_PAYLOAD * 8);
            labels.push(label);
        }
        assert_eq!(labels, vec!["SWV iteration 1/2", "SWV iteration 2/2"]);
    }

    #[tokio::test]
    async fn test_step_name_overrides_technique() {
        let capability = SimulatedCapability::new()
            .with_outputs("CV", outputs("E", 1.0))
            .with_outputs("second CV", outputs("E", 2.0))
            .with_recording();
        let sink_tx: Option<crate::execution::events::ProgressSender> = None;
        let sink = PayloadSink::new(&sink_tx, "second CV", 1);

        let result = capability
            .invoke(invocation("second CV", TaskKind::Measure, "CV"), &sink)
            .await
            .unwrap();
        assert_eq!(result.get("E"), Some(&Value::Number(2.0)));
        assert_eq!(capability.invocations(), vec!["second CV".to_string()]);
    }

    #[tokio::test]
    async fn test_dilute_reports_dilution() {
        let capability = SimulatedCapability::new().with_payloads(3);
        let (tx, mut rx) = progress_channel();
        let sink = PayloadSink::new(&tx, "dilute", 2);

        let result = capability
            .invoke(invocation("dilute", TaskKind::Dilute, ""), &sink)
            .await
            .unwrap();
        assert_eq!(result.get("dilution"), Some(&Value::Bool(true)));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_configured_failure() {
        let capability = SimulatedCapability::new().with_failure("CA", "electrode disconnected");
        let (tx, _rx) = progress_channel();
        let sink = PayloadSink::new(&tx, "CA", 0);

        let err = capability
            .invoke(invocation("CA", TaskKind::Measure, "CA"), &sink)
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::Instrument("electrode disconnected".to_string()));
    }

    #[tokio::test]
    async fn test_analysis_failure_after_payloads() {
        let capability = SimulatedCapability::new()
            .with_payloads(1)
            .with_analysis_failure("SWV", "no peaks found");
        let (tx, mut rx) = progress_channel();
        let sink = PayloadSink::new(&tx, "SWV", 0);

        let err = capability
            .invoke(invocation("SWV", TaskKind::Measure, "SWV"), &sink)
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::Analysis("no peaks found".to_string()));
        assert!(matches!(rx.try_recv(), Ok(ExecutionEvent::IntermediatePayload { .. })));
    }

    #[tokio::test]
    async fn test_unsupported_technique() {
        let capability = SimulatedCapability::new()
            .with_payloads(2)
            .with_techniques(["CV".to_string(), "SWV".to_string()]);
        let (tx, mut rx) = progress_channel();
        let sink = PayloadSink::new(&tx, "EIS", 0);

        let err = capability
            .invoke(invocation("EIS", TaskKind::Measure, "EIS"), &sink)
            .await
            .unwrap_err();
        assert_eq!(err, CapabilityError::UnsupportedTechnique("EIS".to_string()));
        assert!(rx.try_recv().is_err());

        // Dilutions carry no technique and are always accepted
        let result = capability
            .invoke(invocation("dilute", TaskKind::Dilute, ""), &sink)
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_invocations_not_kept_without_recording() {
        let capability = SimulatedCapability::new();
        let sink_tx: Option<crate::execution::events::ProgressSender> = None;
        let sink = PayloadSink::new(&sink_tx, "A", 0);

        for _ in 0..3 {
            capability
                .invoke(invocation("A", TaskKind::Measure, "OCP"), &sink)
                .await
                .unwrap();
        }
        assert!(capability.invoked.is_none());
        assert!(capability.invocations().is_empty());
    }

    #[test]
    fn test_from_config_reads_outputs_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outputs.json");
        let mut file = std::fs::File::create(&path).unwrap();
        write!(
            file,
            r#"{{"SWV": {{"Peak Picking": [{{"peak": -0.1}}, {{"peak": 0.3}}]}}}}"#
        )
        .unwrap();

        let config = SimulationConfig {
            payloads_per_step: 1,
            step_delay_ms: 0,
            outputs_file: Some(path),
            techniques: vec!["SWV".to_string()],
        };
        let capability = SimulatedCapability::from_config(&config).unwrap();
        let peaks = &capability.outputs["SWV"]["Peak Picking"];
        assert_eq!(peaks.as_array().map(<[Value]>::len), Some(2));
        assert!(capability.techniques.contains("SWV"));
    }

    #[test]
    fn test_from_config_rejects_bad_outputs_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("outputs.yaml");
        std::fs::write(&path, "- just\n- a list\n").unwrap();

        let config = SimulationConfig {
            outputs_file: Some(path),
            ..Default::default()
        };
        assert!(matches!(
            SimulatedCapability::from_config(&config),
            Err(ServiceError::Config(_))
        ));
    }
}
