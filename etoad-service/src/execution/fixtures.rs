// Test Fixtures
// Protocol documents and a capability that can interrupt its own run

use crate::capability::{CapabilityError, Invocation, MeasurementCapability, PayloadSink};
use crate::protocol::{parse_str, AnalysisOutputs, ProtocolDefinition, ProtocolFormat, Value};

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Protocol document with the given JSON `Steps` value
pub fn protocol_json(steps: &str) -> String {
    format!(
        r#"{{
    "Protocol Name": "ferrocyanide",
    "Sample Volume": 2.0,
    "Total Volume": 10.0,
    "Discard Sample": false,
    "Purge": 30,
    "Wash": {{ "wash_volume": 5, "washing_cycles": 3 }},
    "Steps": {}
}}"#,
        steps
    )
}

pub fn protocol(steps: &str) -> ProtocolDefinition {
    parse_str(&protocol_json(steps), ProtocolFormat::Json).unwrap()
}

/// SWV peak search feeding a CV window
pub fn ferrocyanide() -> ProtocolDefinition {
    protocol(
        r#"{
        "SWV": { "technique": "SWV" },
        "CV": {
            "technique": "CV",
            "parameters": { "scan_rate": 0.1 },
            "update_parameters": [{
                "parameter": "E_1",
                "from measurement": "SWV",
                "key": "Peak Picking",
                "filters": [
                    { "key": "peak", "operation": "x > -0.2" },
                    { "key": "rel_shape_factor", "operation": "x > 0.1" }
                ],
                "selection": { "key": "peak", "operation": "max(x)" }
            }]
        }
    }"#,
    )
}

pub fn peak_outputs() -> AnalysisOutputs {
    let value: Value = serde_json::from_str(
        r#"[{"peak": -0.1, "rel_shape_factor": 0.05}, {"peak": 0.3, "rel_shape_factor": 0.2}]"#,
    )
    .unwrap();
    let mut outputs = AnalysisOutputs::new();
    outputs.insert("Peak Picking".to_string(), value);
    outputs
}

/// Raises the cancel flag while `step` is in flight
pub struct CancellingCapability {
    pub step: String,
    pub flag: Arc<AtomicBool>,
    pub delay: Duration,
}

#[async_trait]
impl MeasurementCapability for CancellingCapability {
    async fn invoke(
        &self,
        invocation: Invocation,
        sink: &PayloadSink<'_>,
    ) -> Result<AnalysisOutputs, CapabilityError> {
        if invocation.step_name == self.step {
            self.flag.store(true, Ordering::SeqCst);
        }
        tokio::time::sleep(self.delay).await;
        sink.emit("done", Vec::new());
        Ok(AnalysisOutputs::new())
    }
}
