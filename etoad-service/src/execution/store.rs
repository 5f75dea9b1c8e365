// Step Output Store
// Analysis outputs of completed steps, addressable by (step name, output key)

use crate::protocol::AnalysisOutputs;

use std::collections::HashMap;

#[derive(Debug, Clone, Default)]
pub struct StepOutputStore {
    outputs: HashMap<String, AnalysisOutputs>,
}

impl StepOutputStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outputs of a finished step, replacing any earlier entry
    pub fn insert(&mut self, step_name: impl Into<String>, outputs: AnalysisOutputs) {
        self.outputs.insert(step_name.into(), outputs);
    }

    /// Outputs of `step_name`; `None` if the step never produced any
    pub fn get(&self, step_name: &str) -> Option<&AnalysisOutputs> {
        self.outputs.get(step_name)
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Value;

    #[test]
    fn test_insert_and_lookup() {
        let mut store = StepOutputStore::new();
        assert!(store.is_empty());

        let mut outputs = AnalysisOutputs::new();
        outputs.insert("E_peak".to_string(), Value::Number(0.21));
        store.insert("SWV", outputs);

        let swv = store.get("SWV").unwrap();
        assert_eq!(swv.get("E_peak"), Some(&Value::Number(0.21)));
        assert_eq!(swv.get("missing"), None);
        assert!(store.get("CV").is_none());
        assert_eq!(store.len(), 1);
    }
}
