// Parameter Resolver
// Derives step parameters from earlier analysis outputs via filter/pick rules

use crate::error::StepError;
use crate::execution::store::StepOutputStore;
use crate::protocol::{
    AnalysisOutputs, ParameterMap, ParameterUpdateRule, SelectionExpression, StepSpec, Value,
};

pub struct ParameterResolver;

impl ParameterResolver {
    /// Static parameters of `step` with every update rule applied in order
    pub fn resolve_step(step: &StepSpec, store: &StepOutputStore) -> Result<ParameterMap, StepError> {
        let mut parameters = step.parameters.clone();
        for rule in &step.update_rules {
            let value = Self::resolve(rule, store)?;
            parameters.insert(rule.target.clone(), value);
        }
        Ok(parameters)
    }

    /// Value for one rule, read from the source step's stored outputs
    pub fn resolve(rule: &ParameterUpdateRule, store: &StepOutputStore) -> Result<Value, StepError> {
        let outputs = store.get(&rule.source_step).ok_or_else(|| {
            StepError::UnresolvedDependency(format!(
                "step '{}' produced no outputs for '{}'",
                rule.source_step, rule.target
            ))
        })?;
        Self::select(outputs, rule)
    }

    /// Apply the rule's selection (if any) to `outputs`
    pub fn select(outputs: &AnalysisOutputs, rule: &ParameterUpdateRule) -> Result<Value, StepError> {
        let value = outputs.get(&rule.source_key).ok_or_else(|| {
            StepError::UnresolvedDependency(format!(
                "outputs of step '{}' have no key '{}'",
                rule.source_step, rule.source_key
            ))
        })?;

        match &rule.selection {
            None => Ok(value.clone()),
            Some(selection) => {
                let Value::Array(records) = value else {
                    return Err(StepError::UnresolvedDependency(format!(
                        "'{}' of step '{}' is {}, expected a list of records",
                        rule.source_key,
                        rule.source_step,
                        value.type_name()
                    )));
                };
                apply_selection(records, selection).map_err(|err| match err {
                    StepError::EmptySelection(msg) => StepError::EmptySelection(format!(
                        "'{}' of step '{}': {}",
                        rule.source_key, rule.source_step, msg
                    )),
                    other => other,
                })
            }
        }
    }
}

fn apply_selection(records: &[Value], selection: &SelectionExpression) -> Result<Value, StepError> {
    let mut candidates: Vec<&Value> = records.iter().collect();

    for clause in &selection.filters {
        let mut kept = Vec::with_capacity(candidates.len());
        for record in candidates {
            // Records without the key are dropped, never an error
            let Some(field) = record.field(&clause.key) else {
                continue;
            };
            let verdict = clause.predicate.eval(field).map_err(|e| {
                StepError::UnresolvedDependency(format!(
                    "filter '{}' on '{}' cannot be evaluated: {}",
                    clause.predicate, clause.key, e.message
                ))
            })?;
            if verdict.is_truthy() {
                kept.push(record);
            }
        }
        candidates = kept;
    }

    let values: Vec<Value> = candidates
        .into_iter()
        .filter_map(|record| record.field(&selection.pick.key).cloned())
        .collect();

    if values.is_empty() {
        return Err(StepError::EmptySelection(format!(
            "no records left to pick '{}' from",
            selection.pick.key
        )));
    }

    selection
        .pick
        .aggregator
        .eval(&Value::Array(values))
        .map_err(|e| {
            StepError::UnresolvedDependency(format!(
                "pick '{}' on '{}' cannot be evaluated: {}",
                selection.pick.aggregator, selection.pick.key, e.message
            ))
        })
}
