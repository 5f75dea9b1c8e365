// Built-in Functions
// Scalar helpers and aggregators usable in filter and pick expressions

use crate::expression::evaluator::EvalError;
use crate::protocol::Value;

use std::collections::HashMap;
use std::sync::OnceLock;

/// Native implementation of an expression function
pub type NativeFn = fn(&[Value]) -> Result<Value, EvalError>;

#[derive(Clone, Copy)]
pub struct FunctionSpec {
    pub min_args: usize,
    /// `None` for variadic functions
    pub max_args: Option<usize>,
    pub func: NativeFn,
}

impl FunctionSpec {
    pub fn accepts(&self, count: usize) -> bool {
        count >= self.min_args && self.max_args.map_or(true, |max| count <= max)
    }
}

/// Registry of callable functions, keyed by lowercase name
#[derive(Clone, Default)]
pub struct BuiltinFunctions {
    functions: HashMap<String, FunctionSpec>,
}

impl std::fmt::Debug for BuiltinFunctions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names = self.names();
        names.sort_unstable();
        f.debug_struct("BuiltinFunctions")
            .field("functions", &names)
            .finish()
    }
}

impl BuiltinFunctions {
    /// Registry with the standard set of functions
    pub fn new() -> Self {
        let mut registry = Self::default();
        registry.register("abs", 1, Some(1), abs);
        // Aggregators take one array or several scalars
        registry.register("max", 1, None, max);
        registry.register("min", 1, None, min);
        registry.register("first", 1, None, first);
        registry.register("last", 1, None, last);
        registry.register("mean", 1, None, mean);
        registry.register("sum", 1, None, sum);
        registry.register("count", 1, None, count);
        registry
    }

    /// Shared instance of the standard registry
    pub fn standard() -> &'static BuiltinFunctions {
        static STANDARD: OnceLock<BuiltinFunctions> = OnceLock::new();
        STANDARD.get_or_init(BuiltinFunctions::new)
    }

    pub fn register(
        &mut self,
        name: &str,
        min_args: usize,
        max_args: Option<usize>,
        func: NativeFn,
    ) {
        self.functions.insert(
            name.to_lowercase(),
            FunctionSpec {
                min_args,
                max_args,
                func,
            },
        );
    }

    pub fn get(&self, name: &str) -> Option<&FunctionSpec> {
        self.functions.get(&name.to_lowercase())
    }

    pub fn names(&self) -> Vec<&str> {
        self.functions.keys().map(String::as_str).collect()
    }

    pub fn call(&self, name: &str, args: &[Value]) -> Result<Value, EvalError> {
        let spec = self
            .get(name)
            .ok_or_else(|| EvalError::new(format!("unknown function: {}", name)))?;

        if !spec.accepts(args.len()) {
            return Err(EvalError::new(format!(
                "{}() does not take {} argument(s)",
                name,
                args.len()
            )));
        }

        (spec.func)(args)
    }
}

fn abs(args: &[Value]) -> Result<Value, EvalError> {
    match &args[0] {
        Value::Number(n) => Ok(Value::Number(n.abs())),
        other => Err(EvalError::new(format!(
            "abs() expects a number, got {}",
            other.type_name()
        ))),
    }
}

/// Aggregator input: the elements of a single array argument, or the arguments themselves
fn sequence(args: &[Value]) -> &[Value] {
    match args {
        [Value::Array(items)] => items.as_slice(),
        _ => args,
    }
}

fn numbers(name: &str, args: &[Value]) -> Result<Vec<f64>, EvalError> {
    sequence(args)
        .iter()
        .map(|v| {
            v.as_number().ok_or_else(|| {
                EvalError::new(format!("{}() expects numbers, got {}", name, v.type_name()))
            })
        })
        .collect()
}

fn non_empty(name: &str, values: Vec<f64>) -> Result<Vec<f64>, EvalError> {
    if values.is_empty() {
        Err(EvalError::new(format!("{}() of an empty sequence", name)))
    } else {
        Ok(values)
    }
}

fn max(args: &[Value]) -> Result<Value, EvalError> {
    let values = non_empty("max", numbers("max", args)?)?;
    Ok(Value::Number(values.into_iter().fold(f64::NEG_INFINITY, f64::max)))
}

fn min(args: &[Value]) -> Result<Value, EvalError> {
    let values = non_empty("min", numbers("min", args)?)?;
    Ok(Value::Number(values.into_iter().fold(f64::INFINITY, f64::min)))
}

fn mean(args: &[Value]) -> Result<Value, EvalError> {
    let values = non_empty("mean", numbers("mean", args)?)?;
    let total: f64 = values.iter().sum();
    Ok(Value::Number(total / values.len() as f64))
}

fn sum(args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Number(numbers("sum", args)?.into_iter().sum()))
}

fn first(args: &[Value]) -> Result<Value, EvalError> {
    sequence(args)
        .first()
        .cloned()
        .ok_or_else(|| EvalError::new("first() of an empty sequence"))
}

fn last(args: &[Value]) -> Result<Value, EvalError> {
    sequence(args)
        .last()
        .cloned()
        .ok_or_else(|| EvalError::new("last() of an empty sequence"))
}

fn count(args: &[Value]) -> Result<Value, EvalError> {
    Ok(Value::Number(sequence(args).len() as f64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(name: &str, args: Vec<Value>) -> Result<Value, EvalError> {
        BuiltinFunctions::standard().call(name, &args)
    }

    fn array(values: &[f64]) -> Value {
        Value::Array(values.iter().copied().map(Value::Number).collect())
    }

    #[test]
    fn test_aggregators_over_array() {
        let values = array(&[0.3, -0.7, 0.1]);
        assert_eq!(call("max", vec![values.clone()]).unwrap(), Value::Number(0.3));
        assert_eq!(call("min", vec![values.clone()]).unwrap(), Value::Number(-0.7));
        assert_eq!(call("first", vec![values.clone()]).unwrap(), Value::Number(0.3));
        assert_eq!(call("last", vec![values.clone()]).unwrap(), Value::Number(0.1));
        assert_eq!(call("count", vec![values.clone()]).unwrap(), Value::Number(3.0));

        let Value::Number(total) = call("sum", vec![values.clone()]).unwrap() else {
            panic!("expected number");
        };
        assert!((total - -0.3).abs() < 1e-12);
    }

    #[test]
    fn test_mean() {
        assert_eq!(
            call("mean", vec![array(&[1.0, 2.0, 6.0])]).unwrap(),
            Value::Number(3.0)
        );
    }

    #[test]
    fn test_aggregators_over_scalar_arguments() {
        assert_eq!(
            call("max", vec![Value::Number(1.0), Value::Number(4.0)]).unwrap(),
            Value::Number(4.0)
        );
        assert_eq!(call("count", vec![Value::Number(9.0)]).unwrap(), Value::Number(1.0));
    }

    #[test]
    fn test_empty_sequences() {
        assert!(call("max", vec![array(&[])]).is_err());
        assert!(call("first", vec![array(&[])]).is_err());
        assert_eq!(call("sum", vec![array(&[])]).unwrap(), Value::Number(0.0));
        assert_eq!(call("count", vec![array(&[])]).unwrap(), Value::Number(0.0));
    }

    #[test]
    fn test_abs() {
        assert_eq!(call("ABS", vec![Value::Number(-2.5)]).unwrap(), Value::Number(2.5));
        assert!(call("abs", vec![Value::from("a")]).is_err());
        assert!(call("abs", vec![Value::Number(1.0), Value::Number(2.0)]).is_err());
    }

    #[test]
    fn test_type_errors() {
        let err = call("mean", vec![Value::Array(vec![Value::from("a")])]).unwrap_err();
        assert!(err.message.contains("expects numbers"));
    }

    #[test]
    fn test_registry_is_extensible() {
        fn double(args: &[Value]) -> Result<Value, EvalError> {
            Ok(Value::Number(args[0].as_number().unwrap_or(0.0) * 2.0))
        }

        let mut registry = BuiltinFunctions::new();
        registry.register("double", 1, Some(1), double);
        assert_eq!(
            registry.call("double", &[Value::Number(2.0)]).unwrap(),
            Value::Number(4.0)
        );
        assert!(call("double", vec![Value::Number(2.0)]).is_err());
    }
}
