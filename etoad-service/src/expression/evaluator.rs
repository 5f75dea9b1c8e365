// Expression Evaluator
// Evaluates an AST with the single variable `x` bound to a value

use crate::expression::functions::BuiltinFunctions;
use crate::expression::parser::{BinaryOp, Expr, UnaryOp};
use crate::protocol::Value;

use std::cmp::Ordering;
use std::fmt;

/// Name of the variable bound during evaluation
pub const BOUND_VARIABLE: &str = "x";

#[derive(Debug, Clone, PartialEq)]
pub struct EvalError {
    pub message: String,
}

impl fmt::Display for EvalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "evaluation error: {}", self.message)
    }
}

impl std::error::Error for EvalError {}

impl EvalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

pub struct Evaluator<'a> {
    binding: &'a Value,
    functions: &'a BuiltinFunctions,
}

impl<'a> Evaluator<'a> {
    pub fn new(binding: &'a Value) -> Self {
        Self::with_functions(binding, BuiltinFunctions::standard())
    }

    pub fn with_functions(binding: &'a Value, functions: &'a BuiltinFunctions) -> Self {
        Self { binding, functions }
    }

    pub fn eval(&self, expr: &Expr) -> Result<Value, EvalError> {
        match expr {
            Expr::Null => Ok(Value::Null),
            Expr::Bool(b) => Ok(Value::Bool(*b)),
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::String(s) => Ok(Value::String(s.clone())),

            Expr::Variable(name) if name == BOUND_VARIABLE => Ok(self.binding.clone()),
            Expr::Variable(name) => Err(EvalError::new(format!("unknown variable: {}", name))),

            Expr::FunctionCall { name, args } => {
                let values = args
                    .iter()
                    .map(|a| self.eval(a))
                    .collect::<Result<Vec<_>, _>>()?;
                self.functions.call(name, &values)
            }

            Expr::Unary { op, expr } => {
                let val = self.eval(expr)?;
                self.eval_unary(*op, &val)
            }

            Expr::Binary { op, left, right } => match op {
                // Short-circuit
                BinaryOp::And => {
                    if !self.eval(left)?.is_truthy() {
                        return Ok(Value::Bool(false));
                    }
                    Ok(Value::Bool(self.eval(right)?.is_truthy()))
                }
                BinaryOp::Or => {
                    if self.eval(left)?.is_truthy() {
                        return Ok(Value::Bool(true));
                    }
                    Ok(Value::Bool(self.eval(right)?.is_truthy()))
                }
                _ => {
                    let left_val = self.eval(left)?;
                    let right_val = self.eval(right)?;
                    self.eval_binary(*op, &left_val, &right_val)
                }
            },

            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                if self.eval(condition)?.is_truthy() {
                    self.eval(then_expr)
                } else {
                    self.eval(else_expr)
                }
            }
        }
    }

    fn eval_unary(&self, op: UnaryOp, val: &Value) -> Result<Value, EvalError> {
        match op {
            UnaryOp::Not => Ok(Value::Bool(!val.is_truthy())),
            UnaryOp::Neg => match val {
                Value::Number(n) => Ok(Value::Number(-n)),
                other => Err(EvalError::new(format!(
                    "cannot negate {}",
                    other.type_name()
                ))),
            },
        }
    }

    fn eval_binary(&self, op: BinaryOp, left: &Value, right: &Value) -> Result<Value, EvalError> {
        match op {
            BinaryOp::Add => self.eval_add(left, right),
            BinaryOp::Sub => self.eval_numeric_op(op, left, right, |a, b| a - b),
            BinaryOp::Mul => self.eval_numeric_op(op, left, right, |a, b| a * b),
            BinaryOp::Div => self.eval_numeric_op(op, left, right, |a, b| a / b),
            BinaryOp::Mod => self.eval_numeric_op(op, left, right, |a, b| a % b),

            BinaryOp::Eq => Ok(Value::Bool(values_equal(left, right))),
            BinaryOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
            BinaryOp::Lt => self.eval_comparison(op, left, right, Ordering::is_lt),
            BinaryOp::Le => self.eval_comparison(op, left, right, Ordering::is_le),
            BinaryOp::Gt => self.eval_comparison(op, left, right, Ordering::is_gt),
            BinaryOp::Ge => self.eval_comparison(op, left, right, Ordering::is_ge),

            BinaryOp::And | BinaryOp::Or => Ok(Value::Bool(match op {
                BinaryOp::And => left.is_truthy() && right.is_truthy(),
                _ => left.is_truthy() || right.is_truthy(),
            })),
        }
    }

    fn eval_add(&self, left: &Value, right: &Value) -> Result<Value, EvalError> {
        match (left, right) {
            (Value::Number(a), Value::Number(b)) => Ok(Value::Number(a + b)),
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            _ => Err(type_error(BinaryOp::Add, left, right)),
        }
    }

    fn eval_numeric_op<F>(
        &self,
        op: BinaryOp,
        left: &Value,
        right: &Value,
        f: F,
    ) -> Result<Value, EvalError>
    where
        F: FnOnce(f64, f64) -> f64,
    {
        match (left.as_number(), right.as_number()) {
            (Some(a), Some(b)) => Ok(Value::Number(f(a, b))),
            _ => Err(type_error(op, left, right)),
        }
    }

    fn eval_comparison<F>(
        &self,
        op: BinaryOp,
        left: &Value,
        right: &Value,
        f: F,
    ) -> Result<Value, EvalError>
    where
        F: FnOnce(Ordering) -> bool,
    {
        let ordering = match (left, right) {
            (Value::Number(a), Value::Number(b)) => a.partial_cmp(b),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            _ => return Err(type_error(op, left, right)),
        };
        // NaN compares false against everything
        Ok(Value::Bool(ordering.is_some_and(f)))
    }
}

fn type_error(op: BinaryOp, left: &Value, right: &Value) -> EvalError {
    EvalError::new(format!(
        "operator '{}' is not defined for {} and {}",
        op,
        left.type_name(),
        right.type_name()
    ))
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a == b || (a - b).abs() < f64::EPSILON,
        _ => left == right,
    }
}
