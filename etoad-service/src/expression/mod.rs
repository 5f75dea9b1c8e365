// Expression Engine
// Filter predicates and pick aggregators over analysis output fields

pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use evaluator::{EvalError, Evaluator, BOUND_VARIABLE};
pub use functions::{BuiltinFunctions, FunctionSpec, NativeFn};
pub use lexer::{LexError, Lexer, Token};
pub use parser::{BinaryOp, Expr, ExprError, ExprParser, UnaryOp};

use crate::protocol::Value;

use std::fmt;

/// A parsed and checked expression, ready to evaluate against `x`
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    ast: Expr,
}

impl Expression {
    /// Parse `source` and check it only uses `x` and known functions
    pub fn compile(source: &str) -> Result<Self, ExprError> {
        Self::compile_with(source, BuiltinFunctions::standard())
    }

    pub fn compile_with(source: &str, functions: &BuiltinFunctions) -> Result<Self, ExprError> {
        let ast = ExprParser::parse_str(source)?;
        check(&ast, source, functions)?;
        Ok(Self {
            source: source.to_string(),
            ast,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn ast(&self) -> &Expr {
        &self.ast
    }

    pub fn eval(&self, x: &Value) -> Result<Value, EvalError> {
        Evaluator::new(x).eval(&self.ast)
    }

    pub fn eval_with(&self, x: &Value, functions: &BuiltinFunctions) -> Result<Value, EvalError> {
        Evaluator::with_functions(x, functions).eval(&self.ast)
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn check(ast: &Expr, source: &str, functions: &BuiltinFunctions) -> Result<(), ExprError> {
    let mut problem: Option<ExprError> = None;

    ast.walk(&mut |node| {
        if problem.is_some() {
            return;
        }
        match node {
            Expr::Variable(name) if name != BOUND_VARIABLE => {
                problem = Some(ExprError::new(
                    format!("unknown variable '{}', only '{}' is bound", name, BOUND_VARIABLE),
                    source.find(name.as_str()).unwrap_or(0),
                ));
            }
            Expr::FunctionCall { name, args } => {
                let position = source.find(name.as_str()).unwrap_or(0);
                match functions.get(name) {
                    None => {
                        problem = Some(ExprError::new(
                            format!("unknown function '{}'", name),
                            position,
                        ));
                    }
                    Some(spec) if !spec.accepts(args.len()) => {
                        problem = Some(ExprError::new(
                            format!("{}() does not take {} argument(s)", name, args.len()),
                            position,
                        ));
                    }
                    Some(_) => {}
                }
            }
            _ => {}
        }
    });

    match problem {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compile_and_eval() {
        let predicate = Expression::compile("x > -0.2").unwrap();
        assert_eq!(predicate.source(), "x > -0.2");
        assert_eq!(predicate.eval(&Value::Number(0.0)).unwrap(), Value::Bool(true));
    }

    #[test]
    fn test_unknown_variable_rejected() {
        let err = Expression::compile("x > y").unwrap_err();
        assert!(err.message.contains("unknown variable 'y'"));
        assert_eq!(err.position, 4);
    }

    #[test]
    fn test_unknown_function_rejected() {
        let err = Expression::compile("median(x)").unwrap_err();
        assert!(err.message.contains("unknown function 'median'"));
    }

    #[test]
    fn test_arity_checked_at_compile_time() {
        assert!(Expression::compile("abs(x, 1)").is_err());
        assert!(Expression::compile("max()").is_err());
        assert!(Expression::compile("max(x, 0)").is_ok());
    }

    #[test]
    fn test_custom_registry() {
        fn half(args: &[Value]) -> Result<Value, EvalError> {
            Ok(Value::Number(args[0].as_number().unwrap_or(0.0) / 2.0))
        }

        let mut functions = BuiltinFunctions::new();
        functions.register("half", 1, Some(1), half);

        let expr = Expression::compile_with("half(x)", &functions).unwrap();
        assert_eq!(
            expr.eval_with(&Value::Number(3.0), &functions).unwrap(),
            Value::Number(1.5)
        );
        assert!(Expression::compile("half(x)").is_err());
    }
}
