// Expression Parser
// Recursive descent parser producing an AST for filter/pick expressions

use crate::expression::lexer::{LexError, Lexer, Spanned, Token};

use std::fmt;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Null,
    Bool(bool),
    Number(f64),
    String(String),

    /// Free variable reference; only `x` survives compilation
    Variable(String),

    /// Function call: abs(x), max(x)
    FunctionCall { name: String, args: Vec<Expr> },

    Unary { op: UnaryOp, expr: Box<Expr> },

    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// condition ? then : else
    Ternary {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },
}

impl Expr {
    /// Visit this node and all of its descendants, parents first
    pub fn walk<'a>(&'a self, visit: &mut impl FnMut(&'a Expr)) {
        visit(self);
        match self {
            Expr::FunctionCall { args, .. } => args.iter().for_each(|a| a.walk(visit)),
            Expr::Unary { expr, .. } => expr.walk(visit),
            Expr::Binary { left, right, .. } => {
                left.walk(visit);
                right.walk(visit);
            }
            Expr::Ternary {
                condition,
                then_expr,
                else_expr,
            } => {
                condition.walk(visit);
                then_expr.walk(visit);
                else_expr.walk(visit);
            }
            _ => {}
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not, // !
    Neg, // -
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,

    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,

    And,
    Or,
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        };
        write!(f, "{}", s)
    }
}

/// Lexing, parsing or validation failure, positioned in the source
#[derive(Debug, Clone, PartialEq)]
pub struct ExprError {
    pub message: String,
    pub position: usize,
}

impl ExprError {
    pub fn new(message: impl Into<String>, position: usize) -> Self {
        Self {
            message: message.into(),
            position,
        }
    }
}

impl fmt::Display for ExprError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at position {}", self.message, self.position)
    }
}

impl std::error::Error for ExprError {}

impl From<LexError> for ExprError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

pub struct ExprParser {
    tokens: Vec<Spanned>,
    position: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Spanned>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    pub fn parse_str(input: &str) -> Result<Expr, ExprError> {
        let tokens = Lexer::new(input).tokenize()?;
        Self::new(tokens).parse()
    }

    pub fn parse(&mut self) -> Result<Expr, ExprError> {
        if self.check(&Token::Eof) {
            return Err(self.error("empty expression"));
        }

        let expr = self.parse_ternary()?;

        if !self.check(&Token::Eof) {
            return Err(self.error(&format!("unexpected token '{}'", self.peek())));
        }

        Ok(expr)
    }

    // Precedence (lowest to highest):
    // ternary, or, and, equality, comparison, additive, multiplicative, unary, call

    fn parse_ternary(&mut self) -> Result<Expr, ExprError> {
        let condition = self.parse_or()?;

        if self.check(&Token::Question) {
            self.advance();
            let then_expr = self.parse_ternary()?;
            self.expect(&Token::Colon, "expected ':' in ternary expression")?;
            let else_expr = self.parse_ternary()?;

            return Ok(Expr::Ternary {
                condition: Box::new(condition),
                then_expr: Box::new(then_expr),
                else_expr: Box::new(else_expr),
            });
        }

        Ok(condition)
    }

    fn parse_or(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_and()?;

        while self.check(&Token::Or) {
            self.advance();
            let right = self.parse_and()?;
            left = binary(BinaryOp::Or, left, right);
        }

        Ok(left)
    }

    fn parse_and(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_equality()?;

        while self.check(&Token::And) {
            self.advance();
            let right = self.parse_equality()?;
            left = binary(BinaryOp::And, left, right);
        }

        Ok(left)
    }

    fn parse_equality(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_comparison()?;

        loop {
            let op = match self.peek() {
                Token::Eq => BinaryOp::Eq,
                Token::Ne => BinaryOp::Ne,
                _ => break,
            };

            self.advance();
            let right = self.parse_comparison()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_comparison(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_additive()?;

        loop {
            let op = match self.peek() {
                Token::Lt => BinaryOp::Lt,
                Token::Le => BinaryOp::Le,
                Token::Gt => BinaryOp::Gt,
                Token::Ge => BinaryOp::Ge,
                _ => break,
            };

            self.advance();
            let right = self.parse_additive()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_additive(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_multiplicative()?;

        loop {
            let op = match self.peek() {
                Token::Plus => BinaryOp::Add,
                Token::Minus => BinaryOp::Sub,
                _ => break,
            };

            self.advance();
            let right = self.parse_multiplicative()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_multiplicative(&mut self) -> Result<Expr, ExprError> {
        let mut left = self.parse_unary()?;

        loop {
            let op = match self.peek() {
                Token::Star => BinaryOp::Mul,
                Token::Slash => BinaryOp::Div,
                Token::Percent => BinaryOp::Mod,
                _ => break,
            };

            self.advance();
            let right = self.parse_unary()?;
            left = binary(op, left, right);
        }

        Ok(left)
    }

    fn parse_unary(&mut self) -> Result<Expr, ExprError> {
        let op = match self.peek() {
            Token::Not => UnaryOp::Not,
            Token::Minus => UnaryOp::Neg,
            _ => return self.parse_primary(),
        };

        self.advance();
        let expr = self.parse_unary()?;
        Ok(Expr::Unary {
            op,
            expr: Box::new(expr),
        })
    }

    fn parse_primary(&mut self) -> Result<Expr, ExprError> {
        match self.peek().clone() {
            Token::Null => {
                self.advance();
                Ok(Expr::Null)
            }
            Token::True => {
                self.advance();
                Ok(Expr::Bool(true))
            }
            Token::False => {
                self.advance();
                Ok(Expr::Bool(false))
            }
            Token::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            Token::String(s) => {
                self.advance();
                Ok(Expr::String(s))
            }
            Token::Identifier(name) => {
                self.advance();

                if self.check(&Token::LParen) {
                    let args = self.parse_args()?;
                    Ok(Expr::FunctionCall { name, args })
                } else {
                    Ok(Expr::Variable(name))
                }
            }
            Token::LParen => {
                self.advance();
                let expr = self.parse_ternary()?;
                self.expect(&Token::RParen, "expected ')'")?;
                Ok(expr)
            }
            Token::Eof => Err(self.error("unexpected end of expression")),
            token => Err(self.error(&format!("unexpected token '{}'", token))),
        }
    }

    fn parse_args(&mut self) -> Result<Vec<Expr>, ExprError> {
        self.expect(&Token::LParen, "expected '('")?;

        let mut args = Vec::new();

        if !self.check(&Token::RParen) {
            args.push(self.parse_ternary()?);

            while self.check(&Token::Comma) {
                self.advance();
                if self.check(&Token::RParen) {
                    break; // trailing comma
                }
                args.push(self.parse_ternary()?);
            }
        }

        self.expect(&Token::RParen, "expected ')' after arguments")?;
        Ok(args)
    }

    fn peek(&self) -> &Token {
        self.tokens
            .get(self.position)
            .map(|s| &s.token)
            .unwrap_or(&Token::Eof)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    fn expect(&mut self, token: &Token, msg: &str) -> Result<(), ExprError> {
        if self.check(token) {
            self.advance();
            Ok(())
        } else {
            Err(self.error(msg))
        }
    }

    /// Error positioned at the current token's byte offset
    fn error(&self, message: &str) -> ExprError {
        let position = self
            .tokens
            .get(self.position)
            .or_else(|| self.tokens.last())
            .map(|s| s.position)
            .unwrap_or(0);
        ExprError::new(message, position)
    }
}

fn binary(op: BinaryOp, left: Expr, right: Expr) -> Expr {
    Expr::Binary {
        op,
        left: Box::new(left),
        right: Box::new(right),
    }
}
