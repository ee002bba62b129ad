//! Expression evaluation for conditions, skip expressions and loop settings
//!
//! Evaluation sits behind the `ExpressionEvaluator` trait so callers can plug
//! in a full expression language. `SimpleExpressionEvaluator` covers the
//! JUEL-style subset process models use day to day: `${...}` wrappers,
//! variables with member access, literals, arithmetic, comparisons,
//! `empty`, and short-circuiting boolean operators.

use std::collections::{BTreeMap, HashMap};

use logos::Logos;
use serde_json::Value;

use crate::error::{ProcessEngineError, Result};

/// Read access to the variables visible from an execution
pub trait VariableScope {
    fn variable(&self, name: &str) -> Option<Value>;
}

impl VariableScope for BTreeMap<String, Value> {
    fn variable(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

impl VariableScope for HashMap<String, Value> {
    fn variable(&self, name: &str) -> Option<Value> {
        self.get(name).cloned()
    }
}

/// Evaluates expressions against a variable scope
pub trait ExpressionEvaluator: Send + Sync {
    fn evaluate(&self, expression: &str, scope: &dyn VariableScope) -> Result<Value>;

    /// Evaluate and interpret the result as a condition
    fn evaluate_condition(&self, expression: &str, scope: &dyn VariableScope) -> Result<bool> {
        Ok(is_truthy(&self.evaluate(expression, scope)?))
    }
}

/// Truthiness used for conditions
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty() && s != "false" && s != "0",
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\r\n]+")]
enum Token {
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("&&")]
    #[token("and")]
    And,
    #[token("||")]
    #[token("or")]
    Or,
    #[token("!")]
    #[token("not")]
    Not,
    #[token("==")]
    #[token("eq")]
    Eq,
    #[token("!=")]
    #[token("ne")]
    Ne,
    #[token("<=")]
    #[token("le")]
    Le,
    #[token(">=")]
    #[token("ge")]
    Ge,
    #[token("<")]
    #[token("lt")]
    Lt,
    #[token(">")]
    #[token("gt")]
    Gt,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("/")]
    #[token("div")]
    Slash,
    #[token("%")]
    #[token("mod")]
    Percent,
    #[token(".")]
    Dot,
    #[token("empty")]
    Empty,
    #[token("true")]
    True,
    #[token("false")]
    False,
    #[token("null")]
    Null,
    #[regex(r"[0-9]+(\.[0-9]+)?", |lex| lex.slice().parse::<f64>().ok())]
    Number(f64),
    #[regex(r#""([^"\\]|\\.)*""#, |lex| unquote(lex.slice()))]
    #[regex(r"'([^'\\]|\\.)*'", |lex| unquote(lex.slice()))]
    Str(String),
    #[regex(r"[A-Za-z_][A-Za-z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),
}

fn unquote(raw: &str) -> String {
    let inner = &raw[1..raw.len() - 1];
    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            if let Some(escaped) = chars.next() {
                out.push(escaped);
            }
        } else {
            out.push(c);
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum BinOp {
    And,
    Or,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

#[derive(Debug, Clone, PartialEq)]
enum Expr {
    Literal(Value),
    Variable(String),
    Member(Box<Expr>, String),
    Not(Box<Expr>),
    Negate(Box<Expr>),
    Empty(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
}

/// Recursive-descent parser over the token stream
struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Result<Self> {
        let mut tokens = Vec::new();
        for (token, span) in Token::lexer(source).spanned() {
            match token {
                Ok(token) => tokens.push(token),
                Err(_) => {
                    return Err(ProcessEngineError::expression(
                        source,
                        format!("unexpected character '{}'", &source[span]),
                    ))
                }
            }
        }
        Ok(Self { tokens, pos: 0, source })
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, expected: &Token) -> bool {
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn error(&self, msg: impl Into<String>) -> ProcessEngineError {
        ProcessEngineError::expression(self.source, msg)
    }

    fn parse(mut self) -> Result<Expr> {
        let expr = self.or()?;
        match self.peek() {
            None => Ok(expr),
            Some(token) => Err(self.error(format!("unexpected token {:?}", token))),
        }
    }

    fn or(&mut self) -> Result<Expr> {
        let mut left = self.and()?;
        while self.eat(&Token::Or) {
            let right = self.and()?;
            left = Expr::Binary(BinOp::Or, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Expr> {
        let mut left = self.comparison()?;
        while self.eat(&Token::And) {
            let right = self.comparison()?;
            left = Expr::Binary(BinOp::And, Box::new(left), Box::new(right));
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Expr> {
        let left = self.additive()?;
        let op = match self.peek() {
            Some(Token::Eq) => BinOp::Eq,
            Some(Token::Ne) => BinOp::Ne,
            Some(Token::Lt) => BinOp::Lt,
            Some(Token::Le) => BinOp::Le,
            Some(Token::Gt) => BinOp::Gt,
            Some(Token::Ge) => BinOp::Ge,
            _ => return Ok(left),
        };
        self.pos += 1;
        let right = self.additive()?;
        Ok(Expr::Binary(op, Box::new(left), Box::new(right)))
    }

    fn additive(&mut self) -> Result<Expr> {
        let mut left = self.multiplicative()?;
        loop {
            let op = match self.peek() {
                Some(Token::Plus) => BinOp::Add,
                Some(Token::Minus) => BinOp::Sub,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.multiplicative()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn multiplicative(&mut self) -> Result<Expr> {
        let mut left = self.unary()?;
        loop {
            let op = match self.peek() {
                Some(Token::Star) => BinOp::Mul,
                Some(Token::Slash) => BinOp::Div,
                Some(Token::Percent) => BinOp::Rem,
                _ => return Ok(left),
            };
            self.pos += 1;
            let right = self.unary()?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }
    }

    fn unary(&mut self) -> Result<Expr> {
        if self.eat(&Token::Not) {
            return Ok(Expr::Not(Box::new(self.unary()?)));
        }
        if self.eat(&Token::Minus) {
            return Ok(Expr::Negate(Box::new(self.unary()?)));
        }
        if self.eat(&Token::Empty) {
            return Ok(Expr::Empty(Box::new(self.unary()?)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr> {
        let mut expr = self.primary()?;
        while self.eat(&Token::Dot) {
            match self.advance() {
                Some(Token::Ident(name)) => expr = Expr::Member(Box::new(expr), name),
                other => return Err(self.error(format!("expected property name, got {:?}", other))),
            }
        }
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr> {
        match self.advance() {
            Some(Token::Number(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::True) => Ok(Expr::Literal(Value::Bool(true))),
            Some(Token::False) => Ok(Expr::Literal(Value::Bool(false))),
            Some(Token::Null) => Ok(Expr::Literal(Value::Null)),
            Some(Token::Ident(name)) => Ok(Expr::Variable(name)),
            Some(Token::LParen) => {
                let inner = self.or()?;
                if !self.eat(&Token::RParen) {
                    return Err(self.error("missing ')'"));
                }
                Ok(inner)
            }
            Some(token) => Err(self.error(format!("unexpected token {:?}", token))),
            None => Err(self.error("unexpected end of expression")),
        }
    }
}

/// Integral values stay integers so counters compare and serialize cleanly
fn number(n: f64) -> Value {
    if n.fract() == 0.0 && n.abs() < i64::MAX as f64 {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

/// Built-in evaluator for the JUEL-style subset
#[derive(Debug, Default, Clone)]
pub struct SimpleExpressionEvaluator;

impl SimpleExpressionEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn eval(&self, source: &str, expr: &Expr, scope: &dyn VariableScope) -> Result<Value> {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Variable(name) => scope.variable(name).ok_or_else(|| {
                ProcessEngineError::expression(source, format!("unknown variable '{}'", name))
            }),
            Expr::Member(target, property) => {
                let value = self.eval(source, target, scope)?;
                Ok(value.get(property).cloned().unwrap_or(Value::Null))
            }
            Expr::Not(inner) => Ok(Value::Bool(!is_truthy(&self.eval(source, inner, scope)?))),
            Expr::Negate(inner) => {
                let value = as_number(source, &self.eval(source, inner, scope)?)?;
                Ok(number(-value))
            }
            Expr::Empty(inner) => {
                let value = match self.eval(source, inner, scope) {
                    Ok(value) => value,
                    Err(_) => Value::Null,
                };
                Ok(Value::Bool(match &value {
                    Value::Null => true,
                    Value::String(s) => s.is_empty(),
                    Value::Array(a) => a.is_empty(),
                    Value::Object(o) => o.is_empty(),
                    _ => false,
                }))
            }
            Expr::Binary(BinOp::And, left, right) => {
                if !is_truthy(&self.eval(source, left, scope)?) {
                    return Ok(Value::Bool(false));
                }
                Ok(Value::Bool(is_truthy(&self.eval(source, right, scope)?)))
            }
            Expr::Binary(BinOp::Or, left, right) => {
                if is_truthy(&self.eval(source, left, scope)?) {
                    return Ok(Value::Bool(true));
                }
                Ok(Value::Bool(is_truthy(&self.eval(source, right, scope)?)))
            }
            Expr::Binary(op, left, right) => {
                let left = self.eval(source, left, scope)?;
                let right = self.eval(source, right, scope)?;
                binary(source, *op, &left, &right)
            }
        }
    }
}

fn as_number(source: &str, value: &Value) -> Result<f64> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| ProcessEngineError::expression(source, "number out of range")),
        Value::String(s) => s
            .parse::<f64>()
            .map_err(|_| ProcessEngineError::expression(source, format!("'{}' is not a number", s))),
        other => Err(ProcessEngineError::expression(
            source,
            format!("expected a number, got {}", other),
        )),
    }
}

fn values_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn binary(source: &str, op: BinOp, left: &Value, right: &Value) -> Result<Value> {
    match op {
        BinOp::Eq => Ok(Value::Bool(values_equal(left, right))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(left, right))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (left, right) {
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => {
                    let (a, b) = (as_number(source, left)?, as_number(source, right)?);
                    a.partial_cmp(&b).ok_or_else(|| {
                        ProcessEngineError::expression(source, "values are not comparable")
                    })?
                }
            };
            Ok(Value::Bool(match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            }))
        }
        BinOp::Add | BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
            let (a, b) = (as_number(source, left)?, as_number(source, right)?);
            if matches!(op, BinOp::Div | BinOp::Rem) && b == 0.0 {
                return Err(ProcessEngineError::expression(source, "division by zero"));
            }
            Ok(number(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                BinOp::Div => a / b,
                _ => a % b,
            }))
        }
        BinOp::And | BinOp::Or => Err(ProcessEngineError::expression(
            source,
            "boolean operator evaluated eagerly",
        )),
    }
}

/// Strip a `${...}` or `#{...}` wrapper
fn unwrap_expression(expression: &str) -> &str {
    let trimmed = expression.trim();
    if (trimmed.starts_with("${") || trimmed.starts_with("#{")) && trimmed.ends_with('}') {
        &trimmed[2..trimmed.len() - 1]
    } else {
        trimmed
    }
}

impl ExpressionEvaluator for SimpleExpressionEvaluator {
    fn evaluate(&self, expression: &str, scope: &dyn VariableScope) -> Result<Value> {
        let body = unwrap_expression(expression);
        let ast = Parser::new(body)?.parse()?;
        self.eval(expression, &ast, scope)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn vars(value: Value) -> BTreeMap<String, Value> {
        serde_json::from_value(value).unwrap()
    }

    fn eval(expr: &str, scope: &BTreeMap<String, Value>) -> Value {
        SimpleExpressionEvaluator::new().evaluate(expr, scope).unwrap()
    }

    #[test]
    fn test_literals_and_arithmetic() {
        let scope = BTreeMap::new();
        assert_eq!(eval("${5}", &scope), json!(5));
        assert_eq!(eval("${2 + 3 * 4}", &scope), json!(14));
        assert_eq!(eval("${(2 + 3) * 4}", &scope), json!(20));
        assert_eq!(eval("${7 / 2}", &scope), json!(3.5));
        assert_eq!(eval("${-3 + 1}", &scope), json!(-2));
        assert_eq!(eval("'it\\'s'", &scope), json!("it's"));
    }

    #[test]
    fn test_loop_counter_comparisons() {
        let scope = vars(json!({"nrOfCompletedInstances": 2, "nrOfInstances": 5}));
        assert_eq!(eval("${nrOfCompletedInstances >= 2}", &scope), json!(true));
        assert_eq!(eval("${nrOfCompletedInstances / nrOfInstances >= 0.6}", &scope), json!(false));
        assert_eq!(eval("${nrOfCompletedInstances ge 2 and nrOfInstances eq 5}", &scope), json!(true));
    }

    #[test]
    fn test_member_access_and_strings() {
        let scope = vars(json!({"order": {"status": "approved", "total": 120}}));
        assert_eq!(eval("${order.status == 'approved'}", &scope), json!(true));
        assert_eq!(eval("${order.total > 100 && order.status != \"rejected\"}", &scope), json!(true));
        assert_eq!(eval("${order.missing}", &scope), Value::Null);
    }

    #[test]
    fn test_short_circuit_skips_unknown_variable() {
        let scope = vars(json!({"ready": false}));
        assert_eq!(eval("${ready && undefinedThing > 1}", &scope), json!(false));
        assert_eq!(eval("${!ready || undefinedThing}", &scope), json!(true));
    }

    #[test]
    fn test_empty_operator() {
        let scope = vars(json!({"items": [], "name": "x"}));
        assert_eq!(eval("${empty items}", &scope), json!(true));
        assert_eq!(eval("${empty name}", &scope), json!(false));
        assert_eq!(eval("${empty unknown}", &scope), json!(true));
    }

    #[test]
    fn test_errors() {
        let scope = BTreeMap::new();
        let evaluator = SimpleExpressionEvaluator::new();
        assert!(evaluator.evaluate("${missing > 1}", &scope).is_err());
        assert!(evaluator.evaluate("${1 +}", &scope).is_err());
        assert!(evaluator.evaluate("${1 / 0}", &scope).is_err());
        assert!(evaluator.evaluate("${a # b}", &scope).is_err());
    }

    #[test]
    fn test_condition_truthiness() {
        let scope = vars(json!({"flag": "false", "count": 0}));
        let evaluator = SimpleExpressionEvaluator::new();
        assert!(!evaluator.evaluate_condition("${flag}", &scope).unwrap());
        assert!(!evaluator.evaluate_condition("${count}", &scope).unwrap());
        assert!(evaluator.evaluate_condition("true", &scope).unwrap());
    }
}
