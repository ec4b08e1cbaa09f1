//! Gate condition and interpolation expressions.
//!
//! ```text
//! expr      := or
//! or        := and ( "||" and )*
//! and       := unary ( "&&" unary )*
//! unary     := "!" unary | compare
//! compare   := primary ( ("==" | "!=" | "<" | "<=" | ">" | ">=") primary )?
//! primary   := literal | call | reference | "(" expr ")"
//! reference := ident ( "." ident | "[" string "]" )*
//! ```
//!
//! Expressions are parsed once when a run definition is loaded and evaluated
//! against an [`EvalScope`] as often as needed. Unknown references evaluate to
//! [`ExprValue::Undefined`], which is falsy and never compares equal (or
//! unequal) to anything.

use crate::context::RunContext;
use crate::run::{JobResult, MatrixAssignment, StepState, Upstream};
use crate::value::{Value, format_number};
use indexmap::IndexMap;
use regex::Regex;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} (at offset {offset})")]
pub struct ExpressionError {
    pub message: String,
    pub offset: usize,
}

impl ExpressionError {
    fn new(message: impl Into<String>, offset: usize) -> Self {
        Self {
            message: message.into(),
            offset,
        }
    }
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, PartialEq)]
pub enum ExprValue {
    Undefined,
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl ExprValue {
    pub fn is_truthy(&self) -> bool {
        match self {
            ExprValue::Undefined | ExprValue::Null => false,
            ExprValue::Bool(b) => *b,
            ExprValue::Number(n) => *n != 0.0 && !n.is_nan(),
            ExprValue::String(s) => !s.is_empty(),
        }
    }

    pub fn is_undefined(&self) -> bool {
        matches!(self, ExprValue::Undefined)
    }

    /// String rendering used by interpolation. Undefined and null render empty.
    pub fn render(&self) -> String {
        match self {
            ExprValue::Undefined | ExprValue::Null => String::new(),
            ExprValue::Bool(b) => b.to_string(),
            ExprValue::Number(n) => format_number(*n),
            ExprValue::String(s) => s.clone(),
        }
    }

    fn as_number(&self) -> Option<f64> {
        match self {
            ExprValue::Undefined => None,
            ExprValue::Null => Some(0.0),
            ExprValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            ExprValue::Number(n) => Some(*n),
            ExprValue::String(s) => {
                let trimmed = s.trim();
                if trimmed.is_empty() {
                    Some(0.0)
                } else {
                    trimmed.parse().ok()
                }
            }
        }
    }

    fn loose_eq(&self, other: &ExprValue) -> bool {
        use ExprValue::*;
        match (self, other) {
            (Undefined, _) | (_, Undefined) => false,
            (Null, Null) => true,
            (Null, _) | (_, Null) => false,
            (String(a), String(b)) => a == b,
            (Bool(a), Bool(b)) => a == b,
            (Bool(b), String(s)) | (String(s), Bool(b)) => s.eq_ignore_ascii_case(&b.to_string()),
            _ => match (self.as_number(), other.as_number()) {
                (Some(a), Some(b)) => a == b,
                _ => false,
            },
        }
    }

    fn compare(&self, other: &ExprValue) -> Option<std::cmp::Ordering> {
        if self.is_undefined() || other.is_undefined() {
            return None;
        }
        match (self.as_number(), other.as_number()) {
            (Some(a), Some(b)) => a.partial_cmp(&b),
            _ => Some(self.render().cmp(&other.render())),
        }
    }
}

impl From<&Value> for ExprValue {
    fn from(value: &Value) -> Self {
        match value {
            Value::Bool(b) => ExprValue::Bool(*b),
            Value::Number(n) => ExprValue::Number(*n),
            Value::String(s) => ExprValue::String(s.clone()),
        }
    }
}

impl From<&str> for ExprValue {
    fn from(value: &str) -> Self {
        ExprValue::String(value.to_string())
    }
}

impl fmt::Display for ExprValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Everything an expression may reference.
#[derive(Debug, Clone, Copy)]
pub struct EvalScope<'a> {
    ctx: &'a RunContext,
    matrix: Option<&'a MatrixAssignment>,
    env: Option<&'a IndexMap<String, String>>,
    needs: Option<&'a IndexMap<String, Upstream>>,
    steps: Option<&'a IndexMap<String, StepState>>,
    run_cancelled: bool,
    step_failed: bool,
    step_gate: bool,
}

impl<'a> EvalScope<'a> {
    pub fn new(ctx: &'a RunContext) -> Self {
        Self {
            ctx,
            matrix: None,
            env: None,
            needs: None,
            steps: None,
            run_cancelled: false,
            step_failed: false,
            step_gate: false,
        }
    }

    pub fn with_matrix(mut self, matrix: &'a MatrixAssignment) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn with_env(mut self, env: &'a IndexMap<String, String>) -> Self {
        self.env = Some(env);
        self
    }

    pub fn with_needs(mut self, needs: &'a IndexMap<String, Upstream>) -> Self {
        self.needs = Some(needs);
        self
    }

    pub fn with_steps(mut self, steps: &'a IndexMap<String, StepState>) -> Self {
        self.steps = Some(steps);
        self
    }

    pub fn with_run_cancelled(mut self, cancelled: bool) -> Self {
        self.run_cancelled = cancelled;
        self
    }

    /// Marks that an earlier step of the current instance failed.
    pub fn with_step_failed(mut self, failed: bool) -> Self {
        self.step_failed = failed;
        self
    }

    /// Scope for conditions inside a running instance. Status functions then
    /// only look at earlier steps and run cancellation; the job gate already
    /// settled the upstream results. `needs.*` references still resolve.
    pub fn for_steps(mut self) -> Self {
        self.step_gate = true;
        self
    }

    fn upstream_results(&self) -> impl Iterator<Item = JobResult> + '_ {
        self.needs
            .filter(|_| !self.step_gate)
            .into_iter()
            .flat_map(|n| n.values().map(|u| u.result))
    }

    fn status_success(&self) -> bool {
        !self.run_cancelled
            && !self.step_failed
            && self.upstream_results().all(|r| r == JobResult::Success)
    }

    fn status_failure(&self) -> bool {
        self.step_failed || self.upstream_results().any(|r| r == JobResult::Failure)
    }

    fn status_cancelled(&self) -> bool {
        self.run_cancelled || self.upstream_results().any(|r| r == JobResult::Cancelled)
    }

    fn resolve(&self, path: &[String]) -> ExprValue {
        let Some((head, rest)) = path.split_first() else {
            return ExprValue::Undefined;
        };
        let rest: Vec<&str> = rest.iter().map(String::as_str).collect();
        match (head.as_str(), rest.as_slice()) {
            ("ctx", []) => ExprValue::Undefined,
            ("ctx", keys) => lookup_value(self.ctx.get(&keys.join("."))),
            ("inputs", [name]) => lookup_value(self.ctx.get(&format!("inputs.{}", name))),
            ("matrix", [axis]) => lookup_value(self.matrix.and_then(|m| m.get(axis))),
            ("env", [name]) => lookup_str(self.env.and_then(|e| e.get(*name))),
            ("needs", [job, "result"]) => self
                .needs
                .and_then(|n| n.get(*job))
                .map(|u| ExprValue::from(u.result.as_str()))
                .unwrap_or(ExprValue::Undefined),
            ("needs", [job, "outputs", name]) => {
                lookup_str(self.needs.and_then(|n| n.get(*job)).and_then(|u| u.outputs.get(*name)))
            }
            ("steps", [step, "outcome"]) => self
                .steps
                .and_then(|s| s.get(*step))
                .map(|s| ExprValue::from(s.outcome.as_str()))
                .unwrap_or(ExprValue::Undefined),
            ("steps", [step, "stdout"]) => {
                lookup_str(self.steps.and_then(|s| s.get(*step)).map(|s| &s.stdout))
            }
            ("steps", [step, "outputs", name]) => {
                lookup_str(self.steps.and_then(|s| s.get(*step)).and_then(|s| s.outputs.get(*name)))
            }
            _ => ExprValue::Undefined,
        }
    }
}

fn lookup_value(value: Option<&Value>) -> ExprValue {
    value.map(ExprValue::from).unwrap_or(ExprValue::Undefined)
}

fn lookup_str(value: Option<&String>) -> ExprValue {
    value
        .map(|s| ExprValue::String(s.clone()))
        .unwrap_or(ExprValue::Undefined)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CompareOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Function {
    Always,
    Success,
    Failure,
    Cancelled,
    Contains,
    StartsWith,
    EndsWith,
    Matches,
    Format,
}

impl Function {
    fn lookup(name: &str) -> Option<Function> {
        const TABLE: &[(&str, Function)] = &[
            ("always", Function::Always),
            ("success", Function::Success),
            ("failure", Function::Failure),
            ("cancelled", Function::Cancelled),
            ("contains", Function::Contains),
            ("startsWith", Function::StartsWith),
            ("endsWith", Function::EndsWith),
            ("matches", Function::Matches),
            ("format", Function::Format),
        ];
        TABLE
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, f)| *f)
    }

    /// (min, max) argument count; `None` max means variadic.
    fn arity(&self) -> (usize, Option<usize>) {
        match self {
            Function::Always | Function::Success | Function::Failure | Function::Cancelled => {
                (0, Some(0))
            }
            Function::Contains | Function::StartsWith | Function::EndsWith | Function::Matches => {
                (2, Some(2))
            }
            Function::Format => (1, None),
        }
    }

    fn is_status(&self) -> bool {
        matches!(
            self,
            Function::Always | Function::Success | Function::Failure | Function::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Node {
    Literal(ExprValue),
    Reference(Vec<String>),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Compare(CompareOp, Box<Node>, Box<Node>),
    Call(Function, Vec<Node>),
}

impl Node {
    fn eval(&self, scope: &EvalScope<'_>) -> ExprValue {
        match self {
            Node::Literal(v) => v.clone(),
            Node::Reference(path) => scope.resolve(path),
            Node::Not(inner) => ExprValue::Bool(!inner.eval(scope).is_truthy()),
            Node::And(l, r) => {
                ExprValue::Bool(l.eval(scope).is_truthy() && r.eval(scope).is_truthy())
            }
            Node::Or(l, r) => {
                ExprValue::Bool(l.eval(scope).is_truthy() || r.eval(scope).is_truthy())
            }
            Node::Compare(op, l, r) => {
                let (l, r) = (l.eval(scope), r.eval(scope));
                let result = match op {
                    CompareOp::Eq => l.loose_eq(&r),
                    CompareOp::Ne => !l.is_undefined() && !r.is_undefined() && !l.loose_eq(&r),
                    CompareOp::Lt => l.compare(&r).is_some_and(|o| o.is_lt()),
                    CompareOp::Le => l.compare(&r).is_some_and(|o| o.is_le()),
                    CompareOp::Gt => l.compare(&r).is_some_and(|o| o.is_gt()),
                    CompareOp::Ge => l.compare(&r).is_some_and(|o| o.is_ge()),
                };
                ExprValue::Bool(result)
            }
            Node::Call(function, args) => call(*function, args, scope),
        }
    }

    fn visit(&self, f: &mut dyn FnMut(&Node)) {
        f(self);
        match self {
            Node::Not(inner) => inner.visit(f),
            Node::And(l, r) | Node::Or(l, r) | Node::Compare(_, l, r) => {
                l.visit(f);
                r.visit(f);
            }
            Node::Call(_, args) => args.iter().for_each(|a| a.visit(f)),
            Node::Literal(_) | Node::Reference(_) => {}
        }
    }
}

fn call(function: Function, args: &[Node], scope: &EvalScope<'_>) -> ExprValue {
    let text_pair = || {
        let (a, b) = (args[0].eval(scope), args[1].eval(scope));
        if a.is_undefined() || b.is_undefined() {
            None
        } else {
            Some((a.render(), b.render()))
        }
    };
    let result = match function {
        Function::Always => true,
        Function::Success => scope.status_success(),
        Function::Failure => scope.status_failure(),
        Function::Cancelled => scope.status_cancelled(),
        Function::Contains => text_pair().is_some_and(|(a, b)| a.contains(&b)),
        Function::StartsWith => text_pair().is_some_and(|(a, b)| a.starts_with(&b)),
        Function::EndsWith => text_pair().is_some_and(|(a, b)| a.ends_with(&b)),
        Function::Matches => text_pair().is_some_and(|(text, glob)| glob_match(&glob, &text)),
        Function::Format => {
            let template = args[0].eval(scope).render();
            let values: Vec<String> = args[1..].iter().map(|a| a.eval(scope).render()).collect();
            return ExprValue::String(format_template(&template, &values));
        }
    };
    ExprValue::Bool(result)
}

/// Substitute `{0}`, `{1}`, ... in `template`. `{{` and `}}` are literal braces.
fn format_template(template: &str, values: &[String]) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut digits = String::new();
                while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
                    digits.push(*d);
                    chars.next();
                }
                if chars.peek() == Some(&'}') && !digits.is_empty() {
                    chars.next();
                    if let Some(value) = digits.parse::<usize>().ok().and_then(|i| values.get(i)) {
                        out.push_str(value);
                    }
                } else {
                    out.push('{');
                    out.push_str(&digits);
                }
            }
            other => out.push(other),
        }
    }
    out
}

/// Match `text` against a branch-style glob: `*` matches within one path
/// segment, `**` matches across segments and `?` matches a single character.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    if pattern == "*" || pattern == "**" {
        return true;
    }
    let mut source = String::from("^");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                source.push_str(".*");
            }
            '*' => source.push_str("[^/]*"),
            '?' => source.push_str("[^/]"),
            other => source.push_str(&regex::escape(&other.to_string())),
        }
    }
    source.push('$');
    Regex::new(&source).is_ok_and(|re| re.is_match(text))
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Num(f64),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Comma,
    Not,
    And,
    Or,
    Op(CompareOp),
    Eof,
}

fn tokenize(src: &str) -> Result<Vec<(Token, usize)>, ExpressionError> {
    let chars: Vec<(usize, char)> = src.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        let (offset, c) = chars[i];
        let next = chars.get(i + 1).map(|(_, c)| *c);
        let token = match c {
            c if c.is_whitespace() => {
                i += 1;
                continue;
            }
            '.' => Token::Dot,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '(' => Token::LParen,
            ')' => Token::RParen,
            ',' => Token::Comma,
            '&' if next == Some('&') => {
                i += 1;
                Token::And
            }
            '|' if next == Some('|') => {
                i += 1;
                Token::Or
            }
            '=' if next == Some('=') => {
                i += 1;
                Token::Op(CompareOp::Eq)
            }
            '!' if next == Some('=') => {
                i += 1;
                Token::Op(CompareOp::Ne)
            }
            '!' => Token::Not,
            '<' if next == Some('=') => {
                i += 1;
                Token::Op(CompareOp::Le)
            }
            '<' => Token::Op(CompareOp::Lt),
            '>' if next == Some('=') => {
                i += 1;
                Token::Op(CompareOp::Ge)
            }
            '>' => Token::Op(CompareOp::Gt),
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i).map(|(_, c)| *c) {
                        None => return Err(ExpressionError::new("unterminated string", offset)),
                        Some('\'') if chars.get(i + 1).map(|(_, c)| *c) == Some('\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => break,
                        Some(c) => {
                            value.push(c);
                            i += 1;
                        }
                    }
                }
                Token::Str(value)
            }
            '"' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i).map(|(_, c)| *c) {
                        None => return Err(ExpressionError::new("unterminated string", offset)),
                        Some('\\') => {
                            let escaped = chars
                                .get(i + 1)
                                .map(|(_, c)| *c)
                                .ok_or_else(|| ExpressionError::new("unterminated string", offset))?;
                            value.push(escaped);
                            i += 2;
                        }
                        Some('"') => break,
                        Some(c) => {
                            value.push(c);
                            i += 1;
                        }
                    }
                }
                Token::Str(value)
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while chars
                    .get(i)
                    .is_some_and(|(_, c)| c.is_ascii_digit() || *c == '.')
                {
                    i += 1;
                }
                let text: String = chars[start..i].iter().map(|(_, c)| c).collect();
                let number = text
                    .parse::<f64>()
                    .map_err(|_| ExpressionError::new(format!("invalid number '{}'", text), offset))?;
                tokens.push((Token::Num(number), offset));
                continue;
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                i += 1;
                while chars
                    .get(i)
                    .is_some_and(|(_, c)| c.is_alphanumeric() || *c == '_' || *c == '-')
                {
                    i += 1;
                }
                let ident: String = chars[start..i].iter().map(|(_, c)| c).collect();
                tokens.push((Token::Ident(ident), offset));
                continue;
            }
            other => {
                return Err(ExpressionError::new(
                    format!("unexpected character '{}'", other),
                    offset,
                ));
            }
        };
        tokens.push((token, offset));
        i += 1;
    }
    tokens.push((Token::Eof, src.len()));
    Ok(tokens)
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> &Token {
        &self.tokens[self.pos].0
    }

    fn offset(&self) -> usize {
        self.tokens[self.pos].1
    }

    fn advance(&mut self) -> Token {
        let token = self.tokens[self.pos].0.clone();
        if self.pos + 1 < self.tokens.len() {
            self.pos += 1;
        }
        token
    }

    fn expect(&mut self, expected: Token, what: &str) -> Result<(), ExpressionError> {
        if *self.peek() == expected {
            self.advance();
            Ok(())
        } else {
            Err(ExpressionError::new(format!("expected {}", what), self.offset()))
        }
    }

    fn parse_or(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.parse_and()?;
        while *self.peek() == Token::Or {
            self.advance();
            node = Node::Or(Box::new(node), Box::new(self.parse_and()?));
        }
        Ok(node)
    }

    fn parse_and(&mut self) -> Result<Node, ExpressionError> {
        let mut node = self.parse_unary()?;
        while *self.peek() == Token::And {
            self.advance();
            node = Node::And(Box::new(node), Box::new(self.parse_unary()?));
        }
        Ok(node)
    }

    fn parse_unary(&mut self) -> Result<Node, ExpressionError> {
        if *self.peek() == Token::Not {
            self.advance();
            return Ok(Node::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_compare()
    }

    fn parse_compare(&mut self) -> Result<Node, ExpressionError> {
        let left = self.parse_primary()?;
        if let Token::Op(op) = *self.peek() {
            self.advance();
            let right = self.parse_primary()?;
            return Ok(Node::Compare(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn parse_primary(&mut self) -> Result<Node, ExpressionError> {
        let offset = self.offset();
        match self.advance() {
            Token::Str(s) => Ok(Node::Literal(ExprValue::String(s))),
            Token::Num(n) => Ok(Node::Literal(ExprValue::Number(n))),
            Token::LParen => {
                let inner = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                Ok(inner)
            }
            Token::Ident(name) => {
                if *self.peek() == Token::LParen {
                    return self.parse_call(name, offset);
                }
                match name.as_str() {
                    "true" => return Ok(Node::Literal(ExprValue::Bool(true))),
                    "false" => return Ok(Node::Literal(ExprValue::Bool(false))),
                    "null" => return Ok(Node::Literal(ExprValue::Null)),
                    _ => {}
                }
                self.parse_reference(name)
            }
            Token::Eof => Err(ExpressionError::new("unexpected end of expression", offset)),
            other => Err(ExpressionError::new(
                format!("unexpected token {:?}", other),
                offset,
            )),
        }
    }

    fn parse_reference(&mut self, head: String) -> Result<Node, ExpressionError> {
        let mut path = vec![head];
        loop {
            match self.peek() {
                Token::Dot => {
                    self.advance();
                    let offset = self.offset();
                    match self.advance() {
                        Token::Ident(segment) => path.push(segment),
                        Token::Num(n) => path.push(format_number(n)),
                        _ => return Err(ExpressionError::new("expected property name", offset)),
                    }
                }
                Token::LBracket => {
                    self.advance();
                    let offset = self.offset();
                    match self.advance() {
                        Token::Str(segment) => path.push(segment),
                        _ => return Err(ExpressionError::new("expected quoted property", offset)),
                    }
                    self.expect(Token::RBracket, "']'")?;
                }
                _ => break,
            }
        }
        Ok(Node::Reference(path))
    }

    fn parse_call(&mut self, name: String, offset: usize) -> Result<Node, ExpressionError> {
        let function = Function::lookup(&name)
            .ok_or_else(|| ExpressionError::new(format!("unknown function '{}'", name), offset))?;
        self.expect(Token::LParen, "'('")?;
        let mut args = Vec::new();
        if *self.peek() != Token::RParen {
            loop {
                args.push(self.parse_or()?);
                if *self.peek() == Token::Comma {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(Token::RParen, "')'")?;

        let (min, max) = function.arity();
        if args.len() < min || max.is_some_and(|max| args.len() > max) {
            return Err(ExpressionError::new(
                format!("{}() called with {} argument(s)", name, args.len()),
                offset,
            ));
        }
        Ok(Node::Call(function, args))
    }
}

/// A parsed expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Expression {
    source: String,
    root: Node,
}

impl Expression {
    /// Parse `src`, accepting an optional surrounding `${{ }}`.
    pub fn parse(src: &str) -> Result<Self, ExpressionError> {
        let trimmed = src.trim();
        let body = trimmed
            .strip_prefix("${{")
            .and_then(|s| s.strip_suffix("}}"))
            .unwrap_or(trimmed);

        let mut parser = Parser {
            tokens: tokenize(body)?,
            pos: 0,
        };
        let root = parser.parse_or()?;
        if *parser.peek() != Token::Eof {
            return Err(ExpressionError::new("unexpected trailing input", parser.offset()));
        }
        Ok(Self {
            source: src.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, scope: &EvalScope<'_>) -> ExprValue {
        self.root.eval(scope)
    }

    /// True when the expression calls `always()`, `success()`, `failure()` or `cancelled()`.
    pub fn is_status_check(&self) -> bool {
        let mut found = false;
        self.root.visit(&mut |node| {
            if let Node::Call(f, _) = node {
                found |= f.is_status();
            }
        });
        found
    }

    /// Evaluate as a gate condition. Without an explicit status function the
    /// condition only holds when `success()` does too.
    pub fn evaluate_condition(&self, scope: &EvalScope<'_>) -> bool {
        if !self.is_status_check() && !scope.status_success() {
            return false;
        }
        self.evaluate(scope).is_truthy()
    }

    /// Job ids referenced through `needs.<job>`.
    pub fn needs_references(&self) -> Vec<String> {
        let mut jobs = Vec::new();
        self.root.visit(&mut |node| {
            if let Node::Reference(path) = node
                && path.first().map(String::as_str) == Some("needs")
                && let Some(job) = path.get(1)
                && !jobs.contains(job)
            {
                jobs.push(job.clone());
            }
        });
        jobs
    }
}

impl std::str::FromStr for Expression {
    type Err = ExpressionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Expression::parse(s)
    }
}
