//! `${{ expr }}` interpolation for commands, env values, artifact names and job outputs.

use crate::expression::{EvalScope, Expression, ExpressionError};
use std::ops::Range;

const OPEN: &str = "${{";
const CLOSE: &[u8] = b"}}";

/// Byte range of the next placeholder at or after `from`, with the range of
/// its trimmed body. A `}}` inside a quoted string does not close it.
fn next_placeholder(
    input: &str,
    from: usize,
) -> Result<Option<(Range<usize>, Range<usize>)>, ExpressionError> {
    let Some(found) = input[from..].find(OPEN) else {
        return Ok(None);
    };
    let start = from + found;
    let body_start = start + OPEN.len();
    let bytes = input.as_bytes();
    let mut quote = None;
    let mut i = body_start;
    while i < bytes.len() {
        match (quote, bytes[i]) {
            (None, b'\'' | b'"') => quote = Some(bytes[i]),
            (None, _) if bytes[i..].starts_with(CLOSE) => {
                let raw = &input[body_start..i];
                let lead = body_start + raw.len() - raw.trim_start().len();
                return Ok(Some((start..i + CLOSE.len(), lead..lead + raw.trim().len())));
            }
            (Some(b'"'), b'\\') => i += 1,
            (Some(q), c) if q == c => quote = None,
            _ => {}
        }
        i += 1;
    }
    Err(ExpressionError {
        message: "unterminated placeholder".to_string(),
        offset: start,
    })
}

#[derive(Debug, Clone, PartialEq)]
enum Part {
    Literal(String),
    Expr(Expression),
}

/// A string with embedded expressions, parsed once.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    parts: Vec<Part>,
}

impl Template {
    pub fn parse(input: &str) -> Result<Self, ExpressionError> {
        let mut parts = Vec::new();
        let mut last = 0;
        while let Some((whole, body)) = next_placeholder(input, last)? {
            if whole.start > last {
                parts.push(Part::Literal(input[last..whole.start].to_string()));
            }
            let expr = Expression::parse(&input[body.clone()]).map_err(|e| ExpressionError {
                offset: e.offset + body.start,
                ..e
            })?;
            parts.push(Part::Expr(expr));
            last = whole.end;
        }
        if last < input.len() {
            parts.push(Part::Literal(input[last..].to_string()));
        }
        Ok(Self { parts })
    }

    pub fn has_expressions(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::Expr(_)))
    }

    pub fn render(&self, scope: &EvalScope<'_>) -> String {
        self.parts
            .iter()
            .map(|part| match part {
                Part::Literal(text) => text.clone(),
                Part::Expr(expr) => expr.evaluate(scope).render(),
            })
            .collect()
    }
}

/// Parse and render in one go.
pub fn interpolate(input: &str, scope: &EvalScope<'_>) -> Result<String, ExpressionError> {
    if !input.contains("${{") {
        return Ok(input.to_string());
    }
    Ok(Template::parse(input)?.render(scope))
}
