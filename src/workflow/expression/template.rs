//! `{{ expr }}` template splitting

use crate::error::ExpressionError;

/// A piece of a template string
#[derive(Debug, Clone, PartialEq)]
pub enum Segment<'a> {
    Text(&'a str),
    /// Expression source between the braces, trimmed
    Expr(&'a str),
}

/// Whether a string contains template markers at all
pub fn is_template(s: &str) -> bool {
    s.contains("{{")
}

/// Split a template into literal text and expression segments
pub fn segments(template: &str) -> Result<Vec<Segment<'_>>, ExpressionError> {
    let mut out = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            out.push(Segment::Text(&rest[..open]));
        }
        let after = &rest[open + 2..];
        let close = after.find("}}").ok_or_else(|| {
            ExpressionError::syntax(&rest[open..], "unterminated '{{' in template")
        })?;
        let source = after[..close].trim();
        if source.is_empty() {
            return Err(ExpressionError::syntax(
                &rest[open..open + 4 + close],
                "empty expression in template",
            ));
        }
        out.push(Segment::Expr(source));
        rest = &after[close + 2..];
    }
    if !rest.is_empty() {
        out.push(Segment::Text(rest));
    }
    Ok(out)
}

/// The inner expression when the whole string is exactly one `{{ expr }}`
pub fn single_expression(s: &str) -> Option<&str> {
    let trimmed = s.trim();
    if !trimmed.starts_with("{{") || !trimmed.ends_with("}}") {
        return None;
    }
    match segments(trimmed).ok()?.as_slice() {
        [Segment::Expr(source)] => Some(*source),
        _ => None,
    }
}
