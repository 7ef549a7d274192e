// SPDX-License-Identifier: MIT

//! Expression and template evaluation for workflow steps
//!
//! Expressions appear bare (`score >= 70`) or inside templates
//! (`echo {{ name }}`). A string that is exactly one `{{ expr }}` evaluates to
//! the typed value of `expr`; any other template renders to a string.
//!
//! ```text
//! raw.total: "a + b"                -> 5
//! command: "echo {{ x }}"           -> "echo hello"
//! items: "{{ range(1, 4) }}"        -> [1, 2, 3]
//! ```

mod ast;
mod evaluator;
mod functions;
mod lexer;
mod parser;
mod template;

pub use ast::{BinaryOp, Expr, UnaryOp};
pub use evaluator::{EvalLimits, LoopContext, Scope};
pub(crate) use evaluator::{truthy, type_name};
pub use functions::{function_names, is_function, to_display, HostEnv};
pub use parser::parse;
pub use template::{is_template, segments, single_expression, Segment};

use crate::config::EngineConfig;
use crate::error::ExpressionError;
use evaluator::Evaluator;
use serde_json::Value;
use std::collections::BTreeSet;
use std::time::Duration;

/// Evaluates expressions and renders templates under fixed limits
#[derive(Debug, Clone, Default)]
pub struct ExpressionEngine {
    limits: EvalLimits,
    host: HostEnv,
}

impl ExpressionEngine {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            limits: EvalLimits {
                timeout: Duration::from_millis(config.expression_timeout_ms),
                max_depth: config.max_expression_depth,
                max_steps: config.max_expression_steps,
                ..EvalLimits::default()
            },
            host: HostEnv {
                env_allowlist: config.env_allowlist.clone(),
            },
        }
    }

    pub fn with_limits(limits: EvalLimits, host: HostEnv) -> Self {
        Self { limits, host }
    }

    pub fn limits(&self) -> &EvalLimits {
        &self.limits
    }

    /// Evaluate a bare expression or a template
    pub fn evaluate(&self, source: &str, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
        if let Some(inner) = single_expression(source) {
            return self.eval_source(inner, scope);
        }
        if is_template(source) {
            return self.render(source, scope).map(Value::String);
        }
        self.eval_source(source, scope)
    }

    /// Evaluate an already parsed expression
    pub fn eval_expr(&self, expr: &Expr, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
        Evaluator::new(scope, &self.limits, &self.host).eval(expr)
    }

    fn eval_source(&self, source: &str, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
        let expr = parse(source)?;
        self.eval_expr(&expr, scope)
    }

    /// Render a template to a string, interpolating each `{{ expr }}`
    pub fn render(&self, template: &str, scope: &Scope<'_>) -> Result<String, ExpressionError> {
        let mut out = String::with_capacity(template.len());
        for segment in segments(template)? {
            match segment {
                Segment::Text(text) => out.push_str(text),
                Segment::Expr(source) => {
                    let value = self.eval_source(source, scope)?;
                    out.push_str(&to_display(&value));
                }
            }
        }
        Ok(out)
    }

    /// Render every template string inside a JSON value
    ///
    /// Strings without `{{` are returned unchanged. A string that is exactly
    /// one `{{ expr }}` becomes the typed result of `expr`.
    pub fn render_value(&self, value: &Value, scope: &Scope<'_>) -> Result<Value, ExpressionError> {
        match value {
            Value::String(s) if is_template(s) => match single_expression(s) {
                Some(inner) => self.eval_source(inner, scope),
                None => self.render(s, scope).map(Value::String),
            },
            Value::Array(items) => items
                .iter()
                .map(|v| self.render_value(v, scope))
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Array),
            Value::Object(obj) => {
                let mut out = serde_json::Map::new();
                for (k, v) in obj {
                    out.insert(k.clone(), self.render_value(v, scope)?);
                }
                Ok(Value::Object(out))
            }
            other => Ok(other.clone()),
        }
    }

    /// Root identifiers read by a bare expression or template
    pub fn references(source: &str) -> Result<BTreeSet<String>, ExpressionError> {
        if !is_template(source) {
            return Ok(parse(source)?.references());
        }
        let mut out = BTreeSet::new();
        for segment in segments(source)? {
            if let Segment::Expr(inner) = segment {
                out.extend(parse(inner)?.references());
            }
        }
        Ok(out)
    }

    /// Root identifiers read by every template string inside a JSON value
    pub fn template_references(value: &Value) -> Result<BTreeSet<String>, ExpressionError> {
        let mut out = BTreeSet::new();
        match value {
            Value::String(s) if is_template(s) => out.extend(Self::references(s)?),
            Value::Array(items) => {
                for v in items {
                    out.extend(Self::template_references(v)?);
                }
            }
            Value::Object(obj) => {
                for v in obj.values() {
                    out.extend(Self::template_references(v)?);
                }
            }
            _ => {}
        }
        Ok(out)
    }

    /// Function names called anywhere in a bare expression or template
    pub fn calls(source: &str) -> Result<BTreeSet<String>, ExpressionError> {
        let mut out = BTreeSet::new();
        let mut visit = |expr: &Expr| collect_calls(expr, &mut out);
        if is_template(source) {
            for segment in segments(source)? {
                if let Segment::Expr(inner) = segment {
                    visit(&parse(inner)?);
                }
            }
        } else {
            visit(&parse(source)?);
        }
        Ok(out)
    }
}

fn collect_calls(expr: &Expr, out: &mut BTreeSet<String>) {
    match expr {
        Expr::Call { name, args } => {
            out.insert(name.clone());
            args.iter().for_each(|a| collect_calls(a, out));
        }
        Expr::Member(target, _) => collect_calls(target, out),
        Expr::Index(target, index) => {
            collect_calls(target, out);
            collect_calls(index, out);
        }
        Expr::Unary { expr, .. } => collect_calls(expr, out),
        Expr::Binary { left, right, .. } => {
            collect_calls(left, out);
            collect_calls(right, out);
        }
        Expr::Conditional {
            cond,
            then,
            otherwise,
        } => {
            collect_calls(cond, out);
            collect_calls(then, out);
            collect_calls(otherwise, out);
        }
        Expr::Array(items) => items.iter().for_each(|a| collect_calls(a, out)),
        Expr::Object(entries) => entries.iter().for_each(|(_, v)| collect_calls(v, out)),
        Expr::Literal(_) | Expr::Ident(_) => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn state(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap_or_default()
    }

    #[test]
    fn test_single_template_keeps_type() {
        let engine = ExpressionEngine::default();
        let st = state(json!({"items": [1, 2, 3]}));
        let inputs = json!({});
        let scope = Scope::new(&st, &inputs);
        assert_eq!(
            engine.evaluate("{{ items }}", &scope).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(engine.evaluate("items | len", &scope).unwrap(), json!(3));
    }

    #[test]
    fn test_render_interpolates() {
        let engine = ExpressionEngine::default();
        let st = state(json!({"x": "hello", "n": 2}));
        let inputs = json!({});
        let scope = Scope::new(&st, &inputs);
        assert_eq!(
            engine.render("echo {{ x }} {{ n + 1 }}", &scope).unwrap(),
            "echo hello 3"
        );
    }

    #[test]
    fn test_render_value_walks_json() {
        let engine = ExpressionEngine::default();
        let st = state(json!({"q": "rust", "limit": 5}));
        let inputs = json!({});
        let scope = Scope::new(&st, &inputs);
        let rendered = engine
            .render_value(
                &json!({"query": "find {{ q }}", "limit": "{{ limit }}", "raw": "as-is", "n": [1, "{{ limit * 2 }}"]}),
                &scope,
            )
            .unwrap();
        assert_eq!(
            rendered,
            json!({"query": "find rust", "limit": 5, "raw": "as-is", "n": [1, 10]})
        );
    }

    #[test]
    fn test_references() {
        let refs = ExpressionEngine::references("echo {{ a.b }} {{ len(c) }}").unwrap();
        assert_eq!(
            refs.into_iter().collect::<Vec<_>>(),
            vec!["a".to_string(), "c".to_string()]
        );
        let refs = ExpressionEngine::template_references(&json!({"k": ["{{ x }}", "y"]})).unwrap();
        assert_eq!(refs.into_iter().collect::<Vec<_>>(), vec!["x".to_string()]);
    }

    #[test]
    fn test_calls() {
        let calls = ExpressionEngine::calls("upper(name) + lenn(x)").unwrap();
        assert!(calls.contains("lenn"));
        assert!(!is_function("lenn"));
        assert!(is_function("upper"));
    }

    #[test]
    fn test_engine_uses_config_limits() {
        let config = EngineConfig {
            max_expression_depth: 2,
            ..EngineConfig::default()
        };
        let engine = ExpressionEngine::new(&config);
        let st = Map::new();
        let inputs = json!({});
        let scope = Scope::new(&st, &inputs);
        assert!(matches!(
            engine.evaluate("1 + (2 + (3 + 4))", &scope).unwrap_err(),
            ExpressionError::DepthExceeded { limit: 2 }
        ));
    }
}
