//! Sandboxed expression evaluator
//!
//! Evaluation only sees the `Scope` it is handed. Every node visit is
//! charged against a step budget and the wall-clock deadline, and the AST
//! depth is bounded, so a hostile expression fails instead of hanging.

use super::ast::{BinaryOp, Expr, UnaryOp};
use super::functions::{self, HostEnv};
use crate::error::ExpressionError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Number, Value};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};

/// Per-item variables visible inside an iteration child
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoopContext {
    /// Name the item is bound to (`as:` on the iterate step)
    pub alias: String,
    pub item: Value,
    pub index: usize,
    pub total: usize,
}

impl LoopContext {
    pub fn names(&self) -> Vec<String> {
        vec![self.alias.clone(), "index".to_string(), "total".to_string()]
    }

    fn lookup(&self, name: &str) -> Option<Value> {
        if name == self.alias {
            Some(self.item.clone())
        } else if name == "index" {
            Some(json!(self.index))
        } else if name == "total" {
            Some(json!(self.total))
        } else {
            None
        }
    }
}

/// Everything an expression is allowed to read
#[derive(Debug, Clone, Copy)]
pub struct Scope<'a> {
    /// Flattened state, already filtered down to the step's `needs_state`
    pub state: &'a Map<String, Value>,
    pub inputs: &'a Value,
    pub loop_context: Option<&'a LoopContext>,
    /// State fields that exist but were filtered out
    pub hidden: Option<&'a BTreeSet<String>>,
}

impl<'a> Scope<'a> {
    pub fn new(state: &'a Map<String, Value>, inputs: &'a Value) -> Self {
        Self {
            state,
            inputs,
            loop_context: None,
            hidden: None,
        }
    }

    pub fn with_loop(mut self, ctx: Option<&'a LoopContext>) -> Self {
        self.loop_context = ctx;
        self
    }

    pub fn with_hidden(mut self, hidden: &'a BTreeSet<String>) -> Self {
        self.hidden = Some(hidden);
        self
    }

    /// Names an expression could legally reference, for error messages
    pub fn available(&self) -> Vec<String> {
        let mut names: BTreeSet<String> = self.state.keys().cloned().collect();
        if let Some(ctx) = self.loop_context {
            names.extend(ctx.names());
        }
        if let Value::Object(inputs) = self.inputs {
            names.extend(inputs.keys().cloned());
        }
        names.insert("inputs".to_string());
        names.into_iter().collect()
    }
}

/// Bounds applied to a single evaluation
#[derive(Debug, Clone)]
pub struct EvalLimits {
    pub timeout: Duration,
    pub max_depth: usize,
    pub max_steps: u64,
    /// Largest collection a function may build (`range`, `split`, ...)
    pub max_collection: usize,
}

impl Default for EvalLimits {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            max_depth: 64,
            max_steps: 1_000_000,
            max_collection: 100_000,
        }
    }
}

pub(crate) struct Evaluator<'a> {
    scope: &'a Scope<'a>,
    limits: &'a EvalLimits,
    host: &'a HostEnv,
    deadline: Instant,
    steps: u64,
}

impl<'a> Evaluator<'a> {
    pub(crate) fn new(scope: &'a Scope<'a>, limits: &'a EvalLimits, host: &'a HostEnv) -> Self {
        Self {
            scope,
            limits,
            host,
            deadline: Instant::now() + limits.timeout,
            steps: 0,
        }
    }

    fn charge(&mut self, depth: usize) -> Result<(), ExpressionError> {
        if depth > self.limits.max_depth {
            return Err(ExpressionError::DepthExceeded {
                limit: self.limits.max_depth,
            });
        }
        self.steps += 1;
        let over_budget = self.steps > self.limits.max_steps;
        if over_budget || (self.steps % 64 == 0 && Instant::now() > self.deadline) {
            return Err(ExpressionError::Timeout {
                limit_ms: self.limits.timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    pub(crate) fn eval(&mut self, expr: &Expr) -> Result<Value, ExpressionError> {
        let value = self.eval_at(expr, 0)?;
        // Deadline is also checked once at the end so short evaluations cannot slip past it
        if Instant::now() > self.deadline {
            return Err(ExpressionError::Timeout {
                limit_ms: self.limits.timeout.as_millis() as u64,
            });
        }
        Ok(value)
    }

    fn eval_at(&mut self, expr: &Expr, depth: usize) -> Result<Value, ExpressionError> {
        self.charge(depth)?;
        let next = depth + 1;

        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Ident(name) => self.lookup(name),
            Expr::Member(target, field) => {
                let base = self.eval_at(target, next)?;
                member(&base, field, expr)
            }
            Expr::Index(target, index) => {
                let base = self.eval_at(target, next)?;
                let key = self.eval_at(index, next)?;
                index_value(&base, &key, expr)
            }
            Expr::Call { name, args } => {
                // `default` swallows an undefined first argument instead of failing
                if name == "default" && !args.is_empty() {
                    let first = match self.eval_at(&args[0], next) {
                        Ok(v) => v,
                        Err(ExpressionError::UndefinedReference { .. }) => Value::Null,
                        Err(e) => return Err(e),
                    };
                    let mut values = vec![first];
                    for arg in &args[1..] {
                        values.push(self.eval_at(arg, next)?);
                    }
                    return functions::call(name, values, self.host, self.limits, expr);
                }
                let mut values = Vec::with_capacity(args.len());
                for arg in args {
                    values.push(self.eval_at(arg, next)?);
                }
                functions::call(name, values, self.host, self.limits, expr)
            }
            Expr::Unary { op, expr: inner } => {
                let value = self.eval_at(inner, next)?;
                match op {
                    UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                    UnaryOp::Neg => match &value {
                        Value::Number(n) if n.is_i64() => Ok(json!(n.as_i64().unwrap_or(0).wrapping_neg())),
                        Value::Number(n) => float(-n.as_f64().unwrap_or(0.0), expr),
                        other => Err(ExpressionError::type_mismatch(
                            expr,
                            format!("cannot negate {}", type_name(other)),
                        )),
                    },
                }
            }
            Expr::Binary { op, left, right } => match op {
                BinaryOp::And => {
                    let l = self.eval_at(left, next)?;
                    if !truthy(&l) {
                        return Ok(Value::Bool(false));
                    }
                    let r = self.eval_at(right, next)?;
                    Ok(Value::Bool(truthy(&r)))
                }
                BinaryOp::Or => {
                    let l = self.eval_at(left, next)?;
                    if truthy(&l) {
                        return Ok(Value::Bool(true));
                    }
                    let r = self.eval_at(right, next)?;
                    Ok(Value::Bool(truthy(&r)))
                }
                _ => {
                    let l = self.eval_at(left, next)?;
                    let r = self.eval_at(right, next)?;
                    binary(*op, &l, &r, expr)
                }
            },
            Expr::Conditional {
                cond,
                then,
                otherwise,
            } => {
                let c = self.eval_at(cond, next)?;
                if truthy(&c) {
                    self.eval_at(then, next)
                } else {
                    self.eval_at(otherwise, next)
                }
            }
            Expr::Array(items) => {
                let mut out = Vec::with_capacity(items.len());
                for item in items {
                    out.push(self.eval_at(item, next)?);
                }
                Ok(Value::Array(out))
            }
            Expr::Object(entries) => {
                let mut out = Map::new();
                for (k, v) in entries {
                    out.insert(k.clone(), self.eval_at(v, next)?);
                }
                Ok(Value::Object(out))
            }
        }
    }

    fn lookup(&self, name: &str) -> Result<Value, ExpressionError> {
        if let Some(value) = self.scope.loop_context.and_then(|ctx| ctx.lookup(name)) {
            return Ok(value);
        }
        if name == "inputs" {
            return Ok(self.scope.inputs.clone());
        }
        if let Some(value) = self.scope.state.get(name) {
            return Ok(value.clone());
        }
        if self.scope.hidden.is_some_and(|h| h.contains(name)) {
            return Err(ExpressionError::Restricted {
                name: name.to_string(),
            });
        }
        if let Some(value) = self.scope.inputs.get(name) {
            return Ok(value.clone());
        }
        Err(ExpressionError::UndefinedReference {
            name: name.to_string(),
            available: self.scope.available(),
        })
    }
}

fn member(base: &Value, field: &str, expr: &Expr) -> Result<Value, ExpressionError> {
    match base {
        Value::Object(obj) => Ok(obj.get(field).cloned().unwrap_or(Value::Null)),
        other => Err(ExpressionError::type_mismatch(
            expr,
            format!("cannot read field '{}' of {}", field, type_name(other)),
        )),
    }
}

fn index_value(base: &Value, key: &Value, expr: &Expr) -> Result<Value, ExpressionError> {
    match (base, key) {
        (Value::Array(arr), Value::Number(n)) if n.is_i64() || n.is_u64() => {
            let i = n.as_i64().unwrap_or(i64::MAX);
            let idx = if i < 0 { arr.len() as i64 + i } else { i };
            Ok(usize::try_from(idx)
                .ok()
                .and_then(|i| arr.get(i))
                .cloned()
                .unwrap_or(Value::Null))
        }
        (Value::Object(obj), Value::String(k)) => Ok(obj.get(k).cloned().unwrap_or(Value::Null)),
        (Value::String(s), Value::Number(n)) if n.is_i64() || n.is_u64() => {
            let i = n.as_i64().unwrap_or(i64::MAX);
            let chars: Vec<char> = s.chars().collect();
            let idx = if i < 0 { chars.len() as i64 + i } else { i };
            Ok(usize::try_from(idx)
                .ok()
                .and_then(|i| chars.get(i))
                .map(|c| Value::String(c.to_string()))
                .unwrap_or(Value::Null))
        }
        (b, k) => Err(ExpressionError::type_mismatch(
            expr,
            format!("cannot index {} with {}", type_name(b), type_name(k)),
        )),
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value, expr: &Expr) -> Result<Value, ExpressionError> {
    let mismatch = || {
        ExpressionError::type_mismatch(
            expr,
            format!(
                "operator '{}' not supported for {} and {}",
                op,
                type_name(l),
                type_name(r)
            ),
        )
    };

    match op {
        BinaryOp::Eq => Ok(Value::Bool(values_equal(l, r))),
        BinaryOp::NotEq => Ok(Value::Bool(!values_equal(l, r))),
        BinaryOp::Gt | BinaryOp::Gte | BinaryOp::Lt | BinaryOp::Lte => {
            let ordering = match (l, r) {
                (Value::Number(a), Value::Number(b)) => {
                    let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                    a.partial_cmp(&b).ok_or_else(mismatch)?
                }
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => return Err(mismatch()),
            };
            Ok(Value::Bool(match op {
                BinaryOp::Gt => ordering.is_gt(),
                BinaryOp::Gte => ordering.is_ge(),
                BinaryOp::Lt => ordering.is_lt(),
                _ => ordering.is_le(),
            }))
        }
        BinaryOp::In => contains(r, l).map(Value::Bool).ok_or_else(mismatch),
        BinaryOp::NotIn => contains(r, l).map(|b| Value::Bool(!b)).ok_or_else(mismatch),
        BinaryOp::Contains => contains(l, r).map(Value::Bool).ok_or_else(mismatch),
        BinaryOp::Add => match (l, r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::Array(a), Value::Array(b)) => {
                Ok(Value::Array(a.iter().chain(b.iter()).cloned().collect()))
            }
            (Value::Number(_), Value::Number(_)) => {
                arithmetic(l, r, expr, i64::checked_add, |a, b| a + b)
            }
            _ => Err(mismatch()),
        },
        BinaryOp::Sub => match (l, r) {
            (Value::Number(_), Value::Number(_)) => {
                arithmetic(l, r, expr, i64::checked_sub, |a, b| a - b)
            }
            _ => Err(mismatch()),
        },
        BinaryOp::Mul => match (l, r) {
            (Value::Number(_), Value::Number(_)) => {
                arithmetic(l, r, expr, i64::checked_mul, |a, b| a * b)
            }
            _ => Err(mismatch()),
        },
        BinaryOp::Div | BinaryOp::Rem => {
            let (a, b) = match (l, r) {
                (Value::Number(a), Value::Number(b)) => (a, b),
                _ => return Err(mismatch()),
            };
            if b.as_f64() == Some(0.0) {
                return Err(ExpressionError::type_mismatch(expr, "division by zero"));
            }
            match (a.as_i64(), b.as_i64(), op) {
                (Some(x), Some(y), BinaryOp::Rem) => Ok(json!(x.wrapping_rem(y))),
                (Some(x), Some(y), BinaryOp::Div) if x.wrapping_rem(y) == 0 => {
                    Ok(json!(x.wrapping_div(y)))
                }
                _ => {
                    let (x, y) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
                    let result = if op == BinaryOp::Div { x / y } else { x % y };
                    float(result, expr)
                }
            }
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("short-circuit operators are handled by the evaluator"),
    }
}

fn arithmetic(
    l: &Value,
    r: &Value,
    expr: &Expr,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Result<Value, ExpressionError> {
    if let (Some(a), Some(b)) = (as_int(l), as_int(r)) {
        if let Some(result) = int_op(a, b) {
            return Ok(json!(result));
        }
    }
    let a = l.as_f64().unwrap_or(0.0);
    let b = r.as_f64().unwrap_or(0.0);
    float(float_op(a, b), expr)
}

/// Integer view of a JSON number, only when it was written as an integer
pub(crate) fn as_int(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) if n.is_i64() || n.is_u64() => n.as_i64(),
        _ => None,
    }
}

pub(crate) fn float(f: f64, fragment: &Expr) -> Result<Value, ExpressionError> {
    Number::from_f64(f)
        .map(Value::Number)
        .ok_or_else(|| ExpressionError::type_mismatch(fragment, "result is not a finite number"))
}

/// `haystack` contains `needle`; `None` when the types make no sense together
pub(crate) fn contains(haystack: &Value, needle: &Value) -> Option<bool> {
    match (haystack, needle) {
        (Value::Array(items), n) => Some(items.iter().any(|v| values_equal(v, n))),
        (Value::String(s), Value::String(sub)) => Some(s.contains(sub.as_str())),
        (Value::Object(obj), Value::String(key)) => Some(obj.contains_key(key)),
        _ => None,
    }
}

/// Equality with numeric comparison across integer and float encodings
pub(crate) fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(i), Some(j)) => i == j,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        _ => a == b,
    }
}

pub(crate) fn truthy(v: &Value) -> bool {
    match v {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

pub(crate) fn type_name(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "integer",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::expression::parser::parse;

    fn eval_with(source: &str, state: Value) -> Result<Value, ExpressionError> {
        let state = state.as_object().cloned().unwrap_or_default();
        let inputs = json!({});
        let scope = Scope::new(&state, &inputs);
        let limits = EvalLimits::default();
        let host = HostEnv::default();
        Evaluator::new(&scope, &limits, &host).eval(&parse(source)?)
    }

    fn eval(source: &str) -> Value {
        eval_with(source, json!({})).unwrap()
    }

    #[test]
    fn test_integer_arithmetic_stays_integer() {
        assert_eq!(eval_with("a + b", json!({"a": 2, "b": 3})).unwrap(), json!(5));
        assert_eq!(eval("7 % 3"), json!(1));
        assert_eq!(eval("6 / 3"), json!(2));
        assert_eq!(eval("7 / 2"), json!(3.5));
        assert_eq!(eval("2 * -3"), json!(-6));
    }

    #[test]
    fn test_float_arithmetic() {
        assert_eq!(eval("0.5 + 1"), json!(1.5));
    }

    #[test]
    fn test_string_and_array_concat() {
        assert_eq!(eval("'ab' + 'cd'"), json!("abcd"));
        assert_eq!(eval("[1] + [2]"), json!([1, 2]));
    }

    #[test]
    fn test_comparisons() {
        let state = json!({"score": 72});
        assert_eq!(eval_with("score >= 70", state.clone()).unwrap(), json!(true));
        assert_eq!(eval_with("score < 70", state).unwrap(), json!(false));
        assert_eq!(eval("'b' > 'a'"), json!(true));
        assert_eq!(eval("1 == 1.0"), json!(true));
    }

    #[test]
    fn test_membership() {
        let state = json!({"tags": ["bug", "urgent"], "msg": "hello world"});
        assert_eq!(
            eval_with("'bug' in tags", state.clone()).unwrap(),
            json!(true)
        );
        assert_eq!(
            eval_with("'x' not in tags", state.clone()).unwrap(),
            json!(true)
        );
        assert_eq!(
            eval_with("msg contains 'world'", state).unwrap(),
            json!(true)
        );
    }

    #[test]
    fn test_logic_short_circuits() {
        // `missing` would be undefined, but the right side is never evaluated
        assert_eq!(eval("false and missing"), json!(false));
        assert_eq!(eval("true or missing"), json!(true));
        assert_eq!(eval("not 0"), json!(true));
    }

    #[test]
    fn test_member_and_index_access() {
        let state = json!({"result": {"items": [{"name": "a"}, {"name": "b"}]}});
        assert_eq!(
            eval_with("result.items[1].name", state.clone()).unwrap(),
            json!("b")
        );
        assert_eq!(
            eval_with("result.items[-1].name", state.clone()).unwrap(),
            json!("b")
        );
        assert_eq!(
            eval_with("result.missing", state.clone()).unwrap(),
            Value::Null
        );
        assert_eq!(
            eval_with("result['items'][5]", state).unwrap(),
            Value::Null
        );
    }

    #[test]
    fn test_undefined_reference_lists_available() {
        match eval_with("totl + 1", json!({"total": 1})).unwrap_err() {
            ExpressionError::UndefinedReference { name, available } => {
                assert_eq!(name, "totl");
                assert!(available.contains(&"total".to_string()));
            }
            other => panic!("Expected undefined reference, got {:?}", other),
        }
    }

    #[test]
    fn test_type_mismatch_reports_fragment() {
        match eval_with("name - 1", json!({"name": "x"})).unwrap_err() {
            ExpressionError::TypeMismatch { fragment, .. } => assert_eq!(fragment, "name - 1"),
            other => panic!("Expected type mismatch, got {:?}", other),
        }
        assert!(matches!(
            eval_with("1 / 0", json!({})).unwrap_err(),
            ExpressionError::TypeMismatch { .. }
        ));
        assert!(matches!(
            eval_with("x.y", json!({"x": 3})).unwrap_err(),
            ExpressionError::TypeMismatch { .. }
        ));
    }

    #[test]
    fn test_hidden_state_is_restricted() {
        let state = Map::new();
        let inputs = json!({});
        let hidden: BTreeSet<String> = ["secret".to_string()].into_iter().collect();
        let scope = Scope::new(&state, &inputs).with_hidden(&hidden);
        let limits = EvalLimits::default();
        let host = HostEnv::default();
        let err = Evaluator::new(&scope, &limits, &host)
            .eval(&parse("secret").unwrap())
            .unwrap_err();
        assert_eq!(
            err,
            ExpressionError::Restricted {
                name: "secret".to_string()
            }
        );
    }

    #[test]
    fn test_loop_context_and_inputs_resolve() {
        let state = Map::new();
        let inputs = json!({"factor": 3});
        let ctx = LoopContext {
            alias: "n".to_string(),
            item: json!(4),
            index: 1,
            total: 2,
        };
        let scope = Scope::new(&state, &inputs).with_loop(Some(&ctx));
        let limits = EvalLimits::default();
        let host = HostEnv::default();
        let value = Evaluator::new(&scope, &limits, &host)
            .eval(&parse("n * factor + index + total + inputs.factor").unwrap())
            .unwrap();
        assert_eq!(value, json!(18));
    }

    #[test]
    fn test_depth_limit() {
        let state = Map::new();
        let inputs = json!({});
        let scope = Scope::new(&state, &inputs);
        let limits = EvalLimits {
            max_depth: 3,
            ..EvalLimits::default()
        };
        let host = HostEnv::default();
        let err = Evaluator::new(&scope, &limits, &host)
            .eval(&parse("1 + (2 + (3 + (4 + 5)))").unwrap())
            .unwrap_err();
        assert_eq!(err, ExpressionError::DepthExceeded { limit: 3 });
    }

    #[test]
    fn test_step_budget_times_out() {
        let state = Map::new();
        let inputs = json!({});
        let scope = Scope::new(&state, &inputs);
        let limits = EvalLimits {
            max_steps: 10,
            ..EvalLimits::default()
        };
        let host = HostEnv::default();
        let err = Evaluator::new(&scope, &limits, &host)
            .eval(&parse("[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11]").unwrap())
            .unwrap_err();
        assert!(matches!(err, ExpressionError::Timeout { .. }));
    }

    #[test]
    fn test_default_swallows_undefined() {
        assert_eq!(eval("default(missing, 7)"), json!(7));
    }
}
