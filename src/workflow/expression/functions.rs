// SPDX-License-Identifier: MIT

//! Built-in and host functions callable from expressions
//!
//! Functions are plain `fn` pointers registered in a static table. Host
//! functions (`now`, `env`, `random`, ...) are the only way an expression can
//! observe anything outside its scope.

use super::ast::Expr;
use super::evaluator::{as_int, contains, float, truthy, type_name, values_equal, EvalLimits};
use crate::error::ExpressionError;
use base64::Engine as _;
use once_cell::sync::Lazy;
use rand::Rng;
use regex::{Regex, RegexBuilder};
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use std::cmp::Ordering;
use std::collections::HashMap;

/// Compiled-program size ceiling for user-supplied regexes
const REGEX_SIZE_LIMIT: usize = 1 << 20;

/// Host capabilities exposed to expressions
#[derive(Debug, Clone, Default)]
pub struct HostEnv {
    /// Variables `env()` may read; `None` allows all
    pub env_allowlist: Option<Vec<String>>,
}

impl HostEnv {
    fn env_allowed(&self, name: &str) -> bool {
        match &self.env_allowlist {
            Some(list) => list.iter().any(|n| n == name),
            None => true,
        }
    }
}

struct Call<'a> {
    name: &'a str,
    args: Vec<Value>,
    host: &'a HostEnv,
    limits: &'a EvalLimits,
    expr: &'a Expr,
}

impl<'a> Call<'a> {
    fn arity(&self, min: usize, max: usize) -> Result<(), ExpressionError> {
        let n = self.args.len();
        if n < min || n > max {
            let expected = if min == max {
                min.to_string()
            } else {
                format!("{}..{}", min, max)
            };
            return Err(ExpressionError::function(
                self.name,
                format!("expected {} argument(s), got {}", expected, n),
            ));
        }
        Ok(())
    }

    fn arg(&self, i: usize) -> &Value {
        self.args.get(i).unwrap_or(&Value::Null)
    }

    fn str(&self, i: usize) -> Result<&str, ExpressionError> {
        self.arg(i).as_str().ok_or_else(|| self.wrong_type(i, "string"))
    }

    fn int(&self, i: usize) -> Result<i64, ExpressionError> {
        as_int(self.arg(i)).ok_or_else(|| self.wrong_type(i, "integer"))
    }

    fn array(&self, i: usize) -> Result<&Vec<Value>, ExpressionError> {
        self.arg(i)
            .as_array()
            .ok_or_else(|| self.wrong_type(i, "array"))
    }

    fn object(&self, i: usize) -> Result<&Map<String, Value>, ExpressionError> {
        self.arg(i)
            .as_object()
            .ok_or_else(|| self.wrong_type(i, "object"))
    }

    fn number(&self, i: usize) -> Result<f64, ExpressionError> {
        self.arg(i).as_f64().ok_or_else(|| self.wrong_type(i, "number"))
    }

    fn wrong_type(&self, i: usize, expected: &str) -> ExpressionError {
        ExpressionError::type_mismatch(
            self.expr,
            format!(
                "{}() argument {} must be {}, got {}",
                self.name,
                i + 1,
                expected,
                type_name(self.arg(i))
            ),
        )
    }

    fn fail(&self, message: impl Into<String>) -> ExpressionError {
        ExpressionError::function(self.name, message)
    }

    fn cap(&self, len: usize) -> Result<(), ExpressionError> {
        if len > self.limits.max_collection {
            return Err(self.fail(format!(
                "result would hold {} elements, limit is {}",
                len, self.limits.max_collection
            )));
        }
        Ok(())
    }

    fn regex(&self, i: usize) -> Result<Regex, ExpressionError> {
        RegexBuilder::new(self.str(i)?)
            .size_limit(REGEX_SIZE_LIMIT)
            .build()
            .map_err(|e| self.fail(format!("invalid pattern: {}", e)))
    }
}

type Builtin = fn(&Call) -> Result<Value, ExpressionError>;

static FUNCTIONS: Lazy<HashMap<&'static str, Builtin>> = Lazy::new(|| {
    let mut m: HashMap<&'static str, Builtin> = HashMap::new();
    m.insert("len", fn_len);
    m.insert("upper", |c| {
        c.arity(1, 1)?;
        Ok(json!(c.str(0)?.to_uppercase()))
    });
    m.insert("lower", |c| {
        c.arity(1, 1)?;
        Ok(json!(c.str(0)?.to_lowercase()))
    });
    m.insert("trim", |c| {
        c.arity(1, 1)?;
        Ok(json!(c.str(0)?.trim()))
    });
    m.insert("split", fn_split);
    m.insert("join", fn_join);
    m.insert("replace", |c| {
        c.arity(3, 3)?;
        Ok(json!(c.str(0)?.replace(c.str(1)?, c.str(2)?)))
    });
    m.insert("starts_with", |c| {
        c.arity(2, 2)?;
        Ok(json!(c.str(0)?.starts_with(c.str(1)?)))
    });
    m.insert("ends_with", |c| {
        c.arity(2, 2)?;
        Ok(json!(c.str(0)?.ends_with(c.str(1)?)))
    });
    m.insert("contains", |c| {
        c.arity(2, 2)?;
        contains(c.arg(0), c.arg(1))
            .map(Value::Bool)
            .ok_or_else(|| c.wrong_type(0, "array, string or object"))
    });
    m.insert("keys", |c| {
        c.arity(1, 1)?;
        Ok(json!(c.object(0)?.keys().collect::<Vec<_>>()))
    });
    m.insert("values", |c| {
        c.arity(1, 1)?;
        Ok(Value::Array(c.object(0)?.values().cloned().collect()))
    });
    m.insert("first", |c| {
        c.arity(1, 1)?;
        match c.arg(0) {
            Value::Array(a) => Ok(a.first().cloned().unwrap_or(Value::Null)),
            Value::String(s) => Ok(s.chars().next().map(|ch| json!(ch.to_string())).unwrap_or(Value::Null)),
            _ => Err(c.wrong_type(0, "array or string")),
        }
    });
    m.insert("last", |c| {
        c.arity(1, 1)?;
        match c.arg(0) {
            Value::Array(a) => Ok(a.last().cloned().unwrap_or(Value::Null)),
            Value::String(s) => Ok(s.chars().last().map(|ch| json!(ch.to_string())).unwrap_or(Value::Null)),
            _ => Err(c.wrong_type(0, "array or string")),
        }
    });
    m.insert("slice", fn_slice);
    m.insert("reverse", |c| {
        c.arity(1, 1)?;
        match c.arg(0) {
            Value::Array(a) => Ok(Value::Array(a.iter().rev().cloned().collect())),
            Value::String(s) => Ok(json!(s.chars().rev().collect::<String>())),
            _ => Err(c.wrong_type(0, "array or string")),
        }
    });
    m.insert("sort", fn_sort);
    m.insert("unique", |c| {
        c.arity(1, 1)?;
        let mut out: Vec<Value> = Vec::new();
        for v in c.array(0)? {
            if !out.iter().any(|seen| values_equal(seen, v)) {
                out.push(v.clone());
            }
        }
        Ok(Value::Array(out))
    });
    m.insert("flatten", |c| {
        c.arity(1, 1)?;
        let mut out = Vec::new();
        for v in c.array(0)? {
            match v {
                Value::Array(inner) => out.extend(inner.iter().cloned()),
                other => out.push(other.clone()),
            }
        }
        c.cap(out.len())?;
        Ok(Value::Array(out))
    });
    m.insert("sum", fn_sum);
    m.insert("min", |c| fn_extreme(c, Ordering::Less));
    m.insert("max", |c| fn_extreme(c, Ordering::Greater));
    m.insert("abs", |c| {
        c.arity(1, 1)?;
        match as_int(c.arg(0)) {
            Some(i) => Ok(json!(i.wrapping_abs())),
            None => float(c.number(0)?.abs(), c.expr),
        }
    });
    m.insert("round", |c| {
        c.arity(1, 2)?;
        let x = c.number(0)?;
        if c.args.len() == 1 {
            return Ok(json!(x.round() as i64));
        }
        let factor = 10f64.powi(c.int(1)?.clamp(0, 15) as i32);
        float((x * factor).round() / factor, c.expr)
    });
    m.insert("floor", |c| {
        c.arity(1, 1)?;
        Ok(json!(c.number(0)?.floor() as i64))
    });
    m.insert("ceil", |c| {
        c.arity(1, 1)?;
        Ok(json!(c.number(0)?.ceil() as i64))
    });
    m.insert("int", fn_int);
    m.insert("float", |c| {
        c.arity(1, 1)?;
        let f = match c.arg(0) {
            Value::Number(n) => n.as_f64().unwrap_or(0.0),
            Value::String(s) => s
                .trim()
                .parse::<f64>()
                .map_err(|_| c.fail(format!("cannot convert '{}' to float", s)))?,
            Value::Bool(b) => f64::from(u8::from(*b)),
            _ => return Err(c.wrong_type(0, "number, string or boolean")),
        };
        float(f, c.expr)
    });
    m.insert("str", |c| {
        c.arity(1, 1)?;
        Ok(json!(to_display(c.arg(0))))
    });
    m.insert("bool", |c| {
        c.arity(1, 1)?;
        Ok(json!(truthy(c.arg(0))))
    });
    m.insert("type_of", |c| {
        c.arity(1, 1)?;
        Ok(json!(type_name(c.arg(0))))
    });
    m.insert("default", |c| {
        c.arity(2, 2)?;
        Ok(if c.arg(0).is_null() {
            c.arg(1).clone()
        } else {
            c.arg(0).clone()
        })
    });
    m.insert("get", |c| {
        c.arity(2, 3)?;
        let mut current = c.arg(0);
        for part in c.str(1)?.split('.') {
            let next = match current {
                Value::Object(o) => o.get(part),
                Value::Array(a) => part.parse::<usize>().ok().and_then(|i| a.get(i)),
                _ => None,
            };
            match next {
                Some(v) => current = v,
                None => return Ok(c.arg(2).clone()),
            }
        }
        Ok(current.clone())
    });
    m.insert("merge", |c| {
        c.arity(1, usize::MAX)?;
        let mut out = Map::new();
        for i in 0..c.args.len() {
            for (k, v) in c.object(i)? {
                out.insert(k.clone(), v.clone());
            }
        }
        Ok(Value::Object(out))
    });
    m.insert("range", fn_range);
    m.insert("is_empty", |c| {
        c.arity(1, 1)?;
        Ok(json!(match c.arg(0) {
            Value::Null => true,
            Value::String(s) => s.is_empty(),
            Value::Array(a) => a.is_empty(),
            Value::Object(o) => o.is_empty(),
            _ => false,
        }))
    });

    // Host functions
    m.insert("now", |c| {
        c.arity(0, 0)?;
        Ok(json!(chrono::Utc::now().to_rfc3339()))
    });
    m.insert("timestamp", |c| {
        c.arity(0, 0)?;
        Ok(json!(chrono::Utc::now().timestamp()))
    });
    m.insert("env", |c| {
        c.arity(1, 1)?;
        let name = c.str(0)?;
        if !c.host.env_allowed(name) {
            return Err(c.fail(format!("environment variable '{}' is not allowed", name)));
        }
        Ok(std::env::var(name).map(Value::String).unwrap_or(Value::Null))
    });
    m.insert("random", |c| {
        c.arity(0, 0)?;
        float(rand::random::<f64>(), c.expr)
    });
    m.insert("random_int", |c| {
        c.arity(2, 2)?;
        let (lo, hi) = (c.int(0)?, c.int(1)?);
        if lo > hi {
            return Err(c.fail(format!("empty range {}..={}", lo, hi)));
        }
        Ok(json!(rand::thread_rng().gen_range(lo..=hi)))
    });
    m.insert("uuid", |c| {
        c.arity(0, 0)?;
        Ok(json!(uuid::Uuid::new_v4().to_string()))
    });
    m.insert("to_json", |c| {
        c.arity(1, 1)?;
        serde_json::to_string(c.arg(0))
            .map(Value::String)
            .map_err(|e| c.fail(e.to_string()))
    });
    m.insert("from_json", |c| {
        c.arity(1, 1)?;
        serde_json::from_str(c.str(0)?).map_err(|e| c.fail(e.to_string()))
    });
    m.insert("regex_match", |c| {
        c.arity(2, 2)?;
        let re = c.regex(1)?;
        let s = c.str(0)?;
        Ok(json!(re.find(s).is_some_and(|m| m.start() == 0)))
    });
    m.insert("regex_search", |c| {
        c.arity(2, 2)?;
        let re = c.regex(1)?;
        Ok(re
            .find(c.str(0)?)
            .map(|m| json!(m.as_str()))
            .unwrap_or(Value::Null))
    });
    m.insert("regex_replace", |c| {
        c.arity(3, 3)?;
        let re = c.regex(1)?;
        Ok(json!(re.replace_all(c.str(0)?, c.str(2)?).into_owned()))
    });
    m.insert("sha256", |c| {
        c.arity(1, 1)?;
        let digest = Sha256::digest(c.str(0)?.as_bytes());
        Ok(json!(digest
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>()))
    });
    m.insert("base64_encode", |c| {
        c.arity(1, 1)?;
        Ok(json!(base64::engine::general_purpose::STANDARD.encode(c.str(0)?)))
    });
    m.insert("base64_decode", |c| {
        c.arity(1, 1)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(c.str(0)?)
            .map_err(|e| c.fail(e.to_string()))?;
        String::from_utf8(bytes)
            .map(Value::String)
            .map_err(|e| c.fail(e.to_string()))
    });
    m
});

/// True when `name` is a callable function
pub fn is_function(name: &str) -> bool {
    FUNCTIONS.contains_key(name)
}

/// Sorted names of every callable function
pub fn function_names() -> Vec<&'static str> {
    let mut names: Vec<&'static str> = FUNCTIONS.keys().copied().collect();
    names.sort_unstable();
    names
}

pub(crate) fn call(
    name: &str,
    args: Vec<Value>,
    host: &HostEnv,
    limits: &EvalLimits,
    expr: &Expr,
) -> Result<Value, ExpressionError> {
    let builtin = FUNCTIONS.get(name).ok_or_else(|| ExpressionError::UndefinedReference {
        name: name.to_string(),
        available: function_names().into_iter().map(str::to_string).collect(),
    })?;
    builtin(&Call {
        name,
        args,
        host,
        limits,
        expr,
    })
}

/// Text form used by `str()`, `join()` and template interpolation
pub fn to_display(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn fn_len(c: &Call) -> Result<Value, ExpressionError> {
    c.arity(1, 1)?;
    let n = match c.arg(0) {
        Value::String(s) => s.chars().count(),
        Value::Array(a) => a.len(),
        Value::Object(o) => o.len(),
        Value::Null => 0,
        _ => return Err(c.wrong_type(0, "string, array or object")),
    };
    Ok(json!(n))
}

fn fn_split(c: &Call) -> Result<Value, ExpressionError> {
    c.arity(1, 2)?;
    let s = c.str(0)?;
    let parts: Vec<Value> = if c.args.len() == 1 {
        s.split_whitespace().map(|p| json!(p)).collect()
    } else {
        let sep = c.str(1)?;
        if sep.is_empty() {
            return Err(c.fail("separator must not be empty"));
        }
        s.split(sep).map(|p| json!(p)).collect()
    };
    c.cap(parts.len())?;
    Ok(Value::Array(parts))
}

fn fn_join(c: &Call) -> Result<Value, ExpressionError> {
    c.arity(1, 2)?;
    let sep = if c.args.len() == 2 { c.str(1)? } else { "" };
    let items: Vec<String> = c.array(0)?.iter().map(to_display).collect();
    Ok(json!(items.join(sep)))
}

fn fn_slice(c: &Call) -> Result<Value, ExpressionError> {
    c.arity(2, 3)?;
    let clamp = |i: i64, len: usize| -> usize {
        let len = len as i64;
        let i = if i < 0 { len + i } else { i };
        i.clamp(0, len) as usize
    };
    let bounds = |len: usize| -> Result<(usize, usize), ExpressionError> {
        let start = clamp(c.int(1)?, len);
        let end = if c.args.len() == 3 {
            clamp(c.int(2)?, len)
        } else {
            len
        };
        Ok((start, end.max(start)))
    };
    match c.arg(0) {
        Value::Array(a) => {
            let (start, end) = bounds(a.len())?;
            Ok(Value::Array(a[start..end].to_vec()))
        }
        Value::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let (start, end) = bounds(chars.len())?;
            Ok(json!(chars[start..end].iter().collect::<String>()))
        }
        _ => Err(c.wrong_type(0, "array or string")),
    }
}

/// Ordering for homogeneous number or string values
fn compare(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn fn_sort(c: &Call) -> Result<Value, ExpressionError> {
    c.arity(1, 1)?;
    let mut items = c.array(0)?.clone();
    if items.windows(2).any(|w| compare(&w[0], &w[1]).is_none())
        || items.first().is_some_and(|v| compare(v, v).is_none())
    {
        return Err(ExpressionError::type_mismatch(
            c.expr,
            "sort() needs an array of only numbers or only strings",
        ));
    }
    items.sort_by(|a, b| compare(a, b).unwrap_or(Ordering::Equal));
    Ok(Value::Array(items))
}

fn fn_sum(c: &Call) -> Result<Value, ExpressionError> {
    c.arity(1, 1)?;
    let items = c.array(0)?;
    let mut int_total: Option<i64> = Some(0);
    let mut float_total = 0.0;
    for v in items {
        let f = v
            .as_f64()
            .ok_or_else(|| ExpressionError::type_mismatch(c.expr, format!("sum() cannot add {}", type_name(v))))?;
        float_total += f;
        int_total = match (int_total, as_int(v)) {
            (Some(t), Some(i)) => t.checked_add(i),
            _ => None,
        };
    }
    match int_total {
        Some(t) => Ok(json!(t)),
        None => float(float_total, c.expr),
    }
}

fn fn_extreme(c: &Call, want: Ordering) -> Result<Value, ExpressionError> {
    c.arity(1, usize::MAX)?;
    let items: &[Value] = match (c.args.len(), c.arg(0)) {
        (1, Value::Array(a)) => a,
        (1, _) => return Err(c.wrong_type(0, "array")),
        _ => &c.args,
    };
    let mut best: Option<&Value> = None;
    for v in items {
        best = match best {
            None => Some(v),
            Some(b) => {
                let ord = compare(v, b).ok_or_else(|| {
                    ExpressionError::type_mismatch(
                        c.expr,
                        format!("cannot compare {} with {}", type_name(v), type_name(b)),
                    )
                })?;
                if ord == want {
                    Some(v)
                } else {
                    Some(b)
                }
            }
        };
    }
    Ok(best.cloned().unwrap_or(Value::Null))
}

fn fn_int(c: &Call) -> Result<Value, ExpressionError> {
    c.arity(1, 1)?;
    let i = match c.arg(0) {
        Value::Number(n) => match n.as_i64() {
            Some(i) => i,
            None => n.as_f64().unwrap_or(0.0).trunc() as i64,
        },
        Value::String(s) => {
            let t = s.trim();
            match t.parse::<i64>() {
                Ok(i) => i,
                Err(_) => t
                    .parse::<f64>()
                    .map(|f| f.trunc() as i64)
                    .map_err(|_| c.fail(format!("cannot convert '{}' to integer", s)))?,
            }
        }
        Value::Bool(b) => i64::from(*b),
        _ => return Err(c.wrong_type(0, "number, string or boolean")),
    };
    Ok(json!(i))
}

fn fn_range(c: &Call) -> Result<Value, ExpressionError> {
    c.arity(1, 3)?;
    let (start, end, step) = match c.args.len() {
        1 => (0, c.int(0)?, 1),
        2 => (c.int(0)?, c.int(1)?, 1),
        _ => (c.int(0)?, c.int(1)?, c.int(2)?),
    };
    if step == 0 {
        return Err(c.fail("step must not be zero"));
    }
    let span = if step > 0 {
        end.saturating_sub(start).max(0)
    } else {
        start.saturating_sub(end).max(0)
    };
    let count = (span as u64).div_ceil(step.unsigned_abs()) as usize;
    c.cap(count)?;
    let mut out = Vec::with_capacity(count);
    let mut i = start;
    for _ in 0..count {
        out.push(json!(i));
        i += step;
    }
    Ok(Value::Array(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call_fn(name: &str, args: Vec<Value>) -> Result<Value, ExpressionError> {
        let expr = Expr::Ident(name.to_string());
        call(name, args, &HostEnv::default(), &EvalLimits::default(), &expr)
    }

    #[test]
    fn test_string_functions() {
        assert_eq!(call_fn("upper", vec![json!("abc")]).unwrap(), json!("ABC"));
        assert_eq!(call_fn("trim", vec![json!("  x ")]).unwrap(), json!("x"));
        assert_eq!(
            call_fn("split", vec![json!("a,b"), json!(",")]).unwrap(),
            json!(["a", "b"])
        );
        assert_eq!(
            call_fn("join", vec![json!(["a", 1]), json!("-")]).unwrap(),
            json!("a-1")
        );
        assert_eq!(call_fn("len", vec![json!("héllo")]).unwrap(), json!(5));
    }

    #[test]
    fn test_collection_functions() {
        assert_eq!(
            call_fn("sort", vec![json!([3, 1, 2])]).unwrap(),
            json!([1, 2, 3])
        );
        assert!(call_fn("sort", vec![json!([1, "a"])]).is_err());
        assert_eq!(
            call_fn("unique", vec![json!([1, 1.0, 2])]).unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            call_fn("slice", vec![json!([1, 2, 3, 4]), json!(1), json!(-1)]).unwrap(),
            json!([2, 3])
        );
        assert_eq!(call_fn("sum", vec![json!([1, 2, 3])]).unwrap(), json!(6));
        assert_eq!(call_fn("sum", vec![json!([1, 0.5])]).unwrap(), json!(1.5));
        assert_eq!(call_fn("max", vec![json!([4, 9, 2])]).unwrap(), json!(9));
        assert_eq!(call_fn("min", vec![json!(4), json!(2)]).unwrap(), json!(2));
        assert_eq!(
            call_fn("range", vec![json!(1), json!(7), json!(2)]).unwrap(),
            json!([1, 3, 5])
        );
        assert_eq!(
            call_fn(
                "get",
                vec![json!({"a": {"b": [10, 20]}}), json!("a.b.1")]
            )
            .unwrap(),
            json!(20)
        );
    }

    #[test]
    fn test_conversions() {
        assert_eq!(call_fn("int", vec![json!("42")]).unwrap(), json!(42));
        assert_eq!(call_fn("int", vec![json!(3.9)]).unwrap(), json!(3));
        assert_eq!(call_fn("str", vec![json!(5)]).unwrap(), json!("5"));
        assert_eq!(call_fn("round", vec![json!(2.5)]).unwrap(), json!(3));
        assert_eq!(
            call_fn("round", vec![json!(1.234), json!(2)]).unwrap(),
            json!(1.23)
        );
        assert!(matches!(
            call_fn("int", vec![json!("abc")]).unwrap_err(),
            ExpressionError::Function { .. }
        ));
    }

    #[test]
    fn test_range_respects_collection_cap() {
        let expr = Expr::Ident("range".to_string());
        let limits = EvalLimits {
            max_collection: 10,
            ..EvalLimits::default()
        };
        let err = call("range", vec![json!(1000)], &HostEnv::default(), &limits, &expr)
            .unwrap_err();
        assert!(matches!(err, ExpressionError::Function { .. }));
    }

    #[test]
    fn test_host_functions() {
        assert_eq!(
            call_fn("sha256", vec![json!("abc")]).unwrap(),
            json!("ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad")
        );
        assert_eq!(
            call_fn("base64_encode", vec![json!("hi")]).unwrap(),
            json!("aGk=")
        );
        assert_eq!(
            call_fn("base64_decode", vec![json!("aGk=")]).unwrap(),
            json!("hi")
        );
        assert_eq!(
            call_fn("from_json", vec![json!("{\"a\":1}")]).unwrap(),
            json!({"a": 1})
        );
        let n = call_fn("random_int", vec![json!(1), json!(3)]).unwrap();
        assert!((1..=3).contains(&n.as_i64().unwrap()));
        assert_eq!(call_fn("uuid", vec![]).unwrap().as_str().unwrap().len(), 36);
    }

    #[test]
    fn test_regex_functions() {
        assert_eq!(
            call_fn("regex_match", vec![json!("abc123"), json!("[a-z]+")]).unwrap(),
            json!(true)
        );
        assert_eq!(
            call_fn("regex_match", vec![json!("1abc"), json!("[a-z]+")]).unwrap(),
            json!(false)
        );
        assert_eq!(
            call_fn("regex_search", vec![json!("id=42;"), json!("\\d+")]).unwrap(),
            json!("42")
        );
        assert_eq!(
            call_fn(
                "regex_replace",
                vec![json!("a1b2"), json!("\\d"), json!("#")]
            )
            .unwrap(),
            json!("a#b#")
        );
        assert!(call_fn("regex_search", vec![json!("x"), json!("(")]).is_err());
    }

    #[test]
    fn test_env_allowlist() {
        let expr = Expr::Ident("env".to_string());
        let host = HostEnv {
            env_allowlist: Some(vec!["KINETIC_FLOW_TEST_ALLOWED".to_string()]),
        };
        let err = call(
            "env",
            vec![json!("PATH")],
            &host,
            &EvalLimits::default(),
            &expr,
        )
        .unwrap_err();
        assert!(matches!(err, ExpressionError::Function { .. }));

        let ok = call(
            "env",
            vec![json!("KINETIC_FLOW_TEST_ALLOWED")],
            &host,
            &EvalLimits::default(),
            &expr,
        )
        .unwrap();
        assert_eq!(ok, Value::Null);
    }

    #[test]
    fn test_unknown_function() {
        match call_fn("nope", vec![]).unwrap_err() {
            ExpressionError::UndefinedReference { name, available } => {
                assert_eq!(name, "nope");
                assert!(available.contains(&"len".to_string()));
            }
            other => panic!("Expected undefined reference, got {:?}", other),
        }
    }
}
