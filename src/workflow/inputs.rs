// SPDX-License-Identifier: MIT

//! Typed workflow input validation

use regex::RegexBuilder;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::types::{InputSpec, InputType};
use crate::error::ValidationIssue;

/// Check caller-supplied inputs against the definition's input schema
///
/// Defaults fill in missing optional inputs. Every problem is reported, and
/// the returned object holds exactly the declared inputs that have a value.
pub fn validate_inputs(
    specs: &BTreeMap<String, InputSpec>,
    provided: &Value,
) -> Result<Value, Vec<ValidationIssue>> {
    let empty = Map::new();
    let provided = match provided {
        Value::Null => &empty,
        Value::Object(obj) => obj,
        other => {
            return Err(vec![ValidationIssue::new(
                "",
                "invalid_type",
                format!("inputs must be an object, got {}", type_label(other)),
            )])
        }
    };

    let mut issues = Vec::new();
    let mut out = Map::new();

    for name in provided.keys() {
        if !specs.contains_key(name) {
            let mut issue = ValidationIssue::new(
                name.as_str(),
                "unknown_field",
                format!("'{}' is not a declared input", name),
            );
            if let Some(hint) = super::validator::suggest(name, specs.keys().map(String::as_str)) {
                issue = issue.with_suggestion(hint);
            }
            issues.push(issue);
        }
    }

    for (name, spec) in specs {
        let value = match provided.get(name).filter(|v| !v.is_null()) {
            Some(v) => v.clone(),
            None => match &spec.default {
                Some(default) => default.clone(),
                None if spec.is_required() => {
                    issues.push(ValidationIssue::new(
                        name.as_str(),
                        "missing_field",
                        format!("input '{}' is required", name),
                    ));
                    continue;
                }
                None => continue,
            },
        };
        let before = issues.len();
        check_value(name, spec, &value, &mut issues);
        if issues.len() == before {
            out.insert(name.clone(), value);
        }
    }

    if issues.is_empty() {
        Ok(Value::Object(out))
    } else {
        Err(issues)
    }
}

fn type_label(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn matches_type(input_type: InputType, v: &Value) -> bool {
    match input_type {
        InputType::String => v.is_string(),
        InputType::Number => v.is_number(),
        InputType::Integer => v.is_i64() || v.is_u64(),
        InputType::Boolean => v.is_boolean(),
        InputType::Array => v.is_array(),
        InputType::Object => v.is_object(),
    }
}

fn check_value(name: &str, spec: &InputSpec, value: &Value, issues: &mut Vec<ValidationIssue>) {
    if !matches_type(spec.input_type, value) {
        issues.push(ValidationIssue::new(
            name,
            "invalid_type",
            format!(
                "input '{}' must be {}, got {}",
                name,
                spec.input_type.as_str(),
                type_label(value)
            ),
        ));
        return;
    }

    if let (Some(pattern), Some(s)) = (&spec.pattern, value.as_str()) {
        match RegexBuilder::new(pattern).size_limit(1 << 20).build() {
            Ok(re) if !re.is_match(s) => issues.push(ValidationIssue::new(
                name,
                "pattern_mismatch",
                format!("input '{}' does not match pattern '{}'", name, pattern),
            )),
            Ok(_) => {}
            Err(e) => issues.push(ValidationIssue::new(
                name,
                "invalid_pattern",
                format!("pattern '{}' does not compile: {}", pattern, e),
            )),
        }
    }

    if let Some(n) = value.as_f64() {
        if spec.minimum.is_some_and(|min| n < min) || spec.maximum.is_some_and(|max| n > max) {
            issues.push(ValidationIssue::new(
                name,
                "out_of_range",
                format!(
                    "input '{}' = {} is outside [{}, {}]",
                    name,
                    value,
                    spec.minimum.map_or("-inf".to_string(), |m| m.to_string()),
                    spec.maximum.map_or("inf".to_string(), |m| m.to_string()),
                ),
            ));
        }
    }

    let len = match value {
        Value::String(s) => Some(s.chars().count()),
        Value::Array(a) => Some(a.len()),
        _ => None,
    };
    if let Some(len) = len {
        if spec.min_length.is_some_and(|min| len < min)
            || spec.max_length.is_some_and(|max| len > max)
        {
            issues.push(ValidationIssue::new(
                name,
                "invalid_length",
                format!("input '{}' has length {} outside the allowed bounds", name, len),
            ));
        }
    }

    if let Some(allowed) = &spec.allowed {
        if !allowed.contains(value) {
            let options: Vec<String> = allowed.iter().map(|v| v.to_string()).collect();
            issues.push(ValidationIssue::new(
                name,
                "not_allowed",
                format!("input '{}' must be one of {}", name, options.join(", ")),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn specs(value: Value) -> BTreeMap<String, InputSpec> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_defaults_fill_missing() {
        let s = specs(json!({
            "name": {"type": "string"},
            "count": {"type": "integer", "default": 3},
            "note": {"type": "string", "required": false}
        }));
        let out = validate_inputs(&s, &json!({"name": "x"})).unwrap();
        assert_eq!(out, json!({"name": "x", "count": 3}));
    }

    #[test]
    fn test_collects_every_issue() {
        let s = specs(json!({
            "name": {"type": "string"},
            "count": {"type": "integer"}
        }));
        let issues = validate_inputs(&s, &json!({"count": 1.5, "nmae": "x"})).unwrap_err();
        let codes: Vec<&str> = issues.iter().map(|i| i.code.as_str()).collect();
        assert_eq!(codes, vec!["unknown_field", "invalid_type", "missing_field"]);
        assert_eq!(issues[0].suggestion.as_deref(), Some("name"));
    }

    #[test]
    fn test_constraints() {
        let s = specs(json!({
            "slug": {"type": "string", "pattern": "^[a-z]+$", "max_length": 4},
            "score": {"type": "number", "minimum": 0, "maximum": 100},
            "level": {"type": "string", "enum": ["low", "high"]}
        }));
        let issues =
            validate_inputs(&s, &json!({"slug": "Abcdef", "score": 101, "level": "mid"}))
                .unwrap_err();
        let codes: Vec<&str> = issues.iter().map(|i| i.code.as_str()).collect();
        assert_eq!(
            codes,
            vec!["not_allowed", "out_of_range", "pattern_mismatch", "invalid_length"]
        );

        let ok = validate_inputs(&s, &json!({"slug": "abc", "score": 70, "level": "low"}));
        assert!(ok.is_ok());
    }

    #[test]
    fn test_non_object_inputs_rejected() {
        let issues = validate_inputs(&BTreeMap::new(), &json!([1])).unwrap_err();
        assert_eq!(issues[0].code, "invalid_type");
        assert_eq!(validate_inputs(&BTreeMap::new(), &Value::Null).unwrap(), json!({}));
    }
}
