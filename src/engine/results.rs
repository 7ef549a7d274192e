// SPDX-License-Identifier: MIT

//! Expected result shapes for external actions
//!
//! | action     | submitted result                                   | payload        |
//! |------------|----------------------------------------------------|----------------|
//! | shell      | `{output: str, error_output: str, status: int}`    | whole object   |
//! | tool_call  | `{result}`                                         | `result`       |
//! | prompt     | `{response}`                                       | `response`     |
//! | wait       | `{value}`                                          | `value`        |
//! | delegate   | `{output}`                                         | `output`       |
//!
//! Extra keys are rejected. A non-zero shell status is data, not an error.

use serde_json::{Map, Value};

use super::pending::ActionType;
use crate::error::StepError;

/// Validate a submitted result and extract the payload written to `output_to`
pub fn extract_payload(
    step_id: &str,
    action: ActionType,
    output_schema: Option<&Value>,
    result: &Value,
) -> Result<Value, StepError> {
    let malformed = |message: String| StepError::ResultShape {
        step_id: step_id.to_string(),
        action: action.to_string(),
        message,
    };

    let Some(obj) = result.as_object() else {
        return Err(malformed(format!(
            "expected an object, got {}",
            crate::workflow::expression::type_name(result)
        )));
    };

    match action {
        ActionType::Shell => {
            only_keys(obj, &["output", "error_output", "status"]).map_err(malformed)?;
            for key in ["output", "error_output"] {
                match obj.get(key) {
                    Some(Value::String(_)) => {}
                    Some(_) => return Err(malformed(format!("'{}' must be a string", key))),
                    None => return Err(malformed(format!("missing '{}'", key))),
                }
            }
            match obj.get("status") {
                Some(v) if v.is_i64() || v.is_u64() => {}
                Some(_) => return Err(malformed("'status' must be an integer".to_string())),
                None => return Err(malformed("missing 'status'".to_string())),
            }
            Ok(result.clone())
        }
        ActionType::ToolCall => single(obj, "result").map_err(malformed),
        ActionType::Wait => single(obj, "value").map_err(malformed),
        ActionType::Delegate => single(obj, "output").map_err(malformed),
        ActionType::Prompt => {
            let response = single(obj, "response").map_err(malformed)?;
            let required = output_schema
                .and_then(|s| s.get("required"))
                .and_then(Value::as_array);
            if let Some(required) = required {
                let Some(fields) = response.as_object() else {
                    return Err(malformed(
                        "'response' must be an object matching output_schema".to_string(),
                    ));
                };
                let missing: Vec<&str> = required
                    .iter()
                    .filter_map(Value::as_str)
                    .filter(|k| !fields.contains_key(*k))
                    .collect();
                if !missing.is_empty() {
                    return Err(malformed(format!(
                        "'response' is missing required field(s): {}",
                        missing.join(", ")
                    )));
                }
            }
            Ok(response)
        }
        ActionType::DelegateIteration => Err(malformed(
            "delegated iterations are resumed by their children, not by a submitted result"
                .to_string(),
        )),
    }
}

fn only_keys(obj: &Map<String, Value>, allowed: &[&str]) -> Result<(), String> {
    let extra: Vec<&str> = obj
        .keys()
        .map(String::as_str)
        .filter(|k| !allowed.contains(k))
        .collect();
    if extra.is_empty() {
        Ok(())
    } else {
        Err(format!("unexpected key(s): {}", extra.join(", ")))
    }
}

fn single(obj: &Map<String, Value>, key: &str) -> Result<Value, String> {
    only_keys(obj, &[key])?;
    obj.get(key)
        .cloned()
        .ok_or_else(|| format!("missing '{}'", key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_shell_result() {
        let ok = json!({"output": "hi\n", "error_output": "", "status": 0});
        assert_eq!(
            extract_payload("s", ActionType::Shell, None, &ok).unwrap(),
            ok
        );

        let failed_command = json!({"output": "", "error_output": "boom", "status": 2});
        assert!(extract_payload("s", ActionType::Shell, None, &failed_command).is_ok());

        for bad in [
            json!({"output": "hi"}),
            json!({"output": "hi", "error_output": "", "status": "0"}),
            json!({"output": "hi", "error_output": "", "status": 0, "extra": 1}),
            json!("hi"),
        ] {
            let err = extract_payload("s", ActionType::Shell, None, &bad).unwrap_err();
            assert_eq!(err.kind(), "malformed_result");
        }
    }

    #[test]
    fn test_single_key_payloads() {
        assert_eq!(
            extract_payload("t", ActionType::ToolCall, None, &json!({"result": [1, 2]})).unwrap(),
            json!([1, 2])
        );
        assert_eq!(
            extract_payload("w", ActionType::Wait, None, &json!({"value": null})).unwrap(),
            Value::Null
        );
        assert!(extract_payload("t", ActionType::ToolCall, None, &json!({"output": 1})).is_err());
        assert!(
            extract_payload("d", ActionType::Delegate, None, &json!({"output": 1, "x": 2}))
                .is_err()
        );
    }

    #[test]
    fn test_prompt_schema_required() {
        let schema = json!({"type": "object", "required": ["summary"]});
        let ok = json!({"response": {"summary": "done"}});
        assert!(extract_payload("p", ActionType::Prompt, Some(&schema), &ok).is_ok());

        let missing = json!({"response": {"other": 1}});
        let err = extract_payload("p", ActionType::Prompt, Some(&schema), &missing).unwrap_err();
        assert!(err.to_string().contains("summary"));

        let text = json!({"response": "plain text"});
        assert!(extract_payload("p", ActionType::Prompt, None, &text).is_ok());
        assert!(extract_payload("p", ActionType::Prompt, Some(&schema), &text).is_err());
    }

    #[test]
    fn test_delegate_iteration_never_accepts_results() {
        let err =
            extract_payload("it", ActionType::DelegateIteration, None, &json!({})).unwrap_err();
        assert!(matches!(err, StepError::ResultShape { .. }));
    }
}
