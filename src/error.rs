// SPDX-License-Identifier: MIT

//! Typed error handling for kinetic-flow
//!
//! Errors are split by who has to act on them:
//! - `DefinitionError` - the workflow document is broken, nothing ran
//! - `StepError` - a step failed and took its instance down with it
//! - `EngineError` - the caller used the API wrongly, or the backend failed
//!
//! `StepError`s are never returned raw to callers. They are folded into a
//! serializable `FailureReport` that is stored on the failed instance.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// A single structured problem found while validating a workflow document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationIssue {
    /// Location in the document, e.g. `steps[2].then[0].condition`
    pub path: String,
    pub message: String,
    /// Stable machine-readable code, e.g. `missing_field`
    pub code: String,
    /// Suggested correction, when one can be derived
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

impl ValidationIssue {
    pub fn new(path: impl Into<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
            code: code.to_string(),
            suggestion: None,
        }
    }

    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }
}

impl fmt::Display for ValidationIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} [{}]", self.path, self.message, self.code)?;
        if let Some(suggestion) = &self.suggestion {
            write!(f, " (suggestion: {})", suggestion)?;
        }
        Ok(())
    }
}

/// Errors raised before any execution begins
#[derive(Debug, Error)]
pub enum DefinitionError {
    /// The document is not valid YAML/JSON
    #[error("Failed to parse workflow document: {0}")]
    Parse(String),

    /// The document parsed but failed validation
    #[error("Workflow definition is invalid ({} issue(s)): {}", .0.len(), summarize(.0))]
    Invalid(Vec<ValidationIssue>),

    /// The definition file could not be read
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DefinitionError {
    /// Issues carried by an `Invalid` error, empty otherwise
    pub fn issues(&self) -> &[ValidationIssue] {
        match self {
            DefinitionError::Invalid(issues) => issues,
            _ => &[],
        }
    }
}

fn summarize(issues: &[ValidationIssue]) -> String {
    issues
        .iter()
        .map(|i| i.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors produced while parsing or evaluating an expression
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExpressionError {
    #[error("Syntax error in '{fragment}': {message}")]
    Syntax { fragment: String, message: String },

    #[error("Undefined reference '{name}' (available: {})", .available.join(", "))]
    UndefinedReference {
        name: String,
        available: Vec<String>,
    },

    #[error("Type mismatch in '{fragment}': {message}")]
    TypeMismatch { fragment: String, message: String },

    #[error("Expression evaluation exceeded {limit_ms}ms")]
    Timeout { limit_ms: u64 },

    #[error("Expression nesting exceeded depth {limit}")]
    DepthExceeded { limit: usize },

    /// The name exists in state but the step did not declare it
    #[error("State field '{name}' is not readable from this step")]
    Restricted { name: String },

    #[error("Function '{name}' failed: {message}")]
    Function { name: String, message: String },
}

impl ExpressionError {
    pub fn syntax(fragment: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Syntax {
            fragment: fragment.into(),
            message: message.into(),
        }
    }

    pub fn type_mismatch(fragment: impl fmt::Display, message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            fragment: fragment.to_string(),
            message: message.into(),
        }
    }

    pub fn function(name: &str, message: impl Into<String>) -> Self {
        Self::Function {
            name: name.to_string(),
            message: message.into(),
        }
    }

    /// Machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            ExpressionError::Syntax { .. } => "expression_syntax",
            ExpressionError::UndefinedReference { .. } => "undefined_reference",
            ExpressionError::TypeMismatch { .. } | ExpressionError::Function { .. } => {
                "type_mismatch"
            }
            ExpressionError::Timeout { .. } => "expression_timeout",
            ExpressionError::DepthExceeded { .. } => "expression_depth",
            ExpressionError::Restricted { .. } => "state_access_violation",
        }
    }
}

/// Errors raised by the state manager on the write path
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StateError {
    #[error("State path '{0}' must start with a tier (raw. or session.)")]
    MissingTier(String),

    #[error("Computed field '{0}' cannot be written directly")]
    ComputedNotWritable(String),

    #[error("State path '{path}' crosses non-object value at '{at}'")]
    PathConflict { path: String, at: String },

    #[error("Failed to recompute '{field}': {source}")]
    Recompute {
        field: String,
        source: ExpressionError,
    },
}

/// Instance-fatal step failures
#[derive(Debug, Clone, Error)]
pub enum StepError {
    /// A step tried to read state it did not declare in `needs_state`
    #[error("Step '{step_id}' read undeclared state field '{field}'")]
    StateAccess {
        step_id: String,
        field: String,
        declared: Vec<String>,
    },

    #[error("Step '{step_id}': {source}")]
    Expression {
        step_id: String,
        source: ExpressionError,
    },

    #[error("Step '{step_id}' could not update state: {source}")]
    State { step_id: String, source: StateError },

    #[error("Step '{step_id}' condition must be boolean, got {got}")]
    NotBoolean {
        step_id: String,
        fragment: String,
        got: String,
    },

    #[error("Step '{step_id}' items must be an array, got {got}")]
    NotCollection {
        step_id: String,
        fragment: String,
        got: String,
    },

    /// The submitted result did not have the shape the action requires
    #[error("Result for step '{step_id}' ({action}) is malformed: {message}")]
    ResultShape {
        step_id: String,
        action: String,
        message: String,
    },

    /// No result arrived before the action's deadline
    #[error("Step '{step_id}' timed out after {timeout_secs}s waiting for a result")]
    ResultTimeout { step_id: String, timeout_secs: u64 },

    #[error("Step '{step_id}': {} child execution(s) failed at indices {failed:?}", .failed.len())]
    ChildFailures { step_id: String, failed: Vec<usize> },

    /// A terminate step ended the instance with `status: failure`
    #[error("Step '{step_id}' terminated the workflow: {message}")]
    Terminated {
        step_id: String,
        message: String,
        value: Value,
    },

    #[error("Step '{step_id}' exceeds the nesting limit of {limit}")]
    NestingTooDeep { step_id: String, limit: usize },

    #[error("Execution cancelled")]
    Cancelled,
}

impl StepError {
    pub fn expression(step_id: &str, source: ExpressionError) -> Self {
        // Hidden fields surfacing at runtime are access violations, not expression bugs
        if let ExpressionError::Restricted { name } = &source {
            return Self::StateAccess {
                step_id: step_id.to_string(),
                field: name.clone(),
                declared: Vec::new(),
            };
        }
        Self::Expression {
            step_id: step_id.to_string(),
            source,
        }
    }

    /// Machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            StepError::StateAccess { .. } => "state_access_violation",
            StepError::Expression { source, .. } => source.kind(),
            StepError::State { source, .. } => match source {
                StateError::Recompute { source, .. } => source.kind(),
                _ => "state_write",
            },
            StepError::NotBoolean { .. } | StepError::NotCollection { .. } => "type_mismatch",
            StepError::ResultShape { .. } => "malformed_result",
            StepError::ResultTimeout { .. } => "external_result_timeout",
            StepError::ChildFailures { .. } => "child_failures",
            StepError::Terminated { .. } => "terminated",
            StepError::NestingTooDeep { .. } => "nesting_too_deep",
            StepError::Cancelled => "cancelled",
        }
    }

    pub fn step_id(&self) -> Option<&str> {
        match self {
            StepError::StateAccess { step_id, .. }
            | StepError::Expression { step_id, .. }
            | StepError::State { step_id, .. }
            | StepError::NotBoolean { step_id, .. }
            | StepError::NotCollection { step_id, .. }
            | StepError::ResultShape { step_id, .. }
            | StepError::ResultTimeout { step_id, .. }
            | StepError::ChildFailures { step_id, .. }
            | StepError::Terminated { step_id, .. }
            | StepError::NestingTooDeep { step_id, .. } => Some(step_id),
            StepError::Cancelled => None,
        }
    }

    /// Fold into the report stored on the failed instance
    pub fn report(&self) -> FailureReport {
        let mut report = FailureReport {
            kind: self.kind().to_string(),
            message: self.to_string(),
            step_id: self.step_id().map(str::to_string),
            fragment: None,
            available: Vec::new(),
        };
        match self {
            StepError::StateAccess {
                field, declared, ..
            } => {
                report.fragment = Some(field.clone());
                report.available = declared.clone();
            }
            StepError::Expression { source, .. }
            | StepError::State {
                source: StateError::Recompute { source, .. },
                ..
            } => match source {
                ExpressionError::Syntax { fragment, .. }
                | ExpressionError::TypeMismatch { fragment, .. } => {
                    report.fragment = Some(fragment.clone());
                }
                ExpressionError::UndefinedReference { name, available } => {
                    report.fragment = Some(name.clone());
                    report.available = available.clone();
                }
                _ => {}
            },
            StepError::NotBoolean { fragment, .. } | StepError::NotCollection { fragment, .. } => {
                report.fragment = Some(fragment.clone());
            }
            _ => {}
        }
        report
    }
}

/// Serializable description of why an instance failed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub kind: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    /// Offending expression fragment or field name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fragment: Option<String>,
    /// Names that were available at the failure point
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available: Vec<String>,
}

/// Errors from the durable-execution backend
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("Instance '{0}' is not known to the backend")]
    NotFound(String),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Errors returned by `Engine` operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Definition(#[from] DefinitionError),

    #[error("Workflow '{0}' is not registered")]
    UnknownWorkflow(String),

    #[error("Invalid inputs: {}", summarize(.0))]
    InvalidInputs(Vec<ValidationIssue>),

    #[error("Instance '{0}' not found")]
    UnknownInstance(String),

    /// The instance has no pending action that accepts a result
    #[error("Instance '{instance_id}' is not awaiting a result")]
    NotAwaitingResult { instance_id: String },

    #[error("Instance '{instance_id}' is waiting on step '{expected}', not '{got}'")]
    StepMismatch {
        instance_id: String,
        expected: String,
        got: String,
    },

    /// A result for this (instance, step) pair was already applied
    #[error("Result for step '{step_id}' of instance '{instance_id}' was already consumed")]
    ResultAlreadyConsumed {
        instance_id: String,
        step_id: String,
    },

    #[error("Instance '{instance_id}' already finished ({status})")]
    InstanceFinished { instance_id: String, status: String },

    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl EngineError {
    /// Machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::Definition(_) => "definition_error",
            EngineError::UnknownWorkflow(_) => "unknown_workflow",
            EngineError::InvalidInputs(_) => "invalid_inputs",
            EngineError::UnknownInstance(_) => "unknown_instance",
            EngineError::NotAwaitingResult { .. } => "not_awaiting_result",
            EngineError::StepMismatch { .. } => "step_mismatch",
            EngineError::ResultAlreadyConsumed { .. } => "result_already_consumed",
            EngineError::InstanceFinished { .. } => "instance_finished",
            EngineError::Backend(_) => "backend_error",
        }
    }
}
