// SPDX-License-Identifier: MIT

//! Schema types for workflow definitions
//!
//! This module contains the data structures a validated workflow document
//! deserializes into. Documents are always validated on their raw form
//! first (see `validator`), so these types stay permissive.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::expression::{is_template, ExpressionEngine};
use super::state::{ComputedFieldDef, ComputedGraph, InitialState};
use crate::error::ExpressionError;

/// Top-level workflow definition
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WorkflowDefinition {
    pub name: String,
    /// Numbers are accepted and normalised to strings
    #[serde(deserialize_with = "version_string")]
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, InputSpec>,
    #[serde(default)]
    pub initial_state: InitialState,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub computed: BTreeMap<String, ComputedFieldDef>,
    pub steps: Vec<Step>,
    /// Reusable step lists referenced by iterate steps
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub tasks: BTreeMap<String, Vec<Step>>,
    /// Built by the validator
    #[serde(skip)]
    pub computed_graph: ComputedGraph,
}

fn version_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "version must be a string or number, got {}",
            other
        ))),
    }
}

impl WorkflowDefinition {
    /// Registry key, `name@version`
    pub fn key(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }

    /// Resolve a block reference to its step list
    pub fn block(&self, block: &BlockRef) -> Option<&[Step]> {
        match block {
            BlockRef::Root => Some(self.steps.as_slice()),
            BlockRef::Task(name) => self.tasks.get(name).map(Vec::as_slice),
            BlockRef::Then(id) => match &self.find_step(id)?.kind {
                StepKind::Branch(b) => Some(b.then.as_slice()),
                _ => None,
            },
            BlockRef::Else(id) => match &self.find_step(id)?.kind {
                StepKind::Branch(b) => Some(b.otherwise.as_slice()),
                _ => None,
            },
            BlockRef::Body(id) => match &self.find_step(id)?.kind {
                StepKind::Iterate(it) => match (&it.steps, &it.task) {
                    (Some(steps), _) => Some(steps.as_slice()),
                    (None, Some(task)) => self.tasks.get(task).map(Vec::as_slice),
                    _ => None,
                },
                _ => None,
            },
        }
    }

    /// Find a step by id anywhere in the definition, tasks included
    pub fn find_step(&self, id: &str) -> Option<&Step> {
        find_in(&self.steps, id).or_else(|| self.tasks.values().find_map(|steps| find_in(steps, id)))
    }
}

fn find_in<'a>(steps: &'a [Step], id: &str) -> Option<&'a Step> {
    for step in steps {
        if step.id == id {
            return Some(step);
        }
        for (_, children) in step.children() {
            if let Some(found) = find_in(children, id) {
                return Some(found);
            }
        }
    }
    None
}

/// A step list inside a definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "block", content = "step", rename_all = "snake_case")]
pub enum BlockRef {
    Root,
    /// `then` list of a branch step
    Then(String),
    /// `else` list of a branch step
    Else(String),
    /// Per-item body of an iterate step (inline or task)
    Body(String),
    Task(String),
}

/// Typed workflow input
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct InputSpec {
    #[serde(rename = "type")]
    pub input_type: InputType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Regex a string input must match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_length: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<Value>>,
}

impl InputSpec {
    /// Required unless stated otherwise or a default exists
    pub fn is_required(&self) -> bool {
        self.required.unwrap_or(self.default.is_none())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    String,
    Number,
    Integer,
    Boolean,
    Array,
    Object,
}

impl InputType {
    pub fn as_str(&self) -> &'static str {
        match self {
            InputType::String => "string",
            InputType::Number => "number",
            InputType::Integer => "integer",
            InputType::Boolean => "boolean",
            InputType::Array => "array",
            InputType::Object => "object",
        }
    }
}

/// A single workflow step
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct Step {
    pub id: String,
    /// State fields this step may read; absent means none
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub needs_state: Vec<String>,
    /// Tier-qualified path receiving the step's result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_to: Option<String>,
    /// Guard; the step is skipped when it evaluates falsy
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<String>,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// The closed set of step types
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Branch(BranchStep),
    StateUpdate(StateUpdateStep),
    Iterate(IterateStep),
    Terminate(TerminateStep),
    Shell(ShellStep),
    ToolCall(ToolCallStep),
    Prompt(PromptStep),
    Wait(WaitStep),
    Delegate(DelegateStep),
}

pub const STEP_TYPES: &[&str] = &[
    "branch",
    "state_update",
    "iterate",
    "terminate",
    "shell",
    "tool_call",
    "prompt",
    "wait",
    "delegate",
];

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct BranchStep {
    pub condition: String,
    pub then: Vec<Step>,
    #[serde(rename = "else", default, skip_serializing_if = "Vec::is_empty")]
    pub otherwise: Vec<Step>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct StateUpdateStep {
    /// `tier.path` -> expression (strings) or literal
    pub updates: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum IterationMode {
    #[default]
    Parallel,
    Sequential,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct IterateStep {
    pub items: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<Vec<Step>>,
    /// Name of a task to run per item instead of inline `steps`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task: Option<String>,
    #[serde(default)]
    pub mode: IterationMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_concurrency: Option<usize>,
    #[serde(rename = "as", default = "default_alias")]
    pub alias: String,
    /// Values passed to every child as its inputs
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub inputs: BTreeMap<String, Value>,
    /// Delegation target; children run on sub-agents when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    #[serde(default)]
    pub continue_on_error: bool,
}

fn default_alias() -> String {
    "item".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum TerminateStatus {
    #[default]
    Success,
    Failure,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct TerminateStep {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default)]
    pub status: TerminateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ShellStep {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ToolCallStep {
    pub tool: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub args: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct PromptStep {
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct WaitStep {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct DelegateStep {
    pub agent: String,
    pub task: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub inputs: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
}

/// Where an expression lives inside a step, and how it is written
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Source<'a> {
    /// Bare expression or a single `{{ }}` template
    Expr(&'a str),
    /// Text with `{{ }}` interpolations
    Text(&'a str),
    /// JSON value whose strings may hold templates
    Json(&'a Value),
}

impl<'a> Source<'a> {
    /// Strings in expression-or-literal positions are expressions, other values are literals
    pub fn value(v: &'a Value) -> Self {
        match v {
            Value::String(s) => Source::Expr(s),
            other => Source::Json(other),
        }
    }

    pub fn references(&self) -> Result<BTreeSet<String>, ExpressionError> {
        match self {
            Source::Expr(s) => ExpressionEngine::references(s),
            Source::Text(s) if !is_template(s) => Ok(BTreeSet::new()),
            Source::Text(s) => ExpressionEngine::references(s),
            Source::Json(v) => ExpressionEngine::template_references(v),
        }
    }
}

impl Step {
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            StepKind::Branch(_) => "branch",
            StepKind::StateUpdate(_) => "state_update",
            StepKind::Iterate(_) => "iterate",
            StepKind::Terminate(_) => "terminate",
            StepKind::Shell(_) => "shell",
            StepKind::ToolCall(_) => "tool_call",
            StepKind::Prompt(_) => "prompt",
            StepKind::Wait(_) => "wait",
            StepKind::Delegate(_) => "delegate",
        }
    }

    /// Executed by the caller rather than the engine
    pub fn is_external(&self) -> bool {
        matches!(
            self.kind,
            StepKind::Shell(_)
                | StepKind::ToolCall(_)
                | StepKind::Prompt(_)
                | StepKind::Wait(_)
                | StepKind::Delegate(_)
        )
    }

    /// Per-step timeout of an external step, in seconds
    pub fn timeout(&self) -> Option<u64> {
        match &self.kind {
            StepKind::Shell(s) => s.timeout,
            StepKind::ToolCall(s) => s.timeout,
            StepKind::Prompt(s) => s.timeout,
            StepKind::Wait(s) => s.timeout,
            StepKind::Delegate(s) => s.timeout,
            _ => None,
        }
    }

    /// Inline child step lists, labelled by their key
    pub fn children(&self) -> Vec<(&'static str, &[Step])> {
        match &self.kind {
            StepKind::Branch(b) => {
                let mut out = vec![("then", b.then.as_slice())];
                if !b.otherwise.is_empty() {
                    out.push(("else", b.otherwise.as_slice()));
                }
                out
            }
            StepKind::Iterate(it) => it
                .steps
                .as_deref()
                .map(|steps| vec![("steps", steps)])
                .unwrap_or_default(),
            _ => Vec::new(),
        }
    }

    /// Every expression and template the step evaluates in its own scope
    ///
    /// Child step lists are not included. Labels are field paths relative
    /// to the step, e.g. `updates.raw.total`.
    pub fn sources(&self) -> Vec<(String, Source<'_>)> {
        let mut out = Vec::new();
        if let Some(when) = &self.when {
            out.push(("when".to_string(), Source::Expr(when)));
        }
        match &self.kind {
            StepKind::Branch(b) => out.push(("condition".to_string(), Source::Expr(&b.condition))),
            StepKind::StateUpdate(s) => {
                for (path, value) in &s.updates {
                    out.push((format!("updates.{}", path), Source::value(value)));
                }
            }
            StepKind::Iterate(it) => {
                out.push(("items".to_string(), Source::Expr(&it.items)));
                for (name, value) in &it.inputs {
                    out.push((format!("inputs.{}", name), Source::value(value)));
                }
            }
            StepKind::Terminate(t) => {
                if let Some(value) = &t.value {
                    out.push(("value".to_string(), Source::value(value)));
                }
                if let Some(message) = &t.message {
                    out.push(("message".to_string(), Source::Text(message)));
                }
            }
            StepKind::Shell(s) => {
                out.push(("command".to_string(), Source::Text(&s.command)));
                if let Some(cwd) = &s.cwd {
                    out.push(("cwd".to_string(), Source::Text(cwd)));
                }
                for (k, v) in &s.env {
                    out.push((format!("env.{}", k), Source::Text(v)));
                }
            }
            StepKind::ToolCall(t) => {
                for (k, v) in &t.args {
                    out.push((format!("args.{}", k), Source::Json(v)));
                }
            }
            StepKind::Prompt(p) => out.push(("prompt".to_string(), Source::Text(&p.prompt))),
            StepKind::Wait(w) => out.push(("message".to_string(), Source::Text(&w.message))),
            StepKind::Delegate(d) => {
                out.push(("task".to_string(), Source::Text(&d.task)));
                for (k, v) in &d.inputs {
                    out.push((format!("inputs.{}", k), Source::Json(v)));
                }
            }
        }
        out
    }

    /// Root identifiers read by the step's own expressions
    pub fn references(&self) -> Result<BTreeSet<String>, ExpressionError> {
        let mut out = BTreeSet::new();
        for (_, source) in self.sources() {
            out.extend(source.references()?);
        }
        Ok(out)
    }
}
