// SPDX-License-Identifier: MIT

//! Layered workflow validation
//!
//! A document is checked in four layers and every problem found is reported,
//! not just the first:
//!
//! 1. structure of the raw document (required keys, unknown keys, types)
//! 2. per-step-type fields
//! 3. references (state fields, expressions, write targets, tasks)
//! 4. semantics (duplicate ids, computed cycles, unreachable steps, unused
//!    tasks, nesting depth)
//!
//! Layers 3 and 4 run on the typed definition, so they only run when the
//! first two layers found nothing.

use regex::RegexBuilder;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};

use super::expression::{function_names, is_function, ExpressionEngine};
use super::state::{ComputedGraph, ComputedGraphError, StatePath};
use super::types::{Source, Step, StepKind, WorkflowDefinition, STEP_TYPES};
use crate::config::EngineConfig;
use crate::error::{DefinitionError, StateError, ValidationIssue};

const ROOT_KEYS: &[&str] = &[
    "name",
    "version",
    "description",
    "inputs",
    "initial_state",
    "computed",
    "steps",
    "tasks",
];

const COMMON_STEP_KEYS: &[&str] = &["id", "type", "needs_state", "output_to", "when"];

const INPUT_KEYS: &[&str] = &[
    "type",
    "required",
    "default",
    "description",
    "pattern",
    "minimum",
    "maximum",
    "min_length",
    "max_length",
    "enum",
];

const INPUT_TYPES: &[&str] = &["string", "number", "integer", "boolean", "array", "object"];

/// Compiled-program size ceiling for input patterns
const PATTERN_SIZE_LIMIT: usize = 1 << 20;

fn type_keys(step_type: &str) -> &'static [&'static str] {
    match step_type {
        "branch" => &["condition", "then", "else"],
        "state_update" => &["updates"],
        "iterate" => &[
            "items",
            "steps",
            "task",
            "mode",
            "max_concurrency",
            "as",
            "inputs",
            "executor",
            "continue_on_error",
        ],
        "terminate" => &["value", "status", "message"],
        "shell" => &["command", "cwd", "env", "timeout"],
        "tool_call" => &["tool", "args", "timeout"],
        "prompt" => &["prompt", "output_schema", "timeout"],
        "wait" => &["message", "timeout"],
        "delegate" => &["agent", "task", "inputs", "timeout"],
        _ => &[],
    }
}

/// Validates workflow documents into typed definitions
#[derive(Debug, Clone)]
pub struct Validator {
    max_nesting_depth: usize,
}

impl Default for Validator {
    fn default() -> Self {
        Self::new(&EngineConfig::default())
    }
}

impl Validator {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            max_nesting_depth: config.max_nesting_depth,
        }
    }

    /// Parse YAML (or JSON) text and validate it
    pub fn validate_str(&self, text: &str) -> Result<WorkflowDefinition, DefinitionError> {
        let doc: Value =
            serde_yaml::from_str(text).map_err(|e| DefinitionError::Parse(e.to_string()))?;
        self.validate_value(doc)
    }

    /// Validate an already parsed document
    pub fn validate_value(&self, doc: Value) -> Result<WorkflowDefinition, DefinitionError> {
        let mut issues = Vec::new();
        check_document(&doc, &mut issues);
        if !issues.is_empty() {
            return Err(DefinitionError::Invalid(issues));
        }

        let mut def: WorkflowDefinition = serde_json::from_value(doc).map_err(|e| {
            DefinitionError::Invalid(vec![ValidationIssue::new("", "invalid_type", e.to_string())])
        })?;

        let mut walker = ReferenceWalker::new(&def, self.max_nesting_depth);
        walker.run();
        let mut issues = walker.finish();

        check_duplicate_ids(&def, &mut issues);
        check_unused_tasks(&def, &mut issues);
        match check_computed(&def, &mut issues) {
            Some(graph) if issues.is_empty() => def.computed_graph = graph,
            _ => {}
        }

        if !issues.is_empty() {
            return Err(DefinitionError::Invalid(issues));
        }
        log::debug!(
            "Validated workflow '{}' ({} top-level steps)",
            def.key(),
            def.steps.len()
        );
        Ok(def)
    }
}

/// Validate with default limits
pub fn validate(text: &str) -> Result<WorkflowDefinition, DefinitionError> {
    Validator::default().validate_str(text)
}

// ---------------------------------------------------------------------------
// Suggestions
// ---------------------------------------------------------------------------

/// Closest candidate by edit distance, when it is close enough to be a typo
pub(crate) fn suggest<'a, I>(name: &str, candidates: I) -> Option<String>
where
    I: IntoIterator<Item = &'a str>,
{
    let limit = (name.chars().count() / 2).clamp(1, 3);
    candidates
        .into_iter()
        .map(|c| (levenshtein(name, c), c))
        .filter(|(d, _)| *d <= limit)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c.to_string())
}

fn levenshtein(a: &str, b: &str) -> usize {
    let b: Vec<char> = b.chars().collect();
    let mut prev: Vec<usize> = (0..=b.len()).collect();
    for (i, ca) in a.chars().enumerate() {
        let mut row = vec![i + 1; b.len() + 1];
        for (j, cb) in b.iter().enumerate() {
            let cost = usize::from(ca != *cb);
            row[j + 1] = (prev[j] + cost).min(prev[j + 1] + 1).min(row[j] + 1);
        }
        prev = row;
    }
    prev[b.len()]
}

// ---------------------------------------------------------------------------
// Layers 1 and 2: raw document structure
// ---------------------------------------------------------------------------

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{}.{}", path, key)
    }
}

fn kind_of(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Field checks over one object of the raw document
struct Fields<'a, 'i> {
    obj: &'a Map<String, Value>,
    path: &'a str,
    issues: &'i mut Vec<ValidationIssue>,
}

impl<'a, 'i> Fields<'a, 'i> {
    fn missing(&mut self, key: &str) {
        self.issues.push(ValidationIssue::new(
            join(self.path, key),
            "missing_field",
            format!("'{}' is required", key),
        ));
    }

    fn wrong(&mut self, key: &str, expected: &str, got: &Value) {
        self.issues.push(ValidationIssue::new(
            join(self.path, key),
            "invalid_type",
            format!("'{}' must be {}, got {}", key, expected, kind_of(got)),
        ));
    }

    fn get(&mut self, key: &str, required: bool) -> Option<&'a Value> {
        match self.obj.get(key) {
            Some(v) => Some(v),
            None => {
                if required {
                    self.missing(key);
                }
                None
            }
        }
    }

    fn string(&mut self, key: &str, required: bool) -> Option<&'a str> {
        let v = self.get(key, required)?;
        match v.as_str() {
            Some(s) if required && s.trim().is_empty() => {
                self.issues.push(ValidationIssue::new(
                    join(self.path, key),
                    "missing_field",
                    format!("'{}' must not be empty", key),
                ));
                None
            }
            Some(s) => Some(s),
            None => {
                self.wrong(key, "a string", v);
                None
            }
        }
    }

    fn boolean(&mut self, key: &str) {
        if let Some(v) = self.get(key, false) {
            if !v.is_boolean() {
                self.wrong(key, "a boolean", v);
            }
        }
    }

    fn number(&mut self, key: &str) {
        if let Some(v) = self.get(key, false) {
            if !v.is_number() {
                self.wrong(key, "a number", v);
            }
        }
    }

    fn positive_int(&mut self, key: &str) {
        if let Some(v) = self.get(key, false) {
            if !v.as_u64().is_some_and(|n| n > 0) {
                self.wrong(key, "a positive integer", v);
            }
        }
    }

    fn non_negative_int(&mut self, key: &str) {
        if let Some(v) = self.get(key, false) {
            if v.as_u64().is_none() {
                self.wrong(key, "a non-negative integer", v);
            }
        }
    }

    fn object(&mut self, key: &str, required: bool) -> Option<&'a Map<String, Value>> {
        let v = self.get(key, required)?;
        match v.as_object() {
            Some(o) => Some(o),
            None => {
                self.wrong(key, "an object", v);
                None
            }
        }
    }

    fn array(&mut self, key: &str, required: bool) -> Option<&'a Vec<Value>> {
        let v = self.get(key, required)?;
        match v.as_array() {
            Some(a) => Some(a),
            None => {
                self.wrong(key, "an array", v);
                None
            }
        }
    }

    fn string_list(&mut self, key: &str) {
        if let Some(items) = self.array(key, false) {
            for (i, item) in items.iter().enumerate() {
                if !item.is_string() {
                    self.issues.push(ValidationIssue::new(
                        format!("{}[{}]", join(self.path, key), i),
                        "invalid_type",
                        format!("'{}' entries must be strings, got {}", key, kind_of(item)),
                    ));
                }
            }
        }
    }

    fn string_map(&mut self, key: &str) {
        if let Some(map) = self.object(key, false) {
            for (k, v) in map {
                if !v.is_string() {
                    self.issues.push(ValidationIssue::new(
                        join(&join(self.path, key), k),
                        "invalid_type",
                        format!("'{}' values must be strings, got {}", key, kind_of(v)),
                    ));
                }
            }
        }
    }

    fn one_of(&mut self, key: &str, allowed: &[&str]) {
        if let Some(s) = self.string(key, false) {
            if !allowed.contains(&s) {
                let mut issue = ValidationIssue::new(
                    join(self.path, key),
                    "invalid_type",
                    format!("'{}' must be one of {}, got '{}'", key, allowed.join(", "), s),
                );
                if let Some(hint) = suggest(s, allowed.iter().copied()) {
                    issue = issue.with_suggestion(hint);
                }
                self.issues.push(issue);
            }
        }
    }

    fn unknown_keys(&mut self, allowed: &[&str]) {
        for key in self.obj.keys() {
            if allowed.contains(&key.as_str()) {
                continue;
            }
            let mut issue = ValidationIssue::new(
                join(self.path, key),
                "unknown_field",
                format!("unknown field '{}'", key),
            );
            if let Some(hint) = suggest(key, allowed.iter().copied()) {
                issue = issue.with_suggestion(hint);
            }
            self.issues.push(issue);
        }
    }
}

fn check_document(doc: &Value, issues: &mut Vec<ValidationIssue>) {
    let Some(root) = doc.as_object() else {
        issues.push(ValidationIssue::new(
            "",
            "invalid_type",
            format!("workflow document must be an object, got {}", kind_of(doc)),
        ));
        return;
    };

    let mut f = Fields {
        obj: root,
        path: "",
        issues: &mut *issues,
    };
    f.unknown_keys(ROOT_KEYS);
    f.string("name", true);
    match f.get("version", true) {
        Some(Value::String(s)) if !s.trim().is_empty() => {}
        Some(Value::Number(_)) | None => {}
        Some(other) => f.wrong("version", "a non-empty string or number", other),
    }
    f.string("description", false);
    let steps = f.array("steps", true);
    let inputs = f.object("inputs", false);
    f.object("initial_state", false);
    let computed = f.object("computed", false);
    let tasks = f.object("tasks", false);

    if let Some(steps) = steps {
        check_step_list(steps, "steps", issues);
    }
    if let Some(inputs) = inputs {
        for (name, spec) in inputs {
            check_input_spec(spec, &join("inputs", name), issues);
        }
    }
    if let Some(computed) = computed {
        for (name, def) in computed {
            let path = join("computed", name);
            match def {
                Value::String(_) => {}
                Value::Object(obj) => {
                    let mut f = Fields {
                        obj,
                        path: &path,
                        issues: &mut *issues,
                    };
                    f.unknown_keys(&["expr", "depends_on"]);
                    f.string("expr", true);
                    f.string_list("depends_on");
                }
                other => issues.push(ValidationIssue::new(
                    path,
                    "invalid_type",
                    format!(
                        "computed field must be an expression string or object, got {}",
                        kind_of(other)
                    ),
                )),
            }
        }
    }
    if let Some(tasks) = tasks {
        for (name, steps) in tasks {
            let path = join("tasks", name);
            match steps.as_array() {
                Some(list) => check_step_list(list, &path, issues),
                None => issues.push(ValidationIssue::new(
                    path,
                    "invalid_type",
                    format!("task must be a list of steps, got {}", kind_of(steps)),
                )),
            }
        }
    }
}

fn check_input_spec(spec: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
    let Some(obj) = spec.as_object() else {
        issues.push(ValidationIssue::new(
            path,
            "invalid_type",
            format!("input spec must be an object, got {}", kind_of(spec)),
        ));
        return;
    };
    let mut f = Fields {
        obj,
        path,
        issues: &mut *issues,
    };
    f.unknown_keys(INPUT_KEYS);
    if f.get("type", true).is_some() {
        f.one_of("type", INPUT_TYPES);
    }
    f.boolean("required");
    f.string("description", false);
    f.number("minimum");
    f.number("maximum");
    f.non_negative_int("min_length");
    f.non_negative_int("max_length");
    f.array("enum", false);
    if let Some(pattern) = f.string("pattern", false) {
        if let Err(e) = RegexBuilder::new(pattern)
            .size_limit(PATTERN_SIZE_LIMIT)
            .build()
        {
            issues.push(ValidationIssue::new(
                join(path, "pattern"),
                "invalid_pattern",
                format!("pattern does not compile: {}", e),
            ));
        }
    }
}

fn check_step_list(steps: &[Value], path: &str, issues: &mut Vec<ValidationIssue>) {
    if steps.is_empty() {
        issues.push(ValidationIssue::new(
            path,
            "missing_field",
            "step list must contain at least one step",
        ));
    }
    for (i, step) in steps.iter().enumerate() {
        check_step(step, &format!("{}[{}]", path, i), issues);
    }
}

fn check_step(step: &Value, path: &str, issues: &mut Vec<ValidationIssue>) {
    let Some(obj) = step.as_object() else {
        issues.push(ValidationIssue::new(
            path,
            "invalid_type",
            format!("step must be an object, got {}", kind_of(step)),
        ));
        return;
    };

    let mut f = Fields {
        obj,
        path,
        issues: &mut *issues,
    };
    f.string("id", true);
    f.string_list("needs_state");
    f.string("output_to", false);
    f.string("when", false);

    let Some(step_type) = f.string("type", true) else {
        return;
    };
    if !STEP_TYPES.contains(&step_type) {
        let mut issue = ValidationIssue::new(
            join(path, "type"),
            "unknown_step_type",
            format!("unknown step type '{}'", step_type),
        );
        if let Some(hint) = suggest(step_type, STEP_TYPES.iter().copied()) {
            issue = issue.with_suggestion(hint);
        }
        issues.push(issue);
        return;
    }

    let allowed: Vec<&str> = COMMON_STEP_KEYS
        .iter()
        .chain(type_keys(step_type))
        .copied()
        .collect();
    f.unknown_keys(&allowed);

    let mut children: Vec<(&str, &Vec<Value>)> = Vec::new();
    match step_type {
        "branch" => {
            f.string("condition", true);
            if let Some(then) = f.array("then", true) {
                children.push(("then", then));
            }
            if let Some(otherwise) = f.array("else", false) {
                if !otherwise.is_empty() {
                    children.push(("else", otherwise));
                }
            }
        }
        "state_update" => {
            if let Some(updates) = f.object("updates", true) {
                if updates.is_empty() {
                    f.missing("updates");
                }
            }
        }
        "iterate" => {
            f.string("items", true);
            let steps = f.array("steps", false);
            let task = f.string("task", false);
            match (steps, task) {
                (Some(_), Some(_)) => f.issues.push(ValidationIssue::new(
                    path,
                    "invalid_type",
                    "iterate step takes either 'steps' or 'task', not both",
                )),
                (None, None) if !obj.contains_key("steps") && !obj.contains_key("task") => {
                    f.issues.push(
                        ValidationIssue::new(
                            join(path, "steps"),
                            "missing_field",
                            "iterate step needs 'steps' or 'task'",
                        )
                        .with_suggestion("steps"),
                    )
                }
                (Some(steps), None) => children.push(("steps", steps)),
                _ => {}
            }
            f.one_of("mode", &["parallel", "sequential"]);
            f.positive_int("max_concurrency");
            f.string("as", false);
            f.object("inputs", false);
            f.string("executor", false);
            f.boolean("continue_on_error");
        }
        "terminate" => {
            f.one_of("status", &["success", "failure"]);
            f.string("message", false);
        }
        "shell" => {
            f.string("command", true);
            f.string("cwd", false);
            f.string_map("env");
            f.positive_int("timeout");
        }
        "tool_call" => {
            f.string("tool", true);
            f.object("args", false);
            f.positive_int("timeout");
        }
        "prompt" => {
            f.string("prompt", true);
            f.object("output_schema", false);
            f.positive_int("timeout");
        }
        "wait" => {
            f.string("message", true);
            f.positive_int("timeout");
        }
        "delegate" => {
            f.string("agent", true);
            f.string("task", true);
            f.object("inputs", false);
            f.positive_int("timeout");
        }
        _ => {}
    }

    for (key, list) in children {
        check_step_list(list, &join(path, key), issues);
    }
}

// ---------------------------------------------------------------------------
// Layer 3: references
// ---------------------------------------------------------------------------

/// Names visible to the steps of one block
#[derive(Debug, Clone, Default)]
struct RefScope {
    /// State fields that exist by the time the step runs
    known: BTreeSet<String>,
    loop_vars: BTreeSet<String>,
    input_names: BTreeSet<String>,
}

/// A task body to check under the context of the iterate step using it
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct TaskUse {
    task: String,
    alias: String,
    input_names: BTreeSet<String>,
    depth: usize,
}

struct ReferenceWalker<'d> {
    def: &'d WorkflowDefinition,
    max_depth: usize,
    issues: Vec<ValidationIssue>,
    task_queue: Vec<TaskUse>,
}

impl<'d> ReferenceWalker<'d> {
    fn new(def: &'d WorkflowDefinition, max_depth: usize) -> Self {
        Self {
            def,
            max_depth,
            issues: Vec::new(),
            task_queue: Vec::new(),
        }
    }

    fn run(&mut self) {
        let def = self.def;
        let mut scope = RefScope {
            known: def
                .initial_state
                .field_names()
                .chain(def.computed.keys())
                .cloned()
                .collect(),
            loop_vars: BTreeSet::new(),
            input_names: def.inputs.keys().cloned().collect(),
        };
        self.walk_block(&def.steps, "steps", &mut scope, 0);

        // Tasks are checked once per distinct context they are used in
        let mut done: BTreeSet<TaskUse> = BTreeSet::new();
        while let Some(usage) = self.task_queue.pop() {
            if !done.insert(usage.clone()) {
                continue;
            }
            if let Some(steps) = def.tasks.get(&usage.task) {
                let mut scope = child_scope(&usage.alias, usage.input_names.clone());
                self.walk_block(steps, &join("tasks", &usage.task), &mut scope, usage.depth);
            }
        }
        for (name, steps) in &def.tasks {
            if !done.iter().any(|u| &u.task == name) {
                let mut scope = child_scope("item", BTreeSet::new());
                self.walk_block(steps, &join("tasks", name), &mut scope, 1);
            }
        }
    }

    fn finish(self) -> Vec<ValidationIssue> {
        let mut seen = BTreeSet::new();
        self.issues
            .into_iter()
            .filter(|i| seen.insert((i.path.clone(), i.code.clone(), i.message.clone())))
            .collect()
    }

    fn push(&mut self, issue: ValidationIssue) {
        self.issues.push(issue);
    }

    fn walk_block(&mut self, steps: &'d [Step], path: &str, scope: &mut RefScope, depth: usize) {
        let mut terminated = false;
        for (i, step) in steps.iter().enumerate() {
            let step_path = format!("{}[{}]", path, i);
            if depth > self.max_depth {
                self.push(ValidationIssue::new(
                    step_path,
                    "nesting_too_deep",
                    format!("steps are nested deeper than {} levels", self.max_depth),
                ));
                return;
            }
            if terminated {
                self.push(ValidationIssue::new(
                    &step_path,
                    "unreachable_step",
                    format!("step '{}' follows an unconditional terminate", step.id),
                ));
                terminated = false;
            }
            self.check_step(step, &step_path, scope, depth);
            if matches!(step.kind, StepKind::Terminate(_)) && step.when.is_none() {
                terminated = true;
            }
        }
    }

    fn check_step(&mut self, step: &'d Step, path: &str, scope: &mut RefScope, depth: usize) {
        let declared: BTreeSet<&str> = step.needs_state.iter().map(String::as_str).collect();

        for (i, field) in step.needs_state.iter().enumerate() {
            if !scope.known.contains(field) {
                let mut issue = ValidationIssue::new(
                    format!("{}.needs_state[{}]", path, i),
                    "unknown_state_field",
                    format!("'{}' is not a known state field at this point", field),
                );
                if let Some(hint) = suggest(field, scope.known.iter().map(String::as_str)) {
                    issue = issue.with_suggestion(hint);
                }
                self.push(issue);
            }
        }

        for (label, source) in step.sources() {
            self.check_source(&join(path, &label), source, &declared, scope);
        }

        let mut written = Vec::new();
        if let Some(target) = &step.output_to {
            if let Some(field) = self.check_target(&join(path, "output_to"), target) {
                written.push(field);
            }
        }

        match &step.kind {
            StepKind::StateUpdate(update) => {
                for key in update.updates.keys() {
                    let target_path = join(&join(path, "updates"), key);
                    if let Some(field) = self.check_target(&target_path, key) {
                        written.push(field);
                    }
                }
            }
            StepKind::Branch(branch) => {
                let mut then_scope = scope.clone();
                self.walk_block(&branch.then, &join(path, "then"), &mut then_scope, depth + 1);
                let mut else_scope = scope.clone();
                if !branch.otherwise.is_empty() {
                    self.walk_block(
                        &branch.otherwise,
                        &join(path, "else"),
                        &mut else_scope,
                        depth + 1,
                    );
                }
                scope.known.extend(then_scope.known);
                scope.known.extend(else_scope.known);
            }
            StepKind::Iterate(it) => {
                let input_names: BTreeSet<String> = it.inputs.keys().cloned().collect();
                if let Some(steps) = &it.steps {
                    let mut child = child_scope(&it.alias, input_names);
                    self.walk_block(steps, &join(path, "steps"), &mut child, depth + 1);
                } else if let Some(task) = &it.task {
                    if self.def.tasks.contains_key(task) {
                        self.task_queue.push(TaskUse {
                            task: task.clone(),
                            alias: it.alias.clone(),
                            input_names,
                            depth: depth + 1,
                        });
                    } else {
                        let mut issue = ValidationIssue::new(
                            join(path, "task"),
                            "unknown_task",
                            format!("task '{}' is not defined", task),
                        );
                        if let Some(hint) =
                            suggest(task, self.def.tasks.keys().map(String::as_str))
                        {
                            issue = issue.with_suggestion(hint);
                        }
                        self.push(issue);
                    }
                }
            }
            _ => {}
        }

        scope.known.extend(written);
    }

    fn check_source(
        &mut self,
        path: &str,
        source: Source<'_>,
        declared: &BTreeSet<&str>,
        scope: &RefScope,
    ) {
        let refs = match source.references() {
            Ok(refs) => refs,
            Err(e) => {
                self.push(ValidationIssue::new(path, "expression_syntax", e.to_string()));
                return;
            }
        };

        for name in source_calls(&source) {
            if !is_function(&name) {
                let mut issue = ValidationIssue::new(
                    path,
                    "unknown_reference",
                    format!("unknown function '{}'", name),
                );
                if let Some(hint) = suggest(&name, function_names()) {
                    issue = issue.with_suggestion(hint);
                }
                self.push(issue);
            }
        }

        for name in refs {
            if scope.loop_vars.contains(&name) || name == "inputs" || declared.contains(name.as_str())
            {
                continue;
            }
            if scope.known.contains(&name) {
                self.push(
                    ValidationIssue::new(
                        path,
                        "undeclared_state_read",
                        format!("reads state field '{}' without declaring it in needs_state", name),
                    )
                    .with_suggestion(format!("add '{}' to needs_state", name)),
                );
                continue;
            }
            if scope.input_names.contains(&name) {
                continue;
            }
            let candidates = scope
                .known
                .iter()
                .chain(scope.loop_vars.iter())
                .chain(scope.input_names.iter())
                .map(String::as_str);
            let mut issue = ValidationIssue::new(
                path,
                "unknown_reference",
                format!("'{}' is not a state field, input or loop variable", name),
            );
            if let Some(hint) = suggest(&name, candidates) {
                issue = issue.with_suggestion(hint);
            }
            self.push(issue);
        }
    }

    /// Check a write target; returns the top-level field it creates
    fn check_target(&mut self, path: &str, target: &str) -> Option<String> {
        match StatePath::writable(target) {
            Ok(p) => Some(p.field().to_string()),
            Err(StateError::ComputedNotWritable(_)) => {
                self.push(ValidationIssue::new(
                    path,
                    "computed_not_writable",
                    format!("'{}' targets the computed tier, which is read-only", target),
                ));
                None
            }
            Err(_) => {
                self.push(
                    ValidationIssue::new(
                        path,
                        "missing_tier",
                        format!("'{}' must start with raw. or session.", target),
                    )
                    .with_suggestion(format!("raw.{}", target.trim_start_matches("state."))),
                );
                None
            }
        }
    }
}

fn child_scope(alias: &str, input_names: BTreeSet<String>) -> RefScope {
    RefScope {
        known: BTreeSet::new(),
        loop_vars: [alias, "index", "total"]
            .into_iter()
            .map(str::to_string)
            .collect(),
        input_names,
    }
}

fn source_calls(source: &Source<'_>) -> BTreeSet<String> {
    fn json_calls(v: &Value, out: &mut BTreeSet<String>) {
        match v {
            Value::String(s) if super::expression::is_template(s) => {
                out.extend(ExpressionEngine::calls(s).unwrap_or_default());
            }
            Value::Array(items) => items.iter().for_each(|i| json_calls(i, out)),
            Value::Object(obj) => obj.values().for_each(|i| json_calls(i, out)),
            _ => {}
        }
    }

    match source {
        Source::Expr(s) => ExpressionEngine::calls(s).unwrap_or_default(),
        Source::Text(s) if !super::expression::is_template(s) => BTreeSet::new(),
        Source::Text(s) => ExpressionEngine::calls(s).unwrap_or_default(),
        Source::Json(v) => {
            let mut out = BTreeSet::new();
            json_calls(v, &mut out);
            out
        }
    }
}

// ---------------------------------------------------------------------------
// Layer 4: semantics
// ---------------------------------------------------------------------------

fn check_duplicate_ids(def: &WorkflowDefinition, issues: &mut Vec<ValidationIssue>) {
    fn collect<'a>(
        steps: &'a [Step],
        path: &str,
        seen: &mut BTreeMap<&'a str, String>,
        issues: &mut Vec<ValidationIssue>,
    ) {
        for (i, step) in steps.iter().enumerate() {
            let step_path = format!("{}[{}]", path, i);
            if let Some(first) = seen.get(step.id.as_str()) {
                issues.push(ValidationIssue::new(
                    &step_path,
                    "duplicate_step_id",
                    format!("step id '{}' is already used at {}", step.id, first),
                ));
            } else {
                seen.insert(&step.id, step_path.clone());
            }
            for (key, children) in step.children() {
                collect(children, &join(&step_path, key), seen, issues);
            }
        }
    }

    let mut seen = BTreeMap::new();
    collect(&def.steps, "steps", &mut seen, issues);
    for (name, steps) in &def.tasks {
        collect(steps, &join("tasks", name), &mut seen, issues);
    }
}

fn check_unused_tasks(def: &WorkflowDefinition, issues: &mut Vec<ValidationIssue>) {
    fn used<'a>(steps: &'a [Step], out: &mut BTreeSet<&'a str>) {
        for step in steps {
            if let StepKind::Iterate(it) = &step.kind {
                if let Some(task) = &it.task {
                    out.insert(task);
                }
            }
            for (_, children) in step.children() {
                used(children, out);
            }
        }
    }

    let mut referenced = BTreeSet::new();
    used(&def.steps, &mut referenced);
    for steps in def.tasks.values() {
        used(steps, &mut referenced);
    }
    for name in def.tasks.keys() {
        if !referenced.contains(name.as_str()) {
            issues.push(ValidationIssue::new(
                join("tasks", name),
                "unused_task",
                format!("task '{}' is never referenced by an iterate step", name),
            ));
        }
    }
}

/// Build the computed-field graph, reporting cycles and bad references
fn check_computed(def: &WorkflowDefinition, issues: &mut Vec<ValidationIssue>) -> Option<ComputedGraph> {
    if def.computed.is_empty() {
        return Some(ComputedGraph::default());
    }

    let graph = match ComputedGraph::build(&def.computed) {
        Ok(graph) => graph,
        Err(ComputedGraphError::Cycle(cycle)) => {
            issues.push(ValidationIssue::new(
                join("computed", &cycle[0]),
                "computed_cycle",
                format!("computed fields form a cycle: {}", cycle.join(" -> ")),
            ));
            return None;
        }
        Err(ComputedGraphError::Expression { field, source }) => {
            issues.push(ValidationIssue::new(
                join("computed", &field),
                "expression_syntax",
                source.to_string(),
            ));
            return None;
        }
    };

    // Computed fields may read anything the workflow can ever write
    let mut writable: BTreeSet<String> = def
        .initial_state
        .field_names()
        .chain(def.computed.keys())
        .chain(def.inputs.keys())
        .cloned()
        .collect();
    writable.insert("inputs".to_string());
    collect_written(&def.steps, &mut writable);
    for steps in def.tasks.values() {
        collect_written(steps, &mut writable);
    }

    for (name, field) in &def.computed {
        let refs = ExpressionEngine::references(&field.expr).unwrap_or_default();
        for r in refs.iter().filter(|r| !writable.contains(*r)) {
            let mut issue = ValidationIssue::new(
                join("computed", name),
                "unknown_reference",
                format!("computed field '{}' reads unknown field '{}'", name, r),
            );
            if let Some(hint) = suggest(r, writable.iter().map(String::as_str)) {
                issue = issue.with_suggestion(hint);
            }
            issues.push(issue);
        }
    }
    Some(graph)
}

fn collect_written(steps: &[Step], out: &mut BTreeSet<String>) {
    for step in steps {
        if let Some(p) = step.output_to.as_deref().and_then(|t| StatePath::parse(t).ok()) {
            out.insert(p.field().to_string());
        }
        if let StepKind::StateUpdate(update) = &step.kind {
            for key in update.updates.keys() {
                if let Ok(p) = StatePath::parse(key) {
                    out.insert(p.field().to_string());
                }
            }
        }
        for (_, children) in step.children() {
            collect_written(children, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codes(yaml: &str) -> Vec<String> {
        match validate(yaml) {
            Ok(_) => Vec::new(),
            Err(e) => e.issues().iter().map(|i| i.code.clone()).collect(),
        }
    }

    fn issues(yaml: &str) -> Vec<ValidationIssue> {
        validate(yaml).unwrap_err().issues().to_vec()
    }

    #[test]
    fn test_valid_workflow() {
        let def = validate(
            r#"
name: scoring
version: "1.0"
initial_state:
  raw:
    score: 72
computed:
  passed: score >= 70
steps:
  - id: check
    type: branch
    needs_state: [passed]
    condition: passed
    output_to: raw.check_result
    then:
      - id: ok
        type: terminate
        value: "'pass'"
    else:
      - id: nope
        type: terminate
        status: failure
        message: too low
"#,
        )
        .unwrap();
        assert_eq!(def.name, "scoring");
        assert_eq!(def.computed_graph.order(), &["passed".to_string()]);
    }

    #[test]
    fn test_parse_error() {
        assert!(matches!(
            validate("name: [unclosed").unwrap_err(),
            DefinitionError::Parse(_)
        ));
    }

    #[test]
    fn test_structure_issues_aggregate() {
        let found = issues(
            r#"
name: wf
stepz: []
steps:
  - id: a
    type: shel
  - type: wait
"#,
        );
        let codes: Vec<&str> = found.iter().map(|i| i.code.as_str()).collect();
        assert!(codes.contains(&"unknown_field"));
        assert!(codes.contains(&"missing_field"));
        assert!(codes.contains(&"unknown_step_type"));

        let typo = found.iter().find(|i| i.code == "unknown_step_type").unwrap();
        assert_eq!(typo.path, "steps[0].type");
        assert_eq!(typo.suggestion.as_deref(), Some("shell"));

        let unknown = found.iter().find(|i| i.code == "unknown_field").unwrap();
        assert_eq!(unknown.suggestion.as_deref(), Some("steps"));
    }

    #[test]
    fn test_per_type_fields() {
        let found = issues(
            r#"
name: wf
version: 1
steps:
  - id: a
    type: shell
    comand: ls
  - id: b
    type: iterate
    items: xs
    steps: []
    mode: random
"#,
        );
        let paths: Vec<(&str, &str)> = found
            .iter()
            .map(|i| (i.path.as_str(), i.code.as_str()))
            .collect();
        assert!(paths.contains(&("steps[0].command", "missing_field")));
        assert!(paths.contains(&("steps[0].comand", "unknown_field")));
        assert!(paths.contains(&("steps[1].steps", "missing_field")));
        assert!(paths.contains(&("steps[1].mode", "invalid_type")));
    }

    #[test]
    fn test_invalid_input_pattern() {
        let found = issues(
            r#"
name: wf
version: 1
inputs:
  slug:
    type: string
    pattern: "([a-z"
steps:
  - id: done
    type: terminate
"#,
        );
        assert_eq!(found[0].code, "invalid_pattern");
        assert_eq!(found[0].path, "inputs.slug.pattern");
    }

    #[test]
    fn test_undeclared_state_read() {
        let found = issues(
            r#"
name: wf
version: 1
initial_state:
  score: 10
steps:
  - id: check
    type: branch
    condition: score > 5
    then:
      - id: done
        type: terminate
"#,
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "undeclared_state_read");
        assert_eq!(found[0].path, "steps[0].condition");
    }

    #[test]
    fn test_reference_issues() {
        let found = issues(
            r#"
name: wf
version: 1
inputs:
  name:
    type: string
initial_state:
  total: 0
steps:
  - id: a
    type: state_update
    needs_state: [totl]
    updates:
      total: "1"
      computed.x: "2"
  - id: b
    type: shell
    command: "echo {{ nmae }} {{ lenn(name) }}"
    output_to: result
  - id: c
    type: iterate
    items: "[1]"
    task: missing_task
  - id: d
    type: wait
    message: "{{ (a }}"
"#,
        );
        let codes: BTreeSet<&str> = found.iter().map(|i| i.code.as_str()).collect();
        for expected in [
            "unknown_state_field",
            "missing_tier",
            "computed_not_writable",
            "unknown_reference",
            "unknown_task",
            "expression_syntax",
        ] {
            assert!(codes.contains(expected), "missing {}: {:?}", expected, found);
        }
        let typo = found
            .iter()
            .find(|i| i.message.contains("'nmae'"))
            .unwrap();
        assert_eq!(typo.suggestion.as_deref(), Some("name"));
    }

    #[test]
    fn test_output_to_makes_field_known() {
        assert!(codes(
            r#"
name: wf
version: 1
steps:
  - id: fetch
    type: tool_call
    tool: search
    args:
      q: rust
    output_to: state.raw.results
  - id: count
    type: state_update
    needs_state: [results]
    updates:
      raw.count: len(results)
"#,
        )
        .is_empty());
    }

    #[test]
    fn test_child_scope_is_isolated() {
        let found = issues(
            r#"
name: wf
version: 1
initial_state:
  secret: 1
steps:
  - id: each
    type: iterate
    items: "[1, 2]"
    inputs:
      factor: "3"
    steps:
      - id: calc
        type: terminate
        value: item * factor + index + secret
"#,
        );
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].code, "unknown_reference");
        assert!(found[0].message.contains("secret"));
    }

    #[test]
    fn test_semantic_issues() {
        let found = issues(
            r#"
name: wf
version: 1
computed:
  a: b + 1
  b: a + 1
steps:
  - id: x
    type: terminate
  - id: x
    type: wait
    message: never
tasks:
  orphan:
    - id: lonely
      type: terminate
"#,
        );
        let codes: BTreeSet<&str> = found.iter().map(|i| i.code.as_str()).collect();
        assert!(codes.contains("duplicate_step_id"));
        assert!(codes.contains("unreachable_step"));
        assert!(codes.contains("unused_task"));
        assert!(codes.contains("computed_cycle"));

        let cycle = found.iter().find(|i| i.code == "computed_cycle").unwrap();
        assert!(cycle.message.contains("a -> b -> a"));
    }

    #[test]
    fn test_nesting_limit() {
        let config = EngineConfig {
            max_nesting_depth: 1,
            ..EngineConfig::default()
        };
        let err = Validator::new(&config)
            .validate_str(
                r#"
name: wf
version: 1
steps:
  - id: l1
    type: branch
    condition: "true"
    then:
      - id: l2
        type: branch
        condition: "true"
        then:
          - id: l3
            type: terminate
"#,
            )
            .unwrap_err();
        assert_eq!(err.issues()[0].code, "nesting_too_deep");
        assert_eq!(err.issues()[0].path, "steps[0].then[0].then[0]");
    }

    #[test]
    fn test_suggest() {
        assert_eq!(
            suggest("brnch", STEP_TYPES.iter().copied()).as_deref(),
            Some("branch")
        );
        assert_eq!(suggest("zzzzzz", STEP_TYPES.iter().copied()), None);
        assert_eq!(levenshtein("kitten", "sitting"), 3);
    }
}
