// SPDX-License-Identifier: MIT

//! Step dispatcher
//!
//! Walks an instance's cursor, running local steps in place until the
//! instance suspends on an external step, spawns iteration children, or
//! finishes. Every step goes through the same gate first:
//!
//! 1. nesting ceiling
//! 2. access pre-check: no expression on the step may name a state field
//!    missing from `needs_state`
//! 3. `when` guard
//!
//! so a step that would read undeclared state fails before any side effect.

use once_cell::sync::Lazy;
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;

use super::instance::{DispatchState, Frame, InstanceStatus, IterationFrame, WorkflowInstance};
use super::iteration;
use super::pending::{ActionType, PendingAction};
use crate::config::EngineConfig;
use crate::error::StepError;
use crate::workflow::expression::{truthy, type_name, ExpressionEngine, LoopContext, Scope};
use crate::workflow::state::{ComputedGraph, StateStore};
use crate::workflow::types::{BlockRef, Step, StepKind, TerminateStatus, WorkflowDefinition};

/// Children have no computed fields of their own
static NO_COMPUTED: Lazy<ComputedGraph> = Lazy::new(ComputedGraph::default);

/// Why `advance` stopped
#[derive(Debug)]
pub enum Advance {
    /// Waiting on an external result; `pending` is set on the instance
    Suspended,
    /// An iterate step created these queued children
    Spawned(Vec<WorkflowInstance>),
    /// Parked on an iteration whose children have not all settled
    AwaitChildren,
    /// Completed or failed
    Finished,
}

pub struct Dispatcher<'a> {
    def: &'a WorkflowDefinition,
    expressions: &'a ExpressionEngine,
    config: &'a EngineConfig,
}

impl<'a> Dispatcher<'a> {
    pub fn new(
        def: &'a WorkflowDefinition,
        expressions: &'a ExpressionEngine,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            def,
            expressions,
            config,
        }
    }

    /// Run steps until the instance can make no further progress on its own
    pub fn advance(&self, inst: &mut WorkflowInstance) -> Advance {
        if inst.is_finished() {
            return Advance::Finished;
        }
        loop {
            match self.step(inst) {
                Ok(Some(advance)) => return advance,
                Ok(None) => {}
                Err(e) => {
                    inst.fail(&e);
                    return Advance::Finished;
                }
            }
        }
    }

    /// Apply an external step's validated payload and move past the step
    pub fn resume(
        &self,
        inst: &mut WorkflowInstance,
        step_id: &str,
        payload: Value,
    ) -> Result<(), StepError> {
        inst.consumed.insert(step_id.to_string());
        inst.pending = None;
        if let Some(step) = self.def.find_step(step_id) {
            self.write_output(inst, step, payload)?;
        }
        advance_index(inst);
        inst.status = InstanceStatus::Running;
        inst.phase = DispatchState::Ready;
        inst.record(Some(step_id), "resumed");
        Ok(())
    }

    /// Collect settled children into the iterate step's output and move on
    ///
    /// `children` must be the frame's children in item order.
    pub fn finish_iteration(
        &self,
        inst: &mut WorkflowInstance,
        children: &[&WorkflowInstance],
    ) -> Result<(), StepError> {
        let Some(Frame::Iteration(frame)) = inst.cursor.pop() else {
            return Ok(());
        };
        inst.pending = None;
        inst.status = InstanceStatus::Running;

        let (results, failed) = iteration::aggregate(children);
        if !failed.is_empty() && !frame.continue_on_error {
            return Err(StepError::ChildFailures {
                step_id: frame.step_id,
                failed,
            });
        }
        if let Some(step) = self.def.find_step(&frame.step_id) {
            self.write_output(inst, step, results)?;
        }
        inst.record(
            Some(&frame.step_id),
            format!(
                "collected {} child result(s), {} failed",
                children.len(),
                failed.len()
            ),
        );
        advance_index(inst);
        Ok(())
    }

    fn step(&self, inst: &mut WorkflowInstance) -> Result<Option<Advance>, StepError> {
        inst.phase = DispatchState::Ready;
        let (block, index) = match inst.cursor.last() {
            None => {
                let result = Value::Object(inst.state.read());
                inst.complete(result);
                return Ok(Some(Advance::Finished));
            }
            Some(Frame::Iteration(_)) => {
                inst.status = InstanceStatus::WaitingOnChildren;
                return Ok(Some(Advance::AwaitChildren));
            }
            Some(Frame::Block { block, index }) => (block.clone(), *index),
        };

        let steps = self.def.block(&block).unwrap_or(&[]);
        let Some(step) = steps.get(index) else {
            inst.cursor.pop();
            return Ok(None);
        };

        if inst.level() > self.config.max_nesting_depth {
            return Err(StepError::NestingTooDeep {
                step_id: step.id.clone(),
                limit: self.config.max_nesting_depth,
            });
        }

        inst.phase = DispatchState::EvaluatingGuard;
        let flat = inst.state.read();
        self.check_access(step, inst, &flat)?;

        let visible = StateStore::filter(&flat, &step.needs_state);
        let hidden: BTreeSet<String> = flat
            .keys()
            .filter(|k| !step.needs_state.contains(k))
            .cloned()
            .collect();
        let inputs = inst.inputs.clone();
        let loop_context = inst.loop_context.clone();
        let scope = Scope::new(&visible, &inputs)
            .with_loop(loop_context.as_ref())
            .with_hidden(&hidden);

        if let Some(when) = &step.when {
            if !truthy(&self.eval(step, when, &scope)?) {
                log::debug!("Skipping step '{}': guard is false", step.id);
                inst.record(Some(&step.id), "skipped");
                advance_index(inst);
                return Ok(None);
            }
        }

        inst.phase = DispatchState::DispatchedLocal;
        match &step.kind {
            StepKind::Branch(branch) => {
                let taken = match self.eval(step, &branch.condition, &scope)? {
                    Value::Bool(taken) => taken,
                    other => {
                        return Err(StepError::NotBoolean {
                            step_id: step.id.clone(),
                            fragment: branch.condition.clone(),
                            got: type_name(&other).to_string(),
                        })
                    }
                };
                self.write_output(inst, step, Value::Bool(taken))?;
                advance_index(inst);

                let (block, arm, body) = if taken {
                    (BlockRef::Then(step.id.clone()), "then", &branch.then)
                } else {
                    (BlockRef::Else(step.id.clone()), "else", &branch.otherwise)
                };
                inst.record(Some(&step.id), format!("branch took {}", arm));
                if !body.is_empty() {
                    inst.cursor.push(Frame::Block { block, index: 0 });
                    inst.phase = DispatchState::BranchDescended;
                }
                Ok(None)
            }

            StepKind::StateUpdate(update) => {
                let mut batch = Vec::with_capacity(update.updates.len() + 1);
                let mut applied = Map::new();
                for (path, source) in &update.updates {
                    let value = self.eval_value(step, source, &scope)?;
                    applied.insert(path.clone(), value.clone());
                    batch.push((path.clone(), value));
                }
                // The output_to write commits or rolls back with the updates
                if let Some(target) = &step.output_to {
                    batch.push((target.clone(), Value::Object(applied)));
                }
                let written = self.apply(inst, step, &batch)?;
                inst.record(Some(&step.id), format!("updated {}", written.join(", ")));
                advance_index(inst);
                Ok(None)
            }

            StepKind::Iterate(it) => {
                let items = match self.eval(step, &it.items, &scope)? {
                    Value::Array(items) => items,
                    other => {
                        return Err(StepError::NotCollection {
                            step_id: step.id.clone(),
                            fragment: it.items.clone(),
                            got: type_name(&other).to_string(),
                        })
                    }
                };
                let mut child_inputs = Map::new();
                for (name, source) in &it.inputs {
                    child_inputs.insert(name.clone(), self.eval_value(step, source, &scope)?);
                }

                if items.is_empty() {
                    self.write_output(inst, step, json!([]))?;
                    inst.record(Some(&step.id), "no items to iterate");
                    advance_index(inst);
                    return Ok(None);
                }

                let total = items.len();
                let parent = &*inst;
                let children: Vec<WorkflowInstance> = items
                    .into_iter()
                    .enumerate()
                    .map(|(index, item)| {
                        let ctx = LoopContext {
                            alias: it.alias.clone(),
                            item,
                            index,
                            total,
                        };
                        WorkflowInstance::child(
                            parent,
                            &step.id,
                            ctx,
                            Value::Object(child_inputs.clone()),
                            it.executor.clone(),
                        )
                    })
                    .collect();
                let ids: Vec<_> = children.iter().map(|c| c.id).collect();
                inst.children.extend(ids.iter().copied());
                inst.cursor.push(Frame::Iteration(IterationFrame {
                    step_id: step.id.clone(),
                    children: ids,
                    limit: iteration::slot_limit(it, self.config),
                    executor: it.executor.clone(),
                    continue_on_error: it.continue_on_error,
                }));
                inst.status = InstanceStatus::WaitingOnChildren;
                inst.record(Some(&step.id), format!("spawned {} child(ren)", total));
                Ok(Some(Advance::Spawned(children)))
            }

            StepKind::Terminate(t) => {
                let value = match &t.value {
                    Some(source) => Some(self.eval_value(step, source, &scope)?),
                    None => None,
                };
                let message = match &t.message {
                    Some(m) => Some(self.render(step, m, &scope)?),
                    None => None,
                };
                if t.status == TerminateStatus::Failure {
                    return Err(StepError::Terminated {
                        step_id: step.id.clone(),
                        message: message
                            .unwrap_or_else(|| "terminate step reported failure".to_string()),
                        value: value.unwrap_or(Value::Null),
                    });
                }
                if let Some(v) = &value {
                    self.write_output(inst, step, v.clone())?;
                }
                inst.record(Some(&step.id), message.unwrap_or_else(|| "terminated".to_string()));
                let result = value.unwrap_or_else(|| Value::Object(inst.state.read()));
                inst.complete(result);
                Ok(Some(Advance::Finished))
            }

            StepKind::Shell(shell) => {
                let mut params = Map::new();
                params.insert(
                    "command".to_string(),
                    Value::String(self.render(step, &shell.command, &scope)?),
                );
                if let Some(cwd) = &shell.cwd {
                    params.insert("cwd".to_string(), Value::String(self.render(step, cwd, &scope)?));
                }
                let mut env = Map::new();
                for (k, v) in &shell.env {
                    env.insert(k.clone(), Value::String(self.render(step, v, &scope)?));
                }
                params.insert("env".to_string(), Value::Object(env));
                Ok(Some(self.suspend(inst, step, ActionType::Shell, Value::Object(params))))
            }

            StepKind::ToolCall(call) => {
                let args = self.render_json(step, &Value::Object(call.args.clone()), &scope)?;
                let params = json!({ "tool": call.tool, "args": args });
                Ok(Some(self.suspend(inst, step, ActionType::ToolCall, params)))
            }

            StepKind::Prompt(prompt) => {
                let mut params = Map::new();
                params.insert(
                    "prompt".to_string(),
                    Value::String(self.render(step, &prompt.prompt, &scope)?),
                );
                if let Some(schema) = &prompt.output_schema {
                    params.insert("output_schema".to_string(), schema.clone());
                }
                Ok(Some(self.suspend(inst, step, ActionType::Prompt, Value::Object(params))))
            }

            StepKind::Wait(wait) => {
                let params = json!({ "message": self.render(step, &wait.message, &scope)? });
                Ok(Some(self.suspend(inst, step, ActionType::Wait, params)))
            }

            StepKind::Delegate(delegate) => {
                let inputs = self.render_json(step, &Value::Object(delegate.inputs.clone()), &scope)?;
                let params = json!({
                    "agent": delegate.agent,
                    "task": self.render(step, &delegate.task, &scope)?,
                    "inputs": inputs,
                });
                Ok(Some(self.suspend(inst, step, ActionType::Delegate, params)))
            }
        }
    }

    fn suspend(
        &self,
        inst: &mut WorkflowInstance,
        step: &Step,
        action: ActionType,
        params: Value,
    ) -> Advance {
        let timeout = step
            .timeout()
            .unwrap_or(self.config.default_action_timeout_secs);
        log::debug!(
            "Instance {} suspended on {} step '{}'",
            inst.id,
            action,
            step.id
        );
        inst.pending = Some(PendingAction::new(inst.id, &step.id, action, params, timeout));
        inst.status = InstanceStatus::Suspended;
        inst.phase = DispatchState::DispatchedExternal;
        inst.record(Some(&step.id), format!("suspended on {}", action));
        Advance::Suspended
    }

    /// Every root identifier the step reads must be declared if it names state
    fn check_access(
        &self,
        step: &Step,
        inst: &WorkflowInstance,
        flat: &Map<String, Value>,
    ) -> Result<(), StepError> {
        let loop_names = inst
            .loop_context
            .as_ref()
            .map(LoopContext::names)
            .unwrap_or_default();
        let refs = step
            .references()
            .map_err(|e| StepError::expression(&step.id, e))?;
        for name in refs {
            if name == "inputs" || loop_names.contains(&name) || step.needs_state.contains(&name) {
                continue;
            }
            if flat.contains_key(&name) {
                return Err(StepError::StateAccess {
                    step_id: step.id.clone(),
                    field: name,
                    declared: step.needs_state.clone(),
                });
            }
        }
        Ok(())
    }

    fn eval(&self, step: &Step, source: &str, scope: &Scope<'_>) -> Result<Value, StepError> {
        self.expressions
            .evaluate(source, scope)
            .map_err(|e| StepError::expression(&step.id, e))
    }

    /// Strings are expressions, other values are literals with templates inside
    fn eval_value(&self, step: &Step, source: &Value, scope: &Scope<'_>) -> Result<Value, StepError> {
        match source {
            Value::String(s) => self.eval(step, s, scope),
            other => self.render_json(step, other, scope),
        }
    }

    fn render(&self, step: &Step, template: &str, scope: &Scope<'_>) -> Result<String, StepError> {
        self.expressions
            .render(template, scope)
            .map_err(|e| StepError::expression(&step.id, e))
    }

    fn render_json(&self, step: &Step, value: &Value, scope: &Scope<'_>) -> Result<Value, StepError> {
        self.expressions
            .render_value(value, scope)
            .map_err(|e| StepError::expression(&step.id, e))
    }

    fn graph(&self, is_child: bool) -> &'a ComputedGraph {
        if is_child {
            &NO_COMPUTED
        } else {
            &self.def.computed_graph
        }
    }

    fn apply(
        &self,
        inst: &mut WorkflowInstance,
        step: &Step,
        batch: &[(String, Value)],
    ) -> Result<Vec<String>, StepError> {
        let graph = self.graph(inst.parent.is_some());
        inst.state
            .apply(batch, graph, self.expressions, &inst.inputs)
            .map_err(|source| StepError::State {
                step_id: step.id.clone(),
                source,
            })
    }

    fn write_output(
        &self,
        inst: &mut WorkflowInstance,
        step: &Step,
        value: Value,
    ) -> Result<(), StepError> {
        if let Some(target) = &step.output_to {
            self.apply(inst, step, &[(target.clone(), value)])?;
        }
        Ok(())
    }
}

fn advance_index(inst: &mut WorkflowInstance) {
    if let Some(Frame::Block { index, .. }) = inst.cursor.last_mut() {
        *index += 1;
    }
}
