// SPDX-License-Identifier: MIT

//! Workflow engine
//!
//! Owns the instance map and ties the dispatcher, the pending table and the
//! durable backend together. One instance advances one step batch at a time
//! under the instance-map lock; launched iteration children are driven
//! concurrently with `join_all`.
//!
//! ```text
//! start ──> drive ──> Suspended ──(submit_result)──> drive ──> ... ──> Completed
//!             │
//!             └──> WaitingOnChildren ──> launch children ──> finish_iteration
//! ```

pub mod dispatcher;
pub mod instance;
pub mod iteration;
pub mod pending;
pub mod results;

pub use dispatcher::{Advance, Dispatcher};
pub use instance::{DispatchState, HistoryEntry, InstanceStatus, WorkflowInstance};
pub use pending::{ActionType, PendingAction};

use chrono::{DateTime, Utc};
use futures::future::{join_all, BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::backend::{DurableBackend, InMemoryBackend, Signal};
use crate::config::EngineConfig;
use crate::error::{
    DefinitionError, EngineError, FailureReport, StateError, StepError, ValidationIssue,
};
use crate::workflow::expression::ExpressionEngine;
use crate::workflow::inputs::validate_inputs;
use crate::workflow::state::{ComputedGraph, ComputedGraphError, StateStore};
use crate::workflow::{DefinitionCache, WorkflowDefinition, WorkflowLoader, WorkflowRegistry};
use pending::PendingTable;

/// What a caller sees after starting an instance or submitting a result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResponse {
    pub instance_id: Uuid,
    pub status: InstanceStatus,
    /// Next action someone outside the engine has to perform
    #[serde(skip_serializing_if = "Option::is_none")]
    pub action: Option<PendingAction>,
    /// Every action pending anywhere in the instance tree, `action` first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<PendingAction>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<FailureReport>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChildSummary {
    pub instance_id: Uuid,
    pub index: usize,
    pub status: InstanceStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub instance_id: Uuid,
    pub workflow: String,
    pub version: String,
    pub status: InstanceStatus,
    pub phase: DispatchState,
    pub current_step: Option<String>,
    pub pending: Option<PendingAction>,
    /// Flattened state snapshot
    pub state: Map<String, Value>,
    pub children: Vec<ChildSummary>,
    pub history: Vec<HistoryEntry>,
    pub result: Option<Value>,
    pub error: Option<FailureReport>,
}

/// Answer to a sub-agent asking what a child needs next
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NextStep {
    Action {
        action: PendingAction,
    },
    /// Nothing to do until descendants settle
    Waiting,
    /// Queued behind the iteration's slot limit
    Blocked,
    Complete {
        status: InstanceStatus,
        result: Option<Value>,
        error: Option<FailureReport>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub instance_id: Uuid,
    pub step_id: String,
    pub status: InstanceStatus,
}

enum Progress {
    Idle,
    Continue,
    Launch(Vec<Uuid>),
}

struct EngineState {
    instances: HashMap<Uuid, WorkflowInstance>,
    pending: PendingTable,
}

pub struct Engine {
    config: EngineConfig,
    expressions: ExpressionEngine,
    loader: WorkflowLoader,
    cache: DefinitionCache,
    registry: WorkflowRegistry,
    backend: Arc<dyn DurableBackend>,
    state: RwLock<EngineState>,
}

impl Engine {
    pub fn new(config: EngineConfig) -> Self {
        Self::with_backend(config, Arc::new(InMemoryBackend::new()))
    }

    pub fn with_backend(config: EngineConfig, backend: Arc<dyn DurableBackend>) -> Self {
        Self {
            expressions: ExpressionEngine::new(&config),
            loader: WorkflowLoader::new(&config),
            cache: DefinitionCache::from_config(&config),
            registry: WorkflowRegistry::new(),
            backend,
            state: RwLock::new(EngineState {
                instances: HashMap::new(),
                pending: PendingTable::new(config.pending_capacity),
            }),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn cache(&self) -> &DefinitionCache {
        &self.cache
    }

    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    // ------------------------------------------------------------------
    // Definitions
    // ------------------------------------------------------------------

    /// Register an already-built definition
    ///
    /// The computed-field graph is rebuilt here since it is not part of the
    /// serialized form.
    pub async fn register(&self, mut definition: WorkflowDefinition) -> Result<String, EngineError> {
        definition.computed_graph = ComputedGraph::build(&definition.computed).map_err(|e| {
            let code = match &e {
                ComputedGraphError::Cycle(_) => "computed_cycle",
                ComputedGraphError::Expression { .. } => "expression_syntax",
            };
            DefinitionError::Invalid(vec![ValidationIssue::new("computed", code, e.to_string())])
        })?;
        Ok(self.registry.register(Arc::new(definition)).await)
    }

    /// Validate and register a YAML or JSON document
    pub async fn register_yaml(&self, text: &str) -> Result<String, EngineError> {
        let definition = self.loader.parse_str(text)?;
        Ok(self.registry.register(Arc::new(definition)).await)
    }

    /// Load a definition file through the definition cache and register it
    pub async fn load_file<P: AsRef<Path>>(&self, path: P) -> Result<String, EngineError> {
        let definition = self.cache.get_or_load(path, &self.loader).await?;
        Ok(self.registry.register(definition).await)
    }

    async fn definition(&self, key: &str) -> Result<Arc<WorkflowDefinition>, EngineError> {
        self.registry
            .get(key)
            .await
            .ok_or_else(|| EngineError::UnknownWorkflow(key.to_string()))
    }

    async fn definition_of(&self, id: Uuid) -> Result<Arc<WorkflowDefinition>, EngineError> {
        let key = {
            let guard = self.state.read().await;
            guard
                .instances
                .get(&id)
                .map(WorkflowInstance::definition_key)
                .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))?
        };
        self.definition(&key).await
    }

    // ------------------------------------------------------------------
    // Caller API
    // ------------------------------------------------------------------

    /// Start a new instance of `reference` (`name` or `name@version`)
    pub async fn start(&self, reference: &str, inputs: Value) -> Result<StepResponse, EngineError> {
        let definition = self.definition(reference).await?;
        let inputs = validate_inputs(&definition.inputs, &inputs).map_err(EngineError::InvalidInputs)?;

        let initialized = StateStore::initialize(
            &definition.initial_state,
            &definition.computed_graph,
            &self.expressions,
            &inputs,
        );
        let mut inst = match initialized {
            Ok(state) => WorkflowInstance::root(&definition, inputs, state),
            Err(source) => {
                let field = match &source {
                    StateError::Recompute { field, .. } => field.clone(),
                    _ => "initial_state".to_string(),
                };
                let mut inst = WorkflowInstance::root(&definition, inputs, StateStore::default());
                inst.fail(&StepError::State {
                    step_id: format!("computed.{}", field),
                    source,
                });
                inst
            }
        };
        inst.record(None, "started");

        let id = inst.id;
        log::info!("Started instance {} of {}", id, inst.definition_key());
        self.backend.start(&inst).await?;
        self.state.write().await.instances.insert(id, inst);

        self.drive(id).await?;
        self.respond(id).await
    }

    /// Hand in the result of a pending external step
    ///
    /// Works for any instance in a tree; the response describes the root.
    pub async fn submit_result(
        &self,
        instance_id: Uuid,
        step_id: &str,
        result: Value,
    ) -> Result<StepResponse, EngineError> {
        self.accept_result(instance_id, step_id, result).await?;
        self.respond(instance_id).await
    }

    pub async fn query_status(&self, instance_id: Uuid) -> Result<StatusReport, EngineError> {
        self.ensure_loaded(instance_id).await?;
        let definition = self.definition_of(instance_id).await?;

        let mut report = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let inst = state
                .instances
                .get(&instance_id)
                .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))?;
            let pending = if inst.is_finished() {
                None
            } else {
                state
                    .pending
                    .get(&instance_id)
                    .or_else(|| inst.pending.clone())
            };
            let children = inst
                .children
                .iter()
                .filter_map(|c| state.instances.get(c))
                .map(|c| ChildSummary {
                    instance_id: c.id,
                    index: c.parent.as_ref().map_or(0, |p| p.index),
                    status: c.status,
                })
                .collect();
            StatusReport {
                instance_id,
                workflow: inst.workflow.clone(),
                version: inst.version.clone(),
                status: inst.status,
                phase: inst.phase,
                current_step: inst.current_step_id(&definition),
                pending,
                state: inst.state.read(),
                children,
                history: inst.history.clone(),
                result: inst.result.clone(),
                error: inst.failure.clone(),
            }
        };

        if report.pending.is_none() && report.status == InstanceStatus::Suspended {
            report.pending = self
                .backend
                .query(instance_id)
                .await?
                .and_then(|stored| stored.pending);
        }
        Ok(report)
    }

    /// Cancel an instance and every unfinished descendant
    pub async fn cancel(&self, instance_id: Uuid) -> Result<StepResponse, EngineError> {
        self.ensure_loaded(instance_id).await?;
        let cancelled = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let inst = state
                .instances
                .get(&instance_id)
                .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))?;
            if inst.is_finished() {
                return Err(EngineError::InstanceFinished {
                    instance_id: instance_id.to_string(),
                    status: inst.status.to_string(),
                });
            }

            let mut cancelled = Vec::new();
            for id in subtree(&state.instances, instance_id) {
                let Some(inst) = state.instances.get_mut(&id) else {
                    continue;
                };
                if inst.is_finished() {
                    continue;
                }
                inst.cancel();
                state.pending.remove(&id);
                cancelled.push(inst.clone());
            }
            cancelled
        };

        log::info!(
            "Cancelled instance {} ({} instance(s) in tree)",
            instance_id,
            cancelled.len()
        );
        for inst in &cancelled {
            self.backend.persist(inst).await?;
            self.backend.signal(inst.id, &Signal::Cancel).await?;
        }
        self.propagate(instance_id).await?;
        self.respond(instance_id).await
    }

    /// Fail every instance whose pending action is past its deadline
    pub async fn expire_overdue(&self) -> Result<Vec<Uuid>, EngineError> {
        self.expire_overdue_at(Utc::now()).await
    }

    pub async fn expire_overdue_at(&self, now: DateTime<Utc>) -> Result<Vec<Uuid>, EngineError> {
        let (expired, changed) = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let overdue: Vec<Uuid> = state
                .instances
                .values()
                .filter(|i| {
                    !i.is_finished() && i.pending.as_ref().is_some_and(|p| p.is_overdue(now))
                })
                .map(|i| i.id)
                .collect();

            let mut expired = Vec::new();
            let mut changed = Vec::new();
            for id in overdue {
                let Some(inst) = state.instances.get_mut(&id) else {
                    continue;
                };
                // An ancestor's expiry may already have cancelled this one
                if inst.is_finished() {
                    continue;
                }
                let Some(pending) = inst.pending.clone() else {
                    continue;
                };
                log::warn!(
                    "Instance {} timed out waiting for step '{}'",
                    id,
                    pending.step_id
                );
                inst.fail(&StepError::ResultTimeout {
                    step_id: pending.step_id,
                    timeout_secs: pending.timeout_secs,
                });
                state.pending.remove(&id);
                changed.push(inst.clone());
                expired.push(id);

                for child in subtree(&state.instances, id).into_iter().skip(1) {
                    if let Some(c) = state.instances.get_mut(&child) {
                        if !c.is_finished() {
                            c.cancel();
                            state.pending.remove(&child);
                            changed.push(c.clone());
                        }
                    }
                }
            }
            (expired, changed)
        };

        for inst in &changed {
            self.backend.persist(inst).await?;
        }
        for id in &expired {
            self.propagate(*id).await?;
        }
        Ok(expired)
    }

    // ------------------------------------------------------------------
    // Child protocol
    // ------------------------------------------------------------------

    /// What a delegated child needs next, driving it first if it can run
    pub async fn get_next_step(&self, instance_id: Uuid) -> Result<NextStep, EngineError> {
        self.ensure_loaded(instance_id).await?;
        if self.status_of(instance_id).await? == InstanceStatus::Running {
            self.drive(instance_id).await?;
            self.propagate(instance_id).await?;
        }

        let guard = self.state.read().await;
        let inst = guard
            .instances
            .get(&instance_id)
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))?;
        let mut actions = Vec::new();
        collect_pending(&guard.instances, inst, &mut actions);
        Ok(match inst.status {
            InstanceStatus::Queued => NextStep::Blocked,
            status if status.is_terminal() => NextStep::Complete {
                status,
                result: inst.result.clone(),
                error: inst.failure.clone(),
            },
            _ => match actions.into_iter().next() {
                Some(action) => NextStep::Action { action },
                None => NextStep::Waiting,
            },
        })
    }

    pub async fn submit_step_result(
        &self,
        instance_id: Uuid,
        step_id: &str,
        result: Value,
    ) -> Result<Ack, EngineError> {
        self.accept_result(instance_id, step_id, result).await?;
        Ok(Ack {
            instance_id,
            step_id: step_id.to_string(),
            status: self.status_of(instance_id).await?,
        })
    }

    /// Flattened state of any instance
    pub async fn get_state(&self, instance_id: Uuid) -> Result<Map<String, Value>, EngineError> {
        self.ensure_loaded(instance_id).await?;
        let guard = self.state.read().await;
        guard
            .instances
            .get(&instance_id)
            .map(|i| i.state.read())
            .ok_or_else(|| EngineError::UnknownInstance(instance_id.to_string()))
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn status_of(&self, id: Uuid) -> Result<InstanceStatus, EngineError> {
        let guard = self.state.read().await;
        guard
            .instances
            .get(&id)
            .map(|i| i.status)
            .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))
    }

    /// Make sure the instance is in memory, restoring it from the backend
    async fn ensure_loaded(&self, id: Uuid) -> Result<(), EngineError> {
        if self.state.read().await.instances.contains_key(&id) {
            return Ok(());
        }
        let Some(inst) = self.backend.query(id).await? else {
            return Err(EngineError::UnknownInstance(id.to_string()));
        };
        log::debug!("Restored instance {} from backend", id);
        let mut guard = self.state.write().await;
        let state = &mut *guard;
        if !state.instances.contains_key(&id) {
            if let Some(pending) = &inst.pending {
                state.pending.insert(pending.clone());
            }
            state.instances.insert(id, inst);
        }
        Ok(())
    }

    /// Restore iteration children that are only known to the backend
    async fn load_children(&self, id: Uuid) -> Result<(), EngineError> {
        let missing: Vec<Uuid> = {
            let guard = self.state.read().await;
            guard
                .instances
                .get(&id)
                .and_then(WorkflowInstance::iteration_frame)
                .map(|frame| {
                    frame
                        .children
                        .iter()
                        .filter(|c| !guard.instances.contains_key(c))
                        .copied()
                        .collect()
                })
                .unwrap_or_default()
        };
        for child in missing {
            self.ensure_loaded(child).await?;
        }
        Ok(())
    }

    async fn accept_result(
        &self,
        id: Uuid,
        step_id: &str,
        result: Value,
    ) -> Result<(), EngineError> {
        self.ensure_loaded(id).await?;
        let definition = self.definition_of(id).await?;
        let dispatcher = Dispatcher::new(&definition, &self.expressions, &self.config);

        let (snapshot, accepted) = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let inst = state
                .instances
                .get_mut(&id)
                .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))?;

            if inst.consumed.contains(step_id) {
                return Err(EngineError::ResultAlreadyConsumed {
                    instance_id: id.to_string(),
                    step_id: step_id.to_string(),
                });
            }
            if inst.is_finished() {
                return Err(EngineError::InstanceFinished {
                    instance_id: id.to_string(),
                    status: inst.status.to_string(),
                });
            }
            let pending = state
                .pending
                .get(&id)
                .or_else(|| inst.pending.clone())
                .filter(|p| p.action != ActionType::DelegateIteration);
            let Some(pending) = pending else {
                return Err(EngineError::NotAwaitingResult {
                    instance_id: id.to_string(),
                });
            };
            if pending.step_id != step_id {
                return Err(EngineError::StepMismatch {
                    instance_id: id.to_string(),
                    expected: pending.step_id,
                    got: step_id.to_string(),
                });
            }
            state.pending.remove(&id);

            let mut accepted = None;
            if pending.is_overdue(Utc::now()) {
                inst.fail(&StepError::ResultTimeout {
                    step_id: step_id.to_string(),
                    timeout_secs: pending.timeout_secs,
                });
            } else {
                let schema = pending.params.get("output_schema");
                match results::extract_payload(step_id, pending.action, schema, &result) {
                    Ok(payload) => match dispatcher.resume(inst, step_id, payload.clone()) {
                        Ok(()) => accepted = Some(payload),
                        Err(e) => inst.fail(&e),
                    },
                    Err(e) => inst.fail(&e),
                }
            }
            (inst.clone(), accepted)
        };

        self.backend.persist(&snapshot).await?;
        if let Some(payload) = accepted {
            log::debug!("Accepted result for step '{}' of instance {}", step_id, id);
            let signal = Signal::Result {
                step_id: step_id.to_string(),
                payload,
            };
            self.backend.signal(id, &signal).await?;
        }
        self.drive(id).await?;
        self.propagate(id).await
    }

    /// Advance an instance, and any children it launches, until nothing can move
    fn drive(&self, id: Uuid) -> BoxFuture<'_, Result<(), EngineError>> {
        async move {
            loop {
                match self.step_once(id).await? {
                    Progress::Idle => return Ok(()),
                    Progress::Continue => {}
                    Progress::Launch(children) => {
                        log::debug!("Instance {} launching {} child(ren)", id, children.len());
                        for result in join_all(children.into_iter().map(|c| self.drive(c))).await {
                            result?;
                        }
                    }
                }
            }
        }
        .boxed()
    }

    async fn step_once(&self, id: Uuid) -> Result<Progress, EngineError> {
        match self.status_of(id).await? {
            InstanceStatus::Running => {}
            InstanceStatus::WaitingOnChildren => self.load_children(id).await?,
            _ => return Ok(Progress::Idle),
        }
        let definition = self.definition_of(id).await?;
        let dispatcher = Dispatcher::new(&definition, &self.expressions, &self.config);

        let mut spawned = Vec::new();
        let mut touched = Vec::new();
        let (progress, snapshot) = {
            let mut guard = self.state.write().await;
            let state = &mut *guard;
            let Some(mut inst) = state.instances.remove(&id) else {
                return Err(EngineError::UnknownInstance(id.to_string()));
            };

            let progress = match inst.status {
                InstanceStatus::Running => match dispatcher.advance(&mut inst) {
                    Advance::Suspended => {
                        if let Some(pending) = &inst.pending {
                            state.pending.insert(pending.clone());
                        }
                        Progress::Idle
                    }
                    Advance::Spawned(children) => {
                        for child in children {
                            spawned.push(child.clone());
                            state.instances.insert(child.id, child);
                        }
                        Progress::Continue
                    }
                    Advance::AwaitChildren => Progress::Continue,
                    Advance::Finished => {
                        log::info!("Instance {} finished: {}", id, inst.status);
                        Progress::Idle
                    }
                },
                InstanceStatus::WaitingOnChildren => {
                    self.tend_children(&dispatcher, &mut inst, state, &mut touched)
                }
                _ => Progress::Idle,
            };
            let snapshot = inst.clone();
            state.instances.insert(id, inst);
            (progress, snapshot)
        };

        self.backend.persist(&snapshot).await?;
        for child in &spawned {
            self.backend.spawn_child(id, child).await?;
        }
        for child in &touched {
            self.backend.persist(child).await?;
        }
        Ok(progress)
    }

    /// Settle, launch or delegate the children of the iteration on top of the cursor
    fn tend_children(
        &self,
        dispatcher: &Dispatcher<'_>,
        inst: &mut WorkflowInstance,
        state: &mut EngineState,
        touched: &mut Vec<WorkflowInstance>,
    ) -> Progress {
        let Some(frame) = inst.iteration_frame().cloned() else {
            inst.status = InstanceStatus::Running;
            return Progress::Continue;
        };

        let launch = {
            let children: Vec<&WorkflowInstance> = frame
                .children
                .iter()
                .filter_map(|c| state.instances.get(c))
                .collect();
            if children.len() < frame.children.len() {
                log::warn!("Instance {} is missing iteration children", inst.id);
                return Progress::Idle;
            }
            if iteration::all_settled(&children) {
                if let Err(e) = dispatcher.finish_iteration(inst, &children) {
                    inst.fail(&e);
                }
                state.pending.remove(&inst.id);
                return Progress::Continue;
            }
            iteration::launchable(&children, frame.limit)
        };

        for child_id in &launch {
            if let Some(child) = state.instances.get_mut(child_id) {
                child.status = InstanceStatus::Running;
                child.record(None, "launched");
                touched.push(child.clone());
            }
        }

        let Some(executor) = &frame.executor else {
            return if launch.is_empty() {
                Progress::Idle
            } else {
                Progress::Launch(launch)
            };
        };

        // Delegated children are driven through the child protocol
        if inst.pending.is_none() {
            let params = json!({
                "executor": executor,
                "step_id": frame.step_id,
                "children": frame.children,
            });
            let action = PendingAction::new(
                inst.id,
                &frame.step_id,
                ActionType::DelegateIteration,
                params,
                self.config.default_action_timeout_secs,
            );
            inst.record(
                Some(&frame.step_id),
                format!("delegated {} child(ren) to {}", frame.children.len(), executor),
            );
            state.pending.insert(action.clone());
            inst.pending = Some(action);
        }
        Progress::Idle
    }

    /// Re-drive every ancestor of `id` so settled children are picked up
    async fn propagate(&self, id: Uuid) -> Result<(), EngineError> {
        let mut current = id;
        loop {
            let link = {
                let guard = self.state.read().await;
                guard
                    .instances
                    .get(&current)
                    .and_then(|i| i.parent.as_ref().map(|p| (p.instance_id, i.is_finished())))
            };
            let Some((parent, settled)) = link else {
                return Ok(());
            };
            self.ensure_loaded(parent).await?;
            if settled {
                self.backend
                    .signal(parent, &Signal::ChildSettled { child_id: current })
                    .await?;
            }
            self.drive(parent).await?;
            current = parent;
        }
    }

    /// Response for the root of the tree `id` belongs to
    async fn respond(&self, id: Uuid) -> Result<StepResponse, EngineError> {
        let guard = self.state.read().await;
        let mut root = guard
            .instances
            .get(&id)
            .ok_or_else(|| EngineError::UnknownInstance(id.to_string()))?;
        while let Some(parent) = root
            .parent
            .as_ref()
            .and_then(|link| guard.instances.get(&link.instance_id))
        {
            root = parent;
        }
        let mut actions = Vec::new();
        collect_pending(&guard.instances, root, &mut actions);
        Ok(StepResponse {
            instance_id: root.id,
            status: root.status,
            action: actions.first().cloned(),
            actions,
            result: root.result.clone(),
            error: root.failure.clone(),
        })
    }
}

/// Pending actions in the tree, depth-first in spawn order
fn collect_pending(
    instances: &HashMap<Uuid, WorkflowInstance>,
    inst: &WorkflowInstance,
    out: &mut Vec<PendingAction>,
) {
    if inst.is_finished() {
        return;
    }
    if let Some(pending) = &inst.pending {
        out.push(pending.clone());
    }
    for child in inst.children.iter().filter_map(|c| instances.get(c)) {
        collect_pending(instances, child, out);
    }
}

/// `id` followed by all of its descendants, breadth-first
fn subtree(instances: &HashMap<Uuid, WorkflowInstance>, id: Uuid) -> Vec<Uuid> {
    let mut out = vec![id];
    let mut next = 0;
    while next < out.len() {
        if let Some(inst) = instances.get(&out[next]) {
            out.extend(inst.children.iter().copied());
        }
        next += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const WAITING: &str = r#"
name: waiter
version: 1
steps:
  - id: ask
    type: wait
    message: "ready?"
    output_to: raw.answer
"#;

    #[tokio::test]
    async fn test_start_suspends_on_first_external_step() {
        let engine = Engine::new(EngineConfig::default());
        engine.register_yaml(WAITING).await.unwrap();

        let response = engine.start("waiter", json!({})).await.unwrap();
        assert_eq!(response.status, InstanceStatus::Suspended);
        let action = response.action.unwrap();
        assert_eq!(action.step_id, "ask");
        assert_eq!(action.params, json!({"message": "ready?"}));
    }

    #[tokio::test]
    async fn test_submit_result_completes() {
        let engine = Engine::new(EngineConfig::default());
        engine.register_yaml(WAITING).await.unwrap();
        let started = engine.start("waiter", json!({})).await.unwrap();

        let done = engine
            .submit_result(started.instance_id, "ask", json!({"value": "yes"}))
            .await
            .unwrap();
        assert_eq!(done.status, InstanceStatus::Completed);
        assert_eq!(done.result.unwrap()["answer"], json!("yes"));
    }

    #[tokio::test]
    async fn test_submit_result_errors() {
        let engine = Engine::new(EngineConfig::default());
        engine.register_yaml(WAITING).await.unwrap();
        let id = engine.start("waiter", json!({})).await.unwrap().instance_id;

        let err = engine
            .submit_result(id, "other", json!({"value": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "step_mismatch");

        let err = engine
            .submit_result(Uuid::new_v4(), "ask", json!({"value": 1}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "unknown_instance");

        engine.submit_result(id, "ask", json!({"value": 1})).await.unwrap();
        let err = engine
            .submit_result(id, "ask", json!({"value": 2}))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "result_already_consumed");
    }

    #[tokio::test]
    async fn test_malformed_result_fails_instance() {
        let engine = Engine::new(EngineConfig::default());
        engine.register_yaml(WAITING).await.unwrap();
        let id = engine.start("waiter", json!({})).await.unwrap().instance_id;

        let response = engine
            .submit_result(id, "ask", json!({"value": 1, "extra": true}))
            .await
            .unwrap();
        assert_eq!(response.status, InstanceStatus::Failed);
        assert_eq!(response.error.unwrap().kind, "malformed_result");
    }

    #[tokio::test]
    async fn test_invalid_inputs_rejected() {
        let engine = Engine::new(EngineConfig::default());
        engine
            .register_yaml(
                "name: typed\nversion: 1\ninputs:\n  count:\n    type: integer\nsteps:\n  - id: t\n    type: terminate\n",
            )
            .await
            .unwrap();
        let err = engine.start("typed", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "invalid_inputs");
        let err = engine.start("missing", json!({})).await.unwrap_err();
        assert_eq!(err.kind(), "unknown_workflow");
    }

    #[tokio::test]
    async fn test_query_status_reports_pending() {
        let engine = Engine::new(EngineConfig::default());
        engine.register_yaml(WAITING).await.unwrap();
        let id = engine.start("waiter", json!({})).await.unwrap().instance_id;

        let report = engine.query_status(id).await.unwrap();
        assert_eq!(report.current_step.as_deref(), Some("ask"));
        assert_eq!(report.pending.unwrap().step_id, "ask");
        assert_eq!(report.phase, DispatchState::DispatchedExternal);
        assert!(report.history.iter().any(|h| h.event == "started"));
    }

    #[tokio::test]
    async fn test_instance_restored_from_backend() {
        let backend = Arc::new(InMemoryBackend::new());
        let first = Engine::with_backend(EngineConfig::default(), backend.clone());
        first.register_yaml(WAITING).await.unwrap();
        let id = first.start("waiter", json!({})).await.unwrap().instance_id;

        let second = Engine::with_backend(EngineConfig::default(), backend);
        second.register_yaml(WAITING).await.unwrap();
        let response = second
            .submit_result(id, "ask", json!({"value": 7}))
            .await
            .unwrap();
        assert_eq!(response.status, InstanceStatus::Completed);
    }

    #[tokio::test]
    async fn test_computed_failure_at_start_fails_instance() {
        let engine = Engine::new(EngineConfig::default());
        engine
            .register_yaml(
                r#"
name: broken
version: 1
initial_state:
  a: 1
computed:
  ratio: a / 0
steps:
  - id: t
    type: terminate
"#,
            )
            .await
            .unwrap();
        let response = engine.start("broken", json!({})).await.unwrap();
        assert_eq!(response.status, InstanceStatus::Failed);
        let error = response.error.unwrap();
        assert_eq!(error.step_id.as_deref(), Some("computed.ratio"));
    }
}
