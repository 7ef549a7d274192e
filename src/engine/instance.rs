// SPDX-License-Identifier: MIT

//! Workflow instances: one execution of a definition, or of one iteration item

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeSet;
use std::fmt;
use uuid::Uuid;

use super::pending::PendingAction;
use crate::error::{FailureReport, StepError};
use crate::workflow::expression::LoopContext;
use crate::workflow::state::StateStore;
use crate::workflow::types::{BlockRef, WorkflowDefinition};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Child created but not launched yet
    Queued,
    Running,
    /// Waiting for an external result
    Suspended,
    WaitingOnChildren,
    Completed,
    Failed,
    Cancelled,
}

impl InstanceStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed | InstanceStatus::Failed | InstanceStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceStatus::Queued => "queued",
            InstanceStatus::Running => "running",
            InstanceStatus::Suspended => "suspended",
            InstanceStatus::WaitingOnChildren => "waiting_on_children",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dispatcher state machine position
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchState {
    Ready,
    EvaluatingGuard,
    DispatchedLocal,
    DispatchedExternal,
    BranchDescended,
    Complete,
    Failed,
}

/// Where a child sits in its parent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentLink {
    pub instance_id: Uuid,
    pub step_id: String,
    pub index: usize,
}

/// Children of an iterate step that is waiting for them to settle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IterationFrame {
    pub step_id: String,
    /// Child instance ids in item order
    pub children: Vec<Uuid>,
    /// Launched-but-unsettled ceiling
    pub limit: usize,
    /// Delegation target; children are driven by a sub-agent when set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    pub continue_on_error: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "frame", rename_all = "snake_case")]
pub enum Frame {
    /// Walking a step list; `index` is the next step to run
    Block { block: BlockRef, index: usize },
    Iteration(IterationFrame),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub event: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowInstance {
    pub id: Uuid,
    pub workflow: String,
    pub version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<ParentLink>,
    /// Step list this instance starts in
    pub root: BlockRef,
    /// Nesting level of `root` within the definition
    pub depth: usize,
    pub status: InstanceStatus,
    pub phase: DispatchState,
    pub state: StateStore,
    pub inputs: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_context: Option<LoopContext>,
    pub cursor: Vec<Frame>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pending: Option<PendingAction>,
    /// Steps whose external result has been applied
    #[serde(default)]
    pub consumed: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReport>,
    /// Every child ever spawned by this instance, in spawn order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Uuid>,
    #[serde(default)]
    pub history: Vec<HistoryEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowInstance {
    /// A fresh top-level instance positioned at the first root step
    pub fn root(def: &WorkflowDefinition, inputs: Value, state: StateStore) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            workflow: def.name.clone(),
            version: def.version.clone(),
            parent: None,
            root: BlockRef::Root,
            depth: 0,
            status: InstanceStatus::Running,
            phase: DispatchState::Ready,
            state,
            inputs,
            loop_context: None,
            cursor: vec![Frame::Block {
                block: BlockRef::Root,
                index: 0,
            }],
            pending: None,
            consumed: BTreeSet::new(),
            result: None,
            failure: None,
            children: Vec::new(),
            history: Vec::new(),
            executor: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// A queued child running the body of `step_id` for one item
    pub fn child(
        parent: &WorkflowInstance,
        step_id: &str,
        loop_context: LoopContext,
        inputs: Value,
        executor: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let block = BlockRef::Body(step_id.to_string());
        Self {
            id: Uuid::new_v4(),
            workflow: parent.workflow.clone(),
            version: parent.version.clone(),
            parent: Some(ParentLink {
                instance_id: parent.id,
                step_id: step_id.to_string(),
                index: loop_context.index,
            }),
            root: block.clone(),
            depth: parent.level() + 1,
            status: InstanceStatus::Queued,
            phase: DispatchState::Ready,
            state: StateStore::default(),
            inputs,
            loop_context: Some(loop_context),
            cursor: vec![Frame::Block { block, index: 0 }],
            pending: None,
            consumed: BTreeSet::new(),
            result: None,
            failure: None,
            children: Vec::new(),
            history: Vec::new(),
            executor,
            created_at: now,
            updated_at: now,
        }
    }

    /// Registry key of the definition this instance runs
    pub fn definition_key(&self) -> String {
        format!("{}@{}", self.workflow, self.version)
    }

    /// Nesting level of the step list the cursor is in
    pub fn level(&self) -> usize {
        self.depth + self.cursor.len().saturating_sub(1)
    }

    pub fn is_finished(&self) -> bool {
        self.status.is_terminal()
    }

    /// Id of the step the cursor points at, if any
    pub fn current_step_id(&self, def: &WorkflowDefinition) -> Option<String> {
        match self.cursor.last()? {
            Frame::Block { block, index } => def.block(block)?.get(*index).map(|s| s.id.clone()),
            Frame::Iteration(frame) => Some(frame.step_id.clone()),
        }
    }

    pub fn iteration_frame(&self) -> Option<&IterationFrame> {
        match self.cursor.last()? {
            Frame::Iteration(frame) => Some(frame),
            Frame::Block { .. } => None,
        }
    }

    pub fn record(&mut self, step_id: Option<&str>, event: impl Into<String>) {
        let now = Utc::now();
        self.history.push(HistoryEntry {
            at: now,
            step_id: step_id.map(str::to_string),
            event: event.into(),
        });
        self.updated_at = now;
    }

    pub fn complete(&mut self, result: Value) {
        self.status = InstanceStatus::Completed;
        self.phase = DispatchState::Complete;
        self.result = Some(result);
        self.pending = None;
        self.cursor.clear();
        self.record(None, "completed");
    }

    pub fn fail(&mut self, error: &StepError) {
        log::warn!("Instance {} failed: {}", self.id, error);
        self.status = InstanceStatus::Failed;
        self.phase = DispatchState::Failed;
        self.failure = Some(error.report());
        self.pending = None;
        self.record(error.step_id(), format!("failed: {}", error.kind()));
    }

    pub fn cancel(&mut self) {
        self.status = InstanceStatus::Cancelled;
        self.phase = DispatchState::Failed;
        self.failure = Some(StepError::Cancelled.report());
        self.pending = None;
        self.record(None, "cancelled");
    }
}
