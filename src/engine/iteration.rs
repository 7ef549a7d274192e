// SPDX-License-Identifier: MIT

//! Child slots and result aggregation for iterate steps

use serde_json::{json, Value};
use uuid::Uuid;

use super::instance::{InstanceStatus, WorkflowInstance};
use crate::config::EngineConfig;
use crate::workflow::types::{IterateStep, IterationMode};

/// How many children may be launched and unsettled at once
pub fn slot_limit(step: &IterateStep, config: &EngineConfig) -> usize {
    match step.mode {
        IterationMode::Sequential => 1,
        IterationMode::Parallel => step.max_concurrency.unwrap_or(config.max_concurrency).max(1),
    }
}

/// Queued children to launch now, in item order, given the slot limit
pub fn launchable(children: &[&WorkflowInstance], limit: usize) -> Vec<Uuid> {
    let active = children
        .iter()
        .filter(|c| !c.is_finished() && c.status != InstanceStatus::Queued)
        .count();
    children
        .iter()
        .filter(|c| c.status == InstanceStatus::Queued)
        .take(limit.saturating_sub(active))
        .map(|c| c.id)
        .collect()
}

pub fn all_settled(children: &[&WorkflowInstance]) -> bool {
    children.iter().all(|c| c.is_finished())
}

/// Result a completed child contributes to its parent's aggregate
pub fn child_result(child: &WorkflowInstance) -> Value {
    match child.status {
        InstanceStatus::Completed => child.result.clone().unwrap_or(Value::Null),
        InstanceStatus::Failed => match &child.failure {
            Some(report) => json!({ "error": report }),
            None => json!({ "error": null }),
        },
        _ => Value::Null,
    }
}

/// Index-ordered aggregate plus the indices of children that did not complete
///
/// `children` must already be in item order.
pub fn aggregate(children: &[&WorkflowInstance]) -> (Value, Vec<usize>) {
    let mut results = Vec::with_capacity(children.len());
    let mut failed = Vec::new();
    for (index, child) in children.iter().enumerate() {
        if child.status != InstanceStatus::Completed {
            failed.push(index);
        }
        results.push(child_result(child));
    }
    (Value::Array(results), failed)
}
