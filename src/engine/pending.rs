// SPDX-License-Identifier: MIT

//! Pending external actions and the bounded lookup table for them

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Shell,
    ToolCall,
    Prompt,
    Wait,
    Delegate,
    /// Iteration children handed to a sub-agent
    DelegateIteration,
}

impl ActionType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Shell => "shell",
            ActionType::ToolCall => "tool_call",
            ActionType::Prompt => "prompt",
            ActionType::Wait => "wait",
            ActionType::Delegate => "delegate",
            ActionType::DelegateIteration => "delegate_iteration",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A step waiting for someone outside the engine to produce its result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAction {
    pub instance_id: Uuid,
    pub step_id: String,
    pub action: ActionType,
    /// Rendered parameters, e.g. `{"command": "echo hi"}`
    pub params: Value,
    pub created_at: DateTime<Utc>,
    pub timeout_secs: u64,
    pub deadline: DateTime<Utc>,
}

impl PendingAction {
    pub fn new(
        instance_id: Uuid,
        step_id: &str,
        action: ActionType,
        params: Value,
        timeout_secs: u64,
    ) -> Self {
        let created_at = Utc::now();
        let deadline = i64::try_from(timeout_secs)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|d| created_at.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        Self {
            instance_id,
            step_id: step_id.to_string(),
            action,
            params,
            created_at,
            timeout_secs,
            deadline,
        }
    }

    pub fn is_overdue(&self, now: DateTime<Utc>) -> bool {
        now > self.deadline
    }
}

struct Slot {
    action: PendingAction,
    last_used: u64,
}

/// Bounded map from instance id to its pending action
///
/// Least recently used entries are evicted at capacity. The instance record
/// stays authoritative, so a miss here only means a slower lookup.
pub struct PendingTable {
    slots: HashMap<Uuid, Slot>,
    capacity: usize,
    tick: u64,
}

impl PendingTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: HashMap::new(),
            capacity: capacity.max(1),
            tick: 0,
        }
    }

    pub fn insert(&mut self, action: PendingAction) {
        self.tick += 1;
        let slot = Slot {
            action,
            last_used: self.tick,
        };
        self.slots.insert(slot.action.instance_id, slot);

        if self.slots.len() > self.capacity {
            let oldest = self
                .slots
                .iter()
                .min_by_key(|(_, s)| s.last_used)
                .map(|(id, _)| *id);
            if let Some(id) = oldest {
                log::debug!("Evicting pending action of instance {}", id);
                self.slots.remove(&id);
            }
        }
    }

    pub fn get(&mut self, instance_id: &Uuid) -> Option<PendingAction> {
        self.tick += 1;
        let tick = self.tick;
        self.slots.get_mut(instance_id).map(|slot| {
            slot.last_used = tick;
            slot.action.clone()
        })
    }

    pub fn remove(&mut self, instance_id: &Uuid) -> Option<PendingAction> {
        self.slots.remove(instance_id).map(|s| s.action)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(step: &str) -> PendingAction {
        PendingAction::new(Uuid::new_v4(), step, ActionType::Wait, json!({}), 60)
    }

    #[test]
    fn test_deadline() {
        let a = action("w");
        assert_eq!(a.deadline - a.created_at, Duration::seconds(60));
        assert!(!a.is_overdue(a.created_at));
        assert!(a.is_overdue(a.created_at + Duration::seconds(61)));
    }

    #[test]
    fn test_lru_eviction() {
        let mut table = PendingTable::new(2);
        let a = action("a");
        let b = action("b");
        let c = action("c");
        table.insert(a.clone());
        table.insert(b.clone());
        assert!(table.get(&a.instance_id).is_some());
        table.insert(c.clone());

        assert_eq!(table.len(), 2);
        assert!(table.get(&b.instance_id).is_none());
        assert!(table.get(&a.instance_id).is_some());
        assert_eq!(table.remove(&c.instance_id), Some(c));
    }

    #[test]
    fn test_action_type_names() {
        assert_eq!(
            serde_json::to_value(ActionType::DelegateIteration).unwrap(),
            json!("delegate_iteration")
        );
        assert_eq!(ActionType::ToolCall.to_string(), "tool_call");
    }
}
