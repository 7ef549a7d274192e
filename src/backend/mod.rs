// SPDX-License-Identifier: MIT

//! Durable-execution backend
//!
//! The engine persists every instance transition through this trait so a
//! durable implementation can replay or resume instances after a restart.
//! `InMemoryBackend` keeps snapshots in process and is what tests use.

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::engine::instance::WorkflowInstance;
use crate::error::BackendError;

pub use memory::InMemoryBackend;

/// Out-of-band event delivered to an instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "signal", rename_all = "snake_case")]
pub enum Signal {
    /// An external step result was accepted
    Result { step_id: String, payload: Value },
    Cancel,
    /// One of the instance's iteration children reached a terminal status
    ChildSettled { child_id: Uuid },
}

#[async_trait]
pub trait DurableBackend: Send + Sync {
    /// Record a newly started top-level instance
    async fn start(&self, instance: &WorkflowInstance) -> Result<(), BackendError>;

    /// Store the latest snapshot of an instance
    async fn persist(&self, instance: &WorkflowInstance) -> Result<(), BackendError>;

    async fn signal(&self, instance_id: Uuid, signal: &Signal) -> Result<(), BackendError>;

    /// Latest snapshot, if the backend knows the instance
    async fn query(&self, instance_id: Uuid) -> Result<Option<WorkflowInstance>, BackendError>;

    /// Record a child instance under its parent
    async fn spawn_child(
        &self,
        parent_id: Uuid,
        child: &WorkflowInstance,
    ) -> Result<(), BackendError>;

    /// Children recorded under `parent_id`, in spawn order
    async fn children(&self, parent_id: Uuid) -> Result<Vec<Uuid>, BackendError>;
}
