// SPDX-License-Identifier: MIT

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{DurableBackend, Signal};
use crate::engine::instance::WorkflowInstance;
use crate::error::BackendError;

/// Process-local backend keeping serialized snapshots
///
/// Snapshots are stored as JSON so every persist exercises the same
/// serialization a durable store would.
#[derive(Clone, Default)]
pub struct InMemoryBackend {
    snapshots: Arc<RwLock<HashMap<Uuid, Value>>>,
    children: Arc<RwLock<HashMap<Uuid, Vec<Uuid>>>>,
    signals: Arc<RwLock<Vec<(Uuid, Signal)>>>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every signal delivered so far, oldest first
    pub async fn signals(&self) -> Vec<(Uuid, Signal)> {
        self.signals.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.snapshots.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.snapshots.read().await.is_empty()
    }
}

#[async_trait]
impl DurableBackend for InMemoryBackend {
    async fn start(&self, instance: &WorkflowInstance) -> Result<(), BackendError> {
        log::debug!(
            "Backend: started instance {} of {}",
            instance.id,
            instance.definition_key()
        );
        self.persist(instance).await
    }

    async fn persist(&self, instance: &WorkflowInstance) -> Result<(), BackendError> {
        let snapshot = serde_json::to_value(instance)?;
        self.snapshots.write().await.insert(instance.id, snapshot);
        Ok(())
    }

    async fn signal(&self, instance_id: Uuid, signal: &Signal) -> Result<(), BackendError> {
        if !self.snapshots.read().await.contains_key(&instance_id) {
            return Err(BackendError::NotFound(instance_id.to_string()));
        }
        self.signals.write().await.push((instance_id, signal.clone()));
        Ok(())
    }

    async fn query(&self, instance_id: Uuid) -> Result<Option<WorkflowInstance>, BackendError> {
        let snapshots = self.snapshots.read().await;
        match snapshots.get(&instance_id) {
            Some(snapshot) => Ok(Some(serde_json::from_value(snapshot.clone())?)),
            None => Ok(None),
        }
    }

    async fn spawn_child(
        &self,
        parent_id: Uuid,
        child: &WorkflowInstance,
    ) -> Result<(), BackendError> {
        self.persist(child).await?;
        self.children
            .write()
            .await
            .entry(parent_id)
            .or_default()
            .push(child.id);
        Ok(())
    }

    async fn children(&self, parent_id: Uuid) -> Result<Vec<Uuid>, BackendError> {
        Ok(self
            .children
            .read()
            .await
            .get(&parent_id)
            .cloned()
            .unwrap_or_default())
    }
}
