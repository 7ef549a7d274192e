// SPDX-License-Identifier: MIT

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::types::WorkflowDefinition;

/// Validated definitions by `name@version`
#[derive(Clone)]
pub struct WorkflowRegistry {
    definitions: Arc<RwLock<HashMap<String, Arc<WorkflowDefinition>>>>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self {
            definitions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a definition, replacing any with the same name and version
    pub async fn register(&self, definition: Arc<WorkflowDefinition>) -> String {
        let key = definition.key();
        let mut definitions = self.definitions.write().await;
        if definitions.insert(key.clone(), definition).is_some() {
            log::info!("Replaced workflow definition {}", key);
        } else {
            log::info!("Registered workflow definition {}", key);
        }
        key
    }

    /// Look up `name@version`, or the highest version of `name`
    pub async fn get(&self, reference: &str) -> Option<Arc<WorkflowDefinition>> {
        let definitions = self.definitions.read().await;
        if reference.contains('@') {
            return definitions.get(reference).cloned();
        }
        definitions
            .values()
            .filter(|d| d.name == reference)
            .max_by(|a, b| compare_versions(&a.version, &b.version))
            .cloned()
    }

    pub async fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.definitions.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl Default for WorkflowRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Dotted versions compare numerically per segment, falling back to text
fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = a.split('.');
    let mut right = b.split('.');
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (Some(_), None) => return Ordering::Greater,
            (None, Some(_)) => return Ordering::Less,
            (Some(x), Some(y)) => {
                let ord = match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    _ => x.cmp(y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}
