// SPDX-License-Identifier: MIT

//! Runtime state storage for workflow instances

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;

use super::computed::ComputedGraph;
use super::schema::{InitialState, StatePath, Tier};
use crate::error::StateError;
use crate::workflow::expression::{ExpressionEngine, Scope};

/// Three-tier workflow state
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateStore {
    #[serde(default)]
    pub raw: Map<String, Value>,
    #[serde(default)]
    pub computed: Map<String, Value>,
    #[serde(default)]
    pub session: Map<String, Value>,
}

impl StateStore {
    /// Seed the writable tiers and compute every computed field once
    pub fn initialize(
        initial: &InitialState,
        graph: &ComputedGraph,
        engine: &ExpressionEngine,
        inputs: &Value,
    ) -> Result<Self, StateError> {
        let mut store = Self {
            raw: initial.raw.clone(),
            computed: Map::new(),
            session: initial.session.clone(),
        };
        store.recompute(graph.order(), graph, engine, inputs)?;
        Ok(store)
    }

    /// Flattened view; on name collisions computed wins over raw, raw over session
    pub fn read(&self) -> Map<String, Value> {
        let mut flat = self.session.clone();
        for (k, v) in &self.raw {
            flat.insert(k.clone(), v.clone());
        }
        for (k, v) in &self.computed {
            flat.insert(k.clone(), v.clone());
        }
        flat
    }

    /// Restrict a flattened view to the declared fields
    pub fn filter(flat: &Map<String, Value>, declared: &[String]) -> Map<String, Value> {
        declared
            .iter()
            .filter_map(|name| flat.get(name).map(|v| (name.clone(), v.clone())))
            .collect()
    }

    /// Top-level names across all tiers
    pub fn field_names(&self) -> BTreeSet<String> {
        self.raw
            .keys()
            .chain(self.computed.keys())
            .chain(self.session.keys())
            .cloned()
            .collect()
    }

    pub fn get(&self, path: &StatePath) -> Option<&Value> {
        let mut current = self.tier(path.tier).get(path.field())?;
        for key in &path.segments[1..] {
            current = current.get(key)?;
        }
        Some(current)
    }

    fn tier(&self, tier: Tier) -> &Map<String, Value> {
        match tier {
            Tier::Raw => &self.raw,
            Tier::Computed => &self.computed,
            Tier::Session => &self.session,
        }
    }

    fn tier_mut(&mut self, tier: Tier) -> &mut Map<String, Value> {
        match tier {
            Tier::Raw => &mut self.raw,
            Tier::Computed => &mut self.computed,
            Tier::Session => &mut self.session,
        }
    }

    /// Apply a batch of writes atomically
    ///
    /// Writes land on a copy. Computed fields depending on any written field
    /// are recomputed in dependency order. The copy replaces `self` only if
    /// every write and recomputation succeeded. Returns the applied paths.
    pub fn apply(
        &mut self,
        updates: &[(String, Value)],
        graph: &ComputedGraph,
        engine: &ExpressionEngine,
        inputs: &Value,
    ) -> Result<Vec<String>, StateError> {
        let mut next = self.clone();
        let mut touched = BTreeSet::new();
        let mut applied = Vec::with_capacity(updates.len());

        for (path, value) in updates {
            let target = StatePath::writable(path)?;
            next.set(&target, value.clone())?;
            touched.insert(target.field().to_string());
            applied.push(target.to_string());
        }

        let dirty = graph.dependents(&touched);
        if !dirty.is_empty() {
            log::debug!("Recomputing computed fields {:?}", dirty);
            next.recompute(&dirty, graph, engine, inputs)?;
        }

        *self = next;
        Ok(applied)
    }

    fn set(&mut self, path: &StatePath, value: Value) -> Result<(), StateError> {
        let (last, parents) = path
            .segments
            .split_last()
            .ok_or_else(|| StateError::MissingTier(path.to_string()))?;

        let mut current = self.tier_mut(path.tier);
        let mut walked = path.tier.as_str().to_string();
        for key in parents {
            walked.push('.');
            walked.push_str(key);
            let slot = current
                .entry(key.clone())
                .or_insert_with(|| Value::Object(Map::new()));
            if slot.is_null() {
                *slot = Value::Object(Map::new());
            }
            current = match slot {
                Value::Object(obj) => obj,
                _ => {
                    return Err(StateError::PathConflict {
                        path: path.to_string(),
                        at: walked,
                    })
                }
            };
        }
        current.insert(last.clone(), value);
        Ok(())
    }

    fn recompute(
        &mut self,
        fields: &[String],
        graph: &ComputedGraph,
        engine: &ExpressionEngine,
        inputs: &Value,
    ) -> Result<(), StateError> {
        for field in fields {
            let Some(def) = graph.def(field) else {
                continue;
            };
            let flat = self.read();
            let scope = Scope::new(&flat, inputs);
            let value = engine
                .evaluate(&def.expr, &scope)
                .map_err(|source| StateError::Recompute {
                    field: field.clone(),
                    source,
                })?;
            self.computed.insert(field.clone(), value);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::state::ComputedFieldDef;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn graph(entries: &[(&str, &str)]) -> ComputedGraph {
        let defs: BTreeMap<String, ComputedFieldDef> = entries
            .iter()
            .map(|(k, v)| (k.to_string(), ComputedFieldDef::new(*v)))
            .collect();
        ComputedGraph::build(&defs).unwrap()
    }

    fn store(raw: Value, g: &ComputedGraph) -> StateStore {
        let initial: InitialState = serde_json::from_value(raw).unwrap();
        StateStore::initialize(&initial, g, &ExpressionEngine::default(), &json!({})).unwrap()
    }

    #[test]
    fn test_read_precedence() {
        let mut s = StateStore::default();
        s.session.insert("x".to_string(), json!("session"));
        s.raw.insert("x".to_string(), json!("raw"));
        s.session.insert("only_session".to_string(), json!(1));
        let flat = s.read();
        assert_eq!(flat.get("x"), Some(&json!("raw")));
        assert_eq!(flat.get("only_session"), Some(&json!(1)));

        s.computed.insert("x".to_string(), json!("computed"));
        assert_eq!(s.read().get("x"), Some(&json!("computed")));
    }

    #[test]
    fn test_filter_keeps_declared_only() {
        let flat: Map<String, Value> = serde_json::from_value(json!({"a": 1, "b": 2})).unwrap();
        let filtered = StateStore::filter(&flat, &["a".to_string(), "missing".to_string()]);
        assert_eq!(Value::Object(filtered), json!({"a": 1}));
    }

    #[test]
    fn test_nested_write_creates_objects() {
        let g = ComputedGraph::default();
        let mut s = store(json!({}), &g);
        s.apply(
            &[("raw.analysis.score".to_string(), json!(72))],
            &g,
            &ExpressionEngine::default(),
            &json!({}),
        )
        .unwrap();
        assert_eq!(s.raw.get("analysis"), Some(&json!({"score": 72})));
        assert_eq!(
            s.get(&StatePath::parse("raw.analysis.score").unwrap()),
            Some(&json!(72))
        );
    }

    #[test]
    fn test_initialize_computes_fields() {
        let g = graph(&[("total", "a + b")]);
        let s = store(json!({"a": 2, "b": 3}), &g);
        assert_eq!(s.computed.get("total"), Some(&json!(5)));
    }

    #[test]
    fn test_apply_recomputes_dependents() {
        let g = graph(&[("total", "a + b"), ("doubled", "total * 2")]);
        let mut s = store(json!({"a": 1, "b": 1}), &g);
        assert_eq!(s.computed.get("doubled"), Some(&json!(4)));

        s.apply(
            &[("raw.a".to_string(), json!(10))],
            &g,
            &ExpressionEngine::default(),
            &json!({}),
        )
        .unwrap();
        assert_eq!(s.computed.get("total"), Some(&json!(11)));
        assert_eq!(s.computed.get("doubled"), Some(&json!(22)));
    }

    #[test]
    fn test_apply_is_atomic() {
        let g = ComputedGraph::default();
        let mut s = store(json!({"a": 1, "scalar": 5}), &g);
        let before = s.clone();

        let err = s
            .apply(
                &[
                    ("raw.a".to_string(), json!(2)),
                    ("raw.scalar.nested".to_string(), json!(3)),
                ],
                &g,
                &ExpressionEngine::default(),
                &json!({}),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::PathConflict { .. }));
        assert_eq!(s, before);
    }

    #[test]
    fn test_failed_recompute_rolls_back() {
        let g = graph(&[("ratio", "a / b")]);
        let mut s = store(json!({"a": 4, "b": 2}), &g);
        let before = s.clone();

        let err = s
            .apply(
                &[("raw.b".to_string(), json!(0))],
                &g,
                &ExpressionEngine::default(),
                &json!({}),
            )
            .unwrap_err();
        assert!(matches!(err, StateError::Recompute { .. }));
        assert_eq!(s, before);
    }

    #[test]
    fn test_write_errors() {
        let g = ComputedGraph::default();
        let mut s = StateStore::default();
        let engine = ExpressionEngine::default();
        assert_eq!(
            s.apply(&[("total".to_string(), json!(1))], &g, &engine, &json!({}))
                .unwrap_err(),
            StateError::MissingTier("total".to_string())
        );
        assert_eq!(
            s.apply(
                &[("computed.total".to_string(), json!(1))],
                &g,
                &engine,
                &json!({})
            )
            .unwrap_err(),
            StateError::ComputedNotWritable("computed.total".to_string())
        );
    }
}
