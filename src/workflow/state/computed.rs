// SPDX-License-Identifier: MIT

//! Dependency graph for computed fields

use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

use super::schema::ComputedFieldDef;
use crate::error::ExpressionError;
use crate::workflow::expression::ExpressionEngine;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ComputedGraphError {
    /// Cycle path, first and last element equal
    #[error("Computed fields form a cycle: {}", .0.join(" -> "))]
    Cycle(Vec<String>),

    #[error("Computed field '{field}' has an invalid expression: {source}")]
    Expression {
        field: String,
        source: ExpressionError,
    },
}

/// Computed fields in evaluation order with their dependencies
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ComputedGraph {
    defs: BTreeMap<String, ComputedFieldDef>,
    deps: BTreeMap<String, BTreeSet<String>>,
    order: Vec<String>,
}

impl ComputedGraph {
    pub fn build(defs: &BTreeMap<String, ComputedFieldDef>) -> Result<Self, ComputedGraphError> {
        let mut deps = BTreeMap::new();
        for (name, def) in defs {
            let fields = match &def.depends_on {
                Some(explicit) => explicit.iter().cloned().collect(),
                None => ExpressionEngine::references(&def.expr).map_err(|source| {
                    ComputedGraphError::Expression {
                        field: name.clone(),
                        source,
                    }
                })?,
            };
            deps.insert(name.clone(), fields);
        }

        let order = topological_order(&deps)?;
        Ok(Self {
            defs: defs.clone(),
            deps,
            order,
        })
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Fields in an order where every field follows its dependencies
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn def(&self, name: &str) -> Option<&ComputedFieldDef> {
        self.defs.get(name)
    }

    pub fn dependencies(&self, name: &str) -> Option<&BTreeSet<String>> {
        self.deps.get(name)
    }

    /// Computed fields that must be recomputed after `touched` changed,
    /// in evaluation order
    pub fn dependents(&self, touched: &BTreeSet<String>) -> Vec<String> {
        let mut dirty: BTreeSet<&str> = BTreeSet::new();
        let mut out = Vec::new();
        for name in &self.order {
            let stale = self.deps.get(name).is_some_and(|deps| {
                deps.iter()
                    .any(|d| touched.contains(d) || dirty.contains(d.as_str()))
            });
            if stale {
                dirty.insert(name.as_str());
                out.push(name.clone());
            }
        }
        out
    }
}

/// Depth-first topological sort; reports the first cycle found
fn topological_order(
    deps: &BTreeMap<String, BTreeSet<String>>,
) -> Result<Vec<String>, ComputedGraphError> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        Visiting,
        Done,
    }

    fn visit<'a>(
        name: &'a str,
        deps: &'a BTreeMap<String, BTreeSet<String>>,
        marks: &mut BTreeMap<&'a str, Mark>,
        stack: &mut Vec<&'a str>,
        order: &mut Vec<String>,
    ) -> Result<(), ComputedGraphError> {
        match marks.get(name) {
            Some(Mark::Done) => return Ok(()),
            Some(Mark::Visiting) => {
                let start = stack.iter().position(|n| *n == name).unwrap_or(0);
                let mut cycle: Vec<String> = stack[start..].iter().map(|s| s.to_string()).collect();
                cycle.push(name.to_string());
                return Err(ComputedGraphError::Cycle(cycle));
            }
            None => {}
        }

        marks.insert(name, Mark::Visiting);
        stack.push(name);
        if let Some(children) = deps.get(name) {
            for dep in children {
                // Dependencies on plain state fields are leaves
                if deps.contains_key(dep) {
                    visit(dep, deps, marks, stack, order)?;
                }
            }
        }
        stack.pop();
        marks.insert(name, Mark::Done);
        order.push(name.to_string());
        Ok(())
    }

    let mut marks = BTreeMap::new();
    let mut stack = Vec::new();
    let mut order = Vec::new();
    for name in deps.keys() {
        visit(name, deps, &mut marks, &mut stack, &mut order)?;
    }
    Ok(order)
}
