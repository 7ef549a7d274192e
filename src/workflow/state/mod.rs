// SPDX-License-Identifier: MIT

//! State management for workflow instances
//!
//! This module provides:
//! - `StateStore` - the raw, computed and session tiers of one instance
//! - `StatePath` - tier-qualified write targets such as `raw.result.score`
//! - `ComputedGraph` - computed fields in dependency order

mod computed;
mod schema;
mod store;

pub use computed::{ComputedGraph, ComputedGraphError};
pub use schema::{ComputedFieldDef, InitialState, StatePath, Tier};
pub use store::StateStore;
