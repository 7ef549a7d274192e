// SPDX-License-Identifier: MIT

pub mod cache;
pub mod expression;
pub mod inputs;
pub mod loader;
pub mod registry;
pub mod state;
pub mod types;
pub mod validator;

pub use cache::DefinitionCache;
pub use loader::{Fingerprint, WorkflowLoader};
pub use registry::WorkflowRegistry;
pub use types::{BlockRef, Step, StepKind, WorkflowDefinition};
pub use validator::Validator;
