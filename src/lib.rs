// SPDX-License-Identifier: MIT

//! kinetic-flow: a suspendable workflow orchestration engine
//!
//! Workflows are YAML or JSON documents made of typed steps. Control-flow
//! steps (branch, state_update, iterate, terminate) run inside the engine;
//! shell, tool_call, prompt, wait and delegate steps suspend the instance
//! until a caller submits their result.
//!
//! ```no_run
//! use kinetic_flow::config::EngineConfig;
//! use kinetic_flow::engine::Engine;
//! use serde_json::json;
//!
//! # async fn demo() -> Result<(), kinetic_flow::error::EngineError> {
//! let engine = Engine::new(EngineConfig::default());
//! engine.load_file("workflows/review.yaml").await?;
//! let response = engine.start("review", json!({"repo": "kinetic"})).await?;
//! if let Some(action) = response.action {
//!     println!("run {} for step {}", action.action, action.step_id);
//! }
//! # Ok(())
//! # }
//! ```

pub mod backend;
pub mod config;
pub mod engine;
pub mod error;
pub mod workflow;
