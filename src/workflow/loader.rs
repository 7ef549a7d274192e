//! Workflow loader - YAML file loading and parsing
//!
//! This module turns workflow files into validated definitions and computes
//! the fingerprints the definition cache is keyed by.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use super::types::WorkflowDefinition;
use super::validator::Validator;
use crate::config::EngineConfig;
use crate::error::DefinitionError;

/// Identity of a definition file's content: path, modification time and size
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    pub path: PathBuf,
    pub modified: Option<SystemTime>,
    pub len: u64,
}

impl Fingerprint {
    pub fn of<P: AsRef<Path>>(path: P) -> Result<Self, DefinitionError> {
        let path = path.as_ref();
        let meta = fs::metadata(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// Loads workflow definitions from YAML files
#[derive(Debug, Clone, Default)]
pub struct WorkflowLoader {
    validator: Validator,
}

impl WorkflowLoader {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            validator: Validator::new(config),
        }
    }

    /// Load and validate a workflow definition from a YAML file
    pub fn load_workflow<P: AsRef<Path>>(
        &self,
        path: P,
    ) -> Result<WorkflowDefinition, DefinitionError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        log::debug!("Loading workflow from {}", path.display());
        self.parse_str(&content)
    }

    /// Parse and validate a workflow definition from YAML or JSON text
    pub fn parse_str(&self, content: &str) -> Result<WorkflowDefinition, DefinitionError> {
        self.validator.validate_str(content)
    }

    /// Parse a workflow definition from a YAML string with default limits
    pub fn parse_yaml(content: &str) -> Result<WorkflowDefinition, DefinitionError> {
        Self::default().parse_str(content)
    }

    /// Serialize a definition back to YAML
    pub fn to_yaml(def: &WorkflowDefinition) -> Result<String, DefinitionError> {
        serde_yaml::to_string(def).map_err(|e| DefinitionError::Parse(e.to_string()))
    }
}
