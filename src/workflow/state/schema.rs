// SPDX-License-Identifier: MIT

//! State tiers, tier-qualified paths and state declarations

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

use crate::error::StateError;

/// The three state tiers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Step outputs and explicit updates
    Raw,
    /// Derived fields, never written directly
    Computed,
    /// Request-scoped context
    Session,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Raw => "raw",
            Tier::Computed => "computed",
            Tier::Session => "session",
        }
    }
}

/// A write target such as `raw.analysis.score`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePath {
    pub tier: Tier,
    /// Field followed by nested object keys; never empty
    pub segments: Vec<String>,
}

impl StatePath {
    /// Parse `tier.field[.nested...]`, accepting an optional leading `state.`
    pub fn parse(path: &str) -> Result<Self, StateError> {
        let trimmed = path.strip_prefix("state.").unwrap_or(path);
        let mut parts = trimmed.split('.');
        let tier = match parts.next() {
            Some("raw") => Tier::Raw,
            Some("session") => Tier::Session,
            Some("computed") => Tier::Computed,
            _ => return Err(StateError::MissingTier(path.to_string())),
        };
        let segments: Vec<String> = parts.map(str::to_string).collect();
        if segments.is_empty() || segments.iter().any(|s| s.is_empty()) {
            return Err(StateError::MissingTier(path.to_string()));
        }
        Ok(Self { tier, segments })
    }

    /// Parse and reject the computed tier
    pub fn writable(path: &str) -> Result<Self, StateError> {
        let parsed = Self::parse(path)?;
        if parsed.tier == Tier::Computed {
            return Err(StateError::ComputedNotWritable(path.to_string()));
        }
        Ok(parsed)
    }

    /// Top-level field name, as seen in the flattened view
    pub fn field(&self) -> &str {
        &self.segments[0]
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.tier.as_str(), self.segments.join("."))
    }
}

/// Initial contents of the writable tiers
///
/// Accepts either `{raw: {...}, session: {...}}` or a flat object, which is
/// taken as the raw tier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(from = "Map<String, Value>")]
pub struct InitialState {
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub raw: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub session: Map<String, Value>,
}

impl From<Map<String, Value>> for InitialState {
    fn from(map: Map<String, Value>) -> Self {
        let tiered = !map.is_empty()
            && map
                .iter()
                .all(|(k, v)| (k == "raw" || k == "session") && v.is_object());
        if !tiered {
            return Self {
                raw: map,
                session: Map::new(),
            };
        }
        let mut state = Self::default();
        for (k, v) in map {
            if let Value::Object(obj) = v {
                if k == "raw" {
                    state.raw = obj;
                } else {
                    state.session = obj;
                }
            }
        }
        state
    }
}

impl InitialState {
    /// Every top-level field name declared in either tier
    pub fn field_names(&self) -> impl Iterator<Item = &String> {
        self.raw.keys().chain(self.session.keys())
    }
}

/// A derived field: an expression plus the fields it depends on
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "ComputedFieldRepr")]
pub struct ComputedFieldDef {
    pub expr: String,
    /// Explicit dependencies; inferred from the expression when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depends_on: Option<Vec<String>>,
}

impl ComputedFieldDef {
    pub fn new(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            depends_on: None,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ComputedFieldRepr {
    Expr(String),
    Full {
        expr: String,
        #[serde(default)]
        depends_on: Option<Vec<String>>,
    },
}

impl From<ComputedFieldRepr> for ComputedFieldDef {
    fn from(repr: ComputedFieldRepr) -> Self {
        match repr {
            ComputedFieldRepr::Expr(expr) => Self::new(expr),
            ComputedFieldRepr::Full { expr, depends_on } => Self { expr, depends_on },
        }
    }
}
