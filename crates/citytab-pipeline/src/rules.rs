//! YAML-driven reconciliation and normalization rules.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::reconcile::ReconcileError;

const BUILTIN_RULES: &str = include_str!("../rules/reconcile.yaml");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SynonymRule {
    pub canonical: String,
    pub synonym: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    pub source: String,
    pub target: String,
}

/// How the text of one output column is coerced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizeRule {
    Percentage,
    Area,
    AreaText,
    Density,
    Integer,
    Location,
    Elevation,
    Date,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReconcileRules {
    pub version: u32,
    pub sparsity_threshold: usize,
    #[serde(default)]
    pub synonyms: Vec<SynonymRule>,
    pub target_schema: Vec<ColumnMapping>,
    #[serde(default)]
    pub drop: Vec<String>,
    #[serde(default)]
    pub normalize: BTreeMap<String, NormalizeRule>,
}

impl ReconcileRules {
    pub fn builtin() -> Result<Self> {
        Self::from_yaml_str(BUILTIN_RULES).context("parsing built-in rules/reconcile.yaml")
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let rules: Self = serde_yaml::from_str(text)?;
        rules.validate()?;
        Ok(rules)
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("serializing reconcile rules")
    }

    /// Output columns after renaming and dropping, in order.
    pub fn final_columns(&self) -> Vec<String> {
        self.target_schema
            .iter()
            .filter(|m| !self.drop.contains(&m.target))
            .map(|m| m.target.clone())
            .collect()
    }

    pub fn validate(&self) -> Result<(), ReconcileError> {
        let invalid = |msg: String| -> Result<(), ReconcileError> {
            Err(ReconcileError::InvalidRules(msg))
        };

        let mut sources = HashSet::new();
        let mut targets = HashSet::new();
        for mapping in &self.target_schema {
            if !sources.insert(mapping.source.as_str()) {
                return invalid(format!("source {:?} mapped twice", mapping.source));
            }
            if !targets.insert(mapping.target.as_str()) {
                return invalid(format!("target {:?} used twice", mapping.target));
            }
        }
        for mapping in &self.target_schema {
            if mapping.source != mapping.target && sources.contains(mapping.target.as_str()) {
                return invalid(format!(
                    "target {:?} collides with another source column",
                    mapping.target
                ));
            }
        }
        for column in &self.drop {
            if !targets.contains(column.as_str()) {
                return invalid(format!("dropped column {column:?} is not a target"));
            }
        }
        for rule in &self.synonyms {
            if rule.canonical == rule.synonym {
                return invalid(format!("synonym rule maps {:?} onto itself", rule.canonical));
            }
        }
        Ok(())
    }
}
