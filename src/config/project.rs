//! Project configuration (`objdiff.json`) model and resolution
//!
//! The file is parsed into [`ProjectConfig`] as-is and then passed once through
//! [`resolve`], which fills defaults, folds legacy fields and computes unit
//! paths. Everything downstream only ever sees the resolved shape.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::config::{DEFAULT_BUILD_COMMAND, DEFAULT_WATCH_PATTERNS, UNNAMED_UNIT};

/// Project configuration as found in `objdiff.json`
///
/// Immutable once loaded; a reload replaces it wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_make: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_args: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_target: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_base: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub watch_patterns: Option<Vec<String>>,
    /// Legacy alias of `units`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub objects: Option<Vec<Unit>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub units: Option<Vec<Unit>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_categories: Option<Vec<ProgressCategory>>,
}

/// One comparable translation unit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Shared path, combined with the config's `target_dir` / `base_dir`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_path: Option<String>,
    /// Legacy, folded into `metadata.reverse_fn_order`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_fn_order: Option<bool>,
    /// Legacy, folded into `metadata.complete`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scratch: Option<Scratch>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
    /// Manual symbol mappings from target to base
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub symbol_mappings: Option<BTreeMap<String, String>>,
}

/// Settings for the external scratch-sharing integration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scratch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compiler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub c_flags: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ctx_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_ctx: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub complete: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reverse_fn_order: Option<bool>,
    /// Source file that produces the object, relative to the workspace root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_categories: Option<Vec<String>>,
    /// Hidden from pickers, still included in reports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_generated: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressCategory {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ProjectConfig {
    pub fn build_command(&self) -> &str {
        self.custom_make.as_deref().unwrap_or(DEFAULT_BUILD_COMMAND)
    }

    pub fn build_args(&self) -> &[String] {
        self.custom_args.as_deref().unwrap_or_default()
    }

    pub fn build_target(&self) -> bool {
        self.build_target.unwrap_or(false)
    }

    pub fn build_base(&self) -> bool {
        self.build_base.unwrap_or(true)
    }

    pub fn watch_patterns(&self) -> Vec<String> {
        match &self.watch_patterns {
            Some(patterns) => patterns.clone(),
            None => default_watch_patterns(),
        }
    }

    pub fn units(&self) -> &[Unit] {
        self.units.as_deref().unwrap_or_default()
    }

    pub fn find_unit(&self, name: &str) -> Option<&Unit> {
        self.units().iter().find(|unit| unit.name() == name)
    }

    /// Unit whose recorded source file matches `rel_path`
    pub fn find_unit_by_source(&self, rel_path: &str) -> Option<&Unit> {
        self.units()
            .iter()
            .find(|unit| unit.source_path() == Some(rel_path))
    }
}

impl Unit {
    pub fn name(&self) -> &str {
        non_empty(&self.name)
            .or(non_empty(&self.path))
            .unwrap_or(UNNAMED_UNIT)
    }

    /// Target object path, ignoring an empty string
    pub fn target_path(&self) -> Option<&str> {
        non_empty(&self.target_path)
    }

    /// Base object path, ignoring an empty string
    pub fn base_path(&self) -> Option<&str> {
        non_empty(&self.base_path)
    }

    pub fn source_path(&self) -> Option<&str> {
        self.metadata.as_ref()?.source_path.as_deref()
    }

    pub fn is_auto_generated(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.auto_generated)
            .unwrap_or(false)
    }

    pub fn is_complete(&self) -> Option<bool> {
        self.metadata.as_ref().and_then(|m| m.complete)
    }

    pub fn reverse_fn_order(&self) -> bool {
        self.metadata
            .as_ref()
            .and_then(|m| m.reverse_fn_order)
            .unwrap_or(false)
    }
}

/// Empty strings in the config mean "not set"
fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

pub fn default_watch_patterns() -> Vec<String> {
    DEFAULT_WATCH_PATTERNS.iter().map(|p| p.to_string()).collect()
}

/// Normalize a freshly parsed configuration
///
/// Idempotent: resolving an already resolved config returns it unchanged.
/// Values that are already present are never overwritten.
pub fn resolve(mut config: ProjectConfig) -> ProjectConfig {
    if config.watch_patterns.is_none() {
        config.watch_patterns = Some(default_watch_patterns());
    }
    if config.build_target.is_none() {
        config.build_target = Some(false);
    }
    if config.build_base.is_none() {
        config.build_base = Some(true);
    }

    let objects = config.objects.take();
    let mut units = config.units.take().or(objects).unwrap_or_default();
    for unit in &mut units {
        resolve_unit(unit, non_empty(&config.target_dir), non_empty(&config.base_dir));
    }
    config.units = Some(units);
    config
}

fn resolve_unit(unit: &mut Unit, target_dir: Option<&str>, base_dir: Option<&str>) {
    if non_empty(&unit.name).is_none() {
        unit.name = Some(unit.name().to_string());
    }

    if let Some(path) = non_empty(&unit.path) {
        if unit.target_path().is_none() {
            if let Some(dir) = target_dir {
                unit.target_path = Some(format!("{dir}/{path}"));
            }
        }
        if unit.base_path().is_none() {
            if let Some(dir) = base_dir {
                unit.base_path = Some(format!("{dir}/{path}"));
            }
        }
    }

    let metadata = unit.metadata.get_or_insert_with(Metadata::default);
    if metadata.complete.is_none() {
        metadata.complete = unit.complete;
    }
    if metadata.reverse_fn_order.is_none() {
        metadata.reverse_fn_order = unit.reverse_fn_order;
    }
}
