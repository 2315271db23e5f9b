//! Current unit selection
//!
//! The selection survives restarts by name only. A restored name is held as
//! a deferred selection until the first config load, matched once, and then
//! forgotten whether it matched or not.

use std::path::Path;

use tracing::{debug, info};

use crate::config::{ProjectConfig, Unit};
use crate::error::Precondition;
use crate::protocol::QuickPickItem;

#[derive(Debug, Default)]
pub struct UnitSelector {
    current: Option<Unit>,
    deferred: Option<String>,
}

impl UnitSelector {
    /// Selector restoring `deferred` on the next config load
    pub fn new(deferred: Option<String>) -> Self {
        Self {
            current: None,
            deferred,
        }
    }

    pub fn current(&self) -> Option<&Unit> {
        self.current.as_ref()
    }

    pub fn current_name(&self) -> Option<&str> {
        self.current.as_ref().map(Unit::name)
    }

    pub fn deferred(&self) -> Option<&str> {
        self.deferred.as_deref()
    }

    /// Replace the selection; an explicit choice cancels any pending restore
    pub fn set_current_unit(&mut self, unit: Option<Unit>) {
        info!(unit = ?unit.as_ref().map(Unit::name), "Current unit changed");
        self.deferred = None;
        self.current = unit;
    }

    /// Match the deferred name against a freshly loaded config, once
    ///
    /// Returns true when the selection changed.
    pub fn resolve_deferred(&mut self, config: &ProjectConfig) -> bool {
        let Some(name) = self.deferred.take() else {
            return false;
        };
        match config.find_unit(&name) {
            Some(unit) => {
                info!(unit = %name, "Restored current unit");
                self.current = Some(unit.clone());
                true
            }
            None => {
                debug!(unit = %name, "Restored unit not found, dropping");
                false
            }
        }
    }

    /// Select the unit whose source file is `active_file`
    ///
    /// On failure the selection is left unchanged.
    pub fn resolve_from_active_file(
        &mut self,
        config: &ProjectConfig,
        root: &Path,
        active_file: Option<&Path>,
    ) -> Result<&Unit, Precondition> {
        let active_file = active_file.ok_or(Precondition::NoActiveEditor)?;
        let rel_path = active_file
            .strip_prefix(root)
            .map_err(|_| Precondition::NotInWorkspace)?;
        let rel_path = rel_path.to_string_lossy();
        let unit = config
            .find_unit_by_source(&rel_path)
            .ok_or(Precondition::NoUnitForSource)?;
        info!(unit = %unit.name(), source = %rel_path, "Resolved unit from active file");
        self.deferred = None;
        Ok(self.current.insert(unit.clone()))
    }
}

/// Picker entries: every unit not marked auto-generated
pub fn quick_pick_items(config: &ProjectConfig) -> Vec<QuickPickItem> {
    config
        .units()
        .iter()
        .filter(|unit| !unit.is_auto_generated())
        .map(|unit| QuickPickItem {
            label: unit.name().to_string(),
            description: unit.source_path().map(str::to_string),
        })
        .collect()
}
