use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::environment::ProvisionEnvironmentInstruction;
use crate::instruction::{rolled_back_patch_id, ProvisionUnitInstruction, UnitInstructionKind};

/// Identity of a unit plus the version and patches it currently carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionUnitInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub patches: Vec<String>,
}

impl ProvisionUnitInfo {
    pub fn new(name: impl Into<String>, version: Option<String>) -> Self {
        Self {
            name: name.into(),
            version,
            patches: Vec::new(),
        }
    }

    pub fn is_installed(&self) -> bool {
        self.version.is_some()
    }

    /// State after `instruction`. Version changes reset the patch list; a
    /// `rollback-<id>` patch drops `<id>` again.
    pub fn apply(&self, instruction: &ProvisionUnitInstruction) -> Self {
        let mut next = Self {
            name: self.name.clone(),
            version: instruction.resulting_version().map(str::to_string),
            patches: Vec::new(),
        };
        if instruction.kind() != UnitInstructionKind::Patch {
            return next;
        }

        next.patches = self.patches.clone();
        if let Some(id) = instruction.id() {
            match rolled_back_patch_id(id) {
                Some(original) if next.patches.iter().any(|patch| patch == original) => {
                    next.patches.retain(|patch| patch != original);
                }
                _ if next.patches.iter().any(|patch| patch == id) => {}
                _ => next.patches.push(id.to_string()),
            }
        }
        next
    }
}

/// Installed units of an environment, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentState {
    #[serde(default)]
    pub units: BTreeMap<String, ProvisionUnitInfo>,
}

impl EnvironmentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unit(&self, name: &str) -> Option<&ProvisionUnitInfo> {
        self.units.get(name)
    }

    pub fn version_of(&self, name: &str) -> Option<&str> {
        self.units.get(name).and_then(|unit| unit.version.as_deref())
    }

    pub fn unit_or_fresh(&self, name: &str) -> ProvisionUnitInfo {
        self.units
            .get(name)
            .cloned()
            .unwrap_or_else(|| ProvisionUnitInfo::new(name, None))
    }

    pub fn apply_unit(&mut self, info: ProvisionUnitInfo) {
        if info.is_installed() {
            self.units.insert(info.name.clone(), info);
        } else {
            self.units.remove(&info.name);
        }
    }

    pub fn apply(&self, instruction: &ProvisionEnvironmentInstruction) -> Self {
        let mut next = self.clone();
        for unit in instruction.units() {
            let info = next.unit_or_fresh(unit.unit_name()).apply(unit);
            next.apply_unit(info);
        }
        next
    }
}
