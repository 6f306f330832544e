use std::collections::BTreeMap;
use std::fmt;

use crate::condition::InstructionCondition;
use crate::error::{ProvisionError, Result};
use crate::hash::ContentHash;
use crate::path::ContentPath;

const ROLLBACK_PATCH_PREFIX: &str = "rollback-";
const REAPPLY_PATCH_PREFIX: &str = "reapply-";

/// Per-file instruction. `content_hash == None` removes the file,
/// `replaced_hash == None` adds it, both present replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentItemInstruction {
    path: ContentPath,
    content_hash: Option<ContentHash>,
    replaced_hash: Option<ContentHash>,
    required: bool,
    conditions: Vec<InstructionCondition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentAction {
    Add,
    Remove,
    Replace,
}

impl ContentAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Remove => "remove",
            Self::Replace => "replace",
        }
    }
}

impl ContentItemInstruction {
    pub fn new(
        path: ContentPath,
        content_hash: Option<ContentHash>,
        replaced_hash: Option<ContentHash>,
    ) -> Result<Self> {
        if content_hash.is_none() && replaced_hash.is_none() {
            return Err(ProvisionError::invalid_instruction(format!(
                "content instruction for {path} has neither a content nor a replaced hash"
            )));
        }
        Ok(Self {
            path,
            content_hash,
            replaced_hash,
            required: true,
            conditions: Vec::new(),
        })
    }

    pub fn add(path: ContentPath, hash: ContentHash) -> Self {
        Self::from_parts(path, Some(hash), None)
    }

    pub fn remove(path: ContentPath, replaced: ContentHash) -> Self {
        Self::from_parts(path, None, Some(replaced))
    }

    pub fn replace(path: ContentPath, replaced: ContentHash, hash: ContentHash) -> Self {
        Self::from_parts(path, Some(hash), Some(replaced))
    }

    fn from_parts(
        path: ContentPath,
        content_hash: Option<ContentHash>,
        replaced_hash: Option<ContentHash>,
    ) -> Self {
        Self {
            path,
            content_hash,
            replaced_hash,
            required: true,
            conditions: Vec::new(),
        }
    }

    pub fn with_required(mut self, required: bool) -> Self {
        self.required = required;
        self
    }

    pub fn with_condition(mut self, condition: InstructionCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn path(&self) -> &ContentPath {
        &self.path
    }

    pub fn content_hash(&self) -> Option<&ContentHash> {
        self.content_hash.as_ref()
    }

    pub fn replaced_hash(&self) -> Option<&ContentHash> {
        self.replaced_hash.as_ref()
    }

    pub fn is_required(&self) -> bool {
        self.required
    }

    pub fn conditions(&self) -> &[InstructionCondition] {
        &self.conditions
    }

    pub fn action(&self) -> ContentAction {
        match (&self.replaced_hash, &self.content_hash) {
            (None, _) => ContentAction::Add,
            (Some(_), None) => ContentAction::Remove,
            (Some(_), Some(_)) => ContentAction::Replace,
        }
    }

    pub fn is_removal(&self) -> bool {
        self.content_hash.is_none()
    }

    /// Swaps the two hashes: add becomes remove, replace runs backwards.
    /// Declared conditions describe the forward direction and are dropped.
    pub fn rollback(&self) -> Self {
        Self::from_parts(self.path.clone(), self.replaced_hash, self.content_hash)
            .with_required(self.required)
    }

    /// Composes `self` followed by `next` on the same path. `Ok(None)` when the
    /// two cancel out.
    pub fn merge_with(&self, next: &Self) -> Result<Option<Self>> {
        if self.path != next.path {
            return Err(ProvisionError::invalid_instruction(format!(
                "cannot merge content instructions for different paths: {} and {}",
                self.path, next.path
            )));
        }
        if self.content_hash != next.replaced_hash {
            return Err(ProvisionError::HashMismatch {
                path: self.path.to_string(),
                expected: next.replaced_hash,
                actual: self.content_hash,
            });
        }
        if self.replaced_hash == next.content_hash {
            return Ok(None);
        }

        let mut conditions = self.conditions.clone();
        conditions.extend(next.conditions.iter().cloned());
        Ok(Some(Self {
            path: self.path.clone(),
            content_hash: next.content_hash,
            replaced_hash: self.replaced_hash,
            required: self.required || next.required,
            conditions,
        }))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitInstructionKind {
    Install,
    Uninstall,
    Patch,
    Update,
}

impl UnitInstructionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Install => "install",
            Self::Uninstall => "uninstall",
            Self::Patch => "patch",
            Self::Update => "update",
        }
    }
}

impl fmt::Display for UnitInstructionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything one unit goes through in a single apply: version transition,
/// patch id, content changes, and unit-level conditions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProvisionUnitInstruction {
    id: Option<String>,
    unit_name: String,
    required_version: Option<String>,
    resulting_version: Option<String>,
    content: Vec<ContentItemInstruction>,
    conditions: Vec<InstructionCondition>,
    integration_tasks: Vec<String>,
}

impl ProvisionUnitInstruction {
    pub fn new(
        unit_name: impl Into<String>,
        id: Option<String>,
        required_version: Option<String>,
        resulting_version: Option<String>,
    ) -> Result<Self> {
        let unit_name = unit_name.into();
        validate_unit_name(&unit_name)?;
        if required_version.is_none() && resulting_version.is_none() {
            return Err(ProvisionError::invalid_instruction(format!(
                "unit instruction for '{unit_name}' has neither a required nor a resulting version"
            )));
        }
        if required_version == resulting_version && id.is_none() {
            return Err(ProvisionError::invalid_instruction(format!(
                "patch for unit '{unit_name}' must carry a patch id"
            )));
        }
        Ok(Self {
            id,
            unit_name,
            required_version,
            resulting_version,
            content: Vec::new(),
            conditions: Vec::new(),
            integration_tasks: Vec::new(),
        })
    }

    pub fn install(unit_name: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        Self::new(unit_name, None, None, Some(version.into()))
    }

    pub fn uninstall(unit_name: impl Into<String>, version: impl Into<String>) -> Result<Self> {
        Self::new(unit_name, None, Some(version.into()), None)
    }

    pub fn update(
        unit_name: impl Into<String>,
        from: impl Into<String>,
        to: impl Into<String>,
    ) -> Result<Self> {
        Self::new(unit_name, None, Some(from.into()), Some(to.into()))
    }

    pub fn patch(
        unit_name: impl Into<String>,
        version: impl Into<String>,
        id: impl Into<String>,
    ) -> Result<Self> {
        let version = version.into();
        Self::new(unit_name, Some(id.into()), Some(version.clone()), Some(version))
    }

    pub fn with_content(mut self, item: ContentItemInstruction) -> Self {
        self.content.push(item);
        self
    }

    pub fn with_condition(mut self, condition: InstructionCondition) -> Self {
        self.conditions.push(condition);
        self
    }

    pub fn with_integration_task(mut self, task: impl Into<String>) -> Self {
        self.integration_tasks.push(task.into());
        self
    }

    pub fn push_content(&mut self, item: ContentItemInstruction) {
        self.content.push(item);
    }

    pub fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub fn unit_name(&self) -> &str {
        &self.unit_name
    }

    pub fn required_version(&self) -> Option<&str> {
        self.required_version.as_deref()
    }

    pub fn resulting_version(&self) -> Option<&str> {
        self.resulting_version.as_deref()
    }

    pub fn content(&self) -> &[ContentItemInstruction] {
        &self.content
    }

    pub fn conditions(&self) -> &[InstructionCondition] {
        &self.conditions
    }

    pub fn integration_tasks(&self) -> &[String] {
        &self.integration_tasks
    }

    pub fn kind(&self) -> UnitInstructionKind {
        match (&self.required_version, &self.resulting_version) {
            (None, _) => UnitInstructionKind::Install,
            (Some(_), None) => UnitInstructionKind::Uninstall,
            (Some(from), Some(to)) if from == to => UnitInstructionKind::Patch,
            (Some(_), Some(_)) => UnitInstructionKind::Update,
        }
    }

    /// Same unit and version transition with a different content list.
    pub fn with_replaced_content(&self, content: Vec<ContentItemInstruction>) -> Self {
        Self {
            content,
            ..self.clone()
        }
    }

    /// The same change starting from `from`, the version the unit was really
    /// at. A transition that no longer moves the version becomes a patch; it
    /// is tagged `reapply-<version>` when it carries no id of its own.
    pub fn rebased(&self, from: Option<&str>) -> Result<Self> {
        if self.required_version.as_deref() == from {
            return Ok(self.clone());
        }
        let required_version = from.map(str::to_string);
        let id = match (&required_version, &self.resulting_version) {
            (Some(from), Some(to)) if from == to => Some(
                self.id
                    .clone()
                    .unwrap_or_else(|| format!("{REAPPLY_PATCH_PREFIX}{to}")),
            ),
            _ => self.id.clone(),
        };
        let rebased = Self::new(
            self.unit_name.clone(),
            id,
            required_version,
            self.resulting_version.clone(),
        )?;
        Ok(Self {
            content: self.content.clone(),
            conditions: self.conditions.clone(),
            integration_tasks: self.integration_tasks.clone(),
            ..rebased
        })
    }

    /// The instruction that undoes this one. Patches roll back as patches
    /// tagged `rollback-<id>`; rolling back such a patch restores the
    /// original id.
    pub fn rollback(&self) -> Self {
        let id = match (self.kind(), self.id.as_deref()) {
            (UnitInstructionKind::Patch, Some(id)) => Some(rollback_patch_id(id)),
            (_, id) => id.map(str::to_string),
        };
        let mut integration_tasks = self.integration_tasks.clone();
        integration_tasks.reverse();

        Self {
            id,
            unit_name: self.unit_name.clone(),
            required_version: self.resulting_version.clone(),
            resulting_version: self.required_version.clone(),
            content: self.content.iter().map(ContentItemInstruction::rollback).collect(),
            conditions: Vec::new(),
            integration_tasks,
        }
    }

    /// Composes `self` followed by `next` into one instruction that takes the
    /// unit from `self`'s start state straight to `next`'s end state.
    /// `Ok(None)` when the pair is a no-op (install then uninstall, or a
    /// transition that returns to its start with no net content change).
    /// An install followed by another install stays an install of the later
    /// version.
    ///
    /// Two patches at the same version keep `next`'s id; which id a squashed
    /// patch should carry is not settled beyond that.
    pub fn merge_with(&self, next: &Self) -> Result<Option<Self>> {
        if self.unit_name != next.unit_name {
            return Err(ProvisionError::invalid_instruction(format!(
                "cannot merge instructions for different units: '{}' and '{}'",
                self.unit_name, next.unit_name
            )));
        }
        let reinstall = self.required_version.is_none() && next.required_version.is_none();
        if !reinstall && self.resulting_version != next.required_version {
            return Err(ProvisionError::UnitVersionMismatch {
                unit: self.unit_name.clone(),
                expected: next.required_version.clone(),
                actual: self.resulting_version.clone(),
            });
        }

        let content = merge_content(&self.content, &next.content)?;
        let required_version = self.required_version.clone();
        let resulting_version = next.resulting_version.clone();

        if required_version.is_none() && resulting_version.is_none() {
            if let Some(leftover) = content.first() {
                return Err(ProvisionError::HashMismatch {
                    path: leftover.path.to_string(),
                    expected: None,
                    actual: leftover.content_hash.or(leftover.replaced_hash),
                });
            }
            return Ok(None);
        }

        let id = if required_version == resulting_version {
            if content.is_empty() {
                return Ok(None);
            }
            let fallback_version = resulting_version.clone().unwrap_or_default();
            Some(
                next.id
                    .clone()
                    .or_else(|| self.id.clone())
                    .unwrap_or_else(|| format!("merged-{fallback_version}")),
            )
        } else {
            None
        };

        let mut conditions = self.conditions.clone();
        conditions.extend(
            next.conditions
                .iter()
                .filter(|condition| !is_version_condition_for(condition, &next.unit_name))
                .cloned(),
        );
        let mut integration_tasks = self.integration_tasks.clone();
        integration_tasks.extend(next.integration_tasks.iter().cloned());

        Ok(Some(Self {
            id,
            unit_name: self.unit_name.clone(),
            required_version,
            resulting_version,
            content,
            conditions,
            integration_tasks,
        }))
    }
}

/// Unit names double as metadata key prefixes and history directory names.
pub fn validate_unit_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(ProvisionError::invalid_instruction("unit name must not be empty"));
    }
    if name == "location" || name == "default-policy" {
        return Err(ProvisionError::invalid_instruction(format!(
            "unit name is reserved: {name}"
        )));
    }
    if name
        .chars()
        .any(|ch| matches!(ch, '.' | '/' | '\\' | '=' | ',') || ch.is_whitespace() || ch.is_control())
    {
        return Err(ProvisionError::invalid_instruction(format!(
            "unit name contains invalid characters: {name}"
        )));
    }
    Ok(())
}

// The intermediate version no longer holds once two steps are squashed.
fn is_version_condition_for(condition: &InstructionCondition, unit_name: &str) -> bool {
    matches!(condition, InstructionCondition::UnitVersion { unit, .. } if unit == unit_name)
}

fn rollback_patch_id(id: &str) -> String {
    match id.strip_prefix(ROLLBACK_PATCH_PREFIX) {
        Some(original) => original.to_string(),
        None => format!("{ROLLBACK_PATCH_PREFIX}{id}"),
    }
}

/// Returns the original patch id when `id` names the rollback of a patch.
pub fn rolled_back_patch_id(id: &str) -> Option<&str> {
    id.strip_prefix(ROLLBACK_PATCH_PREFIX)
}

fn merge_content(
    first: &[ContentItemInstruction],
    second: &[ContentItemInstruction],
) -> Result<Vec<ContentItemInstruction>> {
    let mut second_by_path: BTreeMap<&ContentPath, &ContentItemInstruction> = BTreeMap::new();
    for item in second {
        if second_by_path.insert(&item.path, item).is_some() {
            return Err(ProvisionError::invalid_instruction(format!(
                "duplicate content instruction for {}",
                item.path
            )));
        }
    }

    let mut merged = Vec::with_capacity(first.len() + second.len());
    for item in first {
        match second_by_path.remove(&item.path) {
            Some(next) => {
                if let Some(combined) = item.merge_with(next)? {
                    merged.push(combined);
                }
            }
            None => merged.push(item.clone()),
        }
    }
    merged.extend(
        second
            .iter()
            .filter(|item| second_by_path.contains_key(&item.path))
            .cloned(),
    );
    Ok(merged)
}
