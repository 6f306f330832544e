use serde::{Deserialize, Serialize};

use crate::condition::InstructionCondition;
use crate::environment::ProvisionEnvironmentInstruction;
use crate::error::{ProvisionError, Result};
use crate::hash::ContentHash;
use crate::instruction::{ContentAction, ContentItemInstruction, ProvisionUnitInstruction};
use crate::path::ContentPath;

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct InstructionDocument {
    #[serde(default, rename = "unit", skip_serializing_if = "Vec::is_empty")]
    units: Vec<UnitEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct UnitEntry {
    operation: String,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    required_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resulting_version: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    integration_tasks: Vec<String>,
    #[serde(default, rename = "condition", skip_serializing_if = "Vec::is_empty")]
    conditions: Vec<ConditionEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    content: Vec<ContentEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
struct ContentEntry {
    action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    hash: Option<ContentHash>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    replaced_hash: Option<ContentHash>,
    #[serde(default = "required_default", skip_serializing_if = "is_required_default")]
    required: bool,
    #[serde(default, rename = "condition", skip_serializing_if = "Vec::is_empty")]
    conditions: Vec<ConditionEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
enum ConditionEntry {
    UnitVersion {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
    },
    ContentHash {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        unit: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        location: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        path: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<ContentHash>,
    },
}

fn required_default() -> bool {
    true
}

fn is_required_default(value: &bool) -> bool {
    *value
}

impl ProvisionEnvironmentInstruction {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let document: InstructionDocument = toml::from_str(input).map_err(|err| {
            ProvisionError::serialization(format!("failed to parse instruction document: {err}"))
        })?;
        let units = document
            .units
            .into_iter()
            .map(UnitEntry::into_instruction)
            .collect::<Result<Vec<_>>>()?;
        Self::from_units(units).map_err(into_serialization)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        let document = InstructionDocument {
            units: self.units().iter().map(UnitEntry::from_instruction).collect(),
        };
        toml::to_string(&document).map_err(|err| {
            ProvisionError::serialization(format!("failed to write instruction document: {err}"))
        })
    }
}

impl ProvisionUnitInstruction {
    /// Parses a document holding exactly one unit operation.
    pub fn from_toml_str(input: &str) -> Result<Self> {
        let environment = ProvisionEnvironmentInstruction::from_toml_str(input)?;
        match environment.units() {
            [unit] => Ok(unit.clone()),
            units => Err(ProvisionError::serialization(format!(
                "expected exactly one unit operation, found {}",
                units.len()
            ))),
        }
    }

    pub fn to_toml_string(&self) -> Result<String> {
        ProvisionEnvironmentInstruction::from_units([self.clone()])?.to_toml_string()
    }
}

impl UnitEntry {
    fn from_instruction(unit: &ProvisionUnitInstruction) -> Self {
        Self {
            operation: unit.kind().as_str().to_string(),
            name: unit.unit_name().to_string(),
            id: unit.id().map(str::to_string),
            required_version: unit.required_version().map(str::to_string),
            resulting_version: unit.resulting_version().map(str::to_string),
            integration_tasks: unit.integration_tasks().to_vec(),
            conditions: unit
                .conditions()
                .iter()
                .map(|condition| ConditionEntry::from_condition(condition, unit.unit_name()))
                .collect(),
            content: unit
                .content()
                .iter()
                .map(|item| ContentEntry::from_item(item, unit.unit_name()))
                .collect(),
        }
    }

    fn into_instruction(self) -> Result<ProvisionUnitInstruction> {
        let mut unit = ProvisionUnitInstruction::new(
            self.name.clone(),
            self.id,
            self.required_version,
            self.resulting_version,
        )
        .map_err(into_serialization)?;
        if unit.kind().as_str() != self.operation {
            return Err(ProvisionError::serialization(format!(
                "unit '{}' declares operation '{}' but its versions describe '{}'",
                self.name,
                self.operation,
                unit.kind()
            )));
        }

        for condition in self.conditions {
            unit = unit.with_condition(condition.into_condition(&self.name)?);
        }
        for task in self.integration_tasks {
            unit = unit.with_integration_task(task);
        }
        for entry in self.content {
            unit.push_content(entry.into_item(&self.name)?);
        }
        Ok(unit)
    }
}

impl ContentEntry {
    fn from_item(item: &ContentItemInstruction, unit_name: &str) -> Self {
        Self {
            action: item.action().as_str().to_string(),
            location: item.path().location().map(str::to_string),
            path: item.path().relative_path().map(str::to_string),
            hash: item.content_hash().copied(),
            replaced_hash: item.replaced_hash().copied(),
            required: item.is_required(),
            conditions: item
                .conditions()
                .iter()
                .map(|condition| ConditionEntry::from_condition(condition, unit_name))
                .collect(),
        }
    }

    fn into_item(self, unit_name: &str) -> Result<ContentItemInstruction> {
        let path = ContentPath::new(self.location, self.path).map_err(into_serialization)?;
        let mut item = ContentItemInstruction::new(path.clone(), self.hash, self.replaced_hash)
            .map_err(into_serialization)?
            .with_required(self.required);
        let expected: ContentAction = item.action();
        if expected.as_str() != self.action {
            return Err(ProvisionError::serialization(format!(
                "content entry {path} declares action '{}' but its hashes describe '{}'",
                self.action,
                expected.as_str()
            )));
        }
        for condition in self.conditions {
            item = item.with_condition(condition.into_condition(unit_name)?);
        }
        Ok(item)
    }
}

impl ConditionEntry {
    // The enclosing unit is implied and left out of the document.
    fn from_condition(condition: &InstructionCondition, unit_name: &str) -> Self {
        let explicit_unit = |unit: &str| (unit != unit_name).then(|| unit.to_string());
        match condition {
            InstructionCondition::UnitVersion { unit, version } => Self::UnitVersion {
                unit: explicit_unit(unit),
                version: version.clone(),
            },
            InstructionCondition::ContentHash { unit, path, hash } => Self::ContentHash {
                unit: explicit_unit(unit),
                location: path.location().map(str::to_string),
                path: path.relative_path().map(str::to_string),
                hash: *hash,
            },
        }
    }

    fn into_condition(self, unit_name: &str) -> Result<InstructionCondition> {
        Ok(match self {
            Self::UnitVersion { unit, version } => InstructionCondition::UnitVersion {
                unit: unit.unwrap_or_else(|| unit_name.to_string()),
                version,
            },
            Self::ContentHash {
                unit,
                location,
                path,
                hash,
            } => InstructionCondition::ContentHash {
                unit: unit.unwrap_or_else(|| unit_name.to_string()),
                path: ContentPath::new(location, path).map_err(into_serialization)?,
                hash,
            },
        })
    }
}

fn into_serialization(err: ProvisionError) -> ProvisionError {
    match err {
        ProvisionError::InvalidInstruction { detail } => {
            ProvisionError::SerializationFailure { detail }
        }
        other => other,
    }
}
