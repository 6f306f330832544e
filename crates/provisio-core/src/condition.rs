use crate::error::{ProvisionError, Result};
use crate::hash::ContentHash;
use crate::path::ContentPath;

/// Read access to the environment as it will look once the staged batch
/// lands, used to evaluate instruction conditions.
pub trait ConditionContext {
    /// Installed version of `unit`, `Ok(None)` when the unit is not installed.
    fn unit_version(&self, unit: &str) -> Result<Option<String>>;

    /// Hash of the content currently at `path` for `unit`, `Ok(None)` when absent.
    fn content_hash(&self, unit: &str, path: &ContentPath) -> Result<Option<ContentHash>>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstructionCondition {
    /// The unit must currently be at exactly `version`; `None` means the unit
    /// must not be installed yet. Violations are errors, never `false`.
    UnitVersion {
        unit: String,
        version: Option<String>,
    },
    /// Content at `path` must hash to `hash`; `None` means the path must be absent.
    ContentHash {
        unit: String,
        path: ContentPath,
        hash: Option<ContentHash>,
    },
}

impl InstructionCondition {
    pub fn evaluate(&self, context: &dyn ConditionContext) -> Result<bool> {
        match self {
            Self::UnitVersion { unit, version } => {
                check_unit_version(context, unit, version.as_deref())?;
                Ok(true)
            }
            Self::ContentHash { unit, path, hash } => {
                Ok(context.content_hash(unit, path)? == *hash)
            }
        }
    }
}

fn check_unit_version(
    context: &dyn ConditionContext,
    unit: &str,
    required: Option<&str>,
) -> Result<()> {
    let current = context.unit_version(unit)?;
    match (required, current) {
        (None, None) => Ok(()),
        (None, Some(version)) => Err(ProvisionError::UnitAlreadyInstalled {
            unit: unit.to_string(),
            version,
        }),
        (Some(_), None) => Err(ProvisionError::UnitUnknown {
            unit: unit.to_string(),
        }),
        (Some(required), Some(version)) if version == required => Ok(()),
        (Some(required), Some(version)) => Err(ProvisionError::UnitVersionMismatch {
            unit: unit.to_string(),
            expected: Some(required.to_string()),
            actual: Some(version),
        }),
    }
}
