use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::error::{ProvisionError, Result};
use crate::path::ContentPath;

/// Gate deciding whether a unit or content instruction is applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum UpdatePolicy {
    /// Apply unconditionally.
    Forced,
    /// Apply only when the instruction's conditions hold.
    #[default]
    Conditioned,
    /// Never apply.
    Ignored,
}

impl UpdatePolicy {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Forced => "forced",
            Self::Conditioned => "conditioned",
            Self::Ignored => "ignored",
        }
    }
}

impl fmt::Display for UpdatePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdatePolicy {
    type Err = ProvisionError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "forced" => Ok(Self::Forced),
            "conditioned" => Ok(Self::Conditioned),
            "ignored" => Ok(Self::Ignored),
            other => Err(ProvisionError::serialization(format!(
                "invalid update policy: {other}"
            ))),
        }
    }
}

/// Per-unit policy with per-path overrides.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct UnitUpdatePolicy {
    pub unit_policy: UpdatePolicy,
    pub default_content_policy: UpdatePolicy,
    pub path_overrides: BTreeMap<ContentPath, UpdatePolicy>,
}

impl UnitUpdatePolicy {
    pub fn new(unit_policy: UpdatePolicy, default_content_policy: UpdatePolicy) -> Self {
        Self {
            unit_policy,
            default_content_policy,
            path_overrides: BTreeMap::new(),
        }
    }

    pub fn forced() -> Self {
        Self::new(UpdatePolicy::Forced, UpdatePolicy::Forced)
    }

    pub fn with_override(mut self, path: ContentPath, policy: UpdatePolicy) -> Self {
        self.path_overrides.insert(path, policy);
        self
    }

    /// Exact path override first, then the default content policy.
    pub fn content_policy(&self, path: &ContentPath) -> UpdatePolicy {
        self.path_overrides
            .get(path)
            .copied()
            .unwrap_or(self.default_content_policy)
    }
}
