use std::fmt;

use provisio_core::{EnvironmentState, UnitInstructionKind};

use crate::history::RecordId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Apply,
    Rollback,
    Uninstall,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Apply => "apply",
            Self::Rollback => "rollback",
            Self::Uninstall => "uninstall",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcomeStatus {
    Applied,
    /// Everything already matched; no record was written.
    Unchanged,
    SkippedByPolicy,
    SkippedByCondition,
    RolledBack,
}

impl UnitOutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Unchanged => "unchanged",
            Self::SkippedByPolicy => "skipped-by-policy",
            Self::SkippedByCondition => "skipped-by-condition",
            Self::RolledBack => "rolled-back",
        }
    }

    pub fn is_skipped(self) -> bool {
        matches!(self, Self::SkippedByPolicy | Self::SkippedByCondition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitOutcome {
    pub unit: String,
    pub kind: UnitInstructionKind,
    pub status: UnitOutcomeStatus,
    pub version: Option<String>,
    pub written: usize,
    pub deleted: usize,
    pub skipped_items: usize,
    pub record: Option<RecordId>,
}

impl UnitOutcome {
    pub(crate) fn skipped(
        unit: &str,
        kind: UnitInstructionKind,
        status: UnitOutcomeStatus,
        version: Option<String>,
    ) -> Self {
        Self {
            unit: unit.to_string(),
            kind,
            status,
            version,
            written: 0,
            deleted: 0,
            skipped_items: 0,
            record: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub operation: OperationKind,
    /// Environment record written by the operation; `None` for rollbacks and
    /// for applies that changed nothing.
    pub record: Option<RecordId>,
    pub units: Vec<UnitOutcome>,
    pub state: EnvironmentState,
}

impl ApplyReport {
    pub fn unit(&self, name: &str) -> Option<&UnitOutcome> {
        self.units.iter().find(|outcome| outcome.unit == name)
    }

    pub fn files_written(&self) -> usize {
        self.units.iter().map(|outcome| outcome.written).sum()
    }

    pub fn files_deleted(&self) -> usize {
        self.units.iter().map(|outcome| outcome.deleted).sum()
    }
}
