use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use provisio_core::{
    validate_unit_name, ContentPath, EnvironmentState, ProvisionEnvironmentInstruction,
    ProvisionError, ProvisionUnitInfo, ProvisionUnitInstruction, Result,
};

use crate::fsimage::FsImage;
use crate::history::{HistoryChain, RecordId};
use crate::layout::EnvironmentLayout;

const INSTRUCTION_FILE: &str = "instruction.toml";
const STATE_FILE: &str = "state.json";
const UNITS_FILE: &str = "units";
const PATHS_FILE: &str = "paths";
const DETACHED_FILE: &str = "detached";
const DETACHED_DIR: &str = "detached";
const CHAIN_DIR: &str = "chain";
const BACKUP_DIR: &str = "backup";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentRecord {
    pub id: RecordId,
    pub state: EnvironmentState,
    pub instruction: ProvisionEnvironmentInstruction,
    /// Unit records created alongside this record, by unit name.
    pub unit_records: BTreeMap<String, RecordId>,
    /// Units uninstalled by this record. Their whole history chain is kept
    /// inside the record until it is rolled back.
    pub detached_units: BTreeSet<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitRecord {
    pub id: RecordId,
    pub info: ProvisionUnitInfo,
    pub instruction: ProvisionUnitInstruction,
    /// Content paths the unit owns once this record is applied.
    pub manifest: BTreeSet<ContentPath>,
}

/// Environment-scoped history chain.
#[derive(Debug, Clone)]
pub struct EnvironmentHistory {
    chain: HistoryChain,
}

impl EnvironmentHistory {
    pub fn new(layout: &EnvironmentLayout) -> Self {
        Self {
            chain: HistoryChain::new(layout.history_dir()),
        }
    }

    pub fn chain(&self) -> &HistoryChain {
        &self.chain
    }

    pub fn last_record(&self, image: &FsImage) -> Result<Option<EnvironmentRecord>> {
        self.chain
            .last_applied(image)?
            .map(|id| self.load(image, &id))
            .transpose()
    }

    pub fn current_state(&self, image: &FsImage) -> Result<EnvironmentState> {
        Ok(self
            .last_record(image)?
            .map(|record| record.state)
            .unwrap_or_default())
    }

    pub fn load(&self, image: &FsImage, id: &RecordId) -> Result<EnvironmentRecord> {
        let dir = self.chain.record_dir(id);
        let state = parse_state(&dir, &self.chain.read_record_file(image, id, STATE_FILE)?)?;
        let instruction = ProvisionEnvironmentInstruction::from_toml_str(&record_text(
            &dir,
            self.chain.read_record_file(image, id, INSTRUCTION_FILE)?,
        )?)?;
        let unit_records = parse_unit_records(
            &dir,
            &record_text(&dir, self.chain.read_record_file(image, id, UNITS_FILE)?)?,
        )?;
        let detached_units = parse_detached_units(
            &dir,
            &record_text(&dir, self.chain.read_record_file(image, id, DETACHED_FILE)?)?,
        )?;
        Ok(EnvironmentRecord {
            id: id.clone(),
            state,
            instruction,
            unit_records,
            detached_units,
        })
    }

    /// Where record `id` keeps the history chain of a unit it uninstalled.
    pub fn detached_chain_dir(&self, id: &RecordId, unit: &str) -> PathBuf {
        self.detached_dir(id, unit).join(CHAIN_DIR)
    }

    /// Prior bytes of the files removed when record `id` uninstalled `unit`.
    pub fn detached_backup_dir(&self, id: &RecordId, unit: &str) -> PathBuf {
        self.detached_dir(id, unit).join(BACKUP_DIR)
    }

    fn detached_dir(&self, id: &RecordId, unit: &str) -> PathBuf {
        self.chain.record_dir(id).join(DETACHED_DIR).join(unit)
    }

    /// Newest-first list of every record.
    pub fn records_backward(&self, image: &FsImage) -> Result<Vec<EnvironmentRecord>> {
        self.chain
            .iter_backward(image)
            .map(|id| id.and_then(|id| self.load(image, &id)))
            .collect()
    }

    /// The single instruction taking an empty environment to the newest
    /// recorded state, squashed oldest-first.
    pub fn cumulative_instruction(&self, image: &FsImage) -> Result<ProvisionEnvironmentInstruction> {
        let mut records = self.records_backward(image)?;
        records.reverse();
        records
            .iter()
            .try_fold(ProvisionEnvironmentInstruction::new(), |merged, record| {
                merged.merge_with(&record.instruction)
            })
    }

    pub fn allocate_id(&self, image: &FsImage) -> Result<RecordId> {
        self.chain.allocate_id(image)
    }

    pub fn schedule_record(
        &self,
        image: &mut FsImage,
        id: &RecordId,
        state: &EnvironmentState,
        instruction: &ProvisionEnvironmentInstruction,
        unit_records: &BTreeMap<String, RecordId>,
        detached_units: &BTreeSet<String>,
    ) -> Result<()> {
        let units = unit_records
            .iter()
            .map(|(unit, record)| format!("{unit}={record}\n"))
            .collect::<String>();
        let detached = detached_units
            .iter()
            .map(|unit| format!("{unit}\n"))
            .collect::<String>();
        self.chain.schedule_append(
            image,
            id,
            vec![
                (INSTRUCTION_FILE, instruction.to_toml_string()?.into_bytes()),
                (STATE_FILE, render_state(state)?),
                (UNITS_FILE, units.into_bytes()),
                (DETACHED_FILE, detached.into_bytes()),
            ],
        )
    }
}

/// History chain of one unit.
#[derive(Debug, Clone)]
pub struct UnitHistory {
    unit: String,
    chain: HistoryChain,
}

impl UnitHistory {
    pub fn new(layout: &EnvironmentLayout, unit: &str) -> Self {
        Self {
            unit: unit.to_string(),
            chain: HistoryChain::new(layout.unit_history_dir(unit)),
        }
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn chain(&self) -> &HistoryChain {
        &self.chain
    }

    pub fn last_record(&self, image: &FsImage) -> Result<Option<UnitRecord>> {
        self.chain
            .last_applied(image)?
            .map(|id| self.load(image, &id))
            .transpose()
    }

    /// Paths owned by the unit according to its newest record.
    pub fn manifest(&self, image: &FsImage) -> Result<BTreeSet<ContentPath>> {
        Ok(self
            .last_record(image)?
            .map(|record| record.manifest)
            .unwrap_or_default())
    }

    pub fn load(&self, image: &FsImage, id: &RecordId) -> Result<UnitRecord> {
        let dir = self.chain.record_dir(id);
        let info: ProvisionUnitInfo =
            serde_json::from_slice(&self.chain.read_record_file(image, id, STATE_FILE)?)
                .map_err(|err| {
                    ProvisionError::history_corrupt(dir.join(STATE_FILE), err.to_string())
                })?;
        let instruction = ProvisionUnitInstruction::from_toml_str(&record_text(
            &dir,
            self.chain.read_record_file(image, id, INSTRUCTION_FILE)?,
        )?)?;
        let manifest = parse_manifest(
            &dir,
            &record_text(&dir, self.chain.read_record_file(image, id, PATHS_FILE)?)?,
        )?;
        Ok(UnitRecord {
            id: id.clone(),
            info,
            instruction,
            manifest,
        })
    }

    pub fn allocate_id(&self, image: &FsImage) -> Result<RecordId> {
        self.chain.allocate_id(image)
    }

    pub fn backup_dir(&self, id: &RecordId) -> PathBuf {
        self.chain.record_dir(id).join(BACKUP_DIR)
    }

    pub fn schedule_record(
        &self,
        image: &mut FsImage,
        id: &RecordId,
        info: &ProvisionUnitInfo,
        instruction: &ProvisionUnitInstruction,
        manifest: &BTreeSet<ContentPath>,
    ) -> Result<()> {
        let state = serde_json::to_vec_pretty(info)
            .map_err(|err| ProvisionError::serialization(err.to_string()))?;
        let paths = manifest
            .iter()
            .map(|path| format!("{path}\n"))
            .collect::<String>();
        self.chain.schedule_append(
            image,
            id,
            vec![
                (INSTRUCTION_FILE, instruction.to_toml_string()?.into_bytes()),
                (STATE_FILE, state),
                (PATHS_FILE, paths.into_bytes()),
            ],
        )
    }
}

fn render_state(state: &EnvironmentState) -> Result<Vec<u8>> {
    serde_json::to_vec_pretty(state).map_err(|err| ProvisionError::serialization(err.to_string()))
}

fn parse_state(dir: &Path, bytes: &[u8]) -> Result<EnvironmentState> {
    serde_json::from_slice(bytes)
        .map_err(|err| ProvisionError::history_corrupt(dir.join(STATE_FILE), err.to_string()))
}

fn record_text(dir: &Path, bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|_| ProvisionError::history_corrupt(dir, "record file is not UTF-8"))
}

fn parse_unit_records(dir: &Path, raw: &str) -> Result<BTreeMap<String, RecordId>> {
    let mut records = BTreeMap::new();
    for line in raw.lines().map(str::trim).filter(|line| !line.is_empty()) {
        let parsed = line
            .split_once('=')
            .and_then(|(unit, id)| RecordId::parse(id).map(|id| (unit.trim().to_string(), id)));
        let Some((unit, id)) = parsed else {
            return Err(ProvisionError::history_corrupt(
                dir.join(UNITS_FILE),
                format!("invalid unit record line: {line}"),
            ));
        };
        records.insert(unit, id);
    }
    Ok(records)
}

fn parse_detached_units(dir: &Path, raw: &str) -> Result<BTreeSet<String>> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|unit| {
            validate_unit_name(unit)
                .map(|()| unit.to_string())
                .map_err(|err| {
                    ProvisionError::history_corrupt(dir.join(DETACHED_FILE), err.to_string())
                })
        })
        .collect()
}

fn parse_manifest(dir: &Path, raw: &str) -> Result<BTreeSet<ContentPath>> {
    raw.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(|line| {
            line.parse::<ContentPath>().map_err(|err| {
                ProvisionError::history_corrupt(dir.join(PATHS_FILE), err.to_string())
            })
        })
        .collect()
}
