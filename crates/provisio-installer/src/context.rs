use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use provisio_core::{
    ConditionContext, ContentHash, ContentItemInstruction, ContentPath, EnvironmentState,
    InstructionCondition, ProvisionEnvironmentInstruction, ProvisionError, ProvisionUnitInfo,
    ProvisionUnitInstruction, Result, UnitUpdatePolicy, UpdatePolicy,
};
use tracing::{debug, info};

use crate::fsimage::FsImage;
use crate::history::RecordId;
use crate::journal::Journal;
use crate::layout::EnvironmentLayout;
use crate::metadata::EnvironmentMetadata;
use crate::records::{EnvironmentHistory, EnvironmentRecord, UnitHistory, UnitRecord};
use crate::sources::{
    package_relative_path, ContentSource, HistoryBackupSource, NoContentSource,
};
use crate::types::{ApplyReport, OperationKind, UnitOutcome, UnitOutcomeStatus};

static TRANSACTION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Entry point for applying, rolling back, and uninstalling against one
/// environment home. Assumes exclusive access to the home for the duration
/// of each call.
#[derive(Debug)]
pub struct ApplicationContext {
    layout: EnvironmentLayout,
    metadata: EnvironmentMetadata,
    environment: EnvironmentHistory,
}

impl ApplicationContext {
    pub fn open(home: impl Into<PathBuf>) -> Result<Self> {
        let layout = EnvironmentLayout::new(home);
        layout.ensure_base_dirs()?;
        let metadata = EnvironmentMetadata::read(&layout.properties_path())?;
        let environment = EnvironmentHistory::new(&layout);
        debug!(home = %layout.home().display(), "opened environment");
        Ok(Self {
            layout,
            metadata,
            environment,
        })
    }

    pub fn layout(&self) -> &EnvironmentLayout {
        &self.layout
    }

    pub fn metadata(&self) -> &EnvironmentMetadata {
        &self.metadata
    }

    pub fn state(&self) -> Result<EnvironmentState> {
        self.environment.current_state(&self.read_view())
    }

    pub fn manifest(&self, unit: &str) -> Result<BTreeSet<ContentPath>> {
        UnitHistory::new(&self.layout, unit).manifest(&self.read_view())
    }

    /// Environment records, newest first.
    pub fn history(&self) -> Result<Vec<EnvironmentRecord>> {
        self.environment.records_backward(&self.read_view())
    }

    /// Records of one unit, newest first.
    pub fn unit_history(&self, unit: &str) -> Result<Vec<UnitRecord>> {
        let image = self.read_view();
        let history = UnitHistory::new(&self.layout, unit);
        history
            .chain()
            .iter_backward(&image)
            .map(|id| id.and_then(|id| history.load(&image, &id)))
            .collect()
    }

    pub fn cumulative_instruction(&self) -> Result<ProvisionEnvironmentInstruction> {
        self.environment.cumulative_instruction(&self.read_view())
    }

    pub fn apply(
        &mut self,
        instruction: &ProvisionEnvironmentInstruction,
        source: &dyn ContentSource,
    ) -> Result<ApplyReport> {
        let mut strategy = ForwardApply::new(OperationKind::Apply, source, &self.environment);
        let (report, metadata) = self.run(instruction, &mut strategy)?;
        self.metadata = metadata;
        Ok(report)
    }

    /// Undoes the newest environment record. `Ok(None)` when history is empty.
    pub fn rollback_last(&mut self) -> Result<Option<ApplyReport>> {
        let image = self.read_view();
        let Some(record) = self.environment.last_record(&image)? else {
            info!("history is empty; nothing to roll back");
            return Ok(None);
        };

        let mut source = HistoryBackupSource::new();
        for (unit, id) in &record.unit_records {
            source.insert(unit.clone(), UnitHistory::new(&self.layout, unit).backup_dir(id));
        }
        for unit in &record.detached_units {
            source.insert(unit.clone(), self.environment.detached_backup_dir(&record.id, unit));
        }
        let instruction = record.instruction.rollback();
        let mut strategy = RollbackApply {
            environment: &self.environment,
            record,
            source,
        };
        let (report, metadata) = self.run(&instruction, &mut strategy)?;
        self.metadata = metadata;
        Ok(Some(report))
    }

    /// Removes every file `unit` owns as a recorded operation that can itself
    /// be rolled back. The unit's history chain moves into the environment
    /// record, so the unit has no history left afterwards.
    pub fn uninstall(&mut self, unit: &str) -> Result<ApplyReport> {
        let image = self.read_view();
        let state = self.environment.current_state(&image)?;
        let version = state
            .version_of(unit)
            .ok_or_else(|| ProvisionError::UnitUnknown {
                unit: unit.to_string(),
            })?
            .to_string();

        let mut instruction = ProvisionUnitInstruction::uninstall(unit, version)?;
        for path in UnitHistory::new(&self.layout, unit).manifest(&image)? {
            let target = self.layout.resolve_content_path(&self.metadata, unit, &path)?;
            if let Some(hash) = image.hash(&target)? {
                instruction.push_content(ContentItemInstruction::remove(path, hash));
            }
        }
        let instruction = ProvisionEnvironmentInstruction::from_units([instruction])?;

        let source = NoContentSource;
        let mut strategy = ForwardApply::new(OperationKind::Uninstall, &source, &self.environment);
        let (report, metadata) = self.run(&instruction, &mut strategy)?;
        self.metadata = metadata;
        Ok(report)
    }

    fn read_view(&self) -> FsImage {
        FsImage::new(self.layout.staging_dir())
    }

    fn run(
        &self,
        instruction: &ProvisionEnvironmentInstruction,
        strategy: &mut dyn ApplyStrategy,
    ) -> Result<(ApplyReport, EnvironmentMetadata)> {
        let operation = strategy.operation();
        let txid = next_transaction_id();
        info!(%operation, txid = %txid, units = instruction.len(), "starting operation");

        let mut image = FsImage::new(self.layout.transaction_staging_path(&txid));
        let start = self.environment.current_state(&image)?;
        let driver = Driver {
            layout: &self.layout,
            metadata: &self.metadata,
        };
        let (units, state) = driver.drive(&mut image, start, instruction, strategy)?;
        let (record, state) = strategy.finish(&mut image, state)?;

        let mut metadata = self.metadata.clone();
        if image.is_empty() {
            info!(%operation, "nothing to change");
        } else {
            metadata.sync_with_state(&state);
            image.write(self.layout.properties_path(), metadata.render());
            let summary = image.commit()?;
            info!(
                %operation,
                record = record.as_ref().map(RecordId::as_str),
                executed = summary.executed,
                "operation complete"
            );
        }

        Ok((
            ApplyReport {
                operation,
                record,
                units,
                state,
            },
            metadata,
        ))
    }
}

fn next_transaction_id() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let sequence = TRANSACTION_COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("tx-{nanos:x}-{:x}-{sequence}", std::process::id())
}

/// Working set for one unit instruction while its content is staged.
struct UnitPass<'a> {
    instruction: &'a ProvisionUnitInstruction,
    history: UnitHistory,
    info_before: ProvisionUnitInfo,
    previous_manifest: BTreeSet<ContentPath>,
    /// Unit record this pass appends.
    record: Option<RecordId>,
    /// Where prior bytes of replaced and removed files are kept.
    backup_dir: Option<PathBuf>,
    /// The unit leaves the environment and its chain is archived.
    detached: bool,
    journal: Journal,
    applied: Vec<ContentItemInstruction>,
    written: usize,
    deleted: usize,
    skipped_items: usize,
}

impl UnitPass<'_> {
    fn backup_path(&self, path: &ContentPath) -> Option<PathBuf> {
        self.backup_dir
            .as_ref()
            .map(|dir| dir.join(package_relative_path(path)))
    }

    fn outcome(
        &self,
        status: UnitOutcomeStatus,
        version: Option<String>,
        record: Option<RecordId>,
    ) -> UnitOutcome {
        UnitOutcome {
            unit: self.instruction.unit_name().to_string(),
            kind: self.instruction.kind(),
            status,
            version,
            written: self.written,
            deleted: self.deleted,
            skipped_items: self.skipped_items,
            record,
        }
    }
}

/// What differs between moving forward and undoing the newest record; the
/// per-unit loop in [`Driver::drive`] is shared.
trait ApplyStrategy {
    fn operation(&self) -> OperationKind;

    fn source(&self) -> &dyn ContentSource;

    fn unit_policy(&self, metadata: &EnvironmentMetadata, unit: &str) -> UnitUpdatePolicy;

    fn prepare_unit(&mut self, image: &FsImage, pass: &mut UnitPass<'_>) -> Result<()>;

    fn finish_unit(
        &mut self,
        image: &mut FsImage,
        pass: UnitPass<'_>,
        info: &ProvisionUnitInfo,
    ) -> Result<UnitOutcome>;

    /// Stages environment-level history changes and returns the written
    /// record plus the resulting state.
    fn finish(
        &mut self,
        image: &mut FsImage,
        state: EnvironmentState,
    ) -> Result<(Option<RecordId>, EnvironmentState)>;
}

struct ForwardApply<'a> {
    operation: OperationKind,
    source: &'a dyn ContentSource,
    environment: &'a EnvironmentHistory,
    effective: ProvisionEnvironmentInstruction,
    unit_records: BTreeMap<String, RecordId>,
    detached: BTreeSet<String>,
    /// Environment record id, allocated on first use.
    record: Option<RecordId>,
}

impl<'a> ForwardApply<'a> {
    fn new(
        operation: OperationKind,
        source: &'a dyn ContentSource,
        environment: &'a EnvironmentHistory,
    ) -> Self {
        Self {
            operation,
            source,
            environment,
            effective: ProvisionEnvironmentInstruction::new(),
            unit_records: BTreeMap::new(),
            detached: BTreeSet::new(),
            record: None,
        }
    }

    fn record_id(&mut self, image: &FsImage) -> Result<RecordId> {
        if let Some(id) = &self.record {
            return Ok(id.clone());
        }
        let id = self.environment.allocate_id(image)?;
        self.record = Some(id.clone());
        Ok(id)
    }
}

impl ApplyStrategy for ForwardApply<'_> {
    fn operation(&self) -> OperationKind {
        self.operation
    }

    fn source(&self) -> &dyn ContentSource {
        self.source
    }

    fn unit_policy(&self, metadata: &EnvironmentMetadata, unit: &str) -> UnitUpdatePolicy {
        metadata.policy_for(unit)
    }

    fn prepare_unit(&mut self, image: &FsImage, pass: &mut UnitPass<'_>) -> Result<()> {
        pass.previous_manifest = pass.history.manifest(image)?;
        if pass.instruction.resulting_version().is_none() {
            let env_id = self.record_id(image)?;
            pass.detached = true;
            pass.backup_dir = Some(
                self.environment
                    .detached_backup_dir(&env_id, pass.instruction.unit_name()),
            );
        } else {
            let id = pass.history.allocate_id(image)?;
            pass.backup_dir = Some(pass.history.backup_dir(&id));
            pass.record = Some(id);
        }
        Ok(())
    }

    fn finish_unit(
        &mut self,
        image: &mut FsImage,
        pass: UnitPass<'_>,
        info: &ProvisionUnitInfo,
    ) -> Result<UnitOutcome> {
        let manifest = pass.journal.next_manifest(&pass.previous_manifest);
        let unchanged = pass.applied.is_empty()
            && *info == pass.info_before
            && manifest == pass.previous_manifest;
        if unchanged {
            debug!(unit = pass.instruction.unit_name(), "unit already in requested state");
            return Ok(pass.outcome(UnitOutcomeStatus::Unchanged, info.version.clone(), None));
        }

        let unit = pass.instruction.unit_name();
        let effective = pass
            .instruction
            .rebased(pass.info_before.version.as_deref())?
            .with_replaced_content(pass.applied.clone());
        if pass.detached {
            let env_id = self.record_id(image)?;
            let archived = pass
                .history
                .chain()
                .schedule_archive(image, &self.environment.detached_chain_dir(&env_id, unit))?;
            info!(unit, records = archived.len(), "unit history detached");
            self.effective.insert(effective)?;
            self.detached.insert(unit.to_string());
            return Ok(pass.outcome(UnitOutcomeStatus::Applied, info.version.clone(), None));
        }

        let Some(id) = pass.record.clone() else {
            return Err(ProvisionError::history_corrupt(
                pass.history.chain().root(),
                "unit record id was not allocated",
            ));
        };
        pass.history
            .schedule_record(image, &id, info, &effective, &manifest)?;
        self.effective.insert(effective)?;
        self.unit_records.insert(unit.to_string(), id.clone());
        Ok(pass.outcome(UnitOutcomeStatus::Applied, info.version.clone(), Some(id)))
    }

    fn finish(
        &mut self,
        image: &mut FsImage,
        state: EnvironmentState,
    ) -> Result<(Option<RecordId>, EnvironmentState)> {
        if self.unit_records.is_empty() && self.detached.is_empty() {
            return Ok((None, state));
        }
        let id = self.record_id(image)?;
        self.environment.schedule_record(
            image,
            &id,
            &state,
            &self.effective,
            &self.unit_records,
            &self.detached,
        )?;
        Ok((Some(id), state))
    }
}

struct RollbackApply<'a> {
    environment: &'a EnvironmentHistory,
    record: EnvironmentRecord,
    source: HistoryBackupSource,
}

impl ApplyStrategy for RollbackApply<'_> {
    fn operation(&self) -> OperationKind {
        OperationKind::Rollback
    }

    fn source(&self) -> &dyn ContentSource {
        &self.source
    }

    // Restoring recorded bytes must not be gated by drift checks.
    fn unit_policy(&self, _metadata: &EnvironmentMetadata, _unit: &str) -> UnitUpdatePolicy {
        UnitUpdatePolicy::forced()
    }

    fn prepare_unit(&mut self, image: &FsImage, pass: &mut UnitPass<'_>) -> Result<()> {
        let unit = pass.instruction.unit_name();
        if self.record.detached_units.contains(unit) {
            if !pass.history.chain().is_empty(image)? {
                return Err(ProvisionError::history_corrupt(
                    pass.history.chain().root(),
                    format!("'{unit}' has records again since {} detached them", self.record.id),
                ));
            }
            pass.detached = true;
            return Ok(());
        }
        let env_dir = self.environment.chain().record_dir(&self.record.id);
        let expected = self.record.unit_records.get(unit).ok_or_else(|| {
            ProvisionError::history_corrupt(&env_dir, format!("no unit record listed for '{unit}'"))
        })?;
        let last = pass.history.chain().last_applied(image)?;
        if last.as_ref() != Some(expected) {
            return Err(ProvisionError::history_corrupt(
                pass.history.chain().root(),
                format!("newest record of '{unit}' is not the one listed in {}", self.record.id),
            ));
        }
        pass.backup_dir = None;
        Ok(())
    }

    fn finish_unit(
        &mut self,
        image: &mut FsImage,
        pass: UnitPass<'_>,
        info: &ProvisionUnitInfo,
    ) -> Result<UnitOutcome> {
        let chain = pass.history.chain();
        if pass.detached {
            let archive = self
                .environment
                .detached_chain_dir(&self.record.id, pass.instruction.unit_name());
            chain.schedule_restore(image, &archive)?;
            return Ok(pass.outcome(UnitOutcomeStatus::RolledBack, info.version.clone(), None));
        }
        let removed = chain.schedule_delete_last(image)?;
        if chain.is_empty(image)? {
            chain.schedule_clear(image)?;
        }
        Ok(pass.outcome(UnitOutcomeStatus::RolledBack, info.version.clone(), removed))
    }

    fn finish(
        &mut self,
        image: &mut FsImage,
        _state: EnvironmentState,
    ) -> Result<(Option<RecordId>, EnvironmentState)> {
        let chain = self.environment.chain();
        let state = match chain.previous_of(image, &self.record.id)? {
            Some(previous) => self.environment.load(image, &previous)?.state,
            None => EnvironmentState::new(),
        };
        chain.schedule_delete_last(image)?;
        info!(record = %self.record.id, "rolled back environment record");
        Ok((None, state))
    }
}

/// Read access to the environment as the staged batch will leave it.
struct StagedView<'a> {
    image: &'a FsImage,
    state: &'a EnvironmentState,
    layout: &'a EnvironmentLayout,
    metadata: &'a EnvironmentMetadata,
}

impl ConditionContext for StagedView<'_> {
    fn unit_version(&self, unit: &str) -> Result<Option<String>> {
        Ok(self.state.version_of(unit).map(str::to_string))
    }

    fn content_hash(&self, unit: &str, path: &ContentPath) -> Result<Option<ContentHash>> {
        let target = self.layout.resolve_content_path(self.metadata, unit, path)?;
        self.image.hash(&target)
    }
}

struct Driver<'a> {
    layout: &'a EnvironmentLayout,
    metadata: &'a EnvironmentMetadata,
}

impl Driver<'_> {
    fn view<'v>(&'v self, image: &'v FsImage, state: &'v EnvironmentState) -> StagedView<'v> {
        StagedView {
            image,
            state,
            layout: self.layout,
            metadata: self.metadata,
        }
    }

    fn drive(
        &self,
        image: &mut FsImage,
        mut state: EnvironmentState,
        instruction: &ProvisionEnvironmentInstruction,
        strategy: &mut dyn ApplyStrategy,
    ) -> Result<(Vec<UnitOutcome>, EnvironmentState)> {
        let mut outcomes = Vec::with_capacity(instruction.len());
        for unit in instruction.units() {
            let name = unit.unit_name();
            let info_before = state.unit_or_fresh(name);
            let policy = strategy.unit_policy(self.metadata, name);

            if policy.unit_policy == UpdatePolicy::Ignored {
                info!(unit = name, "unit ignored by policy");
                outcomes.push(UnitOutcome::skipped(
                    name,
                    unit.kind(),
                    UnitOutcomeStatus::SkippedByPolicy,
                    info_before.version.clone(),
                ));
                continue;
            }
            if !info_before.is_installed() && unit.required_version().is_some() {
                return Err(ProvisionError::UnitUnknown {
                    unit: name.to_string(),
                });
            }
            if policy.unit_policy == UpdatePolicy::Conditioned
                && !self.unit_conditions_hold(image, &state, unit)?
            {
                info!(unit = name, "unit conditions not met; skipped");
                outcomes.push(UnitOutcome::skipped(
                    name,
                    unit.kind(),
                    UnitOutcomeStatus::SkippedByCondition,
                    info_before.version.clone(),
                ));
                continue;
            }

            let mut pass = UnitPass {
                instruction: unit,
                history: UnitHistory::new(self.layout, name),
                info_before,
                previous_manifest: BTreeSet::new(),
                record: None,
                backup_dir: None,
                detached: false,
                journal: Journal::new(),
                applied: Vec::new(),
                written: 0,
                deleted: 0,
                skipped_items: 0,
            };
            strategy.prepare_unit(image, &mut pass)?;
            for item in unit.content() {
                self.stage_item(image, &state, &policy, strategy.source(), item, &mut pass)?;
            }
            for task in unit.integration_tasks() {
                info!(unit = name, task = task.as_str(), "integration task requested");
            }

            let info = pass.info_before.apply(unit);
            let outcome = strategy.finish_unit(image, pass, &info)?;
            debug!(
                unit = name,
                status = outcome.status.as_str(),
                written = outcome.written,
                deleted = outcome.deleted,
                "unit staged"
            );
            state.apply_unit(info);
            outcomes.push(outcome);
        }
        Ok((outcomes, state))
    }

    // Unknown-unit and version violations are errors; declared conditions
    // that do not hold only skip the unit.
    fn unit_conditions_hold(
        &self,
        image: &FsImage,
        state: &EnvironmentState,
        unit: &ProvisionUnitInstruction,
    ) -> Result<bool> {
        let view = self.view(image, state);
        InstructionCondition::UnitVersion {
            unit: unit.unit_name().to_string(),
            version: unit.required_version().map(str::to_string),
        }
        .evaluate(&view)?;
        for condition in unit.conditions() {
            if !condition.evaluate(&view)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn item_conditions_hold(
        &self,
        image: &FsImage,
        state: &EnvironmentState,
        item: &ContentItemInstruction,
    ) -> Result<bool> {
        let view = self.view(image, state);
        for condition in item.conditions() {
            if !condition.evaluate(&view)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn stage_item(
        &self,
        image: &mut FsImage,
        state: &EnvironmentState,
        policy: &UnitUpdatePolicy,
        source: &dyn ContentSource,
        item: &ContentItemInstruction,
        pass: &mut UnitPass<'_>,
    ) -> Result<()> {
        let unit = pass.instruction.unit_name();
        let path = item.path();
        let item_policy = match policy.unit_policy {
            UpdatePolicy::Forced => policy
                .path_overrides
                .get(path)
                .copied()
                .unwrap_or(UpdatePolicy::Forced),
            _ => policy.content_policy(path),
        };
        if item_policy == UpdatePolicy::Ignored {
            debug!(unit, path = %path, "content ignored by policy");
            pass.skipped_items += 1;
            return Ok(());
        }

        let target = self.layout.resolve_content_path(self.metadata, unit, path)?;
        let current = image.hash(&target)?;
        let conditioned = item_policy == UpdatePolicy::Conditioned;

        let Some(desired) = item.content_hash() else {
            let Some(current) = current else {
                pass.journal.record_deleted(path);
                return Ok(());
            };
            if conditioned
                && (item.replaced_hash() != Some(&current)
                    || !self.item_conditions_hold(image, state, item)?)
            {
                info!(unit, path = %path, "content changed since it was recorded; left in place");
                pass.skipped_items += 1;
                return Ok(());
            }
            self.stage_backup(image, &target, path, pass)?;
            image.delete(&target);
            self.prune_empty_parents(image, unit, path, &target)?;
            pass.journal.record_deleted(path);
            pass.applied.push(
                ContentItemInstruction::remove(path.clone(), current)
                    .with_required(item.is_required()),
            );
            pass.deleted += 1;
            return Ok(());
        };

        if current.as_ref() == Some(desired) {
            pass.journal.record_added(path);
            return Ok(());
        }
        if conditioned
            && (current.as_ref() != item.replaced_hash()
                || !self.item_conditions_hold(image, state, item)?)
        {
            info!(unit, path = %path, "content changed since it was recorded; left in place");
            pass.skipped_items += 1;
            return Ok(());
        }

        let Some(bytes) = source.read(unit, path, item.is_required())? else {
            debug!(unit, path = %path, "optional content not available");
            pass.skipped_items += 1;
            return Ok(());
        };
        let actual = ContentHash::of(&bytes);
        if actual != *desired {
            return Err(ProvisionError::HashMismatch {
                path: format!("{unit}:{path}"),
                expected: Some(*desired),
                actual: Some(actual),
            });
        }

        if current.is_some() {
            self.stage_backup(image, &target, path, pass)?;
        }
        image.write(&target, bytes);
        pass.journal.record_added(path);
        pass.applied.push(
            ContentItemInstruction::new(path.clone(), Some(*desired), current)?
                .with_required(item.is_required()),
        );
        pass.written += 1;
        Ok(())
    }

    // Stops at the content root and at the first directory still holding
    // something.
    fn prune_empty_parents(
        &self,
        image: &mut FsImage,
        unit: &str,
        path: &ContentPath,
        target: &Path,
    ) -> Result<()> {
        let root = self.layout.content_root(self.metadata, unit, path)?;
        for ancestor in target.ancestors().skip(1) {
            if ancestor == root || !ancestor.starts_with(&root) || !image.is_empty_dir(ancestor)? {
                break;
            }
            debug!(unit, dir = %ancestor.display(), "pruning empty directory");
            image.delete(ancestor);
        }
        Ok(())
    }

    fn stage_backup(
        &self,
        image: &mut FsImage,
        target: &Path,
        path: &ContentPath,
        pass: &UnitPass<'_>,
    ) -> Result<()> {
        let Some(backup) = pass.backup_path(path) else {
            return Ok(());
        };
        let bytes = image.read_content(target)?.ok_or_else(|| ProvisionError::PathNotFound {
            path: target.display().to_string(),
        })?;
        image.write(backup, bytes);
        Ok(())
    }
}
