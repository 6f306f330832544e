use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use provisio_core::{ContentHash, ProvisionError, Result};
use provisio_security::sha256_file;
use tracing::{debug, error, info, warn};

use crate::fs_utils::{
    copy_path, first_missing_ancestor, is_missing, path_exists, read_optional,
    remove_path_if_exists,
};

const BACKUP_SUFFIX: &str = "provisio-backup";

/// A staged filesystem mutation against one target path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsTask {
    /// Replace whatever is at the target with a file holding these bytes.
    Write(Vec<u8>),
    /// Replace whatever is at the target with a copy of this file or tree.
    Copy(PathBuf),
    /// Remove the target recursively.
    Delete,
    /// Create the target directory and its parents.
    MkDirs,
}

impl FsTask {
    fn replaces_target(&self) -> bool {
        !matches!(self, Self::MkDirs)
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Write(_) => "write",
            Self::Copy(_) => "copy",
            Self::Delete => "delete",
            Self::MkDirs => "mkdirs",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathStatus {
    Missing,
    File,
    Directory,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    pub executed: usize,
    pub backed_up: usize,
}

#[derive(Debug)]
struct StagedTask {
    target: PathBuf,
    task: FsTask,
}

#[derive(Debug)]
struct ExecutedTask {
    position: usize,
    created: Option<PathBuf>,
}

/// How a path would look once every staged task ran.
enum View<'a> {
    Bytes(&'a [u8]),
    Disk(PathBuf),
    Directory,
    Gone,
}

/// Staged, keyed batch of filesystem tasks committed all-or-nothing.
///
/// Queries (`exists`, `hash`, `read_content`, ...) answer as if the staged
/// tasks had already run. `commit` backs up every existing target under the
/// backup root, executes tasks in staging order, and reverts executed tasks
/// in reverse order when one fails.
#[derive(Debug)]
pub struct FsImage {
    backup_root: PathBuf,
    tasks: Vec<Option<StagedTask>>,
    index: BTreeMap<PathBuf, usize>,
}

impl FsImage {
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
            tasks: Vec::new(),
            index: BTreeMap::new(),
        }
    }

    pub fn backup_root(&self) -> &Path {
        &self.backup_root
    }

    pub fn write(&mut self, target: impl Into<PathBuf>, bytes: impl Into<Vec<u8>>) {
        self.stage(target.into(), FsTask::Write(bytes.into()));
    }

    pub fn copy(&mut self, target: impl Into<PathBuf>, source: impl Into<PathBuf>) {
        self.stage(target.into(), FsTask::Copy(source.into()));
    }

    pub fn delete(&mut self, target: impl Into<PathBuf>) {
        self.stage(target.into(), FsTask::Delete);
    }

    pub fn mkdirs(&mut self, target: impl Into<PathBuf>) {
        self.stage(target.into(), FsTask::MkDirs);
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Live staged tasks in commit order.
    pub fn staged(&self) -> impl Iterator<Item = (&Path, &FsTask)> {
        self.tasks
            .iter()
            .flatten()
            .map(|staged| (staged.target.as_path(), &staged.task))
    }

    pub fn staged_task(&self, target: &Path) -> Option<&FsTask> {
        self.index
            .get(target)
            .and_then(|position| self.tasks[*position].as_ref())
            .map(|staged| &staged.task)
    }

    // A re-staged target moves to the end of the batch. Tasks that replace
    // their target also drop pending tasks for descendants.
    fn stage(&mut self, target: PathBuf, task: FsTask) {
        if let Some(previous) = self.index.remove(&target) {
            self.tasks[previous] = None;
        }
        if task.replaces_target() {
            let shadowed: Vec<PathBuf> = self
                .index
                .range(target.clone()..)
                .take_while(|(path, _)| path.starts_with(&target))
                .map(|(path, _)| path.clone())
                .collect();
            for path in shadowed {
                if let Some(position) = self.index.remove(&path) {
                    self.tasks[position] = None;
                }
            }
        }
        debug!(target = %target.display(), task = task.as_str(), "staged filesystem task");
        self.index.insert(target.clone(), self.tasks.len());
        self.tasks.push(Some(StagedTask { target, task }));
    }

    fn has_live_descendant(&self, path: &Path) -> bool {
        self.index
            .range(path.to_path_buf()..)
            .take_while(|(candidate, _)| candidate.starts_with(path))
            .filter(|(candidate, _)| candidate.as_path() != path)
            .any(|(candidate, _)| {
                !matches!(self.staged_task(candidate), Some(FsTask::Delete) | None)
            })
    }

    fn view(&self, path: &Path) -> View<'_> {
        if let Some(task) = self.staged_task(path) {
            return match task {
                FsTask::Write(bytes) => View::Bytes(bytes),
                FsTask::Copy(source) => View::Disk(source.clone()),
                FsTask::MkDirs => View::Directory,
                FsTask::Delete if self.has_live_descendant(path) => View::Directory,
                FsTask::Delete => View::Gone,
            };
        }
        if self.has_live_descendant(path) {
            return View::Directory;
        }
        for ancestor in path.ancestors().skip(1) {
            let Some(task) = self.staged_task(ancestor) else {
                continue;
            };
            let Ok(relative) = path.strip_prefix(ancestor) else {
                continue;
            };
            match task {
                FsTask::Copy(source) => return View::Disk(source.join(relative)),
                FsTask::Write(_) | FsTask::Delete => return View::Gone,
                FsTask::MkDirs => continue,
            }
        }
        View::Disk(path.to_path_buf())
    }

    pub fn status(&self, path: &Path) -> Result<PathStatus> {
        match self.view(path) {
            View::Bytes(_) => Ok(PathStatus::File),
            View::Directory => Ok(PathStatus::Directory),
            View::Gone => Ok(PathStatus::Missing),
            View::Disk(disk) => match fs::metadata(&disk) {
                Ok(metadata) if metadata.is_dir() => Ok(PathStatus::Directory),
                Ok(_) => Ok(PathStatus::File),
                Err(err) if is_missing(&err, &disk) => Ok(PathStatus::Missing),
                Err(err) => Err(ProvisionError::io("failed to stat", disk, err)),
            },
        }
    }

    pub fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.status(path)? != PathStatus::Missing)
    }

    /// True when `path` is a directory with nothing left in it once the
    /// staged tasks ran.
    pub fn is_empty_dir(&self, path: &Path) -> Result<bool> {
        if self.status(path)? != PathStatus::Directory || self.has_live_descendant(path) {
            return Ok(false);
        }
        let listed = match self.view(path) {
            View::Disk(disk) => disk,
            _ => path.to_path_buf(),
        };
        let entries = match fs::read_dir(&listed) {
            Ok(entries) => entries,
            Err(err) if is_missing(&err, &listed) => return Ok(true),
            Err(err) => return Err(ProvisionError::io("failed to list", listed, err)),
        };
        for entry in entries {
            let entry = entry.map_err(|err| ProvisionError::io("failed to list", &listed, err))?;
            if self.exists(&path.join(entry.file_name()))? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// True when a staged task makes `path` disappear.
    pub fn is_deleted(&self, path: &Path) -> bool {
        matches!(self.view(path), View::Gone)
    }

    /// Hash of the file at `path`, `None` when absent. Directories have no
    /// content hash and are reported as an unexpected artifact.
    pub fn hash(&self, path: &Path) -> Result<Option<ContentHash>> {
        match self.view(path) {
            View::Bytes(bytes) => Ok(Some(ContentHash::of(bytes))),
            View::Gone => Ok(None),
            View::Directory => Err(ProvisionError::PathAlreadyExists {
                path: path.display().to_string(),
            }),
            View::Disk(disk) => match fs::metadata(&disk) {
                Ok(metadata) if metadata.is_dir() => Err(ProvisionError::PathAlreadyExists {
                    path: path.display().to_string(),
                }),
                Ok(_) => sha256_file(&disk)
                    .map(|digest| Some(ContentHash::from_bytes(digest)))
                    .map_err(|err| ProvisionError::io("failed to hash", disk, err)),
                Err(err) if is_missing(&err, &disk) => Ok(None),
                Err(err) => Err(ProvisionError::io("failed to stat", disk, err)),
            },
        }
    }

    pub fn read_content(&self, path: &Path) -> Result<Option<Vec<u8>>> {
        match self.view(path) {
            View::Bytes(bytes) => Ok(Some(bytes.to_vec())),
            View::Gone => Ok(None),
            View::Directory => Err(ProvisionError::PathAlreadyExists {
                path: path.display().to_string(),
            }),
            View::Disk(disk) => {
                if disk.is_dir() {
                    return Err(ProvisionError::PathAlreadyExists {
                        path: path.display().to_string(),
                    });
                }
                read_optional(&disk).map_err(|err| ProvisionError::io("failed to read", disk, err))
            }
        }
    }

    /// Runs the staged batch: backup, execute, then cleanup. The staged set is
    /// empty afterwards whether or not the commit succeeded.
    pub fn commit(&mut self) -> Result<CommitSummary> {
        let tasks: Vec<StagedTask> = std::mem::take(&mut self.tasks)
            .into_iter()
            .flatten()
            .collect();
        self.index.clear();
        if tasks.is_empty() {
            return Ok(CommitSummary::default());
        }
        info!(
            tasks = tasks.len(),
            backup_root = %self.backup_root.display(),
            "committing filesystem image"
        );

        let backups = match self.backup_phase(&tasks) {
            Ok(backups) => backups,
            Err(err) => {
                error!(error = %err, "backup phase failed; nothing executed");
                self.discard_backups();
                return Err(err);
            }
        };
        let backed_up = backups.iter().flatten().count();

        let mut executed = Vec::with_capacity(tasks.len());
        for (position, staged) in tasks.iter().enumerate() {
            let created = match staged.task {
                FsTask::Delete => None,
                _ => first_missing_ancestor(&staged.target),
            };
            executed.push(ExecutedTask { position, created });
            if let Err(err) = execute(staged) {
                error!(
                    target = %staged.target.display(),
                    task = staged.task.as_str(),
                    error = %err,
                    "execute phase failed"
                );
                self.revert(&tasks, &backups, &executed);
                return Err(err);
            }
        }

        debug!(executed = executed.len(), backed_up, "execute phase complete");
        self.discard_backups();
        Ok(CommitSummary {
            executed: executed.len(),
            backed_up,
        })
    }

    fn backup_phase(&self, tasks: &[StagedTask]) -> Result<Vec<Option<PathBuf>>> {
        let mut backups = Vec::with_capacity(tasks.len());
        for (position, staged) in tasks.iter().enumerate() {
            let needs_backup = match staged.task {
                FsTask::MkDirs => false,
                _ => path_exists(&staged.target),
            };
            if !needs_backup {
                backups.push(None);
                continue;
            }
            let backup = self
                .backup_root
                .join(format!("{position}.{BACKUP_SUFFIX}"));
            copy_path(&staged.target, &backup)
                .map_err(|err| ProvisionError::io("failed to back up", &staged.target, err))?;
            backups.push(Some(backup));
        }
        debug!(backups = backups.iter().flatten().count(), "backup phase complete");
        Ok(backups)
    }

    fn revert(&self, tasks: &[StagedTask], backups: &[Option<PathBuf>], executed: &[ExecutedTask]) {
        warn!(executed = executed.len(), "reverting filesystem image");
        let mut clean = true;
        for done in executed.iter().rev() {
            let staged = &tasks[done.position];
            let backup = backups[done.position].as_deref();
            if let Err(err) = revert_task(&staged.target, backup, done.created.as_deref()) {
                error!(
                    target = %staged.target.display(),
                    error = %err,
                    "failed to revert filesystem task"
                );
                clean = false;
            }
        }
        if clean {
            self.discard_backups();
        } else {
            warn!(
                backup_root = %self.backup_root.display(),
                "revert incomplete; backups kept for manual recovery"
            );
        }
    }

    fn discard_backups(&self) {
        if let Err(err) = remove_path_if_exists(&self.backup_root) {
            warn!(
                backup_root = %self.backup_root.display(),
                error = %err,
                "failed to clean up filesystem image backups"
            );
        }
    }
}

fn execute(staged: &StagedTask) -> Result<()> {
    let target = &staged.target;
    match &staged.task {
        FsTask::Write(bytes) => {
            ensure_parent_dirs(target)?;
            clear_target(target)?;
            fs::write(target, bytes).map_err(|err| ProvisionError::io("failed to write", target, err))
        }
        FsTask::Copy(source) => {
            ensure_parent_dirs(target)?;
            clear_target(target)?;
            copy_path(source, target)
                .map_err(|err| ProvisionError::io("failed to copy into", target, err))
        }
        FsTask::Delete => remove_path_if_exists(target)
            .map_err(|err| ProvisionError::io("failed to delete", target, err)),
        FsTask::MkDirs => {
            ensure_parent_dirs(target)?;
            match fs::metadata(target) {
                Ok(metadata) if metadata.is_dir() => Ok(()),
                Ok(_) => Err(ProvisionError::NotADirectory {
                    path: target.clone(),
                }),
                Err(_) => fs::create_dir_all(target).map_err(|source| {
                    ProvisionError::DirectoryCreateFailed {
                        path: target.clone(),
                        source,
                    }
                }),
            }
        }
    }
}

fn clear_target(target: &Path) -> Result<()> {
    remove_path_if_exists(target).map_err(|err| ProvisionError::io("failed to replace", target, err))
}

fn ensure_parent_dirs(target: &Path) -> Result<()> {
    let Some(parent) = target.parent() else {
        return Ok(());
    };
    for ancestor in parent.ancestors() {
        match fs::metadata(ancestor) {
            Ok(metadata) if metadata.is_dir() => break,
            Ok(_) => {
                return Err(ProvisionError::NotADirectory {
                    path: ancestor.to_path_buf(),
                })
            }
            Err(_) => continue,
        }
    }
    fs::create_dir_all(parent).map_err(|source| ProvisionError::DirectoryCreateFailed {
        path: parent.to_path_buf(),
        source,
    })
}

fn revert_task(target: &Path, backup: Option<&Path>, created: Option<&Path>) -> io::Result<()> {
    match (backup, created) {
        (Some(backup), _) => {
            remove_path_if_exists(target)?;
            copy_path(backup, target)
        }
        (None, Some(created)) => remove_path_if_exists(created),
        (None, None) => Ok(()),
    }
}
