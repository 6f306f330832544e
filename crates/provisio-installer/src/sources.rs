use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use provisio_core::{ContentPath, ProvisionError, Result};

use crate::fs_utils::read_optional;

/// Supplies the bytes content instructions install.
pub trait ContentSource {
    fn is_available(&self, unit: &str, path: &ContentPath) -> bool;

    /// Bytes for `path`. A missing entry is `Ok(None)` unless
    /// `error_if_missing`, in which case it is `PathNotFound`.
    fn read(
        &self,
        unit: &str,
        path: &ContentPath,
        error_if_missing: bool,
    ) -> Result<Option<Vec<u8>>>;
}

/// `home/<rel>` for unit-home content, `location/<name>/<rel>` otherwise.
pub(crate) fn package_relative_path(path: &ContentPath) -> PathBuf {
    let mut relative = match path.location() {
        Some(location) => PathBuf::from("location").join(location),
        None => PathBuf::from("home"),
    };
    for component in path.components() {
        relative.push(component);
    }
    relative
}

fn read_from(
    root: &Path,
    unit: &str,
    path: &ContentPath,
    error_if_missing: bool,
) -> Result<Option<Vec<u8>>> {
    let file = root.join(package_relative_path(path));
    if file.is_dir() {
        return Err(ProvisionError::PathAlreadyExists {
            path: file.display().to_string(),
        });
    }
    let bytes = read_optional(&file)
        .map_err(|err| ProvisionError::io("failed to read content", &file, err))?;
    match bytes {
        Some(bytes) => Ok(Some(bytes)),
        None if error_if_missing => Err(ProvisionError::PathNotFound {
            path: format!("{unit}:{path}"),
        }),
        None => Ok(None),
    }
}

/// Already-expanded package tree: `<root>/<unit>/home/...` and
/// `<root>/<unit>/location/<name>/...`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryContentSource {
    root: PathBuf,
}

impl DirectoryContentSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn unit_root(&self, unit: &str) -> PathBuf {
        self.root.join(unit)
    }
}

impl ContentSource for DirectoryContentSource {
    fn is_available(&self, unit: &str, path: &ContentPath) -> bool {
        self.unit_root(unit).join(package_relative_path(path)).is_file()
    }

    fn read(
        &self,
        unit: &str,
        path: &ContentPath,
        error_if_missing: bool,
    ) -> Result<Option<Vec<u8>>> {
        read_from(&self.unit_root(unit), unit, path, error_if_missing)
    }
}

/// Prior bytes saved in unit history records, keyed by unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HistoryBackupSource {
    backups: BTreeMap<String, PathBuf>,
}

impl HistoryBackupSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, unit: impl Into<String>, backup_dir: impl Into<PathBuf>) {
        self.backups.insert(unit.into(), backup_dir.into());
    }
}

impl ContentSource for HistoryBackupSource {
    fn is_available(&self, unit: &str, path: &ContentPath) -> bool {
        self.backups
            .get(unit)
            .is_some_and(|root| root.join(package_relative_path(path)).is_file())
    }

    fn read(
        &self,
        unit: &str,
        path: &ContentPath,
        error_if_missing: bool,
    ) -> Result<Option<Vec<u8>>> {
        match self.backups.get(unit) {
            Some(root) => read_from(root, unit, path, error_if_missing),
            None if error_if_missing => Err(ProvisionError::PathNotFound {
                path: format!("{unit}:{path}"),
            }),
            None => Ok(None),
        }
    }
}

/// Source for operations that only remove content.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct NoContentSource;

impl ContentSource for NoContentSource {
    fn is_available(&self, _unit: &str, _path: &ContentPath) -> bool {
        false
    }

    fn read(
        &self,
        unit: &str,
        path: &ContentPath,
        error_if_missing: bool,
    ) -> Result<Option<Vec<u8>>> {
        if error_if_missing {
            return Err(ProvisionError::PathNotFound {
                path: format!("{unit}:{path}"),
            });
        }
        Ok(None)
    }
}
