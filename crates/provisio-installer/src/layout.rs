use std::fs;
use std::path::{Path, PathBuf};

use provisio_core::{ContentPath, ProvisionError, Result};

use crate::metadata::EnvironmentMetadata;

const STATE_DIR_NAME: &str = ".provisio";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvironmentLayout {
    home: PathBuf,
}

impl EnvironmentLayout {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn state_dir(&self) -> PathBuf {
        self.home.join(STATE_DIR_NAME)
    }

    pub fn properties_path(&self) -> PathBuf {
        self.state_dir().join("environment.properties")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir().join("staging")
    }

    pub fn transaction_staging_path(&self, txid: &str) -> PathBuf {
        self.staging_dir().join(txid)
    }

    pub fn history_dir(&self) -> PathBuf {
        self.state_dir().join("history")
    }

    pub fn units_history_dir(&self) -> PathBuf {
        self.history_dir().join("units")
    }

    pub fn unit_history_dir(&self, unit: &str) -> PathBuf {
        self.units_history_dir().join(unit)
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        if self.home.exists() && !self.home.is_dir() {
            return Err(ProvisionError::NotADirectory {
                path: self.home.clone(),
            });
        }
        for dir in [
            self.state_dir(),
            self.staging_dir(),
            self.history_dir(),
            self.units_history_dir(),
        ] {
            fs::create_dir_all(&dir)
                .map_err(|source| ProvisionError::DirectoryCreateFailed { path: dir, source })?;
        }
        Ok(())
    }

    /// Directory `path` is relative to: the named location's root, or the
    /// unit home (the environment home unless overridden).
    pub fn content_root(
        &self,
        metadata: &EnvironmentMetadata,
        unit: &str,
        path: &ContentPath,
    ) -> Result<PathBuf> {
        match path.location() {
            Some(location) => metadata.location_root(&self.home, location).ok_or_else(|| {
                ProvisionError::invalid_instruction(format!(
                    "content path {path} names unknown location '{location}'"
                ))
            }),
            None => Ok(metadata.unit_home(&self.home, unit)),
        }
    }

    /// Physical location of `path` for `unit`.
    pub fn resolve_content_path(
        &self,
        metadata: &EnvironmentMetadata,
        unit: &str,
        path: &ContentPath,
    ) -> Result<PathBuf> {
        let mut resolved = self.content_root(metadata, unit, path)?;
        for component in path.components() {
            resolved.push(component);
        }

        if resolved.starts_with(self.state_dir()) {
            return Err(ProvisionError::invalid_instruction(format!(
                "content path {path} resolves into the reserved state directory"
            )));
        }
        Ok(resolved)
    }
}

pub(crate) fn resolve_against(home: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        home.join(value)
    }
}
