use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use provisio_core::{
    validate_unit_name, ContentPath, EnvironmentState, ProvisionError, Result, UnitUpdatePolicy,
    UpdatePolicy,
};

use crate::layout::resolve_against;

const HEADER: &str = "# provisio environment metadata\n";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitMetadata {
    pub version: Option<String>,
    pub home: Option<PathBuf>,
    pub patches: Vec<String>,
    pub unit_policy: Option<UpdatePolicy>,
    pub content_policy: Option<UpdatePolicy>,
    pub path_policies: BTreeMap<ContentPath, UpdatePolicy>,
}

impl UnitMetadata {
    fn has_settings(&self) -> bool {
        self.home.is_some()
            || self.unit_policy.is_some()
            || self.content_policy.is_some()
            || !self.path_policies.is_empty()
    }
}

/// Contents of `environment.properties`: named locations, default policies,
/// and per-unit settings mirrored from history.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnvironmentMetadata {
    pub locations: BTreeMap<String, PathBuf>,
    pub default_unit_policy: Option<UpdatePolicy>,
    pub default_content_policy: Option<UpdatePolicy>,
    pub units: BTreeMap<String, UnitMetadata>,
}

impl EnvironmentMetadata {
    /// Missing file reads as empty metadata.
    pub fn read(path: &Path) -> Result<Self> {
        match fs::read_to_string(path) {
            Ok(raw) => Self::parse(&raw),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(Self::default()),
            Err(err) => Err(ProvisionError::io("failed to read metadata", path, err)),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut metadata = Self::default();
        for (number, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(ProvisionError::serialization(format!(
                    "metadata line {} is not a key=value pair: {line}",
                    number + 1
                )));
            };
            metadata.apply_entry(key.trim(), value.trim())?;
        }
        Ok(metadata)
    }

    fn apply_entry(&mut self, key: &str, value: &str) -> Result<()> {
        let Some((scope, field)) = key.split_once('.') else {
            return Err(unknown_key(key));
        };
        match scope {
            "location" => {
                if field.is_empty() {
                    return Err(unknown_key(key));
                }
                self.locations.insert(field.to_string(), PathBuf::from(value));
            }
            "default-policy" => match field {
                "unit" => self.default_unit_policy = Some(value.parse()?),
                "content" => self.default_content_policy = Some(value.parse()?),
                _ => return Err(unknown_key(key)),
            },
            unit => {
                validate_unit_name(unit).map_err(|_| unknown_key(key))?;
                let entry = self.units.entry(unit.to_string()).or_default();
                match field {
                    "version" => entry.version = Some(value.to_string()),
                    "home" => entry.home = Some(PathBuf::from(value)),
                    "patches" => {
                        entry.patches = value
                            .split(',')
                            .map(str::trim)
                            .filter(|patch| !patch.is_empty())
                            .map(str::to_string)
                            .collect()
                    }
                    "policy.unit" => entry.unit_policy = Some(value.parse()?),
                    "policy.content" => entry.content_policy = Some(value.parse()?),
                    other => {
                        let Some(path) = other.strip_prefix("policy.content.") else {
                            return Err(unknown_key(key));
                        };
                        let path = path.parse::<ContentPath>().map_err(|err| {
                            ProvisionError::serialization(format!("metadata key {key}: {err}"))
                        })?;
                        entry.path_policies.insert(path, value.parse()?);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut payload = String::from(HEADER);
        for (name, root) in &self.locations {
            payload.push_str(&format!("location.{name}={}\n", root.display()));
        }
        if let Some(policy) = self.default_unit_policy {
            payload.push_str(&format!("default-policy.unit={policy}\n"));
        }
        if let Some(policy) = self.default_content_policy {
            payload.push_str(&format!("default-policy.content={policy}\n"));
        }
        for (unit, entry) in &self.units {
            if let Some(version) = &entry.version {
                payload.push_str(&format!("{unit}.version={version}\n"));
            }
            if let Some(home) = &entry.home {
                payload.push_str(&format!("{unit}.home={}\n", home.display()));
            }
            if !entry.patches.is_empty() {
                payload.push_str(&format!("{unit}.patches={}\n", entry.patches.join(",")));
            }
            if let Some(policy) = entry.unit_policy {
                payload.push_str(&format!("{unit}.policy.unit={policy}\n"));
            }
            if let Some(policy) = entry.content_policy {
                payload.push_str(&format!("{unit}.policy.content={policy}\n"));
            }
            for (path, policy) in &entry.path_policies {
                payload.push_str(&format!("{unit}.policy.content.{path}={policy}\n"));
            }
        }
        payload
    }

    /// Resolved root of a named location, `None` when it is not configured.
    pub fn location_root(&self, home: &Path, location: &str) -> Option<PathBuf> {
        self.locations
            .get(location)
            .map(|root| resolve_against(home, root))
    }

    pub fn unit_home(&self, home: &Path, unit: &str) -> PathBuf {
        self.units
            .get(unit)
            .and_then(|entry| entry.home.as_deref())
            .map(|unit_home| resolve_against(home, unit_home))
            .unwrap_or_else(|| home.to_path_buf())
    }

    /// Effective policy for `unit`: its own settings, then the environment
    /// defaults, then `conditioned`.
    pub fn policy_for(&self, unit: &str) -> UnitUpdatePolicy {
        let entry = self.units.get(unit);
        let unit_policy = entry
            .and_then(|entry| entry.unit_policy)
            .or(self.default_unit_policy)
            .unwrap_or_default();
        let content_policy = entry
            .and_then(|entry| entry.content_policy)
            .or(self.default_content_policy)
            .unwrap_or_default();
        let mut policy = UnitUpdatePolicy::new(unit_policy, content_policy);
        if let Some(entry) = entry {
            policy.path_overrides = entry.path_policies.clone();
        }
        policy
    }

    /// Mirrors versions and patches from `state`. Units that are gone keep
    /// their entry only while they still carry settings of their own.
    pub fn sync_with_state(&mut self, state: &EnvironmentState) {
        for (name, info) in &state.units {
            let entry = self.units.entry(name.clone()).or_default();
            entry.version = info.version.clone();
            entry.patches = info.patches.clone();
        }
        self.units.retain(|name, entry| {
            if state.unit(name).is_none() {
                entry.version = None;
                entry.patches.clear();
            }
            entry.version.is_some() || entry.has_settings()
        });
    }
}

fn unknown_key(key: &str) -> ProvisionError {
    ProvisionError::serialization(format!("unrecognized metadata key: {key}"))
}
