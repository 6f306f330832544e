use std::fmt;
use std::str::FromStr;

use crate::error::{ProvisionError, Result};

const LOCATION_SIGIL: char = '$';

/// Logical file location: an optional named location plus a relative path,
/// resolved against a unit's home (or the named location's root) only when
/// content is actually read or written.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentPath {
    location: Option<String>,
    relative_path: Option<String>,
}

impl ContentPath {
    pub fn new(location: Option<String>, relative_path: Option<String>) -> Result<Self> {
        if location.is_none() && relative_path.is_none() {
            return Err(ProvisionError::invalid_instruction(
                "content path needs a location or a relative path",
            ));
        }
        if let Some(location) = &location {
            validate_location_name(location)?;
        }
        let relative_path = relative_path
            .map(|path| normalize_relative_path(&path))
            .transpose()?;
        Ok(Self {
            location,
            relative_path,
        })
    }

    pub fn relative(path: impl Into<String>) -> Result<Self> {
        Self::new(None, Some(path.into()))
    }

    pub fn at_location(location: impl Into<String>, path: Option<String>) -> Result<Self> {
        Self::new(Some(location.into()), path)
    }

    pub fn location(&self) -> Option<&str> {
        self.location.as_deref()
    }

    pub fn relative_path(&self) -> Option<&str> {
        self.relative_path.as_deref()
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.relative_path
            .as_deref()
            .into_iter()
            .flat_map(|path| path.split('/'))
    }
}

impl fmt::Display for ContentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.location, &self.relative_path) {
            (Some(location), Some(path)) => write!(f, "{LOCATION_SIGIL}{location}/{path}"),
            (Some(location), None) => write!(f, "{LOCATION_SIGIL}{location}"),
            (None, Some(path)) => f.write_str(path),
            (None, None) => Ok(()),
        }
    }
}

impl FromStr for ContentPath {
    type Err = ProvisionError;

    fn from_str(value: &str) -> Result<Self> {
        let Some(rest) = value.strip_prefix(LOCATION_SIGIL) else {
            return Self::relative(value);
        };
        match rest.split_once('/') {
            Some((location, path)) => Self::at_location(location, Some(path.to_string())),
            None => Self::at_location(rest, None),
        }
    }
}

fn validate_location_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(ProvisionError::invalid_instruction(
            "location name must not be empty",
        ));
    }
    if name
        .chars()
        .any(|ch| matches!(ch, '/' | '\\' | '=' | LOCATION_SIGIL) || ch.is_control())
    {
        return Err(ProvisionError::invalid_instruction(format!(
            "location name contains invalid characters: {name}"
        )));
    }
    Ok(())
}

fn normalize_relative_path(path: &str) -> Result<String> {
    if path.starts_with('/') || path.contains('\\') {
        return Err(ProvisionError::invalid_instruction(format!(
            "content path must be relative and '/'-separated: {path}"
        )));
    }
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() {
        return Err(ProvisionError::invalid_instruction(
            "content path must not be empty",
        ));
    }
    for component in trimmed.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(ProvisionError::invalid_instruction(format!(
                "content path contains an invalid component: {path}"
            )));
        }
        if component.chars().any(|ch| ch == '=' || ch.is_control()) {
            return Err(ProvisionError::invalid_instruction(format!(
                "content path contains invalid characters: {path}"
            )));
        }
    }
    Ok(trimmed.to_string())
}
