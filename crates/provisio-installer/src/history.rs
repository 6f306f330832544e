use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use provisio_core::{ProvisionError, Result};

use crate::fsimage::FsImage;

const LAST_FILE: &str = "last";
const PREVIOUS_FILE: &str = "previous";
const NEXT_FILE: &str = "next";
const RECORDS_DIR: &str = "records";

static RECORD_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Opaque record identifier, also the record's directory name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RecordId(String);

impl RecordId {
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let valid = !value.is_empty()
            && value
                .chars()
                .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_');
        valid.then(|| Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn generate(attempt: u32) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_nanos())
            .unwrap_or_default();
        let sequence = RECORD_COUNTER.fetch_add(1, Ordering::Relaxed);
        Self(format!(
            "{nanos:x}-{:x}-{sequence:x}{}",
            std::process::id(),
            if attempt == 0 {
                String::new()
            } else {
                format!("-{attempt}")
            }
        ))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Doubly linked chain of records persisted under one root directory:
/// `last` names the newest record, each `records/<id>/` holds a `previous`
/// pointer and, once it has a successor, a `next` pointer.
///
/// Every read goes through an [`FsImage`] so pointer changes staged earlier in
/// the same batch are visible; every mutation is staged, never written directly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryChain {
    root: PathBuf,
}

impl HistoryChain {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn last_path(&self) -> PathBuf {
        self.root.join(LAST_FILE)
    }

    pub fn records_dir(&self) -> PathBuf {
        self.root.join(RECORDS_DIR)
    }

    pub fn record_dir(&self, id: &RecordId) -> PathBuf {
        self.records_dir().join(id.as_str())
    }

    pub fn last_applied(&self, image: &FsImage) -> Result<Option<RecordId>> {
        let Some(id) = self.read_pointer(image, &self.last_path())? else {
            return Ok(None);
        };
        self.ensure_record(image, &id)?;
        Ok(Some(id))
    }

    pub fn previous_of(&self, image: &FsImage, id: &RecordId) -> Result<Option<RecordId>> {
        self.read_pointer(image, &self.record_dir(id).join(PREVIOUS_FILE))
    }

    pub fn next_of(&self, image: &FsImage, id: &RecordId) -> Result<Option<RecordId>> {
        self.read_pointer(image, &self.record_dir(id).join(NEXT_FILE))
    }

    pub fn is_empty(&self, image: &FsImage) -> Result<bool> {
        Ok(self.last_applied(image)?.is_none())
    }

    /// Fresh identifier with no record directory behind it yet.
    pub fn allocate_id(&self, image: &FsImage) -> Result<RecordId> {
        let mut attempt = 0;
        loop {
            let id = RecordId::generate(attempt);
            if !image.exists(&self.record_dir(&id))? {
                return Ok(id);
            }
            attempt += 1;
        }
    }

    /// Reads `name` from the record directory of `id`.
    pub fn read_record_file(
        &self,
        image: &FsImage,
        id: &RecordId,
        name: &str,
    ) -> Result<Vec<u8>> {
        let path = self.record_dir(id).join(name);
        image
            .read_content(&path)?
            .ok_or_else(|| ProvisionError::history_corrupt(path, "record file is missing"))
    }

    /// Stages record `id` with `files` as the new newest record.
    pub fn schedule_append(
        &self,
        image: &mut FsImage,
        id: &RecordId,
        files: Vec<(&'static str, Vec<u8>)>,
    ) -> Result<()> {
        let previous = self.last_applied(image)?;
        let record_dir = self.record_dir(id);
        image.mkdirs(&record_dir);
        for (name, bytes) in files {
            image.write(record_dir.join(name), bytes);
        }
        if let Some(previous) = &previous {
            image.write(record_dir.join(PREVIOUS_FILE), pointer_bytes(previous));
            image.write(self.record_dir(previous).join(NEXT_FILE), pointer_bytes(id));
        }
        image.write(self.last_path(), pointer_bytes(id));
        Ok(())
    }

    /// Newest-first walk over the chain, following `previous` pointers.
    pub fn iter_backward<'a>(&'a self, image: &'a FsImage) -> Backward<'a> {
        Backward {
            chain: self,
            image,
            pending: Pending::Start,
            seen: BTreeSet::new(),
        }
    }

    /// Stages removal of the newest record and returns its id, `None` when
    /// the chain is already empty.
    pub fn schedule_delete_last(&self, image: &mut FsImage) -> Result<Option<RecordId>> {
        let Some(last) = self.last_applied(image)? else {
            return Ok(None);
        };
        match self.previous_of(image, &last)? {
            Some(previous) => {
                self.ensure_record(image, &previous)?;
                image.write(self.last_path(), pointer_bytes(&previous));
                image.delete(self.record_dir(&previous).join(NEXT_FILE));
            }
            None => image.delete(self.last_path()),
        }
        image.delete(self.record_dir(&last));
        Ok(Some(last))
    }

    /// Stages removal of any record, relinking its neighbours around it.
    pub fn schedule_delete(&self, image: &mut FsImage, id: &RecordId) -> Result<()> {
        if self.last_applied(image)?.as_ref() == Some(id) {
            self.schedule_delete_last(image)?;
            return Ok(());
        }
        self.ensure_record(image, id)?;

        let previous = self.previous_of(image, id)?;
        let next = self.next_of(image, id)?.ok_or_else(|| {
            ProvisionError::history_corrupt(
                self.record_dir(id),
                "record is not the newest but has no next pointer",
            )
        })?;
        self.ensure_record(image, &next)?;

        let next_previous = self.record_dir(&next).join(PREVIOUS_FILE);
        match &previous {
            Some(previous) => {
                self.ensure_record(image, previous)?;
                image.write(next_previous, pointer_bytes(previous));
                image.write(self.record_dir(previous).join(NEXT_FILE), pointer_bytes(&next));
            }
            None => image.delete(next_previous),
        }
        image.delete(self.record_dir(id));
        Ok(())
    }

    /// Stages removal of the whole chain and returns the ids it held,
    /// newest first.
    pub fn schedule_clear(&self, image: &mut FsImage) -> Result<Vec<RecordId>> {
        let ids = self.iter_backward(image).collect::<Result<Vec<_>>>()?;
        image.delete(&self.root);
        Ok(ids)
    }

    /// Stages a copy of the whole chain under `archive`, then its removal.
    /// An empty chain leaves nothing to archive.
    pub fn schedule_archive(&self, image: &mut FsImage, archive: &Path) -> Result<Vec<RecordId>> {
        let ids = self.iter_backward(image).collect::<Result<Vec<_>>>()?;
        if ids.is_empty() {
            return Ok(ids);
        }
        image.copy(archive, &self.root);
        image.delete(&self.root);
        Ok(ids)
    }

    /// Stages the chain archived under `archive` back into place. The chain
    /// must be empty; a missing archive restores nothing.
    pub fn schedule_restore(&self, image: &mut FsImage, archive: &Path) -> Result<()> {
        if !self.is_empty(image)? {
            return Err(ProvisionError::history_corrupt(
                &self.root,
                "cannot restore an archived chain over existing records",
            ));
        }
        if image.exists(archive)? {
            image.copy(&self.root, archive);
        }
        Ok(())
    }

    fn ensure_record(&self, image: &FsImage, id: &RecordId) -> Result<()> {
        let dir = self.record_dir(id);
        if image.exists(&dir)? {
            Ok(())
        } else {
            Err(ProvisionError::history_corrupt(
                dir,
                format!("pointer names missing record '{id}'"),
            ))
        }
    }

    fn read_pointer(&self, image: &FsImage, path: &Path) -> Result<Option<RecordId>> {
        let Some(bytes) = image.read_content(path)? else {
            return Ok(None);
        };
        let raw = String::from_utf8(bytes)
            .map_err(|_| ProvisionError::history_corrupt(path, "pointer is not UTF-8"))?;
        RecordId::parse(&raw)
            .map(Some)
            .ok_or_else(|| ProvisionError::history_corrupt(path, "pointer holds no valid record id"))
    }
}

fn pointer_bytes(id: &RecordId) -> Vec<u8> {
    format!("{id}\n").into_bytes()
}

enum Pending {
    Start,
    Next(RecordId),
    Done,
}

/// Lazy newest-first traversal; yields an error once and stops when the
/// chain is inconsistent.
pub struct Backward<'a> {
    chain: &'a HistoryChain,
    image: &'a FsImage,
    pending: Pending,
    seen: BTreeSet<RecordId>,
}

impl Backward<'_> {
    fn advance(&mut self) -> Result<Option<RecordId>> {
        let current = match std::mem::replace(&mut self.pending, Pending::Done) {
            Pending::Start => self.chain.last_applied(self.image)?,
            Pending::Next(id) => {
                self.chain.ensure_record(self.image, &id)?;
                Some(id)
            }
            Pending::Done => None,
        };
        let Some(current) = current else {
            return Ok(None);
        };
        if !self.seen.insert(current.clone()) {
            return Err(ProvisionError::history_corrupt(
                self.chain.record_dir(&current),
                "previous pointers form a cycle",
            ));
        }
        if let Some(previous) = self.chain.previous_of(self.image, &current)? {
            self.pending = Pending::Next(previous);
        }
        Ok(Some(current))
    }
}

impl Iterator for Backward<'_> {
    type Item = Result<RecordId>;

    fn next(&mut self) -> Option<Self::Item> {
        self.advance().transpose()
    }
}
