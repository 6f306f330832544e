use std::collections::BTreeSet;

use provisio_core::ContentPath;

/// Content paths one unit gained or lost during a single apply.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Journal {
    added: BTreeSet<ContentPath>,
    deleted: BTreeSet<ContentPath>,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_added(&mut self, path: &ContentPath) {
        self.deleted.remove(path);
        self.added.insert(path.clone());
    }

    pub fn record_deleted(&mut self, path: &ContentPath) {
        self.added.remove(path);
        self.deleted.insert(path.clone());
    }

    pub fn added(&self) -> &BTreeSet<ContentPath> {
        &self.added
    }

    pub fn deleted(&self) -> &BTreeSet<ContentPath> {
        &self.deleted
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.deleted.is_empty()
    }

    pub fn next_manifest(&self, previous: &BTreeSet<ContentPath>) -> BTreeSet<ContentPath> {
        previous
            .iter()
            .filter(|path| !self.deleted.contains(*path))
            .chain(self.added.iter())
            .cloned()
            .collect()
    }
}
