//! Change detection between persisted knowledge base rows and the file system.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use crate::error::{KbError, Result};
use crate::kb::model::{KnowledgeBaseNode, LoadState};
use crate::notify::Notifier;
use crate::scan::listing::{list_children, FsEntry};
use crate::store::{EntryKind, PersistedEntry, Store};

/// Differences between one directory level on disk and its persisted rows
#[derive(Debug, Default)]
pub struct Delta<'a> {
    /// On disk, not persisted
    pub added: Vec<&'a FsEntry>,
    /// On both sides and changed, or a deleted row that reappeared
    pub modified: Vec<(&'a PersistedEntry, &'a FsEntry)>,
    /// Persisted and live, no longer on disk
    pub deleted: Vec<&'a PersistedEntry>,
}

impl Delta<'_> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.modified.is_empty() && self.deleted.is_empty()
    }
}

/// Counts from one detection pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ScanReport {
    pub added_nodes: usize,
    pub added_documents: usize,
    pub modified: usize,
    pub deleted: usize,
    pub missing_roots: usize,
}

impl ScanReport {
    pub fn is_empty(&self) -> bool {
        *self == ScanReport::default()
    }

    fn absorb(&mut self, other: &ScanReport) {
        self.added_nodes += other.added_nodes;
        self.added_documents += other.added_documents;
        self.modified += other.modified;
        self.deleted += other.deleted;
        self.missing_roots += other.missing_roots;
    }
}

fn same_kind(persisted: &PersistedEntry, entry: &FsEntry) -> bool {
    match persisted.kind {
        EntryKind::Node => entry.is_dir,
        EntryKind::Document => !entry.is_dir,
    }
}

/// Diff one directory level keyed by `location_path`.
///
/// Rows already soft-deleted are not reported again. If such a row's path
/// reappears with the same kind it is reported as modified so it gets
/// revived; with a different kind it is left alone until the row is purged.
pub fn diff_entries<'a>(persisted: &'a [PersistedEntry], current: &'a [FsEntry]) -> Delta<'a> {
    let mut known: HashMap<&str, &PersistedEntry> = HashMap::with_capacity(persisted.len());
    for row in persisted {
        known.entry(row.location_path.as_str()).or_insert(row);
    }
    let on_disk: HashSet<&str> = current.iter().map(|e| e.location_path.as_str()).collect();

    let mut delta = Delta::default();
    for entry in current {
        match known.get(entry.location_path.as_str()) {
            None => delta.added.push(entry),
            Some(row) if row.load_state == LoadState::Deleted => {
                if same_kind(row, entry) {
                    delta.modified.push((*row, entry));
                }
            }
            Some(row) if !same_kind(row, entry) => delta.deleted.push(*row),
            Some(row) => {
                if row.kind == EntryKind::Document
                    && (row.size != entry.size || row.mtime != entry.mtime)
                {
                    delta.modified.push((*row, entry));
                }
            }
        }
    }

    for row in known.values() {
        if row.load_state != LoadState::Deleted && !on_disk.contains(row.location_path.as_str()) {
            delta.deleted.push(*row);
        }
    }
    // HashMap iteration order is arbitrary
    delta.deleted.sort_by(|a, b| a.location_path.cmp(&b.location_path));
    delta
}

/// Walks knowledge base trees and records adds, modifications and deletions
pub struct ChangeDetector {
    store: Store,
    notifier: Notifier,
}

impl ChangeDetector {
    pub fn new(store: Store, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Run detection over every root knowledge base.
    ///
    /// A failing root is logged and skipped so other roots are still scanned.
    pub fn detect_all(&self) -> Result<ScanReport> {
        let mut total = ScanReport::default();
        for root in self.store.root_nodes()? {
            match self.detect(&root) {
                Ok(report) => total.absorb(&report),
                Err(e) => log::error!("Change detection failed for {}: {}", root.location_path, e),
            }
        }
        self.notifier.pending_count(self.store.pending_count()?);
        Ok(total)
    }

    /// Run detection over one knowledge base and everything below it.
    pub fn detect(&self, root: &KnowledgeBaseNode) -> Result<ScanReport> {
        let mut report = ScanReport::default();

        if !Path::new(&root.location_path).is_dir() {
            if root.load_state != LoadState::Deleted {
                log::info!("Knowledge base root missing: {}", root.location_path);
                self.store.set_node_state(&root.id, LoadState::Deleted)?;
                self.notifier.kb_state(&root.id, LoadState::Deleted);
                report.missing_roots += 1;
            }
            return Ok(report);
        }
        if root.load_state == LoadState::Deleted {
            log::info!("Knowledge base root reappeared: {}", root.location_path);
            self.store.set_node_state(&root.id, LoadState::AddedPending)?;
            self.notifier.kb_state(&root.id, LoadState::AddedPending);
            report.modified += 1;
        }

        let mut worklist = vec![root.id.clone()];
        while let Some(kb_id) = worklist.pop() {
            let Some(node) = self.store.get_node(&kb_id)? else {
                continue;
            };
            let listing = match list_children(Path::new(&node.location_path)) {
                Ok(Some(listing)) => listing,
                Ok(None) => {
                    // vanished after its parent was listed; the next pass marks it
                    log::debug!("Directory vanished during scan: {}", node.location_path);
                    continue;
                }
                Err(e @ KbError::ScanIo { .. }) => {
                    log::warn!("{}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };

            let persisted = self.store.persisted_entries(&node.id)?;
            let delta = diff_entries(&persisted, &listing);
            if !delta.is_empty() {
                log::debug!(
                    "{}: {} added, {} modified, {} deleted",
                    node.location_path,
                    delta.added.len(),
                    delta.modified.len(),
                    delta.deleted.len()
                );
            }
            self.apply(&node, &delta, &mut report)?;

            for child in self.store.child_nodes(&node.id)? {
                if child.load_state != LoadState::Deleted {
                    worklist.push(child.id);
                }
            }
        }

        Ok(report)
    }

    fn apply(&self, node: &KnowledgeBaseNode, delta: &Delta<'_>, report: &mut ScanReport) -> Result<()> {
        for entry in &delta.added {
            if entry.is_dir {
                let child = self.store.insert_node(
                    &node.id,
                    &entry.name,
                    &entry.location_path,
                    LoadState::AddedPending,
                )?;
                self.notifier.node_added(&child);
                report.added_nodes += 1;
            } else {
                let doc = self
                    .store
                    .insert_document(&node.id, entry, LoadState::AddedPending)?;
                self.notifier.document_added(&doc);
                report.added_documents += 1;
            }
        }

        for (row, entry) in &delta.modified {
            match row.kind {
                EntryKind::Document => {
                    self.store.mark_modified(&row.id, entry.size, entry.mtime)?;
                    self.notifier.document_state(&row.id, LoadState::ModifiedPending);
                }
                EntryKind::Node => {
                    self.store.set_node_state(&row.id, LoadState::AddedPending)?;
                    self.notifier.kb_state(&row.id, LoadState::AddedPending);
                }
            }
            report.modified += 1;
        }

        for row in &delta.deleted {
            match row.kind {
                EntryKind::Document => {
                    self.store.set_document_state(&row.id, LoadState::Deleted)?;
                    self.notifier.document_state(&row.id, LoadState::Deleted);
                }
                EntryKind::Node => {
                    self.store.set_node_state(&row.id, LoadState::Deleted)?;
                    self.notifier.kb_state(&row.id, LoadState::Deleted);
                }
            }
            report.deleted += 1;
        }
        Ok(())
    }
}
