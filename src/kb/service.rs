use std::path::Path;

use crate::error::{KbError, Result};
use crate::kb::model::{Document, KnowledgeBaseNode, LoadState, ROOT_PARENT_ID};
use crate::notify::Notifier;
use crate::scan::detector::{ChangeDetector, ScanReport};
use crate::scan::listing::normalize_path;
use crate::store::Store;

/// Registration and removal of knowledge bases
pub struct KnowledgeBaseService {
    store: Store,
    detector: ChangeDetector,
    notifier: Notifier,
}

impl KnowledgeBaseService {
    pub fn new(store: Store, notifier: Notifier) -> Self {
        let detector = ChangeDetector::new(store.clone(), notifier.clone());
        Self {
            store,
            detector,
            notifier,
        }
    }

    /// Register `path` as a root knowledge base and scan it right away.
    ///
    /// The path is canonicalized first, so `./docs` and its absolute form
    /// count as the same root.
    pub fn add_root(&self, path: &Path) -> Result<(KnowledgeBaseNode, ScanReport)> {
        if !path.is_dir() {
            return Err(KbError::InvalidInput(format!(
                "{} is not a directory",
                path.display()
            )));
        }
        let canonical = std::fs::canonicalize(path).map_err(|source| KbError::ScanIo {
            path: path.display().to_string(),
            source,
        })?;
        let location_path = normalize_path(&canonical);

        if self.store.find_root_by_path(&location_path)?.is_some() {
            return Err(KbError::DuplicateKnowledgeBase(location_path));
        }

        let name = canonical
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| location_path.clone());
        let root = self
            .store
            .insert_node(ROOT_PARENT_ID, &name, &location_path, LoadState::AddedPending)?;
        log::info!("Added knowledge base {} at {}", root.id, root.location_path);
        self.notifier.node_added(&root);

        let report = self.detector.detect(&root)?;
        self.notifier.pending_count(self.store.pending_count()?);
        Ok((root, report))
    }

    /// Hard-delete a knowledge base with every node, document and chunk below it.
    pub fn remove_knowledge_base(&self, id: &str) -> Result<usize> {
        let node = self
            .store
            .get_node(id)?
            .ok_or_else(|| KbError::NotFound(format!("knowledge base {}", id)))?;
        let removed = self.store.delete_node_tree(&node.id)?;
        log::info!("Removed knowledge base {} ({} node(s))", node.location_path, removed);
        self.notifier.pending_count(self.store.pending_count()?);
        Ok(removed)
    }

    /// Hard-delete one document. The file on disk is untouched, so the next
    /// scan adds it back if it still exists.
    pub fn remove_document(&self, id: &str) -> Result<()> {
        if !self.store.delete_document(id)? {
            return Err(KbError::NotFound(format!("document {}", id)));
        }
        self.notifier.pending_count(self.store.pending_count()?);
        Ok(())
    }

    pub fn pending_count(&self) -> Result<i64> {
        self.store.pending_count()
    }

    pub fn list_roots(&self) -> Result<Vec<KnowledgeBaseNode>> {
        self.store.root_nodes()
    }

    pub fn children(&self, id: &str) -> Result<Vec<KnowledgeBaseNode>> {
        self.store.child_nodes(id)
    }

    pub fn documents(&self, id: &str) -> Result<Vec<Document>> {
        self.store.documents_in(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::recording;
    use crate::notify::UiEvent;
    use crate::store::test_support::store_in;
    use std::fs;
    use tempfile::TempDir;

    fn corpus() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub").join("b.md"), "# beta").unwrap();
        dir
    }

    #[test]
    fn test_add_root_scans_immediately() {
        let db_dir = TempDir::new().unwrap();
        let store = store_in(&db_dir);
        let (events, notifier) = recording();
        let service = KnowledgeBaseService::new(store.clone(), notifier);
        let data = corpus();

        let (root, report) = service.add_root(data.path()).unwrap();
        assert!(root.is_root());
        assert_eq!(root.load_state, LoadState::AddedPending);
        assert_eq!(report.added_nodes, 1);
        assert_eq!(report.added_documents, 2);

        let sub = service.children(&root.id).unwrap();
        assert_eq!(sub.len(), 1);
        assert_eq!(sub[0].name, "sub");
        assert_eq!(service.documents(&sub[0].id).unwrap()[0].file_name, "b.md");
        // root + sub + two documents
        assert_eq!(service.pending_count().unwrap(), 4);

        let recorded = events.events();
        assert!(matches!(recorded.first(), Some(UiEvent::NodeAdded { .. })));
        assert!(matches!(recorded.last(), Some(UiEvent::PendingCount { count: 4 })));
    }

    #[test]
    fn test_add_root_rejects_duplicates_and_files() {
        let db_dir = TempDir::new().unwrap();
        let service = KnowledgeBaseService::new(store_in(&db_dir), Notifier::log());
        let data = corpus();

        service.add_root(data.path()).unwrap();
        assert!(matches!(
            service.add_root(&data.path().join("sub").join("..")),
            Err(KbError::DuplicateKnowledgeBase(_))
        ));
        assert!(matches!(
            service.add_root(&data.path().join("a.txt")),
            Err(KbError::InvalidInput(_))
        ));
        assert!(matches!(
            service.add_root(&data.path().join("missing")),
            Err(KbError::InvalidInput(_))
        ));
        assert_eq!(service.list_roots().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_knowledge_base_cascades() {
        let db_dir = TempDir::new().unwrap();
        let store = store_in(&db_dir);
        let service = KnowledgeBaseService::new(store.clone(), Notifier::log());
        let data = corpus();
        let (root, _) = service.add_root(data.path()).unwrap();
        let sub = service.children(&root.id).unwrap().remove(0);
        let doc = service.documents(&sub.id).unwrap().remove(0);

        assert_eq!(service.remove_knowledge_base(&root.id).unwrap(), 2);
        assert!(store.get_node(&sub.id).unwrap().is_none());
        assert!(store.get_document(&doc.id).unwrap().is_none());
        assert!(service.list_roots().unwrap().is_empty());
        assert_eq!(service.pending_count().unwrap(), 0);
        assert!(data.path().join("a.txt").exists());

        assert!(matches!(
            service.remove_knowledge_base(&root.id),
            Err(KbError::NotFound(_))
        ));
    }

    #[test]
    fn test_remove_document() {
        let db_dir = TempDir::new().unwrap();
        let service = KnowledgeBaseService::new(store_in(&db_dir), Notifier::log());
        let data = corpus();
        let (root, _) = service.add_root(data.path()).unwrap();
        let doc = service.documents(&root.id).unwrap().remove(0);

        service.remove_document(&doc.id).unwrap();
        assert!(service.documents(&root.id).unwrap().is_empty());
        assert!(matches!(
            service.remove_document(&doc.id),
            Err(KbError::NotFound(_))
        ));
    }
}
