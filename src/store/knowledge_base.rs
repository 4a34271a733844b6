use rusqlite::types::Value;
use std::collections::HashSet;

use super::{
    awaiting_params, now, parse_state, placeholders, rejected_transition, state, text,
    transition_guard, Store,
};
use crate::db::RowRef;
use crate::error::Result;
use crate::kb::model::{Document, KnowledgeBaseNode, LoadState, ROOT_PARENT_ID};

const NODE_COLUMNS: &str = "id, parent_id, name, location_path, load_state";

fn node_from_row(row: &RowRef<'_>) -> Result<KnowledgeBaseNode> {
    Ok(KnowledgeBaseNode {
        id: row.text(0)?,
        parent_id: row.text(1)?,
        name: row.text(2)?,
        location_path: row.text(3)?,
        load_state: parse_state(row, 4)?,
    })
}

/// Whether a persisted child is a directory node or a file document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    Node,
    Document,
}

/// Persisted child of a knowledge base, keyed by location for diffing
#[derive(Debug, Clone, PartialEq)]
pub struct PersistedEntry {
    pub id: String,
    pub kind: EntryKind,
    pub location_path: String,
    pub size: i64,
    pub mtime: i64,
    pub load_state: LoadState,
}

/// Work item for the scheduler drain
#[derive(Debug, Clone)]
pub enum PendingItem {
    Node(KnowledgeBaseNode),
    Document(Document),
}

impl Store {
    pub fn insert_node(
        &self,
        parent_id: &str,
        name: &str,
        location_path: &str,
        load_state: LoadState,
    ) -> Result<KnowledgeBaseNode> {
        let node = KnowledgeBaseNode {
            id: uuid::Uuid::new_v4().to_string(),
            parent_id: parent_id.to_string(),
            name: name.to_string(),
            location_path: location_path.to_string(),
            load_state,
        };
        self.queue.execute(
            "INSERT INTO knowledge_base (id, parent_id, name, location_path, load_state, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            vec![
                text(&node.id),
                text(&node.parent_id),
                text(&node.name),
                text(&node.location_path),
                state(load_state),
                text(now()),
            ],
        )?;
        Ok(node)
    }

    pub fn get_node(&self, id: &str) -> Result<Option<KnowledgeBaseNode>> {
        let rows = self.queue.execute(
            &format!("SELECT {} FROM knowledge_base WHERE id = ?1", NODE_COLUMNS),
            vec![text(id)],
        )?;
        rows.first().map(|row| node_from_row(&row)).transpose()
    }

    pub fn root_nodes(&self) -> Result<Vec<KnowledgeBaseNode>> {
        self.query_nodes(
            &format!(
                "SELECT {} FROM knowledge_base WHERE parent_id = ?1 ORDER BY rowid",
                NODE_COLUMNS
            ),
            vec![text(ROOT_PARENT_ID)],
        )
    }

    pub fn child_nodes(&self, parent_id: &str) -> Result<Vec<KnowledgeBaseNode>> {
        self.query_nodes(
            &format!(
                "SELECT {} FROM knowledge_base WHERE parent_id = ?1 ORDER BY rowid",
                NODE_COLUMNS
            ),
            vec![text(parent_id)],
        )
    }

    pub fn find_root_by_path(&self, location_path: &str) -> Result<Option<KnowledgeBaseNode>> {
        let rows = self.queue.execute(
            &format!(
                "SELECT {} FROM knowledge_base WHERE parent_id = ?1 AND location_path = ?2",
                NODE_COLUMNS
            ),
            vec![text(ROOT_PARENT_ID), text(location_path)],
        )?;
        rows.first().map(|row| node_from_row(&row)).transpose()
    }

    /// Move a node to `load_state`; illegal moves are rejected with `InvalidInput`.
    pub fn set_node_state(&self, id: &str, load_state: LoadState) -> Result<()> {
        let (guard, allowed) = transition_guard(load_state, 3);
        let mut params = vec![state(load_state), text(id)];
        params.extend(allowed);
        let rows = self.queue.execute(
            &format!("UPDATE knowledge_base SET load_state = ?1 WHERE id = ?2 AND {}", guard),
            params,
        )?;
        if rows.affected == 0 {
            let current = self.get_node(id)?.map(|n| n.load_state);
            return rejected_transition("knowledge base", id, current, load_state);
        }
        Ok(())
    }

    /// `id` followed by every node below it, breadth first.
    pub fn descendant_ids(&self, id: &str) -> Result<Vec<String>> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut ordered = Vec::new();
        let mut frontier = vec![id.to_string()];

        while !frontier.is_empty() {
            let mut next = Vec::new();
            for chunk in frontier.chunks(500) {
                let sql = format!(
                    "SELECT id FROM knowledge_base WHERE parent_id IN ({})",
                    placeholders(1, chunk.len())
                );
                let rows = self
                    .queue
                    .execute(&sql, chunk.iter().map(text).collect())?;
                for row in rows.iter() {
                    next.push(row.text(0)?);
                }
            }
            for node_id in frontier.drain(..) {
                if seen.insert(node_id.clone()) {
                    ordered.push(node_id);
                }
            }
            frontier = next.into_iter().filter(|n| !seen.contains(n)).collect();
        }
        Ok(ordered)
    }

    /// Hard-delete a node and everything below it. Returns the number of nodes removed.
    ///
    /// Documents and their chunks go with their node through `ON DELETE CASCADE`.
    pub fn delete_node_tree(&self, id: &str) -> Result<usize> {
        let ids = self.descendant_ids(id)?;
        // leaves first, so no child outlives its parent even briefly
        let rows: Vec<Vec<Value>> = ids.iter().rev().map(|n| vec![text(n)]).collect();
        self.queue
            .execute_many("DELETE FROM knowledge_base WHERE id = ?1", rows)?;
        log::debug!("Deleted knowledge base tree {} ({} node(s))", id, ids.len());
        Ok(ids.len())
    }

    /// Children of `kb_id` (nodes and documents) that still need processing.
    ///
    /// Child nodes count unless Complete; documents count while pending or deleted.
    pub fn pending_children_count(&self, kb_id: &str) -> Result<i64> {
        let mut params = vec![text(kb_id), state(LoadState::Complete)];
        params.extend(awaiting_params());
        let rows = self.queue.execute(
            "SELECT
                (SELECT COUNT(*) FROM knowledge_base WHERE parent_id = ?1 AND load_state <> ?2) +
                (SELECT COUNT(*) FROM document WHERE kb_id = ?1 AND load_state IN (?3, ?4, ?5))",
            params,
        )?;
        match rows.first() {
            Some(row) => row.int(0),
            None => Ok(0),
        }
    }

    /// Persisted children of `kb_id`: sub-nodes followed by documents.
    pub fn persisted_entries(&self, kb_id: &str) -> Result<Vec<PersistedEntry>> {
        let mut entries = Vec::new();

        for node in self.child_nodes(kb_id)? {
            entries.push(PersistedEntry {
                id: node.id,
                kind: EntryKind::Node,
                location_path: node.location_path,
                size: 0,
                mtime: 0,
                load_state: node.load_state,
            });
        }

        let rows = self.queue.execute(
            "SELECT id, location_path, size, mtime, load_state FROM document
             WHERE kb_id = ?1 ORDER BY rowid",
            vec![text(kb_id)],
        )?;
        for row in rows.iter() {
            entries.push(PersistedEntry {
                id: row.text(0)?,
                kind: EntryKind::Document,
                location_path: row.text(1)?,
                size: row.int(2)?,
                mtime: row.int(3)?,
                load_state: parse_state(&row, 4)?,
            });
        }
        Ok(entries)
    }

    /// Everything awaiting the scheduler: nodes first, then documents, each in insertion order.
    pub fn pending_items(&self) -> Result<Vec<PendingItem>> {
        let nodes = self.query_nodes(
            &format!(
                "SELECT {} FROM knowledge_base WHERE load_state IN (?1, ?2, ?3) ORDER BY rowid",
                NODE_COLUMNS
            ),
            awaiting_params(),
        )?;
        let documents = self.pending_documents()?;

        Ok(nodes
            .into_iter()
            .map(PendingItem::Node)
            .chain(documents.into_iter().map(PendingItem::Document))
            .collect())
    }

    fn query_nodes(&self, sql: &str, params: Vec<Value>) -> Result<Vec<KnowledgeBaseNode>> {
        let rows = self.queue.execute(sql, params)?;
        rows.iter().map(|row| node_from_row(&row)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::KbError;
    use crate::store::test_support::store_in;
    use tempfile::TempDir;

    #[test]
    fn test_insert_and_lookup_root() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let root = store
            .insert_node(ROOT_PARENT_ID, "docs", "/data/docs", LoadState::AddedPending)
            .unwrap();
        assert!(root.is_root());

        let found = store.find_root_by_path("/data/docs").unwrap().unwrap();
        assert_eq!(found, root);
        assert_eq!(store.root_nodes().unwrap().len(), 1);
        assert!(store.find_root_by_path("/data/other").unwrap().is_none());
    }

    #[test]
    fn test_descendants_and_tree_delete() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let root = store
            .insert_node(ROOT_PARENT_ID, "r", "/r", LoadState::Complete)
            .unwrap();
        let a = store.insert_node(&root.id, "a", "/r/a", LoadState::Complete).unwrap();
        let b = store.insert_node(&a.id, "b", "/r/a/b", LoadState::Complete).unwrap();
        let other = store
            .insert_node(ROOT_PARENT_ID, "o", "/o", LoadState::Complete)
            .unwrap();

        let ids = store.descendant_ids(&root.id).unwrap();
        assert_eq!(ids, vec![root.id.clone(), a.id.clone(), b.id.clone()]);

        assert_eq!(store.delete_node_tree(&a.id).unwrap(), 2);
        assert!(store.get_node(&b.id).unwrap().is_none());
        assert!(store.get_node(&root.id).unwrap().is_some());
        assert!(store.get_node(&other.id).unwrap().is_some());
    }

    #[test]
    fn test_pending_children_count() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let root = store
            .insert_node(ROOT_PARENT_ID, "r", "/r", LoadState::AddedPending)
            .unwrap();
        let child = store
            .insert_node(&root.id, "c", "/r/c", LoadState::AddedPending)
            .unwrap();
        assert_eq!(store.pending_children_count(&root.id).unwrap(), 1);
        assert_eq!(store.pending_count().unwrap(), 2);

        store.set_node_state(&child.id, LoadState::Complete).unwrap();
        assert_eq!(store.pending_children_count(&root.id).unwrap(), 0);
        assert_eq!(store.pending_count().unwrap(), 1);
    }

    #[test]
    fn test_node_state_changes_follow_lattice() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let node = store
            .insert_node(ROOT_PARENT_ID, "r", "/r", LoadState::AddedPending)
            .unwrap();
        let current = |store: &Store| store.get_node(&node.id).unwrap().unwrap().load_state;

        store.set_node_state(&node.id, LoadState::Complete).unwrap();
        assert!(matches!(
            store.set_node_state(&node.id, LoadState::AddedPending),
            Err(KbError::InvalidInput(_))
        ));
        assert_eq!(current(&store), LoadState::Complete);

        store.set_node_state(&node.id, LoadState::Deleted).unwrap();
        store.set_node_state(&node.id, LoadState::Deleted).unwrap();
        assert!(matches!(
            store.set_node_state(&node.id, LoadState::Complete),
            Err(KbError::InvalidInput(_))
        ));
        store.set_node_state(&node.id, LoadState::AddedPending).unwrap();
        assert_eq!(current(&store), LoadState::AddedPending);

        assert!(matches!(
            store.set_node_state("missing", LoadState::Complete),
            Err(KbError::NotFound(_))
        ));
    }
}
