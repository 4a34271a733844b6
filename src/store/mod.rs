//! Persistence for knowledge base nodes, documents and chunks.
//!
//! All statements go through the [`MutationQueue`]: reads run directly on a
//! fresh connection, writes are serialized by the queue worker.

use rusqlite::types::Value;
use std::sync::Arc;

use crate::db::{MutationQueue, RowRef};
use crate::error::{KbError, Result};
use crate::kb::model::LoadState;

mod document;
mod knowledge_base;

pub use document::ChunkText;
pub use knowledge_base::{EntryKind, PendingItem, PersistedEntry};

/// Data access layer over the mutation queue
#[derive(Clone)]
pub struct Store {
    queue: Arc<MutationQueue>,
}

impl Store {
    pub fn new(queue: Arc<MutationQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<MutationQueue> {
        &self.queue
    }

    /// Documents plus nodes that are pending load or awaiting deletion.
    pub fn pending_count(&self) -> Result<i64> {
        let rows = self.queue.execute(
            "SELECT
                (SELECT COUNT(*) FROM document WHERE load_state IN (?1, ?2, ?3)) +
                (SELECT COUNT(*) FROM knowledge_base WHERE load_state IN (?1, ?2, ?3))",
            awaiting_params(),
        )?;
        match rows.first() {
            Some(row) => row.int(0),
            None => Ok(0),
        }
    }
}

pub(crate) fn text(s: impl Into<String>) -> Value {
    Value::Text(s.into())
}

pub(crate) fn state(state: LoadState) -> Value {
    Value::Text(state.as_str().to_string())
}

pub(crate) fn parse_state(row: &RowRef<'_>, idx: usize) -> Result<LoadState> {
    let raw = row.text(idx)?;
    LoadState::parse(&raw).ok_or_else(|| KbError::Column(format!("unknown load_state '{}'", raw)))
}

/// Parameters for `load_state IN (?1, ?2, ?3)`.
pub(crate) fn awaiting_params() -> Vec<Value> {
    LoadState::ALL
        .into_iter()
        .filter(LoadState::awaits_processing)
        .map(state)
        .collect()
}

/// `load_state IN (...)` clause and parameters admitting only legal moves to `next`.
pub(crate) fn transition_guard(next: LoadState, start: usize) -> (String, Vec<Value>) {
    let allowed = LoadState::predecessors(next);
    (
        format!("load_state IN ({})", placeholders(start, allowed.len())),
        allowed.into_iter().map(state).collect(),
    )
}

/// Explain a guarded state update that changed no row.
///
/// Re-entering the current state is accepted as a no-op.
pub(crate) fn rejected_transition(
    what: &str,
    id: &str,
    current: Option<LoadState>,
    next: LoadState,
) -> Result<()> {
    match current {
        None => Err(KbError::NotFound(format!("{} {}", what, id))),
        Some(current) if current == next => Ok(()),
        Some(current) => Err(KbError::InvalidInput(format!(
            "{} {}: illegal load state change {} -> {}",
            what, id, current, next
        ))),
    }
}

/// `?start, ?start+1, ...` for an `IN (...)` list of `count` values.
pub(crate) fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) fn now() -> String {
    chrono::Utc::now().to_rfc3339()
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholders() {
        assert_eq!(placeholders(3, 3), "?3, ?4, ?5");
        assert_eq!(placeholders(1, 1), "?1");
        assert_eq!(placeholders(2, 0), "");
    }
}
