use rusqlite::types::Value;

use super::{parse_state, placeholders, rejected_transition, state, text, transition_guard, Store};
use crate::db::RowRef;
use crate::error::{KbError, Result};
use crate::kb::model::{Document, LoadState};
use crate::scan::listing::FsEntry;
use crate::search::ranker::{ChunkHit, NameHit};
use crate::similarity::{decode_vector, encode_vector};

const DOCUMENT_COLUMNS: &str =
    "id, kb_id, file_name, file_type, location_path, size, mtime, load_state, order_no, created_at";

fn document_from_row(row: &RowRef<'_>) -> Result<Document> {
    Ok(Document {
        id: row.text(0)?,
        kb_id: row.text(1)?,
        file_name: row.text(2)?,
        file_type: row.text(3)?,
        location_path: row.text(4)?,
        size: row.int(5)?,
        mtime: row.int(6)?,
        content: None,
        content_chunks: Vec::new(),
        content_chunk_vectors: Vec::new(),
        file_name_vector: None,
        load_state: parse_state(row, 7)?,
        order_no: row.int(8)?,
        created_at: row.text(9)?,
    })
}

/// One stored chunk of a document
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkText {
    pub chunk_index: i64,
    pub text: String,
}

/// Append `AND <column> IN (...)` for an optional scope, numbering from `start`.
fn scope_clause(column: &str, scope: Option<&[String]>, start: usize) -> (String, Vec<Value>) {
    match scope {
        Some(ids) => (
            format!(" AND {} IN ({})", column, placeholders(start, ids.len())),
            ids.iter().map(text).collect(),
        ),
        None => (String::new(), Vec::new()),
    }
}

impl Store {
    pub fn insert_document(
        &self,
        kb_id: &str,
        entry: &FsEntry,
        load_state: LoadState,
    ) -> Result<Document> {
        let id = uuid::Uuid::new_v4().to_string();
        self.queue.execute(
            "INSERT INTO document
                (id, kb_id, file_name, file_type, location_path, size, mtime, load_state, order_no, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8,
                (SELECT COALESCE(MAX(order_no), 0) + 1 FROM document WHERE kb_id = ?2), ?9)",
            vec![
                text(&id),
                text(kb_id),
                text(&entry.name),
                text(entry.extension()),
                text(&entry.location_path),
                Value::Integer(entry.size),
                Value::Integer(entry.mtime),
                state(load_state),
                text(super::now()),
            ],
        )?;
        self.get_document(&id)?
            .ok_or_else(|| KbError::NotFound(format!("document {}", id)))
    }

    /// Document metadata without content or vectors.
    pub fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let rows = self.queue.execute(
            &format!("SELECT {} FROM document WHERE id = ?1", DOCUMENT_COLUMNS),
            vec![text(id)],
        )?;
        rows.first().map(|row| document_from_row(&row)).transpose()
    }

    /// Document with content, ordered chunks and vectors.
    pub fn load_document_body(&self, id: &str) -> Result<Option<Document>> {
        let Some(mut doc) = self.get_document(id)? else {
            return Ok(None);
        };

        let rows = self.queue.execute(
            "SELECT content, file_name_vector FROM document WHERE id = ?1",
            vec![text(id)],
        )?;
        if let Some(row) = rows.first() {
            doc.content = row.opt_text(0)?;
            doc.file_name_vector = row.blob(1)?.and_then(decode_vector);
        }

        let rows = self.queue.execute(
            "SELECT chunk_text, vector FROM document_chunk WHERE document_id = ?1 ORDER BY chunk_index",
            vec![text(id)],
        )?;
        for row in rows.iter() {
            doc.content_chunks.push(row.text(0)?);
            let vector = row
                .blob(1)?
                .and_then(decode_vector)
                .ok_or_else(|| KbError::Column(format!("bad chunk vector for {}", id)))?;
            doc.content_chunk_vectors.push(vector);
        }
        Ok(Some(doc))
    }

    pub fn documents_in(&self, kb_id: &str) -> Result<Vec<Document>> {
        let rows = self.queue.execute(
            &format!(
                "SELECT {} FROM document WHERE kb_id = ?1 ORDER BY order_no",
                DOCUMENT_COLUMNS
            ),
            vec![text(kb_id)],
        )?;
        rows.iter().map(|row| document_from_row(&row)).collect()
    }

    pub(super) fn pending_documents(&self) -> Result<Vec<Document>> {
        let rows = self.queue.execute(
            &format!(
                "SELECT {} FROM document WHERE load_state IN (?1, ?2, ?3) ORDER BY rowid",
                DOCUMENT_COLUMNS
            ),
            super::awaiting_params(),
        )?;
        rows.iter().map(|row| document_from_row(&row)).collect()
    }

    /// Move a document to `load_state`; illegal moves are rejected with `InvalidInput`.
    pub fn set_document_state(&self, id: &str, load_state: LoadState) -> Result<()> {
        let (guard, allowed) = transition_guard(load_state, 3);
        let mut params = vec![state(load_state), text(id)];
        params.extend(allowed);
        let rows = self.queue.execute(
            &format!("UPDATE document SET load_state = ?1 WHERE id = ?2 AND {}", guard),
            params,
        )?;
        if rows.affected == 0 {
            let current = self.get_document(id)?.map(|d| d.load_state);
            return rejected_transition("document", id, current, load_state);
        }
        Ok(())
    }

    /// Refresh size and mtime, leaving content and vectors untouched.
    pub fn update_file_stat(&self, id: &str, size: i64, mtime: i64) -> Result<()> {
        self.queue.execute(
            "UPDATE document SET size = ?1, mtime = ?2 WHERE id = ?3",
            vec![Value::Integer(size), Value::Integer(mtime), text(id)],
        )?;
        Ok(())
    }

    /// Flag a changed file for reload with its new size and mtime.
    pub fn mark_modified(&self, id: &str, size: i64, mtime: i64) -> Result<()> {
        let (guard, allowed) = transition_guard(LoadState::ModifiedPending, 5);
        let mut params = vec![
            Value::Integer(size),
            Value::Integer(mtime),
            state(LoadState::ModifiedPending),
            text(id),
        ];
        params.extend(allowed);
        let rows = self.queue.execute(
            &format!(
                "UPDATE document SET size = ?1, mtime = ?2, load_state = ?3 WHERE id = ?4 AND {}",
                guard
            ),
            params,
        )?;
        if rows.affected == 0 {
            let current = self.get_document(id)?.map(|d| d.load_state);
            return rejected_transition("document", id, current, LoadState::ModifiedPending);
        }
        Ok(())
    }

    /// Replace a document's content, chunks and vectors, then set its state.
    ///
    /// The state update runs last so a document never reads as Complete with
    /// a partial chunk list.
    pub fn save_ingested(
        &self,
        id: &str,
        content: &str,
        chunks: &[String],
        chunk_vectors: &[Vec<f32>],
        file_name_vector: &[f32],
        load_state: LoadState,
    ) -> Result<()> {
        if chunks.len() != chunk_vectors.len() {
            return Err(KbError::InvalidInput(format!(
                "{} chunks but {} vectors for document {}",
                chunks.len(),
                chunk_vectors.len(),
                id
            )));
        }

        self.queue.execute(
            "DELETE FROM document_chunk WHERE document_id = ?1",
            vec![text(id)],
        )?;

        let rows: Vec<Vec<Value>> = chunks
            .iter()
            .zip(chunk_vectors)
            .enumerate()
            .map(|(idx, (chunk, vector))| {
                vec![
                    text(id),
                    Value::Integer(idx as i64),
                    text(chunk.as_str()),
                    Value::Blob(encode_vector(vector)),
                ]
            })
            .collect();
        self.queue.execute_many(
            "INSERT INTO document_chunk (document_id, chunk_index, chunk_text, vector)
             VALUES (?1, ?2, ?3, ?4)",
            rows,
        )?;

        self.queue.execute(
            "UPDATE document SET content = ?1, file_name_vector = ?2, load_state = ?3 WHERE id = ?4",
            vec![
                text(content),
                Value::Blob(encode_vector(file_name_vector)),
                state(load_state),
                text(id),
            ],
        )?;
        Ok(())
    }

    /// Drop stale chunks and leave the document visible in a failed state.
    pub fn record_failure(&self, id: &str, load_state: LoadState) -> Result<()> {
        self.queue.execute(
            "DELETE FROM document_chunk WHERE document_id = ?1",
            vec![text(id)],
        )?;
        self.queue.execute(
            "UPDATE document SET content = NULL, load_state = ?1 WHERE id = ?2",
            vec![state(load_state), text(id)],
        )?;
        Ok(())
    }

    /// Hard delete; chunks follow through the foreign key cascade.
    pub fn delete_document(&self, id: &str) -> Result<bool> {
        let rows = self
            .queue
            .execute("DELETE FROM document WHERE id = ?1", vec![text(id)])?;
        Ok(rows.affected > 0)
    }

    /// Best `limit` chunks by similarity to `query`, optionally limited to `scope` knowledge bases.
    pub fn chunk_similarities(
        &self,
        query: &[f32],
        scope: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<ChunkHit>> {
        let (clause, scope_params) = scope_clause("d.kb_id", scope, 4);
        let sql = format!(
            "SELECT c.document_id, d.file_name, c.chunk_index,
                    angular_similarity(c.vector, ?1) AS score
             FROM document_chunk c
             JOIN document d ON d.id = c.document_id
             WHERE d.load_state <> ?2{}
             ORDER BY score DESC, d.rowid, c.chunk_index
             LIMIT ?3",
            clause
        );
        let mut params = vec![
            Value::Blob(encode_vector(query)),
            state(LoadState::Deleted),
            Value::Integer(limit as i64),
        ];
        params.extend(scope_params);

        let rows = self.queue.execute(&sql, params)?;
        rows.iter()
            .map(|row| {
                Ok(ChunkHit {
                    document_id: row.text(0)?,
                    file_name: row.text(1)?,
                    chunk_index: row.int(2)?,
                    score: row.real(3)? as f32,
                })
            })
            .collect()
    }

    /// Best `limit` documents by file-name similarity to `query`.
    pub fn file_name_similarities(
        &self,
        query: &[f32],
        scope: Option<&[String]>,
        limit: usize,
    ) -> Result<Vec<NameHit>> {
        let (clause, scope_params) = scope_clause("kb_id", scope, 4);
        let sql = format!(
            "SELECT id, file_name, angular_similarity(file_name_vector, ?1) AS score
             FROM document
             WHERE file_name_vector IS NOT NULL AND load_state <> ?2{}
             ORDER BY score DESC, rowid
             LIMIT ?3",
            clause
        );
        let mut params = vec![
            Value::Blob(encode_vector(query)),
            state(LoadState::Deleted),
            Value::Integer(limit as i64),
        ];
        params.extend(scope_params);

        let rows = self.queue.execute(&sql, params)?;
        rows.iter()
            .map(|row| {
                Ok(NameHit {
                    document_id: row.text(0)?,
                    file_name: row.text(1)?,
                    score: row.real(2)? as f32,
                })
            })
            .collect()
    }

    /// Stored chunk texts for `indices`, in the order requested. Unknown indices are skipped.
    pub fn chunk_texts(&self, document_id: &str, indices: &[i64]) -> Result<Vec<ChunkText>> {
        if indices.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT chunk_index, chunk_text FROM document_chunk
             WHERE document_id = ?1 AND chunk_index IN ({})",
            placeholders(2, indices.len())
        );
        let mut params = vec![text(document_id)];
        params.extend(indices.iter().map(|i| Value::Integer(*i)));

        let rows = self.queue.execute(&sql, params)?;
        let mut found = rows
            .iter()
            .map(|row| {
                Ok(ChunkText {
                    chunk_index: row.int(0)?,
                    text: row.text(1)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let position = |idx: i64| indices.iter().position(|i| *i == idx).unwrap_or(usize::MAX);
        found.sort_by_key(|c| position(c.chunk_index));
        Ok(found)
    }
}
