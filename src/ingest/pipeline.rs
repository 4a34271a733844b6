use std::path::Path;
use std::sync::Arc;

use crate::embeddings::EmbeddingPort;
use crate::error::{KbError, Result};
use crate::ingest::chunker::chunk_text;
use crate::ingest::loaders::LoaderRegistry;
use crate::kb::model::{Document, LoadState};
use crate::store::Store;

/// Load, chunk, vectorize and persist one document
pub struct IngestionPipeline {
    store: Store,
    loaders: LoaderRegistry,
    embedder: Arc<dyn EmbeddingPort>,
    max_chunks: usize,
}

impl IngestionPipeline {
    pub fn new(store: Store, embedder: Arc<dyn EmbeddingPort>, max_chunks: usize) -> Self {
        Self {
            store,
            loaders: LoaderRegistry::new(),
            embedder,
            max_chunks: max_chunks.max(1),
        }
    }

    /// Ingest `doc` and return the state it was left in.
    ///
    /// Loader and encoder failures end in `Unsupported` or `LoadFailed` and
    /// are not returned as errors; only storage failures are.
    pub fn ingest(&self, doc: &Document) -> Result<LoadState> {
        let path = Path::new(&doc.location_path);

        let text = match self.loaders.load(path, &doc.file_type) {
            Ok(Some(text)) => text,
            Ok(None) => {
                log::debug!("No loader for {} ({})", doc.file_name, doc.file_type);
                self.store.record_failure(&doc.id, LoadState::Unsupported)?;
                return Ok(LoadState::Unsupported);
            }
            Err(e) => {
                log::warn!("Failed to load {}: {}", doc.location_path, e);
                self.store.record_failure(&doc.id, LoadState::LoadFailed)?;
                return Ok(LoadState::LoadFailed);
            }
        };

        // Blank documents are searchable by file name only.
        let mut chunks = if text.trim().is_empty() {
            Vec::new()
        } else {
            chunk_text(&text)
        };
        if chunks.len() > self.max_chunks {
            log::info!(
                "{}: keeping first {} of {} chunks",
                doc.file_name,
                self.max_chunks,
                chunks.len()
            );
            chunks.truncate(self.max_chunks);
        }

        let (chunk_vectors, name_vector) = match self.vectorize(&chunks, &doc.file_name) {
            Ok(vectors) => vectors,
            Err(e) => {
                log::warn!("Failed to vectorize {}: {}", doc.location_path, e);
                self.store.record_failure(&doc.id, LoadState::LoadFailed)?;
                return Ok(LoadState::LoadFailed);
            }
        };

        self.store.save_ingested(
            &doc.id,
            &text,
            &chunks,
            &chunk_vectors,
            &name_vector,
            LoadState::Complete,
        )?;
        log::debug!("Ingested {} ({} chunks)", doc.location_path, chunks.len());
        Ok(LoadState::Complete)
    }

    fn vectorize(&self, chunks: &[String], file_name: &str) -> Result<(Vec<Vec<f32>>, Vec<f32>)> {
        let chunk_vectors = if chunks.is_empty() {
            Vec::new()
        } else {
            self.embedder.encode(chunks)?
        };
        if chunk_vectors.len() != chunks.len() {
            return Err(KbError::Embedding(format!(
                "encoder returned {} vectors for {} chunks",
                chunk_vectors.len(),
                chunks.len()
            )));
        }
        let name_vector = self.embedder.encode_one(file_name)?;
        Ok((chunk_vectors, name_vector))
    }
}
