use serde::Serialize;
use std::sync::Arc;

use super::ranker::{rank_documents, select_top, RankedDocument, RankingOptions};
use crate::cache::QueryVectorCache;
use crate::embeddings::EmbeddingPort;
use crate::error::{KbError, Result};
use crate::store::Store;

/// Text retrieved for one ranked document
#[derive(Debug, Clone, Serialize)]
pub struct ContextEntry {
    pub document_id: String,
    pub file_name: String,
    pub location_path: String,
    pub score: f32,
    pub text: String,
}

/// Documents and their matched text, packed into a character budget
#[derive(Debug, Clone, Default, Serialize)]
pub struct RetrievedContext {
    pub entries: Vec<ContextEntry>,
    pub total_chars: usize,
    /// Ranked documents left out because the budget ran out
    pub omitted: usize,
}

impl RetrievedContext {
    /// Plain-text rendering with one headed section per document.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(&format!(
                "## {} ({:.3})\n{}\n\n{}\n\n",
                entry.file_name, entry.score, entry.location_path, entry.text
            ));
        }
        out
    }
}

/// Query-time search over stored chunk and file-name vectors
pub struct RetrievalRanker {
    store: Store,
    embedder: Arc<dyn EmbeddingPort>,
    cache: Option<Arc<QueryVectorCache>>,
    options: RankingOptions,
    top_n: usize,
    context_budget_chars: usize,
}

impl RetrievalRanker {
    pub fn new(store: Store, embedder: Arc<dyn EmbeddingPort>, options: RankingOptions) -> Self {
        Self {
            store,
            embedder,
            cache: None,
            options,
            top_n: 90,
            context_budget_chars: 45_000,
        }
    }

    pub fn with_cache(mut self, cache: Arc<QueryVectorCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Number of chunk hits and name hits fetched before ranking
    pub fn with_top_n(mut self, top_n: usize) -> Self {
        self.top_n = top_n.max(1);
        self
    }

    pub fn with_context_budget(mut self, chars: usize) -> Self {
        self.context_budget_chars = chars;
        self
    }

    pub fn options(&self) -> &RankingOptions {
        &self.options
    }

    fn query_vector(&self, query: &str) -> Result<Vec<f32>> {
        match &self.cache {
            Some(cache) => cache.get_or_compute(query, || self.embedder.encode_one(query)),
            None => self.embedder.encode_one(query),
        }
    }

    /// Knowledge bases a search is limited to: `kb_id` and everything below it.
    fn scope(&self, kb_id: Option<&str>) -> Result<Option<Vec<String>>> {
        let Some(kb_id) = kb_id else {
            return Ok(None);
        };
        if self.store.get_node(kb_id)?.is_none() {
            return Err(KbError::NotFound(format!("knowledge base {}", kb_id)));
        }
        Ok(Some(self.store.descendant_ids(kb_id)?))
    }

    /// Rank documents for `query`, optionally within one knowledge base subtree.
    pub fn search(&self, query: &str, kb_id: Option<&str>) -> Result<Vec<RankedDocument>> {
        let query = query.trim();
        if query.is_empty() {
            return Err(KbError::InvalidInput("query must not be empty".to_string()));
        }

        let scope = self.scope(kb_id)?;
        let vector = self.query_vector(query)?;

        let chunks = self
            .store
            .chunk_similarities(&vector, scope.as_deref(), self.top_n)?;
        let names = self
            .store
            .file_name_similarities(&vector, scope.as_deref(), self.top_n)?;

        let ranked = rank_documents(&chunks, &names, &self.options);
        let selected = select_top(ranked, &self.options);
        log::debug!(
            "Search '{}': {} chunk hits, {} name hits, {} documents",
            query,
            chunks.len(),
            names.len(),
            selected.len()
        );
        Ok(selected)
    }

    /// Search, then gather matched chunk text per document within the character budget.
    ///
    /// A document matched only by name contributes its first chunk. The first
    /// document is truncated if it alone exceeds the budget; packing stops at
    /// the first later document that does not fit.
    pub fn retrieve_context(&self, query: &str, kb_id: Option<&str>) -> Result<RetrievedContext> {
        let ranked = self.search(query, kb_id)?;
        let mut context = RetrievedContext::default();
        let budget = self.context_budget_chars;

        for (position, doc) in ranked.iter().enumerate() {
            let indices: &[i64] = if doc.chunk_indices.is_empty() {
                &[0]
            } else {
                &doc.chunk_indices
            };
            let pieces = self.store.chunk_texts(&doc.document_id, indices)?;
            let mut text = pieces
                .into_iter()
                .map(|c| c.text)
                .collect::<Vec<_>>()
                .join("\n\n");
            let location_path = self
                .store
                .get_document(&doc.document_id)?
                .map(|d| d.location_path)
                .unwrap_or_default();

            let len = text.chars().count();
            if context.total_chars + len > budget {
                if position > 0 {
                    context.omitted = ranked.len() - position;
                    break;
                }
                text = text.chars().take(budget).collect();
            }

            context.total_chars += text.chars().count();
            context.entries.push(ContextEntry {
                document_id: doc.document_id.clone(),
                file_name: doc.file_name.clone(),
                location_path,
                score: doc.combined_score,
                text,
            });
        }
        Ok(context)
    }
}
