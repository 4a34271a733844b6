//! Hybrid document ranking.
//!
//! Chunk-level and file-name-level similarity hits are fused into one score
//! per document:
//!
//! ```text
//! combined = w_chunk * aggregate(chunk scores) + w_name * name score
//! ```
//!
//! with the weights renormalized to sum to one. Documents below `min_score`
//! are dropped, then a post-filter prefers high-confidence documents but falls
//! back to the best of everything when too few clear the bar.

use serde::Serialize;
use std::collections::HashMap;

/// Position weights for [`ChunkAggregation::WeightedMax`], best chunk first.
pub const POSITION_WEIGHTS: [f32; 5] = [0.5, 0.3, 0.2, 0.1, 0.05];

/// Similarity of one stored chunk to the query
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkHit {
    pub document_id: String,
    pub file_name: String,
    pub chunk_index: i64,
    pub score: f32,
}

/// Similarity of one document's file name to the query
#[derive(Debug, Clone, PartialEq)]
pub struct NameHit {
    pub document_id: String,
    pub file_name: String,
    pub score: f32,
}

/// How per-chunk scores collapse into one chunk score per document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkAggregation {
    /// Top chunks weighted by [`POSITION_WEIGHTS`], renormalized
    WeightedMax,
    Max,
    Mean,
    Sum,
    /// Mean of the best `top_k_chunks`
    TopKMean,
}

impl ChunkAggregation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "weighted_max" => Some(Self::WeightedMax),
            "max" => Some(Self::Max),
            "mean" => Some(Self::Mean),
            "sum" => Some(Self::Sum),
            "top_k_mean" => Some(Self::TopKMean),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WeightedMax => "weighted_max",
            Self::Max => "max",
            Self::Mean => "mean",
            Self::Sum => "sum",
            Self::TopKMean => "top_k_mean",
        }
    }
}

/// Ranking knobs
#[derive(Debug, Clone, PartialEq)]
pub struct RankingOptions {
    pub chunk_weight: f32,
    pub filename_weight: f32,
    pub aggregation: ChunkAggregation,
    pub top_k_chunks: usize,
    pub min_score: f32,
    pub high_score: f32,
    pub min_docs: usize,
    pub max_docs: usize,
}

impl Default for RankingOptions {
    fn default() -> Self {
        Self {
            chunk_weight: 0.7,
            filename_weight: 0.3,
            aggregation: ChunkAggregation::WeightedMax,
            top_k_chunks: 3,
            min_score: 0.6,
            high_score: 0.75,
            min_docs: 5,
            max_docs: 10,
        }
    }
}

impl RankingOptions {
    /// `(chunk, filename)` weights summing to 1; both zero means an even split.
    pub fn normalized_weights(&self) -> (f32, f32) {
        let chunk = self.chunk_weight.max(0.0);
        let name = self.filename_weight.max(0.0);
        let total = chunk + name;
        if total <= f32::EPSILON {
            (0.5, 0.5)
        } else {
            (chunk / total, name / total)
        }
    }
}

/// One document with its fused score
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedDocument {
    pub document_id: String,
    pub file_name: String,
    pub combined_score: f32,
    pub chunk_score: f32,
    pub filename_score: f32,
    /// Matched chunk indices, best first
    pub chunk_indices: Vec<i64>,
}

/// Collapse chunk scores for one document.
pub fn aggregate(scores: &[f32], method: ChunkAggregation, top_k: usize) -> f32 {
    if scores.is_empty() {
        return 0.0;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let top_k = top_k.max(1);

    match method {
        ChunkAggregation::Max => sorted[0],
        ChunkAggregation::Mean => sorted.iter().sum::<f32>() / sorted.len() as f32,
        ChunkAggregation::Sum => sorted.iter().sum(),
        ChunkAggregation::TopKMean => {
            let take = top_k.min(sorted.len());
            sorted[..take].iter().sum::<f32>() / take as f32
        }
        ChunkAggregation::WeightedMax => {
            let take = top_k.min(sorted.len()).min(POSITION_WEIGHTS.len());
            let weights = &POSITION_WEIGHTS[..take];
            let total: f32 = weights.iter().sum();
            sorted[..take]
                .iter()
                .zip(weights)
                .map(|(s, w)| s * w / total)
                .sum()
        }
    }
}

#[derive(Default)]
struct Accumulated {
    file_name: String,
    chunk_scores: Vec<f32>,
    chunk_indices: Vec<i64>,
    filename_score: Option<f32>,
}

/// Fuse hits into documents sorted by combined score, highest first.
///
/// Documents tie-break by first appearance (chunk hits before name hits),
/// and anything below `min_score` is dropped.
pub fn rank_documents(
    chunks: &[ChunkHit],
    names: &[NameHit],
    options: &RankingOptions,
) -> Vec<RankedDocument> {
    let mut order: Vec<String> = Vec::new();
    let mut by_id: HashMap<String, Accumulated> = HashMap::new();

    for hit in chunks {
        let entry = by_id.entry(hit.document_id.clone()).or_insert_with(|| {
            order.push(hit.document_id.clone());
            Accumulated {
                file_name: hit.file_name.clone(),
                ..Accumulated::default()
            }
        });
        entry.chunk_scores.push(hit.score);
        entry.chunk_indices.push(hit.chunk_index);
    }

    for hit in names {
        let entry = by_id.entry(hit.document_id.clone()).or_insert_with(|| {
            order.push(hit.document_id.clone());
            Accumulated {
                file_name: hit.file_name.clone(),
                ..Accumulated::default()
            }
        });
        let best = entry.filename_score.map_or(hit.score, |s| s.max(hit.score));
        entry.filename_score = Some(best);
    }

    let (chunk_weight, filename_weight) = options.normalized_weights();
    let mut ranked: Vec<RankedDocument> = order
        .into_iter()
        .filter_map(|id| {
            let acc = by_id.remove(&id)?;
            let chunk_score = aggregate(&acc.chunk_scores, options.aggregation, options.top_k_chunks);
            let filename_score = acc.filename_score.unwrap_or(0.0);
            let combined_score = chunk_weight * chunk_score + filename_weight * filename_score;
            (combined_score >= options.min_score).then(|| RankedDocument {
                document_id: id,
                file_name: acc.file_name,
                combined_score,
                chunk_score,
                filename_score,
                chunk_indices: acc.chunk_indices,
            })
        })
        .collect();

    // stable: equal scores keep first-appearance order
    ranked.sort_by(|a, b| b.combined_score.total_cmp(&a.combined_score));
    ranked
}

/// Apply the high-confidence post-filter and cap the result at `max_docs`.
pub fn select_top(ranked: Vec<RankedDocument>, options: &RankingOptions) -> Vec<RankedDocument> {
    let confident = ranked
        .iter()
        .filter(|d| d.combined_score >= options.high_score)
        .count();

    if confident < options.min_docs {
        ranked.into_iter().take(options.max_docs).collect()
    } else {
        ranked
            .into_iter()
            .filter(|d| d.combined_score >= options.high_score)
            .take(options.max_docs)
            .collect()
    }
}
