//! Query-time ranking over stored vectors.

pub mod ranker;
pub mod retrieval;

pub use ranker::{
    aggregate, rank_documents, select_top, ChunkAggregation, ChunkHit, NameHit, RankedDocument,
    RankingOptions,
};
pub use retrieval::{ContextEntry, RetrievalRanker, RetrievedContext};
