pub mod chunker;
pub mod loaders;
pub mod pipeline;

pub use chunker::{chunk_text, split_segments, ChunkParams, Segment};
pub use loaders::{ContentLoader, LoaderRegistry};
pub use pipeline::IngestionPipeline;
