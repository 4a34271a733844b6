pub mod model;
pub mod service;

pub use model::{Document, KnowledgeBaseNode, LoadState, ScanState, ROOT_PARENT_ID};
pub use service::KnowledgeBaseService;
