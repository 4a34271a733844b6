pub mod cache;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod error;
pub mod ingest;
pub mod kb;
pub mod notify;
pub mod scan;
pub mod search;
pub mod similarity;
pub mod store;

pub use config::Config;
pub use error::{KbError, Result};
