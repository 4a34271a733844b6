//! Text-to-vector encoders.

pub mod hashing;
pub mod openai;

use std::sync::Arc;

use crate::config::EmbeddingsConfig;
use crate::error::{KbError, Result};

pub use hashing::HashingEmbedder;
pub use openai::OpenAIEmbedder;

/// Encodes texts into fixed-dimension vectors, one per input, in input order.
pub trait EmbeddingPort: Send + Sync {
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    fn encode_one(&self, text: &str) -> Result<Vec<f32>> {
        self.encode(&[text.to_string()])?
            .pop()
            .ok_or_else(|| KbError::Embedding("encoder returned no vector".to_string()))
    }
}

/// Build the encoder selected by `[embeddings].provider`.
pub fn build_embedder(config: &EmbeddingsConfig) -> Result<Arc<dyn EmbeddingPort>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(config.dimensions))),
        "openai" => {
            let api_key = std::env::var(&config.api_key_env).map_err(|_| {
                KbError::Config(format!("Environment variable {} not set", config.api_key_env))
            })?;
            Ok(Arc::new(OpenAIEmbedder::new(
                api_key,
                config.model.clone(),
                config.base_url.clone(),
                config.batch_size,
            )?))
        }
        other => Err(KbError::Config(format!("Unknown embeddings provider: {}", other))),
    }
}
