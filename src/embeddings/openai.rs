use super::EmbeddingPort;
use crate::error::{KbError, Result};
use reqwest::blocking::Client;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Maximum inputs per request accepted by the embeddings endpoint
pub const MAX_BATCH_SIZE: usize = 2048;

const MAX_RETRIES: usize = 3;

/// Request body for the `/embeddings` endpoint
#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

/// Response body from the `/embeddings` endpoint
#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    index: usize,
    embedding: Vec<f32>,
}

/// Failure of one request, tagged with whether a retry may help
struct RequestError {
    retryable: bool,
    error: KbError,
}

fn is_retryable(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error()
}

/// Client for OpenAI-compatible embedding endpoints
///
/// Splits input into batches of at most `batch_size` texts and retries rate
/// limits and server errors with exponential backoff.
pub struct OpenAIEmbedder {
    client: Client,
    api_key: String,
    model: String,
    endpoint: String,
    batch_size: usize,
    initial_backoff: Duration,
}

impl OpenAIEmbedder {
    /// `base_url` is the API root, e.g. `https://api.openai.com/v1`.
    pub fn new(api_key: String, model: String, base_url: String, batch_size: usize) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| KbError::Embedding(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            api_key,
            model,
            endpoint: format!("{}/embeddings", base_url.trim_end_matches('/')),
            batch_size: batch_size.clamp(1, MAX_BATCH_SIZE),
            initial_backoff: Duration::from_secs(1),
        })
    }

    fn request(&self, texts: &[String]) -> std::result::Result<Vec<Vec<f32>>, RequestError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&EmbeddingRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .map_err(|e| RequestError {
                retryable: e.is_timeout() || e.is_connect(),
                error: KbError::Embedding(format!("Network error: {}", e)),
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(RequestError {
                retryable: is_retryable(status),
                error: KbError::Embedding(format!("Embedding API error {}: {}", status, body)),
            });
        }

        let mut parsed: EmbeddingResponse = response.json().map_err(|e| RequestError {
            retryable: false,
            error: KbError::Embedding(format!("Failed to parse response: {}", e)),
        })?;

        if parsed.data.len() != texts.len() {
            return Err(RequestError {
                retryable: false,
                error: KbError::Embedding(format!(
                    "Expected {} embeddings, got {}",
                    texts.len(),
                    parsed.data.len()
                )),
            });
        }
        parsed.data.sort_by_key(|d| d.index);
        Ok(parsed.data.into_iter().map(|d| d.embedding).collect())
    }

    fn request_with_retry(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut delay = self.initial_backoff;
        let mut attempt = 0;
        loop {
            match self.request(texts) {
                Ok(vectors) => return Ok(vectors),
                Err(e) if e.retryable && attempt < MAX_RETRIES => {
                    attempt += 1;
                    log::warn!("Retry {}/{} after error: {}", attempt, MAX_RETRIES, e.error);
                    std::thread::sleep(delay);
                    delay *= 2;
                }
                Err(e) => return Err(e.error),
            }
        }
    }
}

impl EmbeddingPort for OpenAIEmbedder {
    fn encode(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(self.batch_size) {
            let started = std::time::Instant::now();
            vectors.extend(self.request_with_retry(batch)?);
            log::debug!("Embedded {} text(s) in {:?}", batch.len(), started.elapsed());
        }
        Ok(vectors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn embedder(batch_size: usize) -> OpenAIEmbedder {
        OpenAIEmbedder::new(
            "test-key".to_string(),
            "text-embedding-3-small".to_string(),
            "https://api.openai.com/v1/".to_string(),
            batch_size,
        )
        .unwrap()
    }

    #[test]
    fn test_batch_size_clamped() {
        assert_eq!(embedder(5000).batch_size, MAX_BATCH_SIZE);
        assert_eq!(embedder(0).batch_size, 1);
        assert_eq!(embedder(100).batch_size, 100);
    }

    #[test]
    fn test_endpoint_built_from_base_url() {
        assert_eq!(embedder(10).endpoint, "https://api.openai.com/v1/embeddings");
    }

    #[test]
    fn test_retryable_statuses() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::BAD_GATEWAY));
        assert!(!is_retryable(StatusCode::UNAUTHORIZED));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
    }

    #[test]
    fn test_empty_input_makes_no_request() {
        assert!(embedder(10).encode(&[]).unwrap().is_empty());
    }

    // Requests against a live endpoint need a real API key and are not run here.
}
