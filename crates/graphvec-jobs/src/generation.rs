//! Embedding generation service.

use async_trait::async_trait;
use graphvec_config::GenerationConfig;
use graphvec_core::{GraphvecError, GraphvecResult};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

const SERVICE: &str = "generation";

/// Token usage reported by the service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub total_tokens: u32,
}

/// A generated embedding.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub vector: Vec<f32>,
    pub usage: Usage,
}

/// Turns text into a fixed-dimension vector.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Generates an embedding for `text`.
    ///
    /// Rate limits surface as [`GraphvecError::RateLimited`] and server
    /// failures as [`GraphvecError::Unavailable`].
    async fn generate(&self, text: &str) -> GraphvecResult<Generation>;

    /// Model name recorded next to stored embeddings.
    fn model(&self) -> &str;
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: Vec<&'a str>,
    encoding_format: &'static str,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    index: usize,
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

/// OpenAI-compatible `/embeddings` client.
#[derive(Debug, Clone)]
pub struct OpenAiGenerator {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    dimension: usize,
}

impl OpenAiGenerator {
    /// Creates a client from the generation configuration.
    pub fn new(config: &GenerationConfig) -> GraphvecResult<Self> {
        let api_key = config
            .api_key
            .clone()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| GraphvecError::configuration("generation.api_key is required"))?;

        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| GraphvecError::internal(format!("Failed to create HTTP client: {e}")))?;

        info!(
            base_url = %config.base_url,
            model = %config.model,
            dimension = config.dimension,
            "Initializing generation client"
        );

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            model: config.model.clone(),
            dimension: config.dimension,
        })
    }
}

#[async_trait]
impl GenerationService for OpenAiGenerator {
    async fn generate(&self, text: &str) -> GraphvecResult<Generation> {
        let request = EmbeddingRequest {
            model: &self.model,
            input: vec![text],
            encoding_format: "float",
        };

        let response = self
            .client
            .post(format!("{}/embeddings", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<ErrorResponse>()
                .await
                .map_or_else(|_| "Unknown error".to_string(), |body| body.error.message);
            return Err(status_error(status, message));
        }

        let body: EmbeddingResponse = response
            .json()
            .await
            .map_err(|e| GraphvecError::internal(format!("Failed to parse embedding response: {e}")))?;

        let vector = body
            .data
            .into_iter()
            .min_by_key(|d| d.index)
            .map(|d| d.embedding)
            .ok_or_else(|| GraphvecError::internal("Embedding response contained no data"))?;

        if vector.len() != self.dimension {
            return Err(GraphvecError::internal(format!(
                "Embedding dimension mismatch: expected {}, got {}",
                self.dimension,
                vector.len()
            )));
        }

        debug!(
            dimension = vector.len(),
            total_tokens = body.usage.total_tokens,
            "Embedding generated"
        );

        Ok(Generation {
            vector,
            usage: body.usage,
        })
    }

    fn model(&self) -> &str {
        &self.model
    }
}

/// Maps a non-success HTTP status to a tagged error.
fn status_error(status: StatusCode, message: String) -> GraphvecError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => GraphvecError::RateLimited {
            service: SERVICE.to_string(),
            message,
        },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => GraphvecError::Unauthorized {
            service: SERVICE.to_string(),
            message,
        },
        s if s.is_server_error() => GraphvecError::Unavailable {
            service: SERVICE.to_string(),
            status: s.as_u16(),
            message,
        },
        s => GraphvecError::invalid_input(format!("{SERVICE} returned {s}: {message}")),
    }
}

fn transport_error(err: reqwest::Error) -> GraphvecError {
    if err.is_timeout() {
        GraphvecError::Timeout(format!("{SERVICE} request timed out: {err}"))
    } else if err.is_builder() {
        GraphvecError::internal(format!("Invalid {SERVICE} request: {err}"))
    } else {
        GraphvecError::connection(SERVICE, err.to_string())
    }
}
