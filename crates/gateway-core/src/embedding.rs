//! Embedding request and response types.
//!
//! `input` may be a single string or a list of strings; every entry gets
//! its own vector in the response, in request order.

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};

/// Incoming embedding request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingRequest {
    /// Logical model name
    #[serde(default)]
    pub model: String,

    /// Text to embed
    #[serde(default)]
    pub input: EmbeddingInput,

    /// Requested encoding; only `float` is produced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding_format: Option<String>,
}

/// One or many input texts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EmbeddingInput {
    /// Single text
    One(String),
    /// Batch of texts
    Many(Vec<String>),
}

impl Default for EmbeddingInput {
    fn default() -> Self {
        Self::Many(Vec::new())
    }
}

impl EmbeddingInput {
    /// Input texts in order
    #[must_use]
    pub fn texts(&self) -> Vec<&str> {
        match self {
            Self::One(text) => vec![text.as_str()],
            Self::Many(texts) => texts.iter().map(String::as_str).collect(),
        }
    }

    /// True when there is nothing to embed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.texts().iter().all(|text| text.is_empty())
    }

    /// Size in bytes used for traffic accounting
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        self.texts().iter().map(|text| text.len() as u64).sum()
    }
}

impl EmbeddingRequest {
    /// Parse a raw request body
    ///
    /// # Errors
    /// Returns a validation error for an empty body or invalid JSON
    pub fn parse(body: &[u8]) -> GatewayResult<Self> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Err(GatewayError::validation("request body is empty", None));
        }
        serde_json::from_slice(body).map_err(|e| {
            GatewayError::validation(format!("invalid request body: {e}"), Some("body".into()))
        })
    }
}

/// One vector of an embedding response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingData {
    /// Always `embedding`
    pub object: String,
    /// The vector
    pub embedding: Vec<f32>,
    /// Position of the input text
    pub index: usize,
}

/// Token usage; the balancer reports input bytes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingUsage {
    /// Prompt size
    pub prompt_tokens: u64,
    /// Same as `prompt_tokens`
    pub total_tokens: u64,
}

/// `POST /v1/embeddings` response envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingResponse {
    /// Always `list`
    pub object: String,
    /// One entry per input text
    pub data: Vec<EmbeddingData>,
    /// Logical model name
    pub model: String,
    /// Usage summary
    pub usage: EmbeddingUsage,
}

impl EmbeddingResponse {
    /// Wrap vectors produced for `model`
    #[must_use]
    pub fn new(model: impl Into<String>, vectors: Vec<Vec<f32>>, input_bytes: u64) -> Self {
        Self {
            object: "list".to_string(),
            data: vectors
                .into_iter()
                .enumerate()
                .map(|(index, embedding)| EmbeddingData {
                    object: "embedding".to_string(),
                    embedding,
                    index,
                })
                .collect(),
            model: model.into(),
            usage: EmbeddingUsage {
                prompt_tokens: input_bytes,
                total_tokens: input_bytes,
            },
        }
    }

    /// Size of the vectors in bytes, four per component
    #[must_use]
    pub fn vector_bytes(&self) -> u64 {
        self.data
            .iter()
            .map(|d| d.embedding.len() as u64 * 4)
            .sum()
    }
}
