//! Wire types emitted to callers.
//!
//! Streamed responses are a sequence of [`ChatChunk`] objects, each carrying
//! either a `content` or a `reason_content` delta. Non-streamed responses are
//! a single [`ChatCompletion`].

use serde::{Deserialize, Serialize};

/// One streamed delta
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunk {
    /// Response identifier, shared by every chunk of one response
    pub id: String,
    /// Always `chat.completion.chunk`
    pub object: String,
    /// Unix timestamp of the response
    pub created: i64,
    /// Model name as requested by the caller
    pub model: String,
    /// Single-element choice list
    pub choices: Vec<ChunkChoice>,
}

/// A choice inside a chunk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    /// The delta
    pub delta: ChunkDelta,
    /// Always 0
    pub index: u32,
}

/// Delta payload; exactly one field is set
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChunkDelta {
    /// Answer text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Reasoning text
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_content: Option<String>,
}

/// Which logical channel a fragment belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaKind {
    /// Answer text
    Content,
    /// Reasoning text
    Reasoning,
}

impl ChatChunk {
    /// Build a chunk for one fragment
    pub fn delta(
        id: impl Into<String>,
        created: i64,
        model: impl Into<String>,
        kind: DeltaKind,
        text: impl Into<String>,
    ) -> Self {
        let text = text.into();
        let delta = match kind {
            DeltaKind::Content => ChunkDelta {
                content: Some(text),
                reason_content: None,
            },
            DeltaKind::Reasoning => ChunkDelta {
                content: None,
                reason_content: Some(text),
            },
        };
        Self {
            id: id.into(),
            object: "chat.completion.chunk".to_string(),
            created,
            model: model.into(),
            choices: vec![ChunkChoice { delta, index: 0 }],
        }
    }
}

/// Aggregated non-streamed response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    /// Response identifier
    pub id: String,
    /// Always `chat.completion`
    pub object: String,
    /// Unix timestamp
    pub created: i64,
    /// Model name as requested
    pub model: String,
    /// Single choice
    pub choices: Vec<CompletionChoice>,
}

/// The single choice of a non-streamed response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionChoice {
    /// Always 0
    pub index: u32,
    /// Assistant message
    pub message: CompletionMessage,
    /// Always `stop`
    pub finish_reason: String,
}

/// Assistant message of a non-streamed response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionMessage {
    /// Always `assistant`
    pub role: String,
    /// Answer text
    pub content: String,
    /// Reasoning text, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason_content: Option<String>,
}

impl ChatCompletion {
    /// Build a completion from buffered channels
    pub fn new(
        id: impl Into<String>,
        created: i64,
        model: impl Into<String>,
        content: String,
        reasoning: String,
    ) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion".to_string(),
            created,
            model: model.into(),
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: "assistant".to_string(),
                    content,
                    reason_content: (!reasoning.is_empty()).then_some(reasoning),
                },
                finish_reason: "stop".to_string(),
            }],
        }
    }
}
