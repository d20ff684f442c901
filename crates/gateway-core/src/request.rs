//! Request types for the gateway.
//!
//! Callers send OpenAI-shaped chat requests. The balancer only needs the
//! model, whether to stream, and the conversation flattened into a single
//! prompt (plus any image URLs) that is handed to the upstream client.

use crate::error::{GatewayError, GatewayResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Incoming chat-completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    /// Logical model name
    #[serde(default)]
    pub model: String,

    /// Conversation messages
    #[serde(default)]
    pub messages: Vec<ChatMessage>,

    /// Whether the caller wants a streamed response
    #[serde(default)]
    pub stream: bool,
}

/// One message in the conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Author role (`system`, `user`, `assistant`, ...)
    #[serde(default)]
    pub role: String,

    /// Message content
    #[serde(default)]
    pub content: MessageContent,
}

/// Message content: plain text or a list of typed parts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    /// Plain text
    Text(String),
    /// Typed parts (`text`, `image_url`, ...)
    Parts(Vec<Value>),
    /// Absent or null content
    Empty(Option<()>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Empty(None)
    }
}

/// The flattened conversation handed to upstream clients
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Prompt {
    /// Concatenated text
    pub text: String,
    /// Image URLs collected from `image_url` parts
    pub images: Vec<String>,
}

impl Prompt {
    /// Create a text-only prompt
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
        }
    }

    /// True when there is neither text nor images
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.text.is_empty() && self.images.is_empty()
    }

    /// Size in bytes used for traffic accounting
    #[must_use]
    pub fn byte_len(&self) -> u64 {
        (self.text.len() + self.images.iter().map(String::len).sum::<usize>()) as u64
    }
}

impl ChatCompletionRequest {
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

    /// Flatten every message into one prompt
    ///
    /// Text content is appended verbatim. For part lists, `text` parts are
    /// appended followed by a newline, `image_url` parts contribute their
    /// URL to the image list and any other part is appended as JSON.
    #[must_use]
    pub fn build_prompt(&self) -> Prompt {
        let mut prompt = Prompt::default();
        for message in &self.messages {
            match &message.content {
                MessageContent::Text(text) => prompt.text.push_str(text),
                MessageContent::Parts(parts) => {
                    for part in parts {
                        append_part(&mut prompt, part);
                    }
                }
                MessageContent::Empty(_) => {}
            }
        }
        prompt
    }
}

fn append_part(prompt: &mut Prompt, part: &Value) {
    match part.get("type").and_then(Value::as_str) {
        Some("text") => {
            if let Some(text) = part.get("text").and_then(Value::as_str) {
                prompt.text.push_str(text);
                prompt.text.push('\n');
            }
        }
        Some("image_url") => {
            let url = part
                .get("image_url")
                .and_then(|image| image.get("url").or(Some(image)))
                .and_then(Value::as_str);
            if let Some(url) = url {
                prompt.images.push(url.to_string());
            }
        }
        _ => prompt.text.push_str(&part.to_string()),
    }
}
