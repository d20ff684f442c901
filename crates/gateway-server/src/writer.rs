//! Chunked SSE response writer.
//!
//! [`StreamChunkWriter`] owns the client connection for the lifetime of a
//! chat response. Every fragment becomes one chunk frame carrying one
//! `data: <json>\r\n\r\n` event, written under a single lock so frames from
//! the content and reasoning channels never interleave mid-frame. The
//! response head is sent lazily with the first fragment, which lets the
//! caller still answer with an error status if no provider ever produced
//! output.

use crate::http::{chunk_frame, chunked_head, CHUNK_TERMINATOR};
use gateway_core::{ChatChunk, ChatCompletion, DeltaKind, StreamDelta};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

/// Final SSE event of a streamed response
pub const DONE_EVENT: &[u8] = b"data: [DONE]\r\n\r\n";

/// How fragments reach the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// One SSE chunk per fragment
    Stream,
    /// Buffer everything and send one `chat.completion` object on close
    Buffered,
}

struct WriterState<W> {
    conn: W,
    head_sent: bool,
    closed: bool,
    content: String,
    reasoning: String,
}

/// Serialized writer of chat-completion chunks
pub struct StreamChunkWriter<W> {
    state: Mutex<WriterState<W>>,
    id: String,
    created: i64,
    model: String,
    mode: ResponseMode,
    started: AtomicBool,
    bytes: AtomicU64,
}

impl<W> StreamChunkWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Wrap a connection
    pub fn new(conn: W, model: impl Into<String>, mode: ResponseMode) -> Self {
        Self {
            state: Mutex::new(WriterState {
                conn,
                head_sent: false,
                closed: false,
                content: String::new(),
                reasoning: String::new(),
            }),
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            created: chrono::Utc::now().timestamp(),
            model: model.into(),
            mode,
            started: AtomicBool::new(false),
            bytes: AtomicU64::new(0),
        }
    }

    /// Response identifier shared by every chunk
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Whether any fragment has been accepted
    #[must_use]
    pub fn has_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Text bytes accepted so far
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Write one fragment
    ///
    /// Empty fragments are ignored.
    ///
    /// # Errors
    /// Returns the socket error, or `BrokenPipe` after close. A failed
    /// write closes the writer since the connection is unusable.
    pub async fn write(&self, kind: DeltaKind, text: &str) -> io::Result<()> {
        if text.is_empty() {
            return Ok(());
        }
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "writer closed"));
        }
        self.started.store(true, Ordering::SeqCst);
        self.bytes.fetch_add(text.len() as u64, Ordering::SeqCst);

        match self.mode {
            ResponseMode::Buffered => {
                match kind {
                    DeltaKind::Content => state.content.push_str(text),
                    DeltaKind::Reasoning => state.reasoning.push_str(text),
                }
                Ok(())
            }
            ResponseMode::Stream => {
                let chunk = ChatChunk::delta(&self.id, self.created, &self.model, kind, text);
                let json = serde_json::to_string(&chunk).map_err(io::Error::other)?;
                let event = format!("data: {json}\r\n\r\n");

                let mut out = Vec::with_capacity(event.len() + 128);
                if !state.head_sent {
                    out.extend_from_slice(
                        chunked_head(200, "text/event-stream", &[]).as_bytes(),
                    );
                }
                out.extend_from_slice(&chunk_frame(event.as_bytes()));

                let result = write_all(&mut state.conn, &out).await;
                match result {
                    Ok(()) => state.head_sent = true,
                    Err(_) => state.closed = true,
                }
                result
            }
        }
    }

    /// Write one upstream fragment
    ///
    /// # Errors
    /// See [`Self::write`]
    pub async fn write_delta(&self, delta: &StreamDelta) -> io::Result<()> {
        self.write(delta.kind, &delta.text).await
    }

    /// Finish the response and shut the connection down
    ///
    /// Streamed responses end with `data: [DONE]` and the zero chunk;
    /// buffered responses send the aggregated completion as one chunk. Only
    /// the first call writes anything; it returns `true`.
    ///
    /// # Errors
    /// Returns the socket error
    pub async fn close(&self) -> io::Result<bool> {
        let mut state = self.state.lock().await;
        if state.closed {
            return Ok(false);
        }
        state.closed = true;

        let mut out = Vec::new();
        match self.mode {
            ResponseMode::Stream => {
                if !state.head_sent {
                    out.extend_from_slice(
                        chunked_head(200, "text/event-stream", &[]).as_bytes(),
                    );
                }
                out.extend_from_slice(&chunk_frame(DONE_EVENT));
            }
            ResponseMode::Buffered => {
                let completion = ChatCompletion::new(
                    &self.id,
                    self.created,
                    &self.model,
                    std::mem::take(&mut state.content),
                    std::mem::take(&mut state.reasoning),
                );
                let json = serde_json::to_vec(&completion).map_err(io::Error::other)?;
                out.extend_from_slice(chunked_head(200, "application/json", &[]).as_bytes());
                out.extend_from_slice(&chunk_frame(&json));
            }
        }
        out.extend_from_slice(CHUNK_TERMINATOR);
        state.head_sent = true;

        write_all(&mut state.conn, &out).await?;
        state.conn.shutdown().await?;
        Ok(true)
    }

    /// Release the connection
    pub fn into_inner(self) -> W {
        self.state.into_inner().conn
    }
}

async fn write_all<W: AsyncWrite + Unpin>(conn: &mut W, bytes: &[u8]) -> io::Result<()> {
    conn.write_all(bytes).await?;
    conn.flush().await
}
