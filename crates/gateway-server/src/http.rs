//! Minimal HTTP/1.1 framing.
//!
//! Every connection carries exactly one request. The reader understands
//! `Content-Length` and chunked request bodies; every response is sent with
//! `Connection: close`.

use gateway_core::GatewayError;
use http::StatusCode;
use serde::Serialize;
use serde_json::json;
use std::io;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on the request line plus headers
pub const MAX_HEADER_BYTES: u64 = 64 * 1024;

/// Zero-length chunk ending a chunked body
pub const CHUNK_TERMINATOR: &[u8] = b"0\r\n\r\n";

/// Errors while reading a request
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// Peer closed the connection before sending a request line
    #[error("connection closed before request")]
    Closed,

    /// Socket error
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// Request could not be parsed
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Request line and headers exceed [`MAX_HEADER_BYTES`]
    #[error("request headers too large")]
    HeadersTooLarge,

    /// Body exceeds the configured limit
    #[error("request body exceeds {limit} bytes")]
    BodyTooLarge {
        /// Configured limit
        limit: usize,
    },
}

impl RequestError {
    /// Status to answer with, or `None` when the peer is gone
    #[must_use]
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Closed | Self::Io(_) => None,
            Self::Malformed(_) | Self::HeadersTooLarge => Some(400),
            Self::BodyTooLarge { .. } => Some(413),
        }
    }
}

/// One parsed request
#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    /// Method, upper case as sent
    pub method: String,
    /// Raw request target
    pub target: String,
    /// Path component of the target
    pub path: String,
    /// Query string without the leading `?`
    pub query: Option<String>,
    /// Headers in arrival order
    pub headers: Vec<(String, String)>,
    /// Decoded body
    pub body: Vec<u8>,
}

impl HttpRequest {
    /// First header with the given name, case-insensitively
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    /// Credential from `Authorization: Bearer <token>`
    #[must_use]
    pub fn bearer_token(&self) -> Option<&str> {
        let value = self.header("authorization")?.trim();
        let (scheme, token) = value.split_once(' ')?;
        if !scheme.eq_ignore_ascii_case("bearer") {
            return None;
        }
        let token = token.trim();
        (!token.is_empty()).then_some(token)
    }
}

/// Read one request from the connection
///
/// # Errors
/// See [`RequestError`]
pub async fn read_request<R>(reader: &mut R, max_body: usize) -> Result<HttpRequest, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut budget = MAX_HEADER_BYTES;

    let request_line = loop {
        match read_line(reader, &mut budget).await? {
            None => return Err(RequestError::Closed),
            // Tolerate stray CRLFs ahead of the request line
            Some(line) if line.is_empty() => continue,
            Some(line) => break line,
        }
    };

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(RequestError::Malformed(format!(
            "bad request line '{request_line}'"
        )));
    };
    if !version.starts_with("HTTP/1.") {
        return Err(RequestError::Malformed(format!(
            "unsupported protocol {version}"
        )));
    }

    let mut headers = Vec::new();
    loop {
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or_else(|| RequestError::Malformed("unexpected end of headers".into()))?;
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| RequestError::Malformed(format!("bad header '{line}'")))?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    let (path, query) = match target.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (target.to_string(), None),
    };

    let mut request = HttpRequest {
        method: method.to_string(),
        target: target.to_string(),
        path,
        query,
        headers,
        body: Vec::new(),
    };

    let chunked = request
        .header("transfer-encoding")
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        request.body = read_chunked_body(reader, max_body).await?;
    } else if let Some(length) = request.header("content-length") {
        let length: usize = length
            .parse()
            .map_err(|_| RequestError::Malformed(format!("bad content-length '{length}'")))?;
        if length > max_body {
            return Err(RequestError::BodyTooLarge { limit: max_body });
        }
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body).await?;
        request.body = body;
    }

    Ok(request)
}

async fn read_line<R>(reader: &mut R, budget: &mut u64) -> Result<Option<String>, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    if *budget == 0 {
        return Err(RequestError::HeadersTooLarge);
    }
    let mut buf = Vec::new();
    let read = (&mut *reader).take(*budget).read_until(b'\n', &mut buf).await?;
    if read == 0 {
        return Ok(None);
    }
    *budget -= read as u64;
    if !buf.ends_with(b"\n") {
        return Err(if *budget == 0 {
            RequestError::HeadersTooLarge
        } else {
            RequestError::Malformed("unexpected end of line".into())
        });
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    String::from_utf8(buf)
        .map(Some)
        .map_err(|_| RequestError::Malformed("header is not utf-8".into()))
}

async fn read_chunked_body<R>(reader: &mut R, max_body: usize) -> Result<Vec<u8>, RequestError>
where
    R: AsyncBufRead + Unpin,
{
    let mut body = Vec::new();
    let mut budget = MAX_HEADER_BYTES;
    loop {
        let line = read_line(reader, &mut budget)
            .await?
            .ok_or_else(|| RequestError::Malformed("truncated chunked body".into()))?;
        let size_field = line.split(';').next().unwrap_or_default().trim();
        let size = usize::from_str_radix(size_field, 16)
            .map_err(|_| RequestError::Malformed(format!("bad chunk size '{size_field}'")))?;
        if size == 0 {
            // Trailers end with an empty line
            while let Some(trailer) = read_line(reader, &mut budget).await? {
                if trailer.is_empty() {
                    break;
                }
            }
            return Ok(body);
        }
        if body.len() + size > max_body {
            return Err(RequestError::BodyTooLarge { limit: max_body });
        }
        let start = body.len();
        body.resize(start + size, 0);
        reader.read_exact(&mut body[start..]).await?;
        let mut crlf = [0u8; 2];
        reader.read_exact(&mut crlf).await?;
        if &crlf != b"\r\n" {
            return Err(RequestError::Malformed("chunk not terminated by CRLF".into()));
        }
    }
}

/// Status line for a code, e.g. `HTTP/1.1 404 Not Found`
#[must_use]
pub fn status_line(status: u16) -> String {
    let reason = StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .unwrap_or("Unknown");
    format!("HTTP/1.1 {status} {reason}")
}

fn header_block(extra: &[(&str, &str)]) -> String {
    extra
        .iter()
        .map(|(name, value)| format!("{name}: {}\r\n", sanitize_header_value(value)))
        .collect()
}

/// Strip characters that would break header framing
#[must_use]
pub fn sanitize_header_value(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_control() { ' ' } else { c })
        .collect()
}

/// Head of a chunked response; the body follows as chunk frames
#[must_use]
pub fn chunked_head(status: u16, content_type: &str, extra: &[(&str, &str)]) -> String {
    format!(
        "{}\r\nContent-Type: {content_type}\r\nTransfer-Encoding: chunked\r\nCache-Control: no-cache\r\nConnection: close\r\n{}\r\n",
        status_line(status),
        header_block(extra)
    )
}

/// Frame a payload as one chunk: `<hex-length>\r\n<payload>\r\n`
#[must_use]
pub fn chunk_frame(payload: &[u8]) -> Vec<u8> {
    let mut frame = format!("{:x}\r\n", payload.len()).into_bytes();
    frame.extend_from_slice(payload);
    frame.extend_from_slice(b"\r\n");
    frame
}

/// Write a complete response with a `Content-Length` body
///
/// # Errors
/// Returns the socket error
pub async fn write_response<W>(
    writer: &mut W,
    status: u16,
    content_type: &str,
    extra: &[(&str, &str)],
    body: &[u8],
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let head = format!(
        "{}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n{}\r\n",
        status_line(status),
        body.len(),
        header_block(extra)
    );
    let mut out = head.into_bytes();
    out.extend_from_slice(body);
    writer.write_all(&out).await?;
    writer.flush().await
}

/// Write a JSON response
///
/// # Errors
/// Returns the socket error
pub async fn write_json<W, T>(writer: &mut W, status: u16, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(value).map_err(io::Error::other)?;
    write_response(writer, status, "application/json", &[], &body).await
}

/// OpenAI-style error envelope
#[must_use]
pub fn error_body(message: &str, error_type: &str) -> serde_json::Value {
    json!({
        "error": {
            "message": message,
            "type": error_type,
        }
    })
}

/// Write a gateway error with its status, envelope and `X-Reason` header
///
/// # Errors
/// Returns the socket error
pub async fn write_error<W>(writer: &mut W, error: &GatewayError) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let message = error.to_string();
    let body = serde_json::to_vec(&error_body(&message, error.error_type()))
        .map_err(io::Error::other)?;
    write_response(
        writer,
        error.status_code(),
        "application/json",
        &[("X-Reason", &message)],
        &body,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    async fn parse(raw: &[u8]) -> Result<HttpRequest, RequestError> {
        let mut reader = BufReader::new(raw);
        read_request(&mut reader, 1024).await
    }

    #[tokio::test]
    async fn test_content_length_request() {
        let raw = b"POST /v1/chat/completions?x=1 HTTP/1.1\r\nHost: a\r\nAuthorization: Bearer sk-1\r\nContent-Length: 4\r\n\r\nbody";
        let request = parse(raw).await.unwrap();
        assert_eq!(request.method, "POST");
        assert_eq!(request.path, "/v1/chat/completions");
        assert_eq!(request.query.as_deref(), Some("x=1"));
        assert_eq!(request.header("HOST"), Some("a"));
        assert_eq!(request.bearer_token(), Some("sk-1"));
        assert_eq!(request.body, b"body");
    }

    #[tokio::test]
    async fn test_chunked_request() {
        let raw = b"POST /x HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n2;ext=1\r\nde\r\n0\r\n\r\n";
        let request = parse(raw).await.unwrap();
        assert_eq!(request.body, b"abcde");
    }

    #[tokio::test]
    async fn test_body_limit() {
        let raw = b"POST /x HTTP/1.1\r\nContent-Length: 4096\r\n\r\n";
        let err = parse(raw).await.unwrap_err();
        assert_eq!(err.status_code(), Some(413));
    }

    #[tokio::test]
    async fn test_malformed_and_closed() {
        assert!(matches!(parse(b"").await, Err(RequestError::Closed)));
        let err = parse(b"GARBAGE\r\n\r\n").await.unwrap_err();
        assert_eq!(err.status_code(), Some(400));
        let err = parse(b"GET / HTTP/1.1\r\nNoColon\r\n\r\n").await.unwrap_err();
        assert_eq!(err.status_code(), Some(400));
    }

    #[tokio::test]
    async fn test_oversized_headers() {
        let mut raw = b"GET / HTTP/1.1\r\nX-Big: ".to_vec();
        raw.extend(std::iter::repeat(b'a').take(MAX_HEADER_BYTES as usize));
        raw.extend_from_slice(b"\r\n\r\n");
        let err = parse(&raw).await.unwrap_err();
        assert!(matches!(err, RequestError::HeadersTooLarge));
    }

    #[test]
    fn test_bearer_variants() {
        let mut request = HttpRequest::default();
        assert_eq!(request.bearer_token(), None);
        request.headers.push(("authorization".into(), "Basic abc".into()));
        assert_eq!(request.bearer_token(), None);
        request.headers[0].1 = "bearer   tok ".into();
        assert_eq!(request.bearer_token(), Some("tok"));
    }

    #[test]
    fn test_chunk_frame() {
        assert_eq!(chunk_frame(b"hello world, hi"), b"f\r\nhello world, hi\r\n".to_vec());
        assert_eq!(status_line(404), "HTTP/1.1 404 Not Found");
    }

    #[tokio::test]
    async fn test_write_error_envelope() {
        let mut out = Vec::new();
        write_error(&mut out, &GatewayError::authentication("invalid api key"))
            .await
            .unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("HTTP/1.1 401 Unauthorized\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("X-Reason: Authentication failed: invalid api key\r\n"));
        let body = text.split("\r\n\r\n").nth(1).unwrap();
        let value: serde_json::Value = serde_json::from_str(body).unwrap();
        assert_eq!(value["error"]["type"], "authentication_error");
    }
}
