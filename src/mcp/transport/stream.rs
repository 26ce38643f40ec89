//! Streaming transport: SSE subscription plus HTTP POST side channel
//!
//! [`StreamTransport`] keeps a long-lived `GET` request open with
//! `Accept: text/event-stream` and feeds every `data:` payload to the shared
//! correlation core. Outbound messages are POSTed to a sibling send
//! endpoint:
//!
//! - By default the send URL is the subscription URL with a trailing `sse`
//!   path segment replaced by `message` (or `message` appended).
//! - An `event: endpoint` whose data is a relative or absolute URL overrides
//!   the default. `connect()` waits briefly for that event.
//!
//! A POST response carrying a JSON body is handled exactly like an SSE
//! event, so servers that answer inline also work. When the subscription
//! ends without the caller asking for it, the transport is marked closed and
//! every pending request is rejected.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio_util::codec::Decoder;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::error::{McpHubError, Result};
use crate::mcp::config::StreamParams;
use crate::mcp::correlation::PendingRequest;
use crate::mcp::transport::{
    CloseReason, OutboundMessage, Transport, TransportCore, TransportErrorKind, TransportEvent,
    TransportKind,
};

/// How long `connect()` waits for an `endpoint` event before falling back to
/// the derived send URL.
pub const ENDPOINT_DISCOVERY_WINDOW: Duration = Duration::from_millis(500);

/// Streaming MCP transport.
#[derive(Debug)]
pub struct StreamTransport {
    core: Arc<TransportCore>,
    http_client: reqwest::Client,
    subscribe_url: Url,
    send_url: Arc<RwLock<Url>>,
    headers: HashMap<String, String>,
    endpoint_ready: Arc<Notify>,
    session: Mutex<Option<CancellationToken>>,
}

impl StreamTransport {
    /// Create an unconnected streaming transport.
    ///
    /// No network I/O happens here.
    ///
    /// # Errors
    ///
    /// Returns [`McpHubError::Config`] if the URL does not parse, or
    /// [`McpHubError::Http`] if the HTTP client cannot be built.
    pub fn new(endpoint: &str, params: StreamParams, request_timeout: Duration) -> Result<Self> {
        let subscribe_url = Url::parse(&params.url).map_err(|e| {
            McpHubError::Config(format!("endpoint '{endpoint}': invalid url: {e}"))
        })?;
        // No overall timeout: the subscription response body never ends.
        let http_client = reqwest::Client::builder()
            .connect_timeout(request_timeout)
            .build()
            .map_err(McpHubError::Http)?;
        let send_url = derive_send_url(&subscribe_url);
        Ok(Self {
            core: Arc::new(TransportCore::new(endpoint, request_timeout)),
            http_client,
            subscribe_url,
            send_url: Arc::new(RwLock::new(send_url)),
            headers: params.headers,
            endpoint_ready: Arc::new(Notify::new()),
            session: Mutex::new(None),
        })
    }

    /// The URL outbound messages are currently POSTed to.
    pub fn send_url(&self) -> Url {
        read_url(&self.send_url)
    }

    fn apply_headers(&self, mut req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (k, v) in &self.headers {
            req = req.header(k.as_str(), v.as_str());
        }
        req
    }
}

fn read_url(lock: &RwLock<Url>) -> Url {
    lock.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Derive the default send URL from the subscription URL.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use mcphub::mcp::transport::stream::derive_send_url;
///
/// let sse = Url::parse("http://localhost:8080/sse").unwrap();
/// assert_eq!(derive_send_url(&sse).as_str(), "http://localhost:8080/message");
///
/// let nested = Url::parse("http://localhost:8080/mcp/events").unwrap();
/// assert_eq!(derive_send_url(&nested).as_str(), "http://localhost:8080/mcp/events/message");
/// ```
pub fn derive_send_url(subscribe_url: &Url) -> Url {
    let mut url = subscribe_url.clone();
    url.set_query(None);
    let mut segments: Vec<String> = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).map(str::to_string).collect())
        .unwrap_or_default();
    match segments.last().map(String::as_str) {
        Some("sse") => {
            segments.pop();
            segments.push("message".to_string());
        }
        _ => segments.push("message".to_string()),
    }
    url.set_path(&format!("/{}", segments.join("/")));
    url
}

#[async_trait::async_trait]
impl Transport for StreamTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn endpoint_id(&self) -> &str {
        self.core.endpoint()
    }

    async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if session.is_some() && self.core.is_connected() {
            return Ok(());
        }
        let endpoint = self.core.endpoint().to_string();

        let req = self
            .apply_headers(self.http_client.get(self.subscribe_url.as_str()))
            .header("Accept", "text/event-stream");
        let response = tokio::time::timeout(self.core.request_timeout(), req.send())
            .await
            .map_err(|_| McpHubError::connection(&endpoint, "subscription request timed out"))?
            .map_err(|e| McpHubError::connection(&endpoint, format!("subscription failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(McpHubError::connection(
                &endpoint,
                format!("subscription returned HTTP {status}"),
            )
            .into());
        }

        let token = CancellationToken::new();
        let reader_token = token.clone();
        let core = Arc::clone(&self.core);
        let send_url = Arc::clone(&self.send_url);
        let ready = Arc::clone(&self.endpoint_ready);
        let base = self.subscribe_url.clone();
        let byte_stream = response.bytes_stream();

        self.core.set_connected();
        tokio::spawn(async move {
            let sink = |event: SseEvent| {
                if event.event.as_deref() == Some("endpoint") {
                    match base.join(event.data.trim()) {
                        Ok(url) => {
                            tracing::debug!(endpoint = %core.endpoint(), %url, "discovered send endpoint");
                            *send_url
                                .write()
                                .unwrap_or_else(|poisoned| poisoned.into_inner()) = url;
                            ready.notify_one();
                        }
                        Err(e) => core.emit(TransportEvent::Error {
                            kind: TransportErrorKind::Parse,
                            message: format!("invalid endpoint event '{}': {e}", event.data),
                        }),
                    }
                } else {
                    core.handle_inbound(&event.data);
                }
            };

            tokio::select! {
                _ = reader_token.cancelled() => {}
                _ = parse_sse_stream(byte_stream, sink) => {
                    if !reader_token.is_cancelled() {
                        tracing::info!(endpoint = %core.endpoint(), "event stream ended");
                        core.mark_closed(CloseReason::Remote);
                    }
                }
            }
        });
        *session = Some(token);
        drop(session);

        // An endpoint event usually arrives first; fall back to the derived URL.
        if tokio::time::timeout(ENDPOINT_DISCOVERY_WINDOW, self.endpoint_ready.notified())
            .await
            .is_err()
        {
            tracing::debug!(
                endpoint = %endpoint,
                send_url = %self.send_url(),
                "no endpoint event; using derived send url"
            );
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        if let Some(token) = self.session.lock().await.take() {
            token.cancel();
        }
        self.core.mark_closed(CloseReason::Local);
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<Option<PendingRequest>> {
        self.core.ensure_connected()?;
        let endpoint = self.core.endpoint().to_string();
        let (frame, pending) = self.core.encode(message)?;

        let req = self
            .apply_headers(self.http_client.post(self.send_url()))
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .timeout(self.core.request_timeout())
            .body(frame);
        let response = req
            .send()
            .await
            .map_err(|e| McpHubError::connection(&endpoint, format!("POST failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(
                McpHubError::connection(&endpoint, format!("POST returned HTTP {status}")).into(),
            );
        }

        let is_event_stream = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.starts_with("text/event-stream"));
        if is_event_stream {
            let core = Arc::clone(&self.core);
            let byte_stream = response.bytes_stream();
            tokio::spawn(async move {
                parse_sse_stream(byte_stream, |event| core.handle_inbound(&event.data)).await;
            });
        } else {
            let body = match response.text().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::warn!(endpoint = %endpoint, "reading POST response failed: {e}");
                    self.core.emit(TransportEvent::Error {
                        kind: TransportErrorKind::Io,
                        message: format!("reading POST response failed: {e}"),
                    });
                    return Err(McpHubError::connection(
                        &endpoint,
                        format!("reading POST response failed: {e}"),
                    )
                    .into());
                }
            };
            if !body.trim().is_empty() {
                self.core.handle_inbound(&body);
            }
        }
        Ok(pending)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.core.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn pending_requests(&self) -> usize {
        self.core.pending().len()
    }
}

// ---------------------------------------------------------------------------
// SSE parser
// ---------------------------------------------------------------------------

/// One parsed server-sent event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    /// The `event:` field, if present.
    pub event: Option<String>,
    /// `data:` lines joined with `\n`.
    pub data: String,
    /// The `id:` field, if present.
    pub id: Option<String>,
}

/// Server-sent event decoder.
///
/// Buffers raw bytes until a blank line (`\n\n` or `\r\n\r\n`) closes an
/// event block, and only then decodes the block as UTF-8, so a multi-byte
/// character split across reads arrives intact. `event: ping` events and
/// `data: [PING]` payloads are discarded, as are events with no data.
/// Comment lines (leading `:`) and `retry:` are ignored.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use tokio_util::codec::Decoder;
/// use mcphub::mcp::transport::stream::SseCodec;
///
/// let mut codec = SseCodec::default();
/// let mut buf = BytesMut::from(&b"data: {\"id\":1}\n\ndata: par"[..]);
/// assert_eq!(codec.decode(&mut buf).unwrap().unwrap().data, "{\"id\":1}");
/// assert!(codec.decode(&mut buf).unwrap().is_none());
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct SseCodec;

/// Offset just past the blank line ending the first complete block.
fn block_end(src: &[u8]) -> Option<usize> {
    let mut from = 0;
    while let Some(offset) = src[from..].iter().position(|b| *b == b'\n') {
        let next = from + offset + 1;
        match src.get(next) {
            Some(b'\n') => return Some(next + 1),
            Some(b'\r') if src.get(next + 1) == Some(&b'\n') => return Some(next + 2),
            _ => from = next,
        }
    }
    None
}

impl Decoder for SseCodec {
    type Item = SseEvent;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<SseEvent>, Self::Error> {
        while let Some(end) = block_end(src) {
            let block = src.split_to(end);
            if let Some(event) = parse_sse_event(&String::from_utf8_lossy(&block)) {
                return Ok(Some(event));
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::result::Result<Option<SseEvent>, Self::Error> {
        if let Some(event) = self.decode(src)? {
            return Ok(Some(event));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        Ok(parse_sse_event(&String::from_utf8_lossy(&rest)))
    }
}

/// Parse an SSE byte stream and hand every complete event to `sink`.
///
/// Runs until the stream ends or yields an error; an unterminated final
/// block is still delivered.
pub async fn parse_sse_stream<S, E, F>(byte_stream: S, mut sink: F)
where
    S: Stream<Item = std::result::Result<Bytes, E>>,
    E: std::fmt::Display,
    F: FnMut(SseEvent),
{
    let mut codec = SseCodec;
    let mut buffer = BytesMut::new();
    tokio::pin!(byte_stream);

    while let Some(chunk) = byte_stream.next().await {
        match chunk {
            Ok(chunk) => buffer.extend_from_slice(&chunk),
            Err(e) => {
                tracing::debug!("event stream read error: {e}");
                break;
            }
        }
        while let Ok(Some(event)) = codec.decode(&mut buffer) {
            sink(event);
        }
    }

    while let Ok(Some(event)) = codec.decode_eof(&mut buffer) {
        sink(event);
    }
}

/// Parse one SSE event block (the text between blank-line delimiters).
fn parse_sse_event(block: &str) -> Option<SseEvent> {
    let mut data_lines: Vec<&str> = Vec::new();
    let mut event_type: Option<&str> = None;
    let mut event_id: Option<&str> = None;

    for line in block.lines() {
        if let Some(value) = line.strip_prefix("data:") {
            data_lines.push(value.strip_prefix(' ').unwrap_or(value));
        } else if let Some(value) = line.strip_prefix("id:") {
            event_id = Some(value.trim());
        } else if let Some(value) = line.strip_prefix("event:") {
            event_type = Some(value.trim());
        }
    }

    if event_type.map_or(false, |et| et.eq_ignore_ascii_case("ping")) {
        return None;
    }
    let data = data_lines.join("\n");
    if data.trim().is_empty() || data.trim().eq_ignore_ascii_case("[ping]") {
        return None;
    }
    Some(SseEvent {
        event: event_type.map(str::to_string),
        data,
        id: event_id.map(str::to_string),
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
