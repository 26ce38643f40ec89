//! Persistent WebSocket transport with bounded reconnection
//!
//! Every inbound text frame is one complete JSON message. When the socket
//! closes without the caller asking for it, every pending request is
//! rejected and the transport tries to re-establish the channel up to
//! `max_reconnect_attempts` times, waiting `min(base * 2^(n-1), max)` before
//! attempt `n`. A successful attempt publishes
//! [`TransportEvent::Reconnected`]; exhausting the attempts publishes
//! [`TransportEvent::Closed`] with [`CloseReason::Remote`].
//!
//! Calling [`Transport::disconnect`] switches reconnection off for the
//! lifetime of the instance.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use crate::error::{McpHubError, Result};
use crate::mcp::config::SocketParams;
use crate::mcp::correlation::PendingRequest;
use crate::mcp::transport::{
    CloseReason, OutboundMessage, Transport, TransportCore, TransportErrorKind, TransportEvent,
    TransportKind,
};

/// How long a local close waits for the endpoint's close frame.
pub const CLOSE_GRACE: Duration = Duration::from_secs(2);

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bounded exponential backoff for reconnect attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Maximum number of attempts; zero disables reconnection.
    pub max_attempts: u32,
    /// Delay before the first attempt.
    pub initial_delay: Duration,
    /// Upper bound on any single delay.
    pub max_delay: Duration,
}

impl ReconnectPolicy {
    /// Build the policy from socket parameters.
    pub fn from_params(params: &SocketParams) -> Self {
        Self {
            max_attempts: params.max_reconnect_attempts,
            initial_delay: Duration::from_millis(params.reconnect_delay_ms),
            max_delay: Duration::from_millis(params.max_reconnect_delay_ms),
        }
    }

    /// Delay before attempt `attempt` (one-based).
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use mcphub::mcp::transport::socket::ReconnectPolicy;
    ///
    /// let policy = ReconnectPolicy {
    ///     max_attempts: 5,
    ///     initial_delay: Duration::from_millis(100),
    ///     max_delay: Duration::from_millis(350),
    /// };
    /// assert_eq!(policy.delay_for(1), Duration::from_millis(100));
    /// assert_eq!(policy.delay_for(2), Duration::from_millis(200));
    /// assert_eq!(policy.delay_for(3), Duration::from_millis(350));
    /// ```
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 2u64.saturating_pow(exponent);
        let delay = (self.initial_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(delay.min(self.max_delay.as_millis() as u64))
    }
}

#[derive(Debug)]
struct SocketShared {
    core: TransportCore,
    url: String,
    headers: HashMap<String, String>,
    policy: ReconnectPolicy,
    outbound: StdMutex<Option<mpsc::UnboundedSender<String>>>,
    no_reconnect: AtomicBool,
}

impl SocketShared {
    fn install_outbound(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self
            .outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(tx);
        rx
    }

    fn clear_outbound(&self) {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
    }

    fn outbound(&self) -> Option<mpsc::UnboundedSender<String>> {
        self.outbound
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    async fn dial(&self) -> Result<WsStream> {
        let endpoint = self.core.endpoint();
        let mut request = self
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| McpHubError::connection(endpoint, format!("invalid request: {e}")))?;
        for (name, value) in &self.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| McpHubError::connection(endpoint, format!("bad header name: {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| McpHubError::connection(endpoint, format!("bad header value: {e}")))?;
            request.headers_mut().insert(name, value);
        }

        let (ws, _response) = tokio::time::timeout(
            self.core.request_timeout(),
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| McpHubError::connection(endpoint, "handshake timed out"))?
        .map_err(|e| McpHubError::connection(endpoint, format!("dial failed: {e}")))?;
        Ok(ws)
    }
}

#[derive(Debug)]
struct Session {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// WebSocket MCP transport.
#[derive(Debug)]
pub struct SocketTransport {
    shared: Arc<SocketShared>,
    session: Mutex<Option<Session>>,
}

impl SocketTransport {
    /// Create an unconnected socket transport.
    ///
    /// # Errors
    ///
    /// Returns [`McpHubError::Config`] when the URL does not parse or is not
    /// `ws`/`wss`.
    pub fn new(endpoint: &str, params: SocketParams, request_timeout: Duration) -> Result<Self> {
        let url = url::Url::parse(&params.url).map_err(|e| {
            McpHubError::Config(format!("endpoint '{endpoint}': invalid url: {e}"))
        })?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(McpHubError::Config(format!(
                "endpoint '{endpoint}': socket url must use ws or wss, got '{}'",
                url.scheme()
            ))
            .into());
        }
        Ok(Self {
            shared: Arc::new(SocketShared {
                core: TransportCore::new(endpoint, request_timeout),
                url: params.url.clone(),
                policy: ReconnectPolicy::from_params(&params),
                headers: params.headers,
                outbound: StdMutex::new(None),
                no_reconnect: AtomicBool::new(false),
            }),
            session: Mutex::new(None),
        })
    }

    /// The reconnect policy in effect.
    pub fn policy(&self) -> ReconnectPolicy {
        self.shared.policy
    }

    /// `true` once `disconnect()` has been called.
    pub fn reconnect_disabled(&self) -> bool {
        self.shared.no_reconnect.load(Ordering::SeqCst)
    }

    /// Stop the session task, if any, and mark the channel closed.
    async fn close_session(&self) {
        self.shared.core.mark_closed(CloseReason::Local);
        if let Some(Session { token, handle }) = self.session.lock().await.take() {
            token.cancel();
            let abort = handle.abort_handle();
            if tokio::time::timeout(CLOSE_GRACE + Duration::from_millis(500), handle)
                .await
                .is_err()
            {
                tracing::warn!(
                    endpoint = %self.shared.core.endpoint(),
                    "socket did not close within grace period; aborting"
                );
                abort.abort();
            }
        }
        self.shared.clear_outbound();
        self.shared.core.mark_closed(CloseReason::Local);
    }
}

impl Drop for SocketTransport {
    fn drop(&mut self) {
        if let Ok(mut session) = self.session.try_lock() {
            if let Some(Session { token, .. }) = session.take() {
                token.cancel();
            }
        }
    }
}

enum PumpOutcome {
    Cancelled,
    Ended,
}

/// Move frames in both directions until the socket ends or `token` fires.
async fn pump(
    shared: &SocketShared,
    ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    token: &CancellationToken,
) -> PumpOutcome {
    let (mut sink, mut stream) = ws.split();
    let core = &shared.core;

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                let _ = tokio::time::timeout(CLOSE_GRACE, async {
                    while let Some(Ok(msg)) = stream.next().await {
                        if msg.is_close() {
                            break;
                        }
                    }
                })
                .await;
                return PumpOutcome::Cancelled;
            }
            Some(frame) = outbound.recv() => {
                if let Err(e) = sink.send(Message::Text(frame)).await {
                    tracing::warn!(endpoint = %core.endpoint(), "socket write failed: {e}");
                    core.emit(TransportEvent::Error {
                        kind: TransportErrorKind::Io,
                        message: e.to_string(),
                    });
                    return PumpOutcome::Ended;
                }
            }
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => core.handle_inbound(&text),
                Some(Ok(Message::Binary(bytes))) => {
                    core.handle_inbound(&String::from_utf8_lossy(&bytes));
                }
                Some(Ok(Message::Close(frame))) => {
                    tracing::info!(endpoint = %core.endpoint(), ?frame, "endpoint closed socket");
                    return PumpOutcome::Ended;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::warn!(endpoint = %core.endpoint(), "socket read failed: {e}");
                    core.emit(TransportEvent::Error {
                        kind: TransportErrorKind::Io,
                        message: e.to_string(),
                    });
                    return PumpOutcome::Ended;
                }
                None => return PumpOutcome::Ended,
            },
        }
    }
}

/// Try to re-establish the channel. `None` when attempts are exhausted or
/// the caller disconnected meanwhile.
async fn reconnect(shared: &SocketShared, token: &CancellationToken) -> Option<WsStream> {
    let endpoint = shared.core.endpoint();
    for attempt in 1..=shared.policy.max_attempts {
        let delay = shared.policy.delay_for(attempt);
        shared
            .core
            .emit(TransportEvent::Reconnecting { attempt, delay });
        tracing::info!(endpoint = %endpoint, attempt, ?delay, "reconnecting");

        tokio::select! {
            _ = token.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }
        if shared.no_reconnect.load(Ordering::SeqCst) {
            return None;
        }
        match shared.dial().await {
            Ok(ws) => return Some(ws),
            Err(e) => tracing::warn!(endpoint = %endpoint, attempt, "reconnect failed: {e}"),
        }
    }
    tracing::error!(
        endpoint = %endpoint,
        attempts = shared.policy.max_attempts,
        "giving up on reconnect"
    );
    None
}

async fn supervise(
    shared: Arc<SocketShared>,
    mut ws: WsStream,
    mut outbound: mpsc::UnboundedReceiver<String>,
    token: CancellationToken,
) {
    loop {
        let outcome = pump(&shared, ws, outbound, &token).await;
        shared.clear_outbound();
        if matches!(outcome, PumpOutcome::Cancelled) {
            return;
        }

        if shared.no_reconnect.load(Ordering::SeqCst) || shared.policy.max_attempts == 0 {
            shared.core.mark_closed(CloseReason::Remote);
            return;
        }

        shared.core.mark_interrupted();
        match reconnect(&shared, &token).await {
            Some(next) => {
                ws = next;
                outbound = shared.install_outbound();
                shared.core.set_connected();
                tracing::info!(endpoint = %shared.core.endpoint(), "socket reconnected");
                shared.core.emit(TransportEvent::Reconnected);
            }
            None => {
                if !token.is_cancelled() {
                    shared.core.emit(TransportEvent::Closed(CloseReason::Remote));
                }
                return;
            }
        }
    }
}

#[async_trait::async_trait]
impl Transport for SocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Socket
    }

    fn endpoint_id(&self) -> &str {
        self.shared.core.endpoint()
    }

    async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if self.shared.core.is_connected() {
            return Ok(());
        }
        if let Some(stale) = session.take() {
            stale.token.cancel();
            stale.handle.abort();
        }

        let ws = self.shared.dial().await?;
        let outbound = self.shared.install_outbound();
        self.shared.core.set_connected();
        tracing::info!(endpoint = %self.shared.core.endpoint(), url = %self.shared.url, "socket connected");

        let token = CancellationToken::new();
        let handle = tokio::spawn(supervise(
            Arc::clone(&self.shared),
            ws,
            outbound,
            token.clone(),
        ));
        *session = Some(Session { token, handle });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.shared.no_reconnect.store(true, Ordering::SeqCst);
        self.close_session().await;
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.close_session().await;
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<Option<PendingRequest>> {
        let core = &self.shared.core;
        core.ensure_connected()?;
        let tx = self
            .shared
            .outbound()
            .ok_or_else(|| McpHubError::closed(core.endpoint(), "socket is not open"))?;
        let (frame, pending) = core.encode(message)?;
        tx.send(frame)
            .map_err(|_| McpHubError::closed(core.endpoint(), "socket writer stopped"))?;
        Ok(pending)
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.core.subscribe()
    }

    fn is_connected(&self) -> bool {
        self.shared.core.is_connected()
    }

    fn pending_requests(&self) -> usize {
        self.shared.core.pending().len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
