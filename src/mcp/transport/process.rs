//! Process transport for locally spawned MCP servers
//!
//! [`ProcessTransport`] spawns a child process and talks to it over its
//! stdin/stdout pipes using newline-delimited JSON framing.
//!
//! # Protocol
//!
//! - Outbound messages are written to the child's stdin as a single JSON
//!   object followed by `\n`.
//! - Inbound bytes from stdout are split strictly on `\n` by
//!   [`JsonLineCodec`]; a trailing partial line is held back until the rest
//!   arrives. A line that is not valid JSON produces a parse-error event and
//!   is skipped.
//! - The child's stderr is drained and logged at `DEBUG`. It is never
//!   treated as protocol data.
//!
//! # Lifecycle
//!
//! The child environment is the ambient environment with the endpoint's
//! overrides applied on top. A background task waits on the child; when it
//! exits the transport is marked closed, and a non-zero exit code also
//! raises a [`TransportErrorKind::ProcessExit`] event. `disconnect()` closes
//! stdin, sends SIGTERM (Unix), waits for the grace period, and finally
//! force-kills.

use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex};
use tokio_util::codec::{Decoder, FramedRead};

use crate::error::{McpHubError, Result};
use crate::mcp::config::ProcessParams;
use crate::mcp::correlation::PendingRequest;
use crate::mcp::transport::{
    CloseReason, OutboundMessage, Transport, TransportCore, TransportErrorKind, TransportEvent,
    TransportKind,
};

/// How long `disconnect()` waits after SIGTERM before force-killing.
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(2);

/// How long the exit watcher waits for stdout to drain before closing.
const STDOUT_DRAIN_TIMEOUT: Duration = Duration::from_millis(500);

// ---------------------------------------------------------------------------
// Line framing
// ---------------------------------------------------------------------------

/// Newline-delimited frame decoder.
///
/// Splits strictly on `\n`, strips a trailing `\r`, and skips blank lines.
/// Bytes after the last newline stay buffered until more data arrives.
/// Invalid UTF-8 is replaced rather than failing the stream, so one bad line
/// cannot take the connection down.
///
/// # Examples
///
/// ```
/// use bytes::BytesMut;
/// use tokio_util::codec::Decoder;
/// use mcphub::mcp::transport::process::JsonLineCodec;
///
/// let mut codec = JsonLineCodec::default();
/// let mut buf = BytesMut::from(&b"{\"id\":1,\"result\":{}}\n{\"id\":2"[..]);
/// assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("{\"id\":1,\"result\":{}}"));
/// assert_eq!(codec.decode(&mut buf).unwrap(), None);
/// ```
#[derive(Debug, Default, Clone, Copy)]
pub struct JsonLineCodec;

impl Decoder for JsonLineCodec {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> std::result::Result<Option<String>, Self::Error> {
        loop {
            let Some(pos) = src.iter().position(|b| *b == b'\n') else {
                return Ok(None);
            };
            let line = src.split_to(pos + 1);
            let mut body = &line[..pos];
            if body.last() == Some(&b'\r') {
                body = &body[..body.len() - 1];
            }
            let text = String::from_utf8_lossy(body);
            let text = text.trim();
            if !text.is_empty() {
                return Ok(Some(text.to_string()));
            }
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> std::result::Result<Option<String>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        // A final unterminated line is still a complete frame at EOF.
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split_to(src.len());
        let text = String::from_utf8_lossy(&rest).trim().to_string();
        Ok((!text.is_empty()).then_some(text))
    }
}

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct RunningProcess {
    stdin_tx: mpsc::UnboundedSender<String>,
    pid: Option<u32>,
    kill_tx: Option<oneshot::Sender<()>>,
    exited: watch::Receiver<bool>,
}

/// Child-process MCP transport.
///
/// # Examples
///
/// ```no_run
/// use std::time::Duration;
/// use mcphub::mcp::config::ProcessParams;
/// use mcphub::mcp::transport::process::ProcessTransport;
/// use mcphub::mcp::transport::Transport;
///
/// # #[tokio::main]
/// # async fn main() -> anyhow::Result<()> {
/// let transport = ProcessTransport::new(
///     "files",
///     ProcessParams {
///         command: "npx".into(),
///         args: vec!["-y".into(), "@modelcontextprotocol/server-filesystem".into(), "/tmp".into()],
///         env: Default::default(),
///         cwd: None,
///     },
///     Duration::from_secs(30),
/// );
/// transport.connect().await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct ProcessTransport {
    core: Arc<TransportCore>,
    params: ProcessParams,
    grace: Duration,
    closing: Arc<AtomicBool>,
    running: Mutex<Option<RunningProcess>>,
}

impl ProcessTransport {
    /// Create an unconnected process transport.
    pub fn new(endpoint: &str, params: ProcessParams, request_timeout: Duration) -> Self {
        Self {
            core: Arc::new(TransportCore::new(endpoint, request_timeout)),
            params,
            grace: DEFAULT_TERMINATION_GRACE,
            closing: Arc::new(AtomicBool::new(false)),
            running: Mutex::new(None),
        }
    }

    /// Override the SIGTERM grace period used by `disconnect()`.
    pub fn with_termination_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn spawn_child(&self) -> Result<RunningProcess> {
        let endpoint = self.core.endpoint().to_string();
        let mut cmd = Command::new(&self.params.command);
        cmd.args(&self.params.args)
            .envs(&self.params.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.params.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|e| {
            McpHubError::connection(
                &endpoint,
                format!("failed to spawn `{}`: {}", self.params.command, e),
            )
        })?;

        // Each handle is Some because of the Stdio::piped() calls above.
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpHubError::connection(&endpoint, "child stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpHubError::connection(&endpoint, "child stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpHubError::connection(&endpoint, "child stderr unavailable"))?;
        let pid = child.id();

        // stdin writer. Dropping stdin_tx closes the child's stdin.
        let (stdin_tx, mut stdin_rx) = mpsc::unbounded_channel::<String>();
        let writer_endpoint = endpoint.clone();
        tokio::spawn(async move {
            let mut stdin = stdin;
            while let Some(frame) = stdin_rx.recv().await {
                let line = format!("{frame}\n");
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    tracing::debug!(endpoint = %writer_endpoint, "stdin write failed: {e}");
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // stdout reader.
        let reader_core = Arc::clone(&self.core);
        let reader = tokio::spawn(async move {
            let mut frames = FramedRead::new(stdout, JsonLineCodec);
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(line) => reader_core.handle_inbound(&line),
                    Err(e) => {
                        reader_core.emit(TransportEvent::Error {
                            kind: TransportErrorKind::Io,
                            message: format!("stdout read failed: {e}"),
                        });
                        break;
                    }
                }
            }
        });

        // stderr drain.
        let stderr_endpoint = endpoint.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                tracing::debug!(
                    target: "mcphub::mcp::transport::process",
                    endpoint = %stderr_endpoint,
                    "server stderr: {}",
                    line
                );
            }
        });

        // Exit watcher.
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exited_tx, exited_rx) = watch::channel(false);
        let watcher_core = Arc::clone(&self.core);
        let closing = Arc::clone(&self.closing);
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            // Let the reader deliver any replies written just before exit.
            let _ = tokio::time::timeout(STDOUT_DRAIN_TIMEOUT, reader).await;

            let requested = closing.load(Ordering::SeqCst);
            let code = status.as_ref().ok().and_then(|s| s.code());
            tracing::info!(
                endpoint = %watcher_core.endpoint(),
                ?code,
                requested,
                "server process exited"
            );
            if !requested && code.map_or(false, |c| c != 0) {
                watcher_core.emit(TransportEvent::Error {
                    kind: TransportErrorKind::ProcessExit(code),
                    message: McpHubError::ProcessExit {
                        endpoint: watcher_core.endpoint().to_string(),
                        code,
                    }
                    .to_string(),
                });
            }
            watcher_core.mark_closed(if requested {
                CloseReason::Local
            } else {
                CloseReason::Remote
            });
            let _ = exited_tx.send(true);
        });

        Ok(RunningProcess {
            stdin_tx,
            pid,
            kill_tx: Some(kill_tx),
            exited: exited_rx,
        })
    }
}

#[cfg(unix)]
fn send_sigterm(pid: u32) {
    // SAFETY: pid was obtained from tokio::process::Child and the child has
    // not been reaped yet (the exit watcher has not observed its exit).
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }
}

async fn wait_exited(exited: &mut watch::Receiver<bool>, within: Duration) -> bool {
    tokio::time::timeout(within, exited.wait_for(|done| *done))
        .await
        .map_or(false, |r| r.is_ok())
}

#[async_trait::async_trait]
impl Transport for ProcessTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Process
    }

    fn endpoint_id(&self) -> &str {
        self.core.endpoint()
    }

    async fn connect(&self) -> Result<()> {
        let mut running = self.running.lock().await;
        if running.is_some() && self.core.is_connected() {
            return Ok(());
        }
        self.closing.store(false, Ordering::SeqCst);
        let process = self.spawn_child()?;
        tracing::info!(
            endpoint = %self.core.endpoint(),
            pid = ?process.pid,
            command = %self.params.command,
            "spawned server process"
        );
        *running = Some(process);
        self.core.set_connected();
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let Some(mut process) = self.running.lock().await.take() else {
            self.core.mark_closed(CloseReason::Local);
            return Ok(());
        };
        self.closing.store(true, Ordering::SeqCst);
        self.core.mark_closed(CloseReason::Local);

        // Polite: close stdin, then SIGTERM.
        drop(process.stdin_tx);
        #[cfg(unix)]
        {
            let already_exited = *process.exited.borrow();
            if let (Some(pid), false) = (process.pid, already_exited) {
                send_sigterm(pid);
            }
        }

        if !wait_exited(&mut process.exited, self.grace).await {
            tracing::warn!(
                endpoint = %self.core.endpoint(),
                "server did not exit within {:?}; killing",
                self.grace
            );
            if let Some(kill) = process.kill_tx.take() {
                let _ = kill.send(());
            }
            wait_exited(&mut process.exited, Duration::from_secs(1)).await;
        }

        self.core.mark_closed(CloseReason::Local);
        Ok(())
    }

    async fn send(&self, message: OutboundMessage) -> Result<Option<PendingRequest>> {
        self.core.ensure_connected()?;
        let running = self.running.lock().await;
        let process = running
            .as_ref()
            .ok_or_else(|| McpHubError::closed(self.core.endpoint(), "process not running"))?;
        let (frame, pending) = self.core.encode(message)?;
        process
            .stdin_tx
            .send(frame)
            .map_err(|_| McpHubError::closed(self.core.endpoint(), "stdin closed"))?;
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
// Tests
// ---------------------------------------------------------------------------
