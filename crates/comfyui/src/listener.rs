//! Push-channel listener for a single job.
//!
//! [`EventListener::spawn`] opens the WebSocket with the job's client id
//! and runs a background task that reads raw frames, normalizes them
//! into [`ExecutionEvent`]s for that job, and forwards them over an
//! mpsc channel. Frames belonging to other jobs are dropped. Every
//! received frame refreshes the shared [`Liveness`] clock, whether or
//! not it produced an event.
//!
//! A connection that drops after the job started (and before it
//! reached a terminal event) is re-established with bounded backoff.
//! When the listener gives up, or the channel ends for good, it emits
//! [`ExecutionEvent::EndOfStream`] and exits.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIClientError, WsStream};
use crate::events::ExecutionEvent;
use crate::messages::{normalize, parse_message, Normalized};
use crate::reconnect::{reconnect_loop, ReconnectConfig};

/// Capacity of the per-job event channel.
const EVENT_CHANNEL_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// Liveness
// ---------------------------------------------------------------------------

/// Time of the most recent push-channel frame, shared between the
/// listener task (writer) and the reconciler (reader).
#[derive(Debug)]
pub struct Liveness {
    origin: Instant,
    /// Milliseconds since `origin` plus one; zero means "never".
    last_ms: AtomicU64,
}

impl Liveness {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    /// Record that a frame arrived now.
    pub fn touch(&self) {
        let ms = self.origin.elapsed().as_millis() as u64 + 1;
        self.last_ms.store(ms, Ordering::Release);
    }

    /// Time since the last frame, or `None` if nothing has arrived yet.
    pub fn silence(&self) -> Option<Duration> {
        match self.last_ms.load(Ordering::Acquire) {
            0 => None,
            ms => Some(
                self.origin
                    .elapsed()
                    .saturating_sub(Duration::from_millis(ms - 1)),
            ),
        }
    }
}

impl Default for Liveness {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Consumer side of a running listener.
///
/// Dropping the handle stops the background task.
pub struct ListenerHandle {
    events: mpsc::Receiver<ExecutionEvent>,
    liveness: Arc<Liveness>,
    shutdown: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ListenerHandle {
    /// Wrap an externally fed channel. Nothing is spawned; the caller
    /// drives both the events and the liveness clock.
    pub fn from_channel(events: mpsc::Receiver<ExecutionEvent>, liveness: Arc<Liveness>) -> Self {
        Self {
            events,
            liveness,
            shutdown: CancellationToken::new(),
            task: None,
        }
    }

    /// Next event, or `None` once the listener has exited.
    pub async fn recv(&mut self) -> Option<ExecutionEvent> {
        self.events.recv().await
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Stop the listener and wait for its task to finish.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Event listener task panicked");
            }
        }
    }
}

impl Drop for ListenerHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

// ---------------------------------------------------------------------------
// Listener
// ---------------------------------------------------------------------------

/// Spawns per-job push-channel listeners against one ComfyUI instance.
#[derive(Debug, Clone)]
pub struct EventListener {
    client: ComfyUIClient,
    reconnect: ReconnectConfig,
}

impl EventListener {
    pub fn new(client: ComfyUIClient, reconnect: ReconnectConfig) -> Self {
        Self { client, reconnect }
    }

    /// Start listening for `job_id`'s frames on the channel identified
    /// by `client_id`. The listener stops when `cancel` (or the returned
    /// handle) is cancelled or dropped.
    pub fn spawn(
        &self,
        client_id: impl Into<String>,
        job_id: impl Into<String>,
        cancel: &CancellationToken,
    ) -> ListenerHandle {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let liveness = Arc::new(Liveness::new());
        let shutdown = cancel.child_token();

        let session = Session {
            client: self.client.clone(),
            reconnect: self.reconnect.clone(),
            client_id: client_id.into(),
            job_id: job_id.into(),
            tx,
            liveness: Arc::clone(&liveness),
            shutdown: shutdown.clone(),
            started: false,
            terminal: false,
            reconnects_used: 0,
        };
        let task = tokio::spawn(session.run());

        ListenerHandle {
            events: rx,
            liveness,
            shutdown,
            task: Some(task),
        }
    }
}

/// Why the frame pump stopped.
enum PumpExit {
    /// The socket closed or errored.
    Closed,
    /// Shutdown requested or nobody is listening any more.
    Stop,
}

/// State owned by one listener task.
struct Session {
    client: ComfyUIClient,
    reconnect: ReconnectConfig,
    client_id: String,
    job_id: String,
    tx: mpsc::Sender<ExecutionEvent>,
    liveness: Arc<Liveness>,
    shutdown: CancellationToken,
    started: bool,
    terminal: bool,
    /// Reconnect attempts spent so far, across every drop.
    reconnects_used: u32,
}

impl Session {
    async fn run(mut self) {
        let connected = tokio::select! {
            _ = self.shutdown.cancelled() => return,
            result = self.client.connect(&self.client_id) => result,
        };
        let mut conn = match connected {
            Ok(conn) => conn,
            Err(e) => {
                tracing::warn!(
                    job_id = %self.job_id,
                    error = %e,
                    "Push channel unavailable; relying on polling",
                );
                self.finish().await;
                return;
            }
        };

        loop {
            self.liveness.touch();
            if !self.emit(ExecutionEvent::Connected).await {
                return;
            }

            match self.pump(&mut conn.ws_stream).await {
                PumpExit::Stop => return,
                PumpExit::Closed => {}
            }

            if self.terminal || !self.started {
                tracing::debug!(
                    job_id = %self.job_id,
                    started = self.started,
                    terminal = self.terminal,
                    "Push channel closed; not reconnecting",
                );
                break;
            }

            if self.reconnects_used >= self.reconnect.max_attempts {
                tracing::warn!(
                    job_id = %self.job_id,
                    attempts = self.reconnects_used,
                    "Reconnect budget spent; ending push channel",
                );
                break;
            }

            let tx = self.tx.clone();
            let max_attempts = self.reconnect.max_attempts;
            let mut used = self.reconnects_used;
            let restored = reconnect_loop(
                &self.client,
                &self.client_id,
                &self.reconnect,
                self.reconnects_used,
                &self.shutdown,
                |attempt| {
                    used = attempt;
                    // Best effort; a full channel only loses the notice.
                    let _ = tx.try_send(ExecutionEvent::Reconnecting {
                        attempt,
                        max_attempts,
                    });
                },
            )
            .await;
            self.reconnects_used = used;

            match restored {
                Some(next) => conn = next,
                None if self.shutdown.is_cancelled() => return,
                None => break,
            }
        }

        self.finish().await;
    }

    /// Read frames until the socket ends or the listener is stopped.
    async fn pump(&mut self, ws: &mut WsStream) -> PumpExit {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => return PumpExit::Stop,
                frame = ws.next() => frame,
            };

            let Some(frame) = frame else {
                tracing::info!(job_id = %self.job_id, "ComfyUI WebSocket stream ended");
                return PumpExit::Closed;
            };

            match frame {
                Ok(Message::Text(text)) => {
                    self.liveness.touch();
                    if let Some(event) = self.interpret(&text) {
                        if !self.emit(event).await {
                            return PumpExit::Stop;
                        }
                    }
                }
                Ok(Message::Binary(_)) => {
                    // Preview images; only their arrival matters.
                    self.liveness.touch();
                    tracing::trace!(job_id = %self.job_id, "Ignoring binary message (preview image)");
                }
                Ok(Message::Ping(_) | Message::Pong(_)) => {
                    self.liveness.touch();
                }
                Ok(Message::Close(frame)) => {
                    tracing::info!(job_id = %self.job_id, ?frame, "ComfyUI WebSocket closed");
                    return PumpExit::Closed;
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    let err = ComfyUIClientError::Protocol(e.to_string());
                    tracing::warn!(job_id = %self.job_id, error = %err, "WebSocket receive error");
                    return PumpExit::Closed;
                }
            }
        }
    }

    /// Turn one text frame into an event for this job, if it is one.
    fn interpret(&mut self, text: &str) -> Option<ExecutionEvent> {
        let message = match parse_message(text) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!(
                    job_id = %self.job_id,
                    error = %e,
                    raw_message = %text,
                    "Skipping unrecognized ComfyUI message",
                );
                return None;
            }
        };

        match normalize(&message, &self.job_id) {
            Normalized::Foreign { prompt_id } => {
                tracing::debug!(
                    job_id = %self.job_id,
                    foreign_prompt_id = %prompt_id,
                    "Discarding frame for another job",
                );
                None
            }
            Normalized::Event(event) => {
                self.started |= event.marks_started();
                self.terminal |= event.is_terminal();
                Some(event)
            }
        }
    }

    /// Forward an event; `false` when the receiver is gone.
    async fn emit(&self, event: ExecutionEvent) -> bool {
        self.tx.send(event).await.is_ok()
    }

    async fn finish(&self) {
        let _ = self.tx.send(ExecutionEvent::EndOfStream).await;
    }
}
