//! Shared event-stream connection with per-prompt fan-out.
//!
//! One reader task owns the socket. Every frame is decoded once and routed
//! through a table keyed by `prompt_id` to the [`Subscription`]s that asked
//! for it. Each subscription has a bounded queue and the reader awaits
//! every send, so a slow consumer slows the reader down instead of losing
//! events.

use futures_util::{Stream, StreamExt};
use std::collections::HashMap;
use std::fmt::{self, Display};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

use crate::error::{ComfyError, Result};
use crate::messages::{decode_event, ServerEvent};
use crate::tracker::{JobState, ProgressState, ProgressTracker};

/// What a [`Subscription`] receives.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(ServerEvent),
    /// Binary frame (latent previews). Only delivered to `subscribe_all`.
    Binary(Vec<u8>),
    /// A frame that could not be decoded. Sent to every subscriber.
    DecodeError(String),
    /// The connection ended; no further items follow.
    Closed(String),
}

/// Bounds on a blocking wait.
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
}

impl WaitOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

struct Route {
    id: u64,
    tx: mpsc::Sender<StreamItem>,
}

#[derive(Default)]
struct Registry {
    jobs: HashMap<String, Vec<Route>>,
    all: Vec<Route>,
    next_id: u64,
    /// Prompt named by the latest `executing` frame with a node.
    running: Option<String>,
    seen_executing: bool,
    closed: Option<String>,
}

impl Registry {
    fn job_senders(&self) -> impl Iterator<Item = &mpsc::Sender<StreamItem>> {
        self.jobs.values().flatten().map(|r| &r.tx)
    }

    fn all_senders(&self) -> impl Iterator<Item = &mpsc::Sender<StreamItem>> {
        self.all.iter().map(|r| &r.tx)
    }

    fn job_route(&self, prompt_id: &str) -> impl Iterator<Item = &mpsc::Sender<StreamItem>> {
        self.jobs.get(prompt_id).into_iter().flatten().map(|r| &r.tx)
    }

    fn observe(&mut self, event: &ServerEvent) {
        if let ServerEvent::Executing(data) = event {
            self.seen_executing = true;
            if data.is_finished() {
                if self.running.as_deref() == Some(data.prompt_id.as_str()) {
                    self.running = None;
                }
            } else {
                self.running = Some(data.prompt_id.clone());
            }
        }
    }

    fn targets(&mut self, item: &StreamItem) -> Vec<mpsc::Sender<StreamItem>> {
        let mut targets: Vec<_> = self.all_senders().cloned().collect();
        match item {
            StreamItem::Event(event) => {
                self.observe(event);
                match event.prompt_id() {
                    Some(id) => targets.extend(self.job_route(id).cloned()),
                    // Bare progress belongs to the running prompt. Before any
                    // `executing` frame it is unknown, so every job gets it.
                    None if matches!(event, ServerEvent::Progress(_)) => match &self.running {
                        Some(running) => targets.extend(self.job_route(running).cloned()),
                        None if !self.seen_executing => {
                            targets.extend(self.job_senders().cloned())
                        }
                        None => {}
                    },
                    None => {}
                }
            }
            StreamItem::DecodeError(_) => targets.extend(self.job_senders().cloned()),
            StreamItem::Binary(_) | StreamItem::Closed(_) => {}
        }
        targets
    }
}

struct Shared {
    registry: Mutex<Registry>,
    capacity: usize,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug, Clone)]
enum RouteKey {
    Job(String, u64),
    All(u64),
}

/// A live event-stream connection shared by any number of trackers.
///
/// Dropping the stream stops the reader task; outstanding subscriptions then
/// observe [`StreamItem::Closed`].
pub struct EventStream {
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl EventStream {
    /// Open a WebSocket connection to `url` (e.g. `ws://host:8188/ws?clientId=x`).
    pub async fn connect(url: &str, capacity: usize, connect_timeout: Duration) -> Result<Self> {
        let connect = tokio_tungstenite::connect_async(url);
        let (ws, _) = tokio::time::timeout(connect_timeout, connect)
            .await
            .map_err(|_| ComfyError::WebSocket(format!("Timed out connecting to {}", url)))?
            .map_err(|e| ComfyError::WebSocket(format!("Failed to connect to {}: {}", url, e)))?;
        tracing::info!(url, "Connected to ComfyUI event stream");
        Ok(Self::from_frames(ws, capacity))
    }

    /// Drive the dispatcher from any frame source. Spawns the reader task on
    /// the current Tokio runtime.
    pub fn from_frames<S, E>(frames: S, capacity: usize) -> Self
    where
        S: Stream<Item = std::result::Result<Message, E>> + Send + Unpin + 'static,
        E: Display + Send + 'static,
    {
        let shared = Arc::new(Shared {
            registry: Mutex::new(Registry::default()),
            capacity: capacity.max(1),
        });
        let cancel = CancellationToken::new();
        tokio::spawn(read_loop(frames, shared.clone(), cancel.clone()));
        Self { shared, cancel }
    }

    /// Receive every event addressed to `prompt_id`, plus bare progress
    /// frames and decode errors.
    pub fn subscribe(&self, prompt_id: &str) -> Result<Subscription> {
        self.register(Some(prompt_id))
    }

    /// Receive every frame regardless of prompt.
    pub fn subscribe_all(&self) -> Result<Subscription> {
        self.register(None)
    }

    /// Whether the reader has stopped.
    pub fn is_closed(&self) -> bool {
        self.shared.lock().closed.is_some()
    }

    /// Stop the reader task. Subscribers observe [`StreamItem::Closed`].
    pub fn close(&self) {
        self.cancel.cancel();
    }

    fn register(&self, prompt_id: Option<&str>) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(self.shared.capacity);
        let mut registry = self.shared.lock();
        if let Some(reason) = &registry.closed {
            return Err(ComfyError::StreamClosed(reason.clone()));
        }
        let id = registry.next_id;
        registry.next_id += 1;
        let key = match prompt_id {
            Some(prompt_id) => {
                registry
                    .jobs
                    .entry(prompt_id.to_string())
                    .or_default()
                    .push(Route { id, tx });
                RouteKey::Job(prompt_id.to_string(), id)
            }
            None => {
                registry.all.push(Route { id, tx });
                RouteKey::All(id)
            }
        };
        Ok(Subscription {
            rx,
            key,
            shared: self.shared.clone(),
        })
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let registry = self.shared.lock();
        f.debug_struct("EventStream")
            .field("jobs", &registry.jobs.len())
            .field("all", &registry.all.len())
            .field("running", &registry.running)
            .field("closed", &registry.closed)
            .finish()
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Receiving end of one registration. Unregisters on drop.
pub struct Subscription {
    rx: mpsc::Receiver<StreamItem>,
    key: RouteKey,
    shared: Arc<Shared>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription").field("key", &self.key).finish()
    }
}

impl Subscription {
    pub fn prompt_id(&self) -> Option<&str> {
        match &self.key {
            RouteKey::Job(id, _) => Some(id),
            RouteKey::All(_) => None,
        }
    }

    /// Next item. Once the stream has ended this keeps returning
    /// [`StreamItem::Closed`].
    pub async fn recv(&mut self) -> StreamItem {
        match self.rx.recv().await {
            Some(item) => item,
            None => StreamItem::Closed(
                self.shared
                    .lock()
                    .closed
                    .clone()
                    .unwrap_or_else(|| "event stream ended".to_string()),
            ),
        }
    }

    /// Feed events into `tracker` until its prompt completes or fails.
    ///
    /// `on_progress` runs after every state change. Returns
    /// [`ComfyError::Execution`] if the prompt failed, and
    /// `StreamClosed`/`Timeout`/`Cancelled` if the wait ended early. The
    /// connection itself is left open in every case.
    pub async fn track<F>(
        &mut self,
        tracker: &mut ProgressTracker,
        opts: &WaitOptions,
        mut on_progress: F,
    ) -> Result<()>
    where
        F: FnMut(&ProgressState),
    {
        let deadline = opts.timeout.map(|t| tokio::time::Instant::now() + t);
        let cancel = opts.cancel.clone().unwrap_or_default();

        loop {
            if let Some(result) = terminal_result(tracker.state()) {
                return result;
            }
            let expired = async {
                match deadline {
                    Some(deadline) => tokio::time::sleep_until(deadline).await,
                    None => std::future::pending().await,
                }
            };
            let item = tokio::select! {
                _ = cancel.cancelled() => return Err(ComfyError::Cancelled),
                _ = expired => return Err(ComfyError::Timeout),
                item = self.recv() => item,
            };
            match item {
                StreamItem::Event(event) => {
                    if tracker.apply(&event) {
                        on_progress(tracker.state());
                    }
                }
                StreamItem::DecodeError(reason) => {
                    tracing::warn!(
                        prompt_id = tracker.prompt_id(),
                        %reason,
                        "Undecodable event while waiting",
                    );
                }
                StreamItem::Binary(_) => {}
                StreamItem::Closed(reason) => return Err(ComfyError::StreamClosed(reason)),
            }
        }
    }
}

fn terminal_result(state: &ProgressState) -> Option<Result<()>> {
    match state.state {
        JobState::Completed => Some(Ok(())),
        JobState::Failed => {
            let data = state.error.clone().unwrap_or_default();
            Some(Err(ComfyError::Execution(Box::new(data))))
        }
        JobState::Idle | JobState::Running => None,
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let mut registry = self.shared.lock();
        match &self.key {
            RouteKey::Job(prompt_id, id) => {
                if let Some(routes) = registry.jobs.get_mut(prompt_id) {
                    routes.retain(|r| r.id != *id);
                    if routes.is_empty() {
                        registry.jobs.remove(prompt_id);
                    }
                }
            }
            RouteKey::All(id) => registry.all.retain(|r| r.id != *id),
        }
    }
}

async fn read_loop<S, E>(mut frames: S, shared: Arc<Shared>, cancel: CancellationToken)
where
    S: Stream<Item = std::result::Result<Message, E>> + Unpin,
    E: Display,
{
    let reason = loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break "event stream closed by client".to_string(),
            frame = frames.next() => frame,
        };
        let item = match frame {
            None => break "connection ended".to_string(),
            Some(Err(e)) => break format!("read error: {}", e),
            Some(Ok(Message::Close(frame))) => {
                break match frame {
                    Some(f) => format!("server closed the connection ({}): {}", f.code, f.reason),
                    None => "server closed the connection".to_string(),
                }
            }
            Some(Ok(Message::Text(text))) => decode_item(text.as_bytes()),
            Some(Ok(Message::Binary(bytes))) => {
                if bytes.first() == Some(&b'{') {
                    decode_item(&bytes)
                } else {
                    StreamItem::Binary(bytes.to_vec())
                }
            }
            Some(Ok(_)) => continue,
        };
        if !dispatch(&shared, item, &cancel).await {
            break "event stream closed by client".to_string();
        }
    };

    tracing::info!(%reason, "ComfyUI event stream stopped");
    let routes = {
        let mut registry = shared.lock();
        registry.closed = Some(reason.clone());
        let mut routes: Vec<Route> = registry.jobs.drain().flat_map(|(_, r)| r).collect();
        routes.append(&mut registry.all);
        routes
    };
    for route in routes {
        // A full queue still sees the channel close once drained.
        let _ = route.tx.try_send(StreamItem::Closed(reason.clone()));
    }
}

fn decode_item(bytes: &[u8]) -> StreamItem {
    match decode_event(bytes) {
        Ok(event) => {
            tracing::debug!(kind = event.kind(), prompt_id = event.prompt_id(), "Event received");
            StreamItem::Event(event)
        }
        Err(e) => {
            tracing::warn!(error = %e, "Failed to decode ComfyUI event");
            StreamItem::DecodeError(e.to_string())
        }
    }
}

/// Returns `false` if cancelled while blocked on a full queue.
async fn dispatch(shared: &Shared, item: StreamItem, cancel: &CancellationToken) -> bool {
    let targets = shared.lock().targets(&item);
    for tx in targets {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            // A dropped receiver just means that subscriber went away.
            _ = tx.send(item.clone()) => {}
        }
    }
    true
}
