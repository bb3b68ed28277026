// Draft connection manager.
//
// A single task owns every piece of mutable sync state and processes user
// commands, transport events and the reconnect timer one at a time. Each
// socket is pumped by its own task that tags what it reports with a
// connection generation; anything from an older generation is discarded, so
// a torn-down socket can never feed the next draft.

mod backoff;
mod endpoint;
mod transport;

#[cfg(test)]
mod tests;

pub use backoff::{
    ReconnectPolicy, DEFAULT_BASE_DELAY, DEFAULT_JITTER, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
};
pub use endpoint::{
    http_origin, socket_origin, DraftFlavor, Endpoint, EndpointError, HeroDraft, TeamDraft,
};
pub use transport::{
    Connector, Inbound, Socket, TransportError, TungsteniteConnector, TungsteniteSocket,
    ABNORMAL_CLOSURE, CONNECT_TIMEOUT, NORMAL_CLOSURE, NO_STATUS,
};

use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Sleep;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::event_log::{Appended, BackfillOrder, EventLog};
use crate::protocol::{DraftEvent, DraftId, DraftSnapshot, InboundFrame};
use crate::reconcile::{Reconciler, Reconciliation};
use crate::subscription::{Subscriber, SubscriberRegistry, Subscription};

// ---------------------------------------------------------------------------
// Public state types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
        })
    }
}

/// Transport status of the owned draft connection.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConnectionState {
    pub draft_id: Option<DraftId>,
    pub status: ConnectionStatus,
    /// Last transport error; cleared on a successful connect.
    pub error: Option<String>,
    pub reconnect_attempts: u32,
}

/// Read model published after every change to the log or snapshot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DraftView {
    pub draft_id: Option<DraftId>,
    /// Most recent first.
    pub events: Vec<DraftEvent>,
    pub has_new_event: bool,
    pub snapshot: Option<DraftSnapshot>,
    pub is_draft_completed: bool,
    pub users_remaining_count: usize,
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub reconnect: ReconnectPolicy,
    pub backfill_order: BackfillOrder,
    /// Upper bound on waiting for a socket to finish closing before the next
    /// one is opened.
    pub close_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            reconnect: ReconnectPolicy::default(),
            backfill_order: BackfillOrder::default(),
            close_timeout: Duration::from_secs(2),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal messages
// ---------------------------------------------------------------------------

enum Command {
    Connect(DraftId),
    Disconnect { draft_id: DraftId, reason: String },
    MarkViewed,
    ApplySnapshot { draft_id: DraftId, snapshot: DraftSnapshot },
    Shutdown(oneshot::Sender<()>),
}

#[derive(Debug)]
struct TransportEvent {
    generation: u64,
    kind: TransportEventKind,
}

#[derive(Debug)]
enum TransportEventKind {
    Opened,
    Frame(String),
    Error(String),
    Closed { code: u16, reason: String },
}

struct CloseRequest {
    code: u16,
    reason: String,
}

// ---------------------------------------------------------------------------
// DraftSync handle
// ---------------------------------------------------------------------------

/// Owns the live connection to at most one draft and everything derived
/// from it. Construct one per consumer context; dropping it aborts the
/// background task and closes the socket.
pub struct DraftSync {
    commands: mpsc::UnboundedSender<Command>,
    connection: watch::Receiver<ConnectionState>,
    view: watch::Receiver<DraftView>,
    registry: SubscriberRegistry,
    task: Option<JoinHandle<()>>,
}

impl DraftSync {
    /// Spawn the manager task. Must be called inside a tokio runtime.
    pub fn new(endpoint: Endpoint, connector: Arc<dyn Connector>, options: SyncOptions) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let registry = SubscriberRegistry::new();
        let (engine, connection, view) =
            Engine::new(endpoint, connector, options, registry.clone(), transport_tx);
        let task = tokio::spawn(engine.run(command_rx, transport_rx));

        Self {
            commands,
            connection,
            view,
            registry,
            task: Some(task),
        }
    }

    /// Manager over real WebSocket connections.
    pub fn with_tungstenite(endpoint: Endpoint, options: SyncOptions) -> Self {
        Self::new(endpoint, Arc::new(TungsteniteConnector), options)
    }

    /// Start syncing `draft_id`. No-op when already connecting, connected or
    /// reconnecting to it; a different draft is closed first.
    pub fn connect(&self, draft_id: DraftId) {
        self.send(Command::Connect(draft_id));
    }

    /// Close the connection to `draft_id` intentionally. Cancels any pending
    /// reconnect and drops that draft's subscribers.
    pub fn disconnect(&self, draft_id: DraftId, reason: impl Into<String>) {
        self.send(Command::Disconnect {
            draft_id,
            reason: reason.into(),
        });
    }

    /// Clear the "has new event" flag.
    pub fn mark_viewed(&self) {
        self.send(Command::MarkViewed);
    }

    /// Feed in a snapshot fetched out of band after a refresh request.
    pub fn apply_snapshot(&self, draft_id: DraftId, snapshot: DraftSnapshot) {
        self.send(Command::ApplySnapshot { draft_id, snapshot });
    }

    pub fn subscribe(&self, draft_id: DraftId, subscriber: Subscriber) -> Subscription {
        self.registry.subscribe(draft_id, subscriber)
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.borrow().clone()
    }

    pub fn watch_connection(&self) -> watch::Receiver<ConnectionState> {
        self.connection.clone()
    }

    pub fn view(&self) -> DraftView {
        self.view.borrow().clone()
    }

    pub fn watch_view(&self) -> watch::Receiver<DraftView> {
        self.view.clone()
    }

    /// Close the owned connection and stop the manager task.
    pub async fn shutdown(mut self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack_tx)).is_ok() {
            let _ = ack_rx.await;
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                warn!("Draft sync task join error during shutdown: {e}");
            }
        }
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            warn!("Draft sync task is no longer running; command dropped");
        }
    }
}

impl Drop for DraftSync {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            debug!("DraftSync dropped, aborting manager task");
            task.abort();
        }
    }
}

// ---------------------------------------------------------------------------
// Engine (runs inside the manager task)
// ---------------------------------------------------------------------------

struct ActiveConnection {
    generation: u64,
    close_tx: Option<oneshot::Sender<CloseRequest>>,
    task: JoinHandle<()>,
}

impl ActiveConnection {
    /// Ask the pump to close with 1000 and wait for it to finish.
    async fn close(mut self, reason: &str, wait: Duration) {
        if let Some(close_tx) = self.close_tx.take() {
            let _ = close_tx.send(CloseRequest {
                code: NORMAL_CLOSURE,
                reason: reason.to_string(),
            });
        }
        if tokio::time::timeout(wait, &mut self.task).await.is_err() {
            warn!(
                generation = self.generation,
                "Socket did not close within {wait:?}; aborting"
            );
            self.task.abort();
        }
    }
}

struct Engine {
    endpoint: Endpoint,
    connector: Arc<dyn Connector>,
    options: SyncOptions,
    registry: SubscriberRegistry,
    state_tx: watch::Sender<ConnectionState>,
    view_tx: watch::Sender<DraftView>,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
    draft_id: Option<DraftId>,
    generation: u64,
    connection: Option<ActiveConnection>,
    reconnect_timer: Option<Pin<Box<Sleep>>>,
    attempts: u32,
    log: EventLog,
    reconciler: Reconciler,
}

impl Engine {
    fn new(
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        options: SyncOptions,
        registry: SubscriberRegistry,
        transport_tx: mpsc::UnboundedSender<TransportEvent>,
    ) -> (
        Self,
        watch::Receiver<ConnectionState>,
        watch::Receiver<DraftView>,
    ) {
        let (state_tx, connection) = watch::channel(ConnectionState::default());
        let (view_tx, view) = watch::channel(DraftView::default());
        let engine = Self {
            endpoint,
            connector,
            options,
            registry,
            state_tx,
            view_tx,
            transport_tx,
            draft_id: None,
            generation: 0,
            connection: None,
            reconnect_timer: None,
            attempts: 0,
            log: EventLog::new(),
            reconciler: Reconciler::new(),
        };
        (engine, connection, view)
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut transport: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        info!("Draft sync task started ({})", self.endpoint.flavor().name());

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Connect(draft_id)) => self.connect(draft_id).await,
                    Some(Command::Disconnect { draft_id, reason }) => {
                        self.disconnect(draft_id, &reason).await;
                    }
                    Some(Command::MarkViewed) => self.mark_viewed(),
                    Some(Command::ApplySnapshot { draft_id, snapshot }) => {
                        self.apply_snapshot(draft_id, snapshot);
                    }
                    Some(Command::Shutdown(ack)) => {
                        self.teardown("client shutdown").await;
                        let _ = ack.send(());
                        break;
                    }
                    None => {
                        info!("Command channel closed, shutting down");
                        self.teardown("client dropped").await;
                        break;
                    }
                },

                Some(event) = transport.recv() => self.on_transport(event),

                () = reconnect_due(&mut self.reconnect_timer) => self.on_reconnect_due(),
            }
        }

        info!("Draft sync task exiting");
    }

    fn status(&self) -> ConnectionStatus {
        self.state_tx.borrow().status
    }

    async fn connect(&mut self, draft_id: DraftId) {
        if self.draft_id == Some(draft_id) && self.status() != ConnectionStatus::Disconnected {
            debug!(%draft_id, status = %self.status(), "Connect ignored; draft already owned");
            return;
        }

        if let Some(previous) = self.draft_id.filter(|id| *id != draft_id) {
            info!(from = %previous, to = %draft_id, "Switching drafts");
            self.teardown("switching drafts").await;
        }

        self.draft_id = Some(draft_id);
        self.attempts = 0;
        self.reconnect_timer = None;
        self.open();
    }

    async fn disconnect(&mut self, draft_id: DraftId, reason: &str) {
        if self.draft_id != Some(draft_id) {
            debug!(%draft_id, "Disconnect ignored; draft not owned");
            return;
        }
        info!(%draft_id, reason, "Disconnecting from draft");
        self.teardown(reason).await;
    }

    /// Intentional close: cancel the timer, close with 1000, forget the
    /// draft and its subscribers, and publish the initial state.
    async fn teardown(&mut self, reason: &str) {
        self.reconnect_timer = None;
        // Anything the old pump still has in flight is now stale.
        self.generation += 1;

        if let Some(connection) = self.connection.take() {
            connection.close(reason, self.options.close_timeout).await;
        }
        if let Some(draft_id) = self.draft_id.take() {
            let removed = self.registry.clear_draft(draft_id);
            debug!(%draft_id, removed, "Cleared draft subscribers");
        }

        self.attempts = 0;
        self.log.reset();
        self.reconciler.reset();
        self.state_tx.send_replace(ConnectionState::default());
        self.view_tx.send_replace(DraftView::default());
    }

    fn open(&mut self) {
        let Some(draft_id) = self.draft_id else {
            return;
        };

        let url = match self.endpoint.url(draft_id) {
            Ok(url) => url,
            Err(e) => {
                error!(%draft_id, "Cannot build socket URL: {e}");
                self.state_tx.send_modify(|s| {
                    s.draft_id = Some(draft_id);
                    s.status = ConnectionStatus::Disconnected;
                    s.error = Some(e.to_string());
                });
                return;
            }
        };

        if let Some(stale) = self.connection.take() {
            stale.task.abort();
        }

        self.generation += 1;
        let generation = self.generation;
        info!(%draft_id, %url, attempt = self.attempts, "Connecting to draft socket");

        let (close_tx, close_rx) = oneshot::channel();
        let task = tokio::spawn(pump(
            generation,
            url,
            self.connector.clone(),
            close_rx,
            self.transport_tx.clone(),
        ));
        self.connection = Some(ActiveConnection {
            generation,
            close_tx: Some(close_tx),
            task,
        });

        self.state_tx.send_modify(|s| {
            s.draft_id = Some(draft_id);
            s.status = ConnectionStatus::Connecting;
        });
    }

    fn on_transport(&mut self, event: TransportEvent) {
        if event.generation != self.generation {
            debug!(
                generation = event.generation,
                current = self.generation,
                "Dropping event from stale connection"
            );
            return;
        }
        let Some(draft_id) = self.draft_id else {
            return;
        };

        match event.kind {
            TransportEventKind::Opened => {
                info!(%draft_id, "Draft socket connected");
                self.attempts = 0;
                self.state_tx.send_modify(|s| {
                    s.status = ConnectionStatus::Connected;
                    s.error = None;
                    s.reconnect_attempts = 0;
                });
            }
            TransportEventKind::Frame(text) => self.ingest(draft_id, &text),
            TransportEventKind::Error(message) => {
                warn!(%draft_id, "Draft socket error: {message}");
                self.state_tx.send_modify(|s| s.error = Some(message));
            }
            TransportEventKind::Closed { code, reason } => {
                // The pump has already returned.
                self.connection = None;
                if code == NORMAL_CLOSURE {
                    info!(%draft_id, %reason, "Draft socket closed normally by server");
                    self.state_tx.send_modify(|s| {
                        s.status = ConnectionStatus::Disconnected;
                        s.reconnect_attempts = 0;
                    });
                } else {
                    warn!(%draft_id, code, %reason, "Draft socket closed unexpectedly");
                    self.schedule_reconnect();
                }
            }
        }
    }

    fn schedule_reconnect(&mut self) {
        self.attempts += 1;
        let attempt = self.attempts;
        let policy = &self.options.reconnect;

        if policy.is_exhausted(attempt) {
            let message = format!("gave up after {} reconnect attempts", attempt - 1);
            error!(draft_id = ?self.draft_id, "{message}");
            self.attempts = attempt - 1;
            self.state_tx.send_modify(|s| {
                s.status = ConnectionStatus::Disconnected;
                s.error = Some(message);
            });
            return;
        }

        let delay = policy.delay_for(attempt);
        warn!(draft_id = ?self.draft_id, attempt, ?delay, "Scheduling reconnect");
        self.reconnect_timer = Some(Box::pin(tokio::time::sleep(delay)));
        self.state_tx.send_modify(|s| {
            s.status = ConnectionStatus::Reconnecting;
            s.reconnect_attempts = attempt;
        });
    }

    fn on_reconnect_due(&mut self) {
        self.reconnect_timer = None;
        if self.draft_id.is_some() {
            self.open();
        }
    }

    /// Event Log Reducer + State Reconciler + fan-out for one frame.
    fn ingest(&mut self, draft_id: DraftId, text: &str) {
        let frame = match self.endpoint.flavor().decode(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%draft_id, "Dropping frame: {e}");
                return;
            }
        };

        match frame {
            InboundFrame::InitialEvents { events } => {
                let kept = self.log.replace(events, self.options.backfill_order);
                info!(%draft_id, kept, "Received event backfill");
                self.publish_view();
            }
            InboundFrame::DraftEvent { event, draft_state } => {
                if self.log.push(event.clone()) == Appended::Duplicate {
                    debug!(%draft_id, event_id = %event.id, "Ignoring duplicate event");
                    return;
                }

                let outcome = self.reconciler.reconcile(&event, draft_state);
                debug!(
                    %draft_id,
                    event_id = %event.id,
                    event_type = %event.event_type(),
                    ?outcome,
                    "Applied draft event"
                );
                self.publish_view();

                self.registry.dispatch_event(draft_id, &event);
                if let Some(text) = event.notification_text() {
                    self.registry.dispatch_notification(draft_id, &text);
                }
                match outcome {
                    Reconciliation::Applied => {
                        if let Some(snapshot) = self.reconciler.snapshot() {
                            self.registry.dispatch_snapshot(draft_id, snapshot);
                        }
                    }
                    Reconciliation::RefreshNeeded => {
                        self.registry.dispatch_refresh_needed(draft_id, &event);
                    }
                    Reconciliation::Unchanged => {}
                }
            }
        }
    }

    fn mark_viewed(&mut self) {
        if self.log.has_new_event() {
            self.log.mark_viewed();
            self.publish_view();
        }
    }

    fn apply_snapshot(&mut self, draft_id: DraftId, snapshot: DraftSnapshot) {
        if self.draft_id != Some(draft_id) {
            debug!(%draft_id, "Snapshot ignored; draft not owned");
            return;
        }
        self.reconciler.apply(snapshot);
        self.publish_view();
        if let Some(snapshot) = self.reconciler.snapshot() {
            self.registry.dispatch_snapshot(draft_id, snapshot);
        }
    }

    fn publish_view(&self) {
        self.view_tx.send_replace(DraftView {
            draft_id: self.draft_id,
            events: self.log.events().to_vec(),
            has_new_event: self.log.has_new_event(),
            snapshot: self.reconciler.snapshot().cloned(),
            is_draft_completed: self.reconciler.is_draft_completed(),
            users_remaining_count: self.reconciler.users_remaining_count(),
        });
    }
}

async fn reconnect_due(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(sleep) => sleep.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Open one socket and forward what it produces until it closes or a close
/// is requested.
async fn pump(
    generation: u64,
    url: Url,
    connector: Arc<dyn Connector>,
    mut close_rx: oneshot::Receiver<CloseRequest>,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let emit = |kind: TransportEventKind| {
        let _ = events.send(TransportEvent { generation, kind });
    };

    let mut socket = tokio::select! {
        _ = &mut close_rx => {
            debug!(%url, "Close requested before the socket opened");
            return;
        }
        result = connector.connect(&url) => match result {
            Ok(socket) => socket,
            Err(e) => {
                emit(TransportEventKind::Error(e.to_string()));
                emit(TransportEventKind::Closed {
                    code: ABNORMAL_CLOSURE,
                    reason: "connection failed".into(),
                });
                return;
            }
        },
    };
    emit(TransportEventKind::Opened);

    loop {
        tokio::select! {
            request = &mut close_rx => {
                let request = request.unwrap_or_else(|_| CloseRequest {
                    code: NORMAL_CLOSURE,
                    reason: "client dropped".into(),
                });
                if let Err(e) = socket.close(request.code, &request.reason).await {
                    debug!(%url, "Error while closing socket: {e}");
                }
                return;
            }
            inbound = socket.recv() => match inbound {
                Some(Ok(Inbound::Text(text))) => emit(TransportEventKind::Frame(text)),
                Some(Ok(Inbound::Closed { code, reason })) => {
                    emit(TransportEventKind::Closed { code, reason });
                    return;
                }
                Some(Err(e)) => {
                    emit(TransportEventKind::Error(e.to_string()));
                    emit(TransportEventKind::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "transport error".into(),
                    });
                    return;
                }
                None => {
                    emit(TransportEventKind::Closed {
                        code: ABNORMAL_CLOSURE,
                        reason: "stream ended".into(),
                    });
                    return;
                }
            },
        }
    }
}
