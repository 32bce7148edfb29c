//! Resilient Backend Connection
//!
//! `ConnectionManager` owns exactly one logical connection to the chat
//! backend. It re-establishes the transport on a fixed interval after an
//! unexpected close, fans inbound messages and status changes out to
//! observers, and refuses (rather than queues) sends while not connected.
//!
//! Each connect attempt runs on its own driver task tagged with a generation
//! number. Starting a new attempt or disconnecting aborts the previous driver
//! and drops its outbound half, so a stale transport can never report back.

use crate::{message::ChatMessage, observer::Observers};
use async_trait::async_trait;
use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
    time::Duration,
};
use tokio::{
    sync::mpsc,
    task::JoinHandle,
    time::{Instant, MissedTickBehavior},
};
use tracing::{Instrument, debug, info, info_span, warn};

pub const DEFAULT_WS_URL: &str = "ws://localhost:8080/ws";
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(5000);

/// Observable state of the logical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Events a live transport reports back to its owner.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// An inbound text frame.
    Text(String),
    /// A transport-level error. A `Closed` event normally follows.
    Error(String),
    /// The transport is gone.
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("failed to open transport: {0}")]
    Connect(String),
}

/// An open transport. Dropping `sender` closes the connection.
pub struct Transport {
    pub sender: mpsc::UnboundedSender<String>,
    pub events: mpsc::UnboundedReceiver<TransportEvent>,
}

/// Opens transports to the backend.
///
/// `open` resolves only once the transport's open acknowledgment has arrived.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn open(&self, url: &str) -> Result<Transport, TransportError>;
}

#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    pub url: String,
    pub reconnect_interval: Duration,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_WS_URL.to_string(),
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
        }
    }
}

struct LinkState {
    status: ConnectionStatus,
    generation: u64,
    /// Outbound half of the live transport; the only transport handle.
    outbound: Option<mpsc::UnboundedSender<String>>,
    driver: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    /// Identifies the armed reconnect timer.
    reconnect_timer: u64,
    closed_by_user: bool,
}

struct Shared {
    settings: ConnectionSettings,
    connector: Arc<dyn Connector>,
    state: Mutex<LinkState>,
    messages: Observers<ChatMessage>,
    statuses: Observers<ConnectionStatus>,
}

/// Handle to the backend connection. Clones share the same connection.
///
/// All methods must be called from within a Tokio runtime, either flavour.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(settings: ConnectionSettings, connector: Arc<dyn Connector>) -> Self {
        Self {
            shared: Arc::new(Shared {
                settings,
                connector,
                state: Mutex::new(LinkState {
                    status: ConnectionStatus::Disconnected,
                    generation: 0,
                    outbound: None,
                    driver: None,
                    reconnect: None,
                    reconnect_timer: 0,
                    closed_by_user: false,
                }),
                messages: Observers::new(),
                statuses: Observers::new(),
            }),
        }
    }

    /// Tears down any existing transport and starts a new connect attempt.
    /// Returns immediately; the outcome arrives as status notifications.
    pub fn connect(&self) {
        self.shared.start_attempt();
    }

    /// Cancels any pending reconnect, closes the transport and stays
    /// disconnected until the next explicit `connect()`.
    pub fn disconnect(&self) {
        {
            let mut state = self.shared.lock();
            state.closed_by_user = true;
            if let Some(timer) = state.reconnect.take() {
                timer.abort();
            }
            Shared::teardown(&mut state);
            state.generation += 1;
            state.status = ConnectionStatus::Disconnected;
        }
        info!("Disconnected by request.");
        self.shared.statuses.notify(&ConnectionStatus::Disconnected);
    }

    /// Transmits `message` if the connection is open. Never queues.
    pub fn send(&self, message: &ChatMessage) -> bool {
        if let Err(e) = message.validate() {
            warn!(error = %e, "Refusing to send invalid message.");
            return false;
        }
        let state = self.shared.lock();
        let Some(outbound) = state.outbound.as_ref() else {
            debug!(status = ?state.status, "Send refused: no open transport.");
            return false;
        };
        if state.status != ConnectionStatus::Connected {
            debug!(status = ?state.status, "Send refused: not connected.");
            return false;
        }
        let frame = match message.to_wire() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Failed to serialize outbound message.");
                return false;
            }
        };
        outbound.send(frame).is_ok()
    }

    pub fn on_message<F>(&self, handler: F)
    where
        F: Fn(&ChatMessage) + Send + Sync + 'static,
    {
        self.shared.messages.subscribe(handler);
    }

    pub fn on_status_change<F>(&self, handler: F)
    where
        F: Fn(&ConnectionStatus) + Send + Sync + 'static,
    {
        self.shared.statuses.subscribe(handler);
    }

    pub fn status(&self) -> ConnectionStatus {
        self.shared.lock().status
    }

    /// Whether a reconnect timer is currently armed.
    pub fn reconnect_pending(&self) -> bool {
        self.shared.lock().reconnect.is_some()
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, LinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Aborting the driver unbinds the old transport's handlers before the
    /// outbound half is dropped, so its close can't trigger a reconnect.
    fn teardown(state: &mut LinkState) {
        if let Some(driver) = state.driver.take() {
            driver.abort();
        }
        if state.outbound.take().is_some() {
            debug!("Closed previous transport.");
        }
    }

    fn start_attempt(self: &Arc<Self>) {
        let generation = Self::begin_attempt(&mut self.lock());
        self.launch(generation);
    }

    /// Reconnect tick. The check and the new attempt share one lock, so a
    /// concurrent `disconnect()` or a superseded timer can't reconnect.
    fn retry(self: &Arc<Self>, timer: u64) {
        let generation = {
            let mut state = self.lock();
            if state.closed_by_user || state.reconnect.is_none() || state.reconnect_timer != timer
            {
                debug!(timer, "Reconnect timer is no longer armed.");
                return;
            }
            Self::begin_attempt(&mut state)
        };
        info!("Attempting to reconnect...");
        self.launch(generation);
    }

    fn begin_attempt(state: &mut LinkState) -> u64 {
        Self::teardown(state);
        state.generation += 1;
        state.closed_by_user = false;
        state.status = ConnectionStatus::Connecting;
        state.generation
    }

    fn launch(self: &Arc<Self>, generation: u64) {
        info!(url = %self.settings.url, generation, "Connecting...");
        self.statuses.notify(&ConnectionStatus::Connecting);

        let mut state = self.lock();
        // A status handler may have reconnected or disconnected meanwhile.
        if state.generation != generation {
            return;
        }
        let driver = drive(Arc::downgrade(self), generation)
            .instrument(info_span!("transport", generation));
        state.driver = Some(tokio::spawn(driver));
    }

    /// Installs a freshly opened transport if its attempt is still current.
    fn adopt(&self, generation: u64, outbound: mpsc::UnboundedSender<String>) -> bool {
        {
            let mut state = self.lock();
            if state.generation != generation || state.closed_by_user {
                return false;
            }
            state.outbound = Some(outbound);
            state.status = ConnectionStatus::Connected;
            if let Some(timer) = state.reconnect.take() {
                timer.abort();
            }
        }
        info!("Transport connected.");
        self.statuses.notify(&ConnectionStatus::Connected);
        true
    }

    fn dispatch(&self, generation: u64, frame: &str) {
        if self.lock().generation != generation {
            return;
        }
        match ChatMessage::from_wire(frame) {
            Ok(message) => self.messages.notify(&message),
            Err(e) => warn!(error = %e, frame, "Dropping undecodable inbound frame."),
        }
    }

    /// Transport errors only flag the status; the close that follows owns
    /// reconnect scheduling.
    fn fail(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.status = ConnectionStatus::Error;
        }
        self.statuses.notify(&ConnectionStatus::Error);
    }

    fn closed(self: &Arc<Self>, generation: u64) {
        {
            let mut state = self.lock();
            if state.generation != generation {
                return;
            }
            state.outbound = None;
            state.driver = None;
            state.status = ConnectionStatus::Disconnected;
            if !state.closed_by_user {
                self.schedule_reconnect(&mut state);
            }
        }
        info!("Transport disconnected.");
        self.statuses.notify(&ConnectionStatus::Disconnected);
    }

    fn schedule_reconnect(self: &Arc<Self>, state: &mut LinkState) {
        if state.reconnect.is_some() {
            debug!("Reconnect already scheduled.");
            return;
        }
        let period = self.settings.reconnect_interval;
        let link = Arc::downgrade(self);
        state.reconnect_timer += 1;
        let timer = state.reconnect_timer;
        state.reconnect = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(shared) = link.upgrade() else { break };
                shared.retry(timer);
            }
        }));
    }
}

/// Runs one connect attempt and pumps its transport until it closes.
async fn drive(link: Weak<Shared>, generation: u64) {
    let Some(shared) = link.upgrade() else { return };
    let connector = shared.connector.clone();
    let url = shared.settings.url.clone();
    drop(shared);

    let opened = connector.open(&url).await;
    let Some(shared) = link.upgrade() else { return };
    let mut events = match opened {
        Ok(Transport { sender, events }) => {
            if !shared.adopt(generation, sender) {
                return;
            }
            events
        }
        Err(e) => {
            warn!(error = %e, "Connect attempt failed.");
            shared.fail(generation);
            shared.closed(generation);
            return;
        }
    };
    drop(shared);

    while let Some(event) = events.recv().await {
        let Some(shared) = link.upgrade() else { return };
        match event {
            TransportEvent::Text(frame) => shared.dispatch(generation, &frame),
            TransportEvent::Error(reason) => {
                warn!(%reason, "Transport error.");
                shared.fail(generation);
            }
            TransportEvent::Closed => break,
        }
    }

    if let Some(shared) = link.upgrade() {
        shared.closed(generation);
    }
}
