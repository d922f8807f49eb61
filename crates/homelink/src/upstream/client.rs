use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::backoff::Backoff;
use super::buffer::MessageBuffer;
use super::transport;
use super::transport::CloseInfo;
use super::transport::ConnectRequest;
use super::transport::Connector;
use super::transport::EventSink;
use super::transport::Link;
use super::transport::LinkEvent;
use crate::bridge::DeviceBridge;
use crate::fulfillment;
use crate::fulfillment::CommandSink;
use crate::metrics::Metric;
use crate::metrics::Metrics;
use crate::metrics::METRICS_DEBOUNCE;
use crate::protocol::decode_server_frame;
use crate::protocol::encode_client;
use crate::protocol::ClientMessage;
use crate::protocol::ServerMessage;
use crate::protocol::Service;
use crate::protocol::SetCharacteristic;
use crate::timer::Timer;

/// How long a connection must stay open before it counts as ready.
pub const CONNECTION_RESET_DELAY: Duration = Duration::from_secs(5);

/// How long shutdown waits for the close handshake.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub url: String,
    pub api_key: String,
    /// Accept self-signed certificates
    pub development: bool,
}

/// Receives every snapshot and status change the client sends upstream.
pub trait MessageObserver: Send + Sync {
    fn observe(&self, message: &ClientMessage);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Open,
    Closing,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStatus {
    pub state: ConnectionState,
    pub ready: bool,
    pub generation: u64,
    pub backoff_attempts: u32,
    pub reconnect_pending: bool,
    pub buffered: usize,
    pub services: usize,
}

#[derive(Debug)]
enum Command {
    Connect,
    Send(ClientMessage),
    Fulfill(SetCharacteristic),
    /// Outcome of the resync started when connection `generation` became ready
    Resynced {
        generation: u64,
        services: Option<Vec<Service>>,
    },
    Status(oneshot::Sender<ClientStatus>),
    Shutdown(oneshot::Sender<()>),
}

/// Cheap handle used to talk to a running [`UpstreamClient`].
#[derive(Debug, Clone)]
pub struct UpstreamHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl UpstreamHandle {
    /// Ask the client to connect. A no-op while connected, connecting or
    /// waiting to reconnect.
    pub fn connect(&self) {
        let _ = self.tx.send(Command::Connect);
    }

    /// Send a message upstream, buffering it while the channel is not ready.
    pub fn send(&self, message: ClientMessage) {
        let _ = self.tx.send(Command::Send(message));
    }

    pub fn fulfill(&self, command: SetCharacteristic) {
        let _ = self.tx.send(Command::Fulfill(command));
    }

    /// None once the client has stopped.
    pub async fn status(&self) -> Option<ClientStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::Status(tx)).ok()?;
        rx.await.ok()
    }

    /// Stop the client and wait until the connection is closed.
    pub async fn shutdown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Command::Shutdown(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl CommandSink for UpstreamHandle {
    fn submit(&self, command: SetCharacteristic) {
        self.fulfill(command);
    }
}

/// Resilient client for the upstream service
///
/// A single task owns the connection, the outbound buffer, the cached service
/// snapshot and the reconnect, reset and metrics timers. Everything else talks
/// to it through an [`UpstreamHandle`].
pub struct UpstreamClient {
    options: ClientOptions,
    connector: Arc<dyn Connector>,
    bridge: Arc<dyn DeviceBridge>,
    metrics: Metrics,
    observer: Option<Arc<dyn MessageObserver>>,

    commands_tx: mpsc::UnboundedSender<Command>,
    commands: mpsc::UnboundedReceiver<Command>,
    events_tx: mpsc::UnboundedSender<(u64, LinkEvent)>,
    events: mpsc::UnboundedReceiver<(u64, LinkEvent)>,

    state: ConnectionState,
    ready: bool,
    /// Whether any connection has been ready before
    was_ready: bool,
    /// Set while the snapshot for a reconnected channel is being fetched
    resyncing: bool,
    /// Device messages sent during a resync, in order
    held: Vec<(ClientMessage, String)>,
    generation: u64,
    link: Option<Link>,
    link_task: Option<JoinHandle<()>>,

    backoff: Backoff,
    buffer: MessageBuffer,
    services: Vec<Service>,

    reconnect_timer: Timer,
    reset_timer: Timer,
    metrics_timer: Timer,
}

impl UpstreamClient {
    pub fn new(
        options: ClientOptions,
        connector: Arc<dyn Connector>,
        bridge: Arc<dyn DeviceBridge>,
        metrics: Metrics,
    ) -> (Self, UpstreamHandle) {
        let (commands_tx, commands) = mpsc::unbounded_channel();
        let (events_tx, events) = mpsc::unbounded_channel();
        let handle = UpstreamHandle {
            tx: commands_tx.clone(),
        };
        let client = Self {
            options,
            connector,
            bridge,
            metrics,
            observer: None,
            commands_tx,
            commands,
            events_tx,
            events,
            state: ConnectionState::Disconnected,
            ready: false,
            was_ready: false,
            resyncing: false,
            held: Vec::new(),
            generation: 0,
            link: None,
            link_task: None,
            backoff: Backoff::default(),
            buffer: MessageBuffer::default(),
            services: Vec::new(),
            reconnect_timer: Timer::default(),
            reset_timer: Timer::default(),
            metrics_timer: Timer::default(),
        };
        (client, handle)
    }

    /// Forward snapshots and status changes to `observer` as they are sent.
    pub fn observe(&mut self, observer: Arc<dyn MessageObserver>) {
        self.observer = Some(observer);
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Run until shut down. Does not connect by itself.
    pub async fn run(mut self) {
        debug!("[upstream] Client task started for {}", self.options.url);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown(done)) => {
                        self.shutdown().await;
                        let _ = done.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some((generation, event)) = self.events.recv() => {
                    self.handle_link_event(generation, event);
                }
                _ = self.reconnect_timer.fired() => self.connect(),
                _ = self.reset_timer.fired() => self.on_ready(),
                _ = self.metrics_timer.fired() => self.push_metrics(),
                _ = self.metrics.changed() => self.metrics_timer.schedule(METRICS_DEBOUNCE),
            }
        }

        debug!("[upstream] Client task stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Connect => self.connect(),
            Command::Send(message) => self.send(message),
            Command::Fulfill(command) => {
                fulfillment::fulfill(&self.services, &self.bridge, &self.metrics, command)
            }
            Command::Resynced {
                generation,
                services,
            } => self.on_resynced(generation, services),
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
            // Handled by the run loop
            Command::Shutdown(_) => {}
        }
    }

    fn connect(&mut self) {
        if self.state != ConnectionState::Disconnected || self.reconnect_timer.is_pending() {
            debug!(
                "[upstream] Ignoring connect while {} (reconnect pending: {})",
                self.state,
                self.reconnect_timer.is_pending()
            );
            return;
        }

        self.generation += 1;
        self.state = ConnectionState::Connecting;
        info!(
            "[upstream] Connecting to {} (generation {})",
            self.options.url, self.generation
        );

        let request = ConnectRequest {
            url: self.options.url.clone(),
            credential: self.options.api_key.clone(),
            accept_invalid_certs: self.options.development,
        };
        let events = EventSink::new(self.generation, self.events_tx.clone());
        self.link_task = Some(transport::spawn_link(
            self.connector.clone(),
            request,
            events,
        ));
    }

    fn handle_link_event(&mut self, generation: u64, event: LinkEvent) {
        if generation != self.generation {
            debug!(
                "[upstream] Discarding event from stale connection {} (current {})",
                generation, self.generation
            );
            if let LinkEvent::Opened(link) = event {
                link.close();
            }
            return;
        }

        match event {
            LinkEvent::Opened(link) => {
                info!("[upstream] Connection open, ready in {:?}", CONNECTION_RESET_DELAY);
                self.state = ConnectionState::Open;
                self.link = Some(link);
                self.metrics.increment(Metric::ConnectionCount);
                self.reset_timer.schedule(CONNECTION_RESET_DELAY);
            }
            LinkEvent::Message(text) => self.receive(&text),
            LinkEvent::Error(e) => {
                warn!("[upstream] Connection error: {}", e);
                self.metrics.increment(Metric::ConnectionErrors);
                if let Some(penalty) = e.penalty() {
                    self.backoff.penalize(penalty);
                }
            }
            LinkEvent::Closed(info) => self.on_closed(info),
        }
    }

    /// The connection stayed open for [`CONNECTION_RESET_DELAY`].
    fn on_ready(&mut self) {
        if self.state != ConnectionState::Open {
            return;
        }

        self.backoff.reset();
        self.ready = true;

        if !self.was_ready {
            self.was_ready = true;
            info!(
                "[upstream] Channel ready, flushing {} buffered messages",
                self.buffer.len()
            );
            self.flush_buffer();
        } else {
            info!("[upstream] Channel ready after reconnect, resynchronising devices");
            self.resync();
        }
    }

    /// Fetch a fresh snapshot and send it as a full `deviceList`.
    fn resync(&mut self) {
        self.resyncing = true;
        let generation = self.generation;
        let bridge = self.bridge.clone();
        let commands = self.commands_tx.clone();
        tokio::spawn(async move {
            let services = match bridge.get_all_services().await {
                Ok(services) => Some(services),
                Err(e) => {
                    warn!("[upstream] Resync failed, flushing buffer instead: {}", e);
                    None
                }
            };
            let _ = commands.send(Command::Resynced {
                generation,
                services,
            });
        });
    }

    fn on_resynced(&mut self, generation: u64, services: Option<Vec<Service>>) {
        if generation != self.generation || !self.resyncing {
            debug!(
                "[upstream] Ignoring resync for connection {} (current {})",
                generation, self.generation
            );
            return;
        }

        self.resyncing = false;
        match services {
            Some(services) => {
                // Changes made while fetching are newer than the snapshot
                let held = std::mem::take(&mut self.held);
                self.send(ClientMessage::DeviceList(services));
                for (message, frame) in held {
                    self.remember(&message);
                    self.buffer.enqueue(frame);
                }
            }
            None => self.release_held(),
        }
        self.flush_buffer();
    }

    /// Queue held messages behind the buffered ones.
    fn release_held(&mut self) {
        for (_, frame) in self.held.drain(..) {
            self.buffer.enqueue(frame);
        }
    }

    fn on_closed(&mut self, info: CloseInfo) {
        self.ready = false;
        self.resyncing = false;
        self.release_held();
        self.link = None;
        self.link_task = None;
        self.state = ConnectionState::Disconnected;
        self.reset_timer.cancel();

        log_close(&info);

        let delay = self.backoff.next_delay();
        self.metrics.increment(Metric::ReconnectAttempts);
        info!(
            "[upstream] Reconnecting in {:?} (attempt {})",
            delay,
            self.backoff.attempts()
        );
        self.reconnect_timer.schedule(delay);
    }

    fn send(&mut self, message: ClientMessage) {
        let frame = match encode_client(&message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("[upstream] Dropping invalid {}: {}", message.kind(), e);
                self.metrics.increment(Metric::InvalidClientMessages);
                return;
            }
        };

        if let ClientMessage::DeviceList(services) = &message {
            if services.is_empty() {
                warn!("[upstream] Sending an empty device list");
            }
        }
        self.remember(&message);

        let device = !matches!(message, ClientMessage::MetricsChange(_));
        if device {
            if let Some(observer) = &self.observer {
                observer.observe(&message);
            }
        }

        if device && self.resyncing {
            debug!("[upstream] Holding {} until the resync finishes", message.kind());
            self.held.push((message, frame));
            self.metrics.increment(Metric::BufferedMessages);
            return;
        }

        // Device frames never overtake frames that are still queued
        if (!device || self.buffer.is_empty()) && self.transmit(&frame) {
            debug!("[upstream] Sent {}", message.kind());
            return;
        }

        match message {
            ClientMessage::MetricsChange(_) => {
                debug!("[upstream] Not ready, dropping metricsChange");
            }
            ClientMessage::DeviceList(_) | ClientMessage::DeviceStatusChange(_) => {
                debug!("[upstream] Buffering {}", message.kind());
                self.buffer.enqueue(frame);
                self.metrics.increment(Metric::BufferedMessages);
            }
        }
    }

    /// Keep the cached snapshot current.
    fn remember(&mut self, message: &ClientMessage) {
        match message {
            ClientMessage::DeviceList(services) => {
                // A full snapshot supersedes anything still queued
                self.buffer.clear();
                self.held.clear();
                self.services = services.clone();
            }
            ClientMessage::DeviceStatusChange(service) => self.patch_service(service),
            ClientMessage::MetricsChange(_) => {}
        }
    }

    /// Write a frame if the channel is ready.
    fn transmit(&self, frame: &str) -> bool {
        match &self.link {
            Some(link) if self.ready => link.send_text(frame),
            _ => false,
        }
    }

    fn flush_buffer(&mut self) {
        let Some(link) = self.link.as_ref() else {
            return;
        };
        let ready = self.ready;
        let delivered = self.buffer.flush(|frame| ready && link.send_text(frame));
        if delivered > 0 {
            debug!("[upstream] Flushed {} buffered messages", delivered);
        }
    }

    /// Most recent snapshot wins; unknown services are appended.
    fn patch_service(&mut self, service: &Service) {
        match self
            .services
            .iter_mut()
            .find(|s| s.unique_id == service.unique_id)
        {
            Some(cached) => *cached = service.clone(),
            None => self.services.push(service.clone()),
        }
    }

    fn push_metrics(&mut self) {
        if !self.ready {
            debug!("[upstream] Not ready, suppressing metricsChange");
            return;
        }
        self.send(ClientMessage::MetricsChange(self.metrics.snapshot()));
    }

    fn receive(&mut self, text: &str) {
        let decoded = match decode_server_frame(text) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!("[upstream] Invalid frame from server: {}", e);
                self.metrics.increment(Metric::InvalidServerMessages);
                return;
            }
        };

        for result in decoded {
            match result {
                Ok(message) => self.dispatch(message),
                Err(e) => {
                    warn!("[upstream] Invalid message from server: {}", e);
                    self.metrics.increment(Metric::InvalidServerMessages);
                }
            }
        }
    }

    fn dispatch(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::SetCharacteristic(command) => {
                fulfillment::fulfill(&self.services, &self.bridge, &self.metrics, command)
            }
            ServerMessage::Notify(data) => info!("[upstream] Notification: {}", data),
        }
    }

    fn status(&self) -> ClientStatus {
        ClientStatus {
            state: self.state,
            ready: self.ready,
            generation: self.generation,
            backoff_attempts: self.backoff.attempts(),
            reconnect_pending: self.reconnect_timer.is_pending(),
            buffered: self.buffer.len() + self.held.len(),
            services: self.services.len(),
        }
    }

    async fn shutdown(&mut self) {
        info!("[upstream] Shutting down");
        self.reconnect_timer.cancel();
        self.reset_timer.cancel();
        self.metrics_timer.cancel();
        self.ready = false;

        if let Some(link) = self.link.take() {
            self.state = ConnectionState::Closing;
            link.close();
        }
        if let Some(mut task) = self.link_task.take() {
            if tokio::time::timeout(SHUTDOWN_GRACE, &mut task).await.is_err() {
                task.abort();
            }
        }
        self.state = ConnectionState::Disconnected;
    }
}

fn log_close(info: &CloseInfo) {
    match info.code {
        1000 | 1012 => info!(
            "[upstream] Connection closed ({}): {}",
            info.code, info.reason
        ),
        1006 => warn!(
            "[upstream] Connection lost abnormally ({}): {}",
            info.code, info.reason
        ),
        1003 | 1009 => error!(
            "[upstream] Server refused our data ({}): {}",
            info.code, info.reason
        ),
        _ => warn!(
            "[upstream] Connection closed with unexpected code {}: {}",
            info.code, info.reason
        ),
    }
}
