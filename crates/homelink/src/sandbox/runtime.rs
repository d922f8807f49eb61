use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufReader;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tracing::debug;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::launcher::Launcher;
use super::launcher::ProcessGuard;
use super::launcher::ScriptProcess;
use super::launcher::ScriptStdin;
use super::launcher::ScriptStdout;
use super::protocol::decode_line;
use super::protocol::encode_line;
use super::protocol::HostMessage;
use super::protocol::LogLevel;
use super::protocol::ScriptMessage;
use crate::fulfillment::CommandSink;
use crate::metrics::Metric;
use crate::metrics::Metrics;
use crate::protocol::decode_server_value;
use crate::protocol::envelope_value;
use crate::protocol::ClientMessage;
use crate::protocol::ServerMessage;
use crate::timer::Timer;
use crate::upstream::MessageObserver;

/// How long dispose waits for the script to exit on its own.
const DISPOSE_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct SandboxOptions {
    /// Limit for compiling and running the script's top level
    pub compile_timeout: Duration,
    /// Limit for one `handleMessage` call
    pub call_timeout: Duration,
    /// Restarts allowed after crashes or timeouts
    pub max_restarts: u32,
}

impl Default for SandboxOptions {
    fn default() -> Self {
        Self {
            compile_timeout: Duration::from_secs(10),
            call_timeout: Duration::from_secs(5),
            max_restarts: 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SandboxState {
    Uncompiled,
    Compiled,
    Running,
    CompileFailed,
    /// Gave up after too many restarts
    Exhausted,
    Disposed,
}

impl SandboxState {
    /// No further messages will be handled.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SandboxState::CompileFailed | SandboxState::Exhausted | SandboxState::Disposed
        )
    }
}

#[derive(Debug)]
enum Request {
    Deliver(serde_json::Value),
    Dispose(oneshot::Sender<()>),
}

#[derive(Debug)]
enum ScriptEvent {
    Message(ScriptMessage),
    Invalid(String),
    Exited,
}

/// Handle to a running sandbox.
///
/// Delivering never blocks; messages are queued for the sandbox task.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    tx: mpsc::UnboundedSender<Request>,
    state: watch::Receiver<SandboxState>,
}

impl SandboxHandle {
    pub fn deliver(&self, message: &ClientMessage) {
        match envelope_value(message) {
            Ok(value) => {
                let _ = self.tx.send(Request::Deliver(value));
            }
            Err(e) => warn!("[automation] Not delivering invalid {}: {}", message.kind(), e),
        }
    }

    pub fn state(&self) -> SandboxState {
        *self.state.borrow()
    }

    /// Wait until the sandbox reaches a state matching `predicate`.
    pub async fn wait_for(&self, predicate: impl Fn(SandboxState) -> bool) -> SandboxState {
        let mut state = self.state.clone();
        let reached = state.wait_for(|s| predicate(*s)).await.map(|s| *s);
        reached.unwrap_or_else(|_| *state.borrow())
    }

    /// Stop the script and wait for it to exit.
    pub async fn dispose(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(Request::Dispose(tx)).is_ok() {
            let _ = rx.await;
        }
    }
}

impl MessageObserver for SandboxHandle {
    fn observe(&self, message: &ClientMessage) {
        match message {
            ClientMessage::DeviceList(_) | ClientMessage::DeviceStatusChange(_) => {
                self.deliver(message)
            }
            ClientMessage::MetricsChange(_) => {}
        }
    }
}

/// One running copy of the script process.
struct Incarnation {
    id: u64,
    writer: mpsc::UnboundedSender<String>,
    guard: ProcessGuard,
}

/// Runs a user automation script in an isolated process
///
/// A single task owns the process, the queue of unanswered calls and the
/// compile/call deadline. Crashes and timeouts restart the process up to
/// `max_restarts` times, replaying the last device list each time.
pub struct Sandbox {
    source: String,
    launcher: Arc<dyn Launcher>,
    sink: Arc<dyn CommandSink>,
    metrics: Metrics,
    options: SandboxOptions,

    requests: mpsc::UnboundedReceiver<Request>,
    state: watch::Sender<SandboxState>,
    events_tx: mpsc::UnboundedSender<(u64, ScriptEvent)>,
    events: mpsc::UnboundedReceiver<(u64, ScriptEvent)>,

    incarnation: Option<Incarnation>,
    next_incarnation: u64,
    compiling: bool,
    restarts: u32,
    seq: u64,
    /// Sequence numbers sent but not yet answered, oldest first
    in_flight: VecDeque<u64>,
    /// Messages received before the script was ready
    pending: VecDeque<serde_json::Value>,
    last_device_list: Option<serde_json::Value>,
    deadline: Timer,
}

impl Sandbox {
    pub fn new(
        source: String,
        launcher: Arc<dyn Launcher>,
        sink: Arc<dyn CommandSink>,
        metrics: Metrics,
        options: SandboxOptions,
    ) -> (Self, SandboxHandle) {
        let (tx, requests) = mpsc::unbounded_channel();
        let (state, state_rx) = watch::channel(SandboxState::Uncompiled);
        let (events_tx, events) = mpsc::unbounded_channel();
        let sandbox = Self {
            source,
            launcher,
            sink,
            metrics,
            options,
            requests,
            state,
            events_tx,
            events,
            incarnation: None,
            next_incarnation: 0,
            compiling: false,
            restarts: 0,
            seq: 0,
            in_flight: VecDeque::new(),
            pending: VecDeque::new(),
            last_device_list: None,
            deadline: Timer::default(),
        };
        let handle = SandboxHandle {
            tx,
            state: state_rx,
        };
        (sandbox, handle)
    }

    pub fn spawn(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(self.run())
    }

    /// Compile the script, then handle messages until disposed.
    pub async fn run(mut self) {
        self.start().await;

        loop {
            tokio::select! {
                request = self.requests.recv() => match request {
                    Some(Request::Deliver(message)) => self.deliver(message),
                    Some(Request::Dispose(done)) => {
                        self.dispose().await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        self.dispose().await;
                        break;
                    }
                },
                Some((id, event)) = self.events.recv() => self.handle_event(id, event).await,
                _ = self.deadline.fired() => self.on_deadline().await,
            }
        }

        debug!("[automation] Sandbox task stopped");
    }

    fn current_state(&self) -> SandboxState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SandboxState) {
        self.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("[automation] {} -> {}", current, state);
            *current = state;
            true
        });
    }

    /// Launch a new script process and wait for it to report ready.
    async fn start(&mut self) {
        let process = match self.launcher.launch(&self.source).await {
            Ok(process) => process,
            Err(e) => {
                error!("[automation] Failed to start script: {}", e);
                if self.restarts == 0 {
                    self.set_state(SandboxState::CompileFailed);
                } else {
                    self.set_state(SandboxState::Exhausted);
                }
                return;
            }
        };

        self.next_incarnation += 1;
        let ScriptProcess {
            stdin,
            stdout,
            guard,
        } = process;
        let id = self.next_incarnation;
        tokio::spawn(read_script(id, stdout, self.events_tx.clone()));
        let (writer, lines) = mpsc::unbounded_channel();
        tokio::spawn(write_script(stdin, lines));

        self.incarnation = Some(Incarnation { id, writer, guard });
        self.compiling = true;
        self.deadline.schedule(self.options.compile_timeout);
    }

    fn deliver(&mut self, message: serde_json::Value) {
        let state = self.current_state();
        if state.is_terminal() {
            debug!("[automation] Dropping message while {}", state);
            return;
        }

        if message.get("type").and_then(|t| t.as_str()) == Some("deviceList") {
            self.last_device_list = Some(message.clone());
        }

        if self.compiling || self.incarnation.is_none() {
            self.pending.push_back(message);
        } else {
            self.call(message);
        }
    }

    /// Send one `handleMessage` call to the script.
    fn call(&mut self, message: serde_json::Value) {
        let Some(incarnation) = self.incarnation.as_ref() else {
            return;
        };

        self.seq += 1;
        let line = match encode_line(&HostMessage::HandleMessage {
            seq: self.seq,
            message,
        }) {
            Ok(line) => line,
            Err(e) => {
                warn!("[automation] Failed to encode message: {}", e);
                return;
            }
        };
        if incarnation.writer.send(line).is_err() {
            debug!("[automation] Script input closed, dropping call {}", self.seq);
            return;
        }

        if self.in_flight.is_empty() {
            self.deadline.schedule(self.options.call_timeout);
        }
        self.in_flight.push_back(self.seq);
        self.set_state(SandboxState::Running);
    }

    async fn handle_event(&mut self, id: u64, event: ScriptEvent) {
        if self.incarnation.as_ref().map(|i| i.id) != Some(id) {
            debug!("[automation] Ignoring event from stopped script {}", id);
            return;
        }

        match event {
            ScriptEvent::Message(message) => self.handle_message(message),
            ScriptEvent::Invalid(line) => {
                warn!("[automation] Invalid message from script: {}", line);
                self.metrics.increment(Metric::InvalidAutomationMessages);
            }
            ScriptEvent::Exited => self.on_exit().await,
        }
    }

    fn handle_message(&mut self, message: ScriptMessage) {
        match message {
            ScriptMessage::Ready if self.compiling => self.on_ready(),
            ScriptMessage::Ready => {
                warn!("[automation] Unexpected ready message");
                self.metrics.increment(Metric::InvalidAutomationMessages);
            }
            ScriptMessage::CompileError { error } => {
                error!("[automation] Script failed to compile: {}", error);
                self.stop_process();
                self.set_state(SandboxState::CompileFailed);
            }
            ScriptMessage::Done { seq } => self.complete(seq),
            ScriptMessage::Failed { seq, error } => {
                warn!("[automation] Script threw while handling message {}: {}", seq, error);
                self.metrics.increment(Metric::AutomationErrors);
                self.complete(seq);
            }
            ScriptMessage::Uncaught { error } => {
                warn!("[automation] Uncaught error in script: {}", error);
                self.metrics.increment(Metric::AutomationErrors);
            }
            ScriptMessage::Host { message } => self.on_host_message(message),
            ScriptMessage::Log { level, message } => match level {
                LogLevel::Debug => debug!("[automation] {}", message),
                LogLevel::Info => info!("[automation] {}", message),
                LogLevel::Warning => warn!("[automation] {}", message),
                LogLevel::Error => error!("[automation] {}", message),
            },
        }
    }

    fn on_ready(&mut self) {
        self.compiling = false;
        self.deadline.cancel();
        if self.restarts == 0 {
            info!("[automation] Script compiled");
        } else {
            info!("[automation] Script restarted ({}/{})", self.restarts, self.options.max_restarts);
        }
        self.set_state(SandboxState::Compiled);

        while let Some(message) = self.pending.pop_front() {
            self.call(message);
        }
    }

    /// A call finished, successfully or not.
    fn complete(&mut self, seq: u64) {
        let Some(position) = self.in_flight.iter().position(|s| *s == seq) else {
            warn!("[automation] Completion for unknown message {}", seq);
            self.metrics.increment(Metric::InvalidAutomationMessages);
            return;
        };
        self.in_flight.remove(position);

        // The deadline always belongs to the oldest unanswered call
        if position == 0 {
            if self.in_flight.is_empty() {
                self.deadline.cancel();
            } else {
                self.deadline.schedule(self.options.call_timeout);
            }
        }
    }

    fn on_host_message(&mut self, message: serde_json::Value) {
        match decode_server_value(message) {
            Ok(ServerMessage::SetCharacteristic(command)) => {
                debug!(
                    "[automation] Script set {}.{} = {}",
                    command.service_id, command.iid, command.value
                );
                self.sink.submit(command);
            }
            Ok(other) => {
                warn!("[automation] Script sent unsupported message {:?}", other);
                self.metrics.increment(Metric::InvalidAutomationMessages);
            }
            Err(e) => {
                warn!("[automation] Script sent invalid message: {}", e);
                self.metrics.increment(Metric::InvalidAutomationMessages);
            }
        }
    }

    async fn on_deadline(&mut self) {
        if self.compiling {
            error!(
                "[automation] Script did not compile within {:?}",
                self.options.compile_timeout
            );
            self.stop_process();
            self.set_state(SandboxState::CompileFailed);
            return;
        }

        warn!(
            "[automation] Script did not handle message within {:?}",
            self.options.call_timeout
        );
        self.metrics.increment(Metric::AutomationTimeouts);
        self.restart().await;
    }

    async fn on_exit(&mut self) {
        if self.compiling {
            error!("[automation] Script exited before it was ready");
            self.stop_process();
            self.set_state(SandboxState::CompileFailed);
            return;
        }

        error!("[automation] Script process exited unexpectedly");
        self.metrics.increment(Metric::AutomationCrashes);
        self.restart().await;
    }

    fn stop_process(&mut self) {
        if let Some(mut incarnation) = self.incarnation.take() {
            incarnation.guard.kill();
        }
        self.compiling = false;
        self.deadline.cancel();
        if !self.in_flight.is_empty() {
            debug!("[automation] Abandoning {} unanswered calls", self.in_flight.len());
            self.in_flight.clear();
        }
    }

    async fn restart(&mut self) {
        self.stop_process();

        if self.restarts >= self.options.max_restarts {
            error!(
                "[automation] Giving up after {} restarts, automations disabled",
                self.restarts
            );
            self.pending.clear();
            self.set_state(SandboxState::Exhausted);
            return;
        }

        self.restarts += 1;
        warn!(
            "[automation] Restarting script ({}/{})",
            self.restarts, self.options.max_restarts
        );
        if let Some(list) = self.last_device_list.clone() {
            self.pending.push_front(list);
        }
        self.start().await;
    }

    async fn dispose(&mut self) {
        if let Some(mut incarnation) = self.incarnation.take() {
            if let Ok(line) = encode_line(&HostMessage::Shutdown) {
                let _ = incarnation.writer.send(line);
            }

            let id = incarnation.id;
            let exited = tokio::time::timeout(DISPOSE_GRACE, async {
                while let Some((from, event)) = self.events.recv().await {
                    if from == id && matches!(event, ScriptEvent::Exited) {
                        return;
                    }
                }
            })
            .await;
            if exited.is_err() {
                debug!("[automation] Script ignored shutdown, killing it");
            }
            incarnation.guard.kill();
        }

        self.deadline.cancel();
        self.in_flight.clear();
        self.pending.clear();
        self.set_state(SandboxState::Disposed);
        info!("[automation] Sandbox disposed");
    }
}

async fn read_script(id: u64, stdout: ScriptStdout, events: mpsc::UnboundedSender<(u64, ScriptEvent)>) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        let event = match lines.next_line().await {
            Ok(Some(line)) if line.trim().is_empty() => continue,
            Ok(Some(line)) => match decode_line(&line) {
                Ok(message) => ScriptEvent::Message(message),
                Err(_) => ScriptEvent::Invalid(line),
            },
            Ok(None) => ScriptEvent::Exited,
            Err(e) => {
                debug!("[automation] Failed to read script output: {}", e);
                ScriptEvent::Exited
            }
        };
        let exited = matches!(event, ScriptEvent::Exited);
        if events.send((id, event)).is_err() || exited {
            return;
        }
    }
}

async fn write_script(mut stdin: ScriptStdin, mut lines: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = lines.recv().await {
        if let Err(e) = stdin.write_all(line.as_bytes()).await {
            debug!("[automation] Failed to write to script: {}", e);
            return;
        }
        if stdin.flush().await.is_err() {
            return;
        }
    }
}
