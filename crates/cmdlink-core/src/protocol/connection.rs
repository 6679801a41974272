//! Connection management
//!
//! [`Transport`] is the caller-facing handle. Behind it run two tasks:
//!
//! - the event loop, which owns the [`StateMachine`], feeds device bytes
//!   into the frame buffer and fires reconnection attempts when the backoff
//!   countdown expires;
//! - the command worker ([`Pipeline`]), which owns the device's write side
//!   and executes queued jobs one at a time.
//!
//! Both stop when the last handle is dropped or [`Transport::shutdown`] is
//! called.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, info_span, warn, Instrument, Span};

use super::backoff::{Backoff, ExponentialBackoff};
use super::device::{ByteStream, DeviceEvent, DeviceEventReceiver};
use super::frame::SharedFrameBuffer;
use super::pipeline::{Job, Pipeline, PipelineConfig, ReconnectOutcome};
use super::state::{ConnectionState, StateMachine, TransportEvent};
use super::{
    Command, Result, SerialDevice, TransportError, DEFAULT_BAUD_RATE, DEFAULT_TIMEOUT_MS,
    PROBE_COMMAND,
};

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Serial port name
    pub port_name: String,
    /// Baud rate
    pub baud_rate: u32,
    /// Default response timeout for commands in milliseconds
    pub command_timeout_ms: u64,
    /// Attempts per command before failing with a timeout
    pub max_command_attempts: u32,
    /// Status query used to prove frame alignment (terminator is appended)
    pub probe_command: String,
    /// Probe response timeout in milliseconds
    pub probe_timeout_ms: u64,
    /// Probe attempts per resynchronization
    pub resync_attempts: u32,
    /// Pause after a failed resync attempt in milliseconds
    pub resync_pause_ms: u64,
    /// First reconnection delay in milliseconds
    pub backoff_initial_ms: u64,
    /// Upper bound for the reconnection delay in milliseconds
    pub backoff_max_ms: u64,
    /// Buffered events per subscriber before slow subscribers lag
    pub event_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
            command_timeout_ms: DEFAULT_TIMEOUT_MS,
            max_command_attempts: 3,
            probe_command: PROBE_COMMAND.to_string(),
            probe_timeout_ms: 1000,
            resync_attempts: 3,
            resync_pause_ms: 2000,
            backoff_initial_ms: 100,
            backoff_max_ms: 60_000,
            event_capacity: 64,
        }
    }
}

impl TransportConfig {
    /// Create a configuration for `port_name` with default timings
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Self::default()
        }
    }

    /// Parse a JSON configuration; missing fields take their defaults
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| TransportError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    /// Reject settings the transport cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.max_command_attempts == 0 {
            return Err(TransportError::Config(
                "max_command_attempts must be at least 1".into(),
            ));
        }
        if self.resync_attempts == 0 {
            return Err(TransportError::Config(
                "resync_attempts must be at least 1".into(),
            ));
        }
        if self.backoff_initial_ms > self.backoff_max_ms {
            return Err(TransportError::Config(format!(
                "backoff_initial_ms ({}) exceeds backoff_max_ms ({})",
                self.backoff_initial_ms, self.backoff_max_ms
            )));
        }
        if self.event_capacity == 0 {
            return Err(TransportError::Config(
                "event_capacity must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Default command timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            max_command_attempts: self.max_command_attempts,
            probe_command: self.probe_command.clone(),
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            resync_attempts: self.resync_attempts,
            resync_pause: Duration::from_millis(self.resync_pause_ms),
        }
    }

    fn backoff_policy(&self) -> ExponentialBackoff {
        ExponentialBackoff {
            initial: Duration::from_millis(self.backoff_initial_ms),
            max: Duration::from_millis(self.backoff_max_ms),
            ..ExponentialBackoff::default()
        }
    }
}

/// Handle to a running transport
///
/// Cheap to clone; all clones share the same link. Commands from every
/// clone are executed one at a time in submission order.
#[derive(Debug, Clone)]
pub struct Transport {
    jobs: mpsc::UnboundedSender<Job>,
    state: watch::Receiver<ConnectionState>,
    events: broadcast::Sender<TransportEvent>,
    next_seq: Arc<AtomicU64>,
    default_timeout: Duration,
    cancel: CancellationToken,
    _guard: Arc<DropGuard>,
}

impl Transport {
    /// Open the configured serial port and start the transport on it
    pub fn open(config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let (device, events) = SerialDevice::open_port(&config.port_name, Some(config.baud_rate))?;
        Ok(Self::spawn(device, events, config))
    }

    /// Start the transport on an already constructed device
    ///
    /// Runs inside a `transport` span carrying the port name.
    pub fn spawn<D: ByteStream>(
        device: D,
        device_events: DeviceEventReceiver,
        config: TransportConfig,
    ) -> Self {
        let span = info_span!("transport", port = %config.port_name);
        Self::spawn_in_span(device, device_events, config, span)
    }

    /// Start the transport with both tasks instrumented by `span`
    pub fn spawn_in_span<D: ByteStream>(
        device: D,
        device_events: DeviceEventReceiver,
        config: TransportConfig,
        span: Span,
    ) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let frames = SharedFrameBuffer::new();

        let machine = StateMachine::new(
            Backoff::new(Box::new(config.backoff_policy())),
            events.clone(),
        );
        let state = machine.watch();

        let pipeline = Pipeline::new(device, frames.clone(), config.pipeline_config());
        tokio::spawn(
            pipeline
                .run(jobs_rx, outcomes_tx, cancel.clone())
                .instrument(span.clone()),
        );

        let event_loop = EventLoop {
            machine,
            frames,
            jobs: jobs_tx.clone(),
            last_attempt_id: 0,
            in_flight: None,
            deferred: false,
        };
        tokio::spawn(
            event_loop
                .run(device_events, outcomes_rx, cancel.clone())
                .instrument(span),
        );

        Self {
            jobs: jobs_tx,
            state,
            events,
            next_seq: Arc::new(AtomicU64::new(1)),
            default_timeout: config.command_timeout(),
            _guard: Arc::new(cancel.clone().drop_guard()),
            cancel,
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Check if the link accepts commands
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Receiver that tracks the connection state
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.clone()
    }

    /// Subscribe to transport events
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    /// Wait until the link reaches `target` or the transport shuts down
    pub async fn wait_for(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|s| *s == target)
            .await
            .map(|_| ())
            .map_err(|_| TransportError::Closed)
    }

    /// Execute a command with the configured default timeout
    pub async fn execute(&self, command: &str) -> Result<String> {
        self.execute_with_timeout(command, self.default_timeout)
            .await
    }

    /// Execute a command and return the response frame
    ///
    /// Fails immediately with [`TransportError::NotConnected`] unless the
    /// link is connected. Otherwise the command waits its turn behind every
    /// command submitted before it.
    pub async fn execute_with_timeout(&self, command: &str, timeout: Duration) -> Result<String> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        let (reply, rx) = oneshot::channel();
        self.jobs
            .send(Job::Execute {
                command: Command::new(seq, command, timeout),
                reply,
            })
            .map_err(|_| TransportError::Closed)?;

        rx.await.map_err(|_| TransportError::Closed)?
    }

    /// Stop both tasks and close the device
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }
}

/// Reconnection attempt handed to the command worker
struct Attempt {
    id: u64,
    abort: CancellationToken,
}

/// State owned by the event loop task
struct EventLoop {
    machine: StateMachine,
    frames: SharedFrameBuffer,
    jobs: mpsc::UnboundedSender<Job>,
    last_attempt_id: u64,
    /// At most one reconnection attempt is queued or running
    in_flight: Option<Attempt>,
    /// A countdown fired while `in_flight` was still winding down
    deferred: bool,
}

impl EventLoop {
    async fn run(
        mut self,
        mut device_events: DeviceEventReceiver,
        mut outcomes: mpsc::UnboundedReceiver<ReconnectOutcome>,
        cancel: CancellationToken,
    ) {
        loop {
            let deadline = self.machine.backoff().deadline();

            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                event = device_events.recv() => match event {
                    Some(event) => self.on_device_event(event),
                    None => {
                        warn!("device event stream ended, shutting down transport");
                        self.machine.report_error("device event stream ended".into());
                        self.link_lost();
                        cancel.cancel();
                        break;
                    }
                },

                Some(outcome) = outcomes.recv() => self.on_reconnect_outcome(outcome),

                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_backoff_ready();
                }
            }
        }

        debug!("event loop exiting");
    }

    fn on_device_event(&mut self, event: DeviceEvent) {
        match event {
            DeviceEvent::Data(bytes) => self.frames.push(&bytes),
            DeviceEvent::Opened => {
                if self.machine.state() == ConnectionState::Connecting {
                    // The reconnection attempt reopened the device itself.
                    debug!("device reopened during reconnection attempt");
                } else {
                    info!("device opened, waiting to synchronize");
                    self.link_lost();
                }
            }
            DeviceEvent::Closed(reason) => {
                warn!(%reason, "device closed");
                self.link_lost();
            }
            DeviceEvent::Error(e) => {
                warn!("device error: {e}");
                self.machine.report_error(e.to_string());
            }
        }
    }

    /// Enter `Disconnected`, abandoning any attempt that started on the old link
    fn link_lost(&mut self) {
        if let Some(attempt) = &self.in_flight {
            attempt.abort.cancel();
        }
        self.machine.transition(ConnectionState::Disconnected);
    }

    fn on_backoff_ready(&mut self) {
        self.machine.backoff_fired();
        if self.machine.state() == ConnectionState::Connected {
            return;
        }
        if let Some(attempt) = &self.in_flight {
            debug!(attempt_id = attempt.id, "previous reconnection attempt still running");
            self.deferred = true;
            return;
        }
        self.start_attempt();
    }

    fn start_attempt(&mut self) {
        self.deferred = false;
        self.last_attempt_id += 1;
        let attempt = Attempt {
            id: self.last_attempt_id,
            abort: CancellationToken::new(),
        };

        self.machine.transition(ConnectionState::Connecting);
        let job = Job::Reconnect {
            id: attempt.id,
            abort: attempt.abort.clone(),
        };
        if self.jobs.send(job).is_err() {
            warn!("command worker gone, cannot reconnect");
            return;
        }
        self.in_flight = Some(attempt);
    }

    fn on_reconnect_outcome(&mut self, outcome: ReconnectOutcome) {
        let ReconnectOutcome { id, synced } = outcome;
        if self.in_flight.as_ref().map(|a| a.id) != Some(id) {
            debug!(attempt_id = id, synced, "ignoring outcome of unknown reconnection attempt");
            return;
        }
        self.in_flight = None;

        if self.machine.state() != ConnectionState::Connecting {
            // The link was lost while the attempt was running.
            debug!(attempt_id = id, synced, "ignoring stale reconnection outcome");
            if self.deferred {
                self.start_attempt();
            }
            return;
        }
        if synced {
            self.machine.transition(ConnectionState::Connected);
        } else {
            self.machine.transition(ConnectionState::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config() {
        let config = TransportConfig::default();
        assert_eq!(config.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.probe_command, "#get input ");
        assert_eq!(config.max_command_attempts, 3);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_json_uses_defaults() {
        let config =
            TransportConfig::from_json(r#"{"port_name": "/dev/ttyUSB0", "baud_rate": 9600}"#)
                .unwrap();
        assert_eq!(
            config,
            TransportConfig {
                port_name: "/dev/ttyUSB0".into(),
                baud_rate: 9600,
                ..TransportConfig::default()
            }
        );
    }

    #[test]
    fn test_config_rejects_zero_attempts() {
        let result = TransportConfig::from_json(r#"{"max_command_attempts": 0}"#);
        assert!(matches!(result, Err(TransportError::Config(_))));

        let result = TransportConfig::from_json(r#"{"backoff_initial_ms": 5000, "backoff_max_ms": 10}"#);
        assert!(matches!(result, Err(TransportError::Config(_))));
    }

    #[test]
    fn test_config_rejects_bad_json() {
        let result = TransportConfig::from_json("{port_name:");
        assert!(matches!(result, Err(TransportError::Config(_))));
    }

    #[test]
    fn test_config_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.json");
        std::fs::write(&path, r#"{"port_name": "COM3", "command_timeout_ms": 2500}"#).unwrap();

        let config = TransportConfig::load(&path).unwrap();
        assert_eq!(config.port_name, "COM3");
        assert_eq!(config.command_timeout(), Duration::from_millis(2500));
    }

    #[test]
    fn test_pipeline_config_follows_transport_config() {
        let config = TransportConfig::from_json(
            r##"{"probe_command": "#status ", "probe_timeout_ms": 250, "resync_pause_ms": 500}"##,
        )
        .unwrap();
        assert_eq!(
            config.pipeline_config(),
            PipelineConfig {
                probe_command: "#status ".into(),
                probe_timeout: Duration::from_millis(250),
                resync_pause: Duration::from_millis(500),
                ..PipelineConfig::default()
            }
        );
    }
}
