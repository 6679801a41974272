//! Connection state machine
//!
//! Owns the current [`ConnectionState`] and the reconnection [`Backoff`].
//! Every change goes through [`StateMachine::transition`], which publishes
//! the new state and applies the side effects tied to entering it.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info};

use super::backoff::Backoff;

/// Connection state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    /// Link not usable; a reconnection countdown may be running
    Disconnected,
    /// Reconnection attempt dispatched, waiting for the probe result
    Connecting,
    /// Link aligned and ready for commands
    Connected,
}

/// Notifications published by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// A reconnection attempt started
    Connecting,
    /// The link was resynchronized and accepts commands
    Connected,
    /// The link was lost (or never synchronized after opening)
    Disconnected,
    /// A reconnection countdown started
    ReconnectScheduled {
        /// Attempts since the last successful connection
        attempt: u32,
        /// Countdown before the attempt runs
        delay: Duration,
    },
    /// The device reported an error
    Error(String),
}

/// The state machine driven by the transport's event loop
#[derive(Debug)]
pub struct StateMachine {
    state: ConnectionState,
    backoff: Backoff,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<TransportEvent>,
}

impl StateMachine {
    /// Create a machine in the `Disconnected` state
    pub fn new(backoff: Backoff, events: broadcast::Sender<TransportEvent>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            state: ConnectionState::Disconnected,
            backoff,
            state_tx,
            events,
        }
    }

    /// Get current connection state
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Subscribe to state changes
    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Reconnection backoff controller
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Mark the running backoff countdown as fired
    pub fn backoff_fired(&mut self) {
        self.backoff.fire();
    }

    /// Publish a device error without changing state
    pub fn report_error(&self, message: String) {
        self.emit(TransportEvent::Error(message));
    }

    /// Enter `target` and apply its side effects
    ///
    /// Re-entering `Disconnected` is allowed: it re-announces the state and
    /// asks the backoff controller for a countdown, which is a no-op while
    /// one is already running.
    pub fn transition(&mut self, target: ConnectionState) {
        let previous = self.state;
        self.state = target;
        self.state_tx.send_replace(target);
        debug!(from = ?previous, to = ?target, "connection state transition");

        match target {
            ConnectionState::Connecting => {
                info!("attempting to resynchronize link");
                self.emit(TransportEvent::Connecting);
            }
            ConnectionState::Connected => {
                info!("link connected");
                self.backoff.reset();
                self.emit(TransportEvent::Connected);
            }
            ConnectionState::Disconnected => {
                self.emit(TransportEvent::Disconnected);
                match self.backoff.schedule_next() {
                    Some((attempt, delay)) => {
                        info!(
                            attempt,
                            ?delay,
                            "link disconnected, reconnect scheduled"
                        );
                        self.emit(TransportEvent::ReconnectScheduled { attempt, delay });
                    }
                    None => debug!("link disconnected, reconnect already scheduled"),
                }
            }
        }
    }

    fn emit(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}
