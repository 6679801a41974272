//! Command execution pipeline
//!
//! A single worker task owns the device's write side and runs queued jobs
//! strictly one at a time, in submission order. The link has no request
//! ids, so a response belongs to whichever command is in flight; keeping
//! exactly one command in flight is what makes that attribution correct.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::commands::{is_aligned, is_error_response, Command};
use super::device::ByteStream;
use super::frame::SharedFrameBuffer;
use super::{Result, TransportError};

/// Work submitted to the pipeline
pub(crate) enum Job {
    /// Run a caller command with retries
    Execute {
        command: Command,
        reply: oneshot::Sender<Result<String>>,
    },
    /// Reopen the device if needed and prove the link is aligned
    Reconnect {
        id: u64,
        /// Cancelled when the attempt no longer matters (link lost meanwhile)
        abort: CancellationToken,
    },
}

/// Result of one reconnection attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReconnectOutcome {
    pub(crate) id: u64,
    pub(crate) synced: bool,
}

/// Retry and probe settings used by the pipeline
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct PipelineConfig {
    /// Attempts per command before giving up with a timeout
    pub(crate) max_command_attempts: u32,
    /// Status query sent to check alignment
    pub(crate) probe_command: String,
    /// Timeout for a single probe
    pub(crate) probe_timeout: Duration,
    /// Probe attempts per resynchronization
    pub(crate) resync_attempts: u32,
    /// Pause after a failed resync attempt
    pub(crate) resync_pause: Duration,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_command_attempts: 3,
            probe_command: super::PROBE_COMMAND.to_string(),
            probe_timeout: Duration::from_secs(1),
            resync_attempts: 3,
            resync_pause: Duration::from_secs(2),
        }
    }
}

/// The worker's view of the link
pub(crate) struct Pipeline<D> {
    device: D,
    frames: SharedFrameBuffer,
    config: PipelineConfig,
}

impl<D: ByteStream> Pipeline<D> {
    pub(crate) fn new(device: D, frames: SharedFrameBuffer, config: PipelineConfig) -> Self {
        Self {
            device,
            frames,
            config,
        }
    }

    /// Drain the task queue until cancelled
    ///
    /// Cancellation also interrupts the job in progress: a running command
    /// fails with [`TransportError::Closed`] and nothing more is written.
    /// The outcome of every reconnection attempt is reported on `outcomes`.
    pub(crate) async fn run(
        mut self,
        mut jobs: mpsc::UnboundedReceiver<Job>,
        outcomes: mpsc::UnboundedSender<ReconnectOutcome>,
        cancel: CancellationToken,
    ) {
        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };

            match job {
                Job::Execute { command, reply } => {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => {
                            debug!(seq = command.seq, "command interrupted by shutdown");
                            let _ = reply.send(Err(TransportError::Closed));
                            break;
                        }
                        result = self.execute(&command) => {
                            let _ = reply.send(result);
                        }
                    }
                }
                Job::Reconnect { id, abort } => {
                    let synced = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        _ = abort.cancelled() => {
                            debug!(attempt_id = id, "reconnection attempt abandoned");
                            false
                        }
                        synced = self.reconnect() => synced,
                    };
                    let _ = outcomes.send(ReconnectOutcome { id, synced });
                }
            }
        }

        debug!("command worker exiting");
        if let Err(e) = self.device.close().await {
            warn!("failed to close device: {e}");
        }
    }

    /// Single attempt: register a read, send, race the frame against the timeout
    ///
    /// `Ok(None)` means no frame arrived in time (or the read was cancelled
    /// by a drain).
    pub(crate) async fn execute_once(&mut self, command: &Command) -> Result<Option<String>> {
        let read = self.frames.schedule_read();
        let deadline = Instant::now() + command.timeout;

        self.device.write(&command.to_bytes()).await?;

        match tokio::time::timeout_at(deadline, read.recv()).await {
            Ok(Some(frame)) => Ok(Some(frame)),
            Ok(None) => {
                debug!(seq = command.seq, probe = command.is_probe(), "pending read cancelled");
                Ok(None)
            }
            Err(_) => {
                debug!(seq = command.seq, probe = command.is_probe(), "no frame before deadline");
                Ok(None)
            }
        }
    }

    /// Run a command with retries, resynchronizing after every timeout
    pub(crate) async fn execute(&mut self, command: &Command) -> Result<String> {
        let mut response = None;

        for attempt in 1..=self.config.max_command_attempts {
            debug!(seq = command.seq, attempt, command = %command.payload, "sending command");
            match self.execute_once(command).await? {
                Some(frame) => {
                    response = Some(frame);
                    break;
                }
                None => {
                    warn!(
                        seq = command.seq,
                        attempt,
                        timeout = ?command.timeout,
                        "command timed out, resynchronizing"
                    );
                    if !self.resynchronize().await {
                        warn!(seq = command.seq, "resynchronization failed");
                    }
                }
            }
        }

        let frame = response.ok_or(TransportError::Timeout)?;
        if is_error_response(&frame) {
            debug!(seq = command.seq, "device rejected command");
            return Err(TransportError::UnsupportedCommand(command.payload.clone()));
        }
        Ok(frame)
    }

    /// Discard stale state and prove the link is frame-aligned
    pub(crate) async fn resynchronize(&mut self) -> bool {
        let attempts = self.config.resync_attempts;

        for attempt in 1..=attempts {
            match self.resync_attempt().await {
                Ok(()) => {
                    debug!(attempt, "link resynchronized");
                    return true;
                }
                Err(e) => warn!(attempt, "resync attempt failed: {e}"),
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.resync_pause).await;
            }
        }

        false
    }

    async fn resync_attempt(&mut self) -> Result<()> {
        let cancelled = self.frames.drain();
        if cancelled > 0 {
            debug!(cancelled, "cancelled pending reads");
        }
        self.device.flush().await?;
        self.device.drain().await?;

        let probe = Command::probe(self.config.probe_command.clone(), self.config.probe_timeout);
        let response = self
            .execute_once(&probe)
            .await?
            .ok_or(TransportError::Timeout)?;

        if is_aligned(&response) {
            Ok(())
        } else {
            Err(TransportError::Misaligned(response))
        }
    }

    async fn reconnect(&mut self) -> bool {
        if !self.device.is_open() {
            info!("reopening device");
            if let Err(e) = self.device.open().await {
                warn!("failed to reopen device: {e}");
                return false;
            }
        }
        self.resynchronize().await
    }
}
