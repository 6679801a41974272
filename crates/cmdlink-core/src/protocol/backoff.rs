//! Reconnection backoff
//!
//! [`Backoff`] tracks the countdown between reconnection attempts. The
//! delay curve itself comes from a [`BackoffPolicy`].

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

/// Delay curve for reconnection attempts
pub trait BackoffPolicy: Send + Sync + fmt::Debug {
    /// Delay before the given attempt (1-indexed)
    fn delay(&self, attempt: u32) -> Duration;
}

/// Exponential delay, capped at a maximum
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay before the first attempt
    pub initial: Duration,
    /// Upper bound for any delay
    pub max: Duration,
    /// Growth factor between attempts
    pub multiplier: f64,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_millis(100),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        // Clamp the exponent so the float never overflows into inf.
        let exponent = attempt.saturating_sub(1).min(64) as i32;
        let scaled = self.initial.as_secs_f64() * self.multiplier.powi(exponent);
        if scaled >= self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(scaled)
        }
    }
}

/// `now + delay`, clamped for delays too large to represent
fn deadline_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .unwrap_or_else(|| now + Duration::from_secs(FAR_FUTURE_SECS))
}

/// Roughly thirty years
const FAR_FUTURE_SECS: u64 = 86_400 * 365 * 30;

/// Backoff controller: attempt count, current delay and the running countdown
#[derive(Debug)]
pub struct Backoff {
    policy: Box<dyn BackoffPolicy>,
    attempt: u32,
    current_delay: Duration,
    deadline: Option<Instant>,
}

impl Backoff {
    /// Create a controller in its reset state
    pub fn new(policy: Box<dyn BackoffPolicy>) -> Self {
        let current_delay = policy.delay(1);
        Self {
            policy,
            attempt: 0,
            current_delay,
            deadline: None,
        }
    }

    /// Start the next countdown
    ///
    /// Returns the attempt number and delay, or `None` when a countdown is
    /// already running (repeated disconnect notifications do not stack).
    pub fn schedule_next(&mut self) -> Option<(u32, Duration)> {
        if self.deadline.is_some() {
            return None;
        }
        self.attempt = self.attempt.saturating_add(1);
        self.current_delay = self.policy.delay(self.attempt);
        self.deadline = Some(deadline_after(self.current_delay));
        Some((self.attempt, self.current_delay))
    }

    /// Return to the initial delay and cancel any running countdown
    pub fn reset(&mut self) {
        self.attempt = 0;
        self.current_delay = self.policy.delay(1);
        self.deadline = None;
    }

    /// When the running countdown fires, if any
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Mark the running countdown as fired
    pub fn fire(&mut self) {
        self.deadline = None;
    }

    /// Whether a countdown is running
    pub fn is_counting_down(&self) -> bool {
        self.deadline.is_some()
    }

    /// Attempts scheduled since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay of the latest countdown (the initial delay after a reset)
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Box::<ExponentialBackoff>::default())
    }
}
