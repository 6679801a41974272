//! Serial Protocol Communication
//!
//! Implements the colon-framed text protocol spoken by the control device:
//! commands go out terminated by `\r`, responses come back terminated by `:`.
//!
//! The link has no request ids, so the transport keeps one command in
//! flight at a time and recovers alignment after a timeout by draining and
//! probing the link.

pub mod backoff;
pub mod commands;
mod connection;
pub mod device;
mod error;
pub mod frame;
mod pipeline;
pub mod serial;
mod state;

pub use backoff::{Backoff, BackoffPolicy, ExponentialBackoff};
pub use commands::Command;
pub use connection::{Transport, TransportConfig};
pub use device::{device_events, ByteStream, DeviceEvent, DeviceEventReceiver, DeviceEventSender};
pub use error::{Result, TransportError};
pub use frame::{FrameBuffer, PendingRead, SharedFrameBuffer};
pub use serial::{list_ports, PortInfo, SerialDevice};
pub use state::{ConnectionState, StateMachine, TransportEvent};

/// Default baud rate for the control link
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default timeout for command responses in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Appended to every outbound command
pub const COMMAND_TERMINATOR: u8 = b'\r';

/// Ends every inbound frame (kept in the frame text)
pub const FRAME_TERMINATOR: u8 = b':';

/// Prefix of the device's generic rejection frame
pub const ERROR_MARKER: &str = "ERR\r:";

/// Status query used to prove frame alignment, without its terminator
pub const PROBE_COMMAND: &str = "#get input ";
