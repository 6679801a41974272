//! # cmdlink Core Library
//!
//! Resilient command/response transport for colon-framed serial control links.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//!
//! This library provides:
//! - Reassembly of the byte stream into `:`-terminated response frames
//! - Serialized command execution with timeouts and bounded retries
//! - Link resynchronization after a timeout (drain, then probe)
//! - Connection state tracking with automatic reconnection and backoff
//! - Serial port discovery and a `tokio-serial` backed device
//!
//! ## Example
//!
//! ```rust,ignore
//! use cmdlink_core::protocol::{ConnectionState, Transport, TransportConfig};
//!
//! let transport = Transport::open(TransportConfig::new("/dev/ttyUSB0"))?;
//! transport.wait_for(ConnectionState::Connected).await?;
//!
//! let inputs = transport.execute("#get input ").await?;
//! println!("inputs: {inputs}");
//! ```

pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        ByteStream, ConnectionState, DeviceEvent, Transport, TransportConfig, TransportError,
        TransportEvent,
    };
}

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
