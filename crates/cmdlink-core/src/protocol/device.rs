//! Byte-stream device boundary
//!
//! The transport never touches hardware directly. It writes through a
//! [`ByteStream`] and learns about incoming data and link changes from a
//! channel of [`DeviceEvent`]s fed by the device implementation.

use std::future::Future;
use std::io;

use bytes::Bytes;
use tokio::sync::mpsc;

/// Asynchronous notifications from a device
#[derive(Debug)]
pub enum DeviceEvent {
    /// The device was opened and can carry data
    Opened,
    /// Bytes arrived from the device
    Data(Bytes),
    /// The device closed (unplugged, EOF, explicit close)
    Closed(String),
    /// The device reported an error
    Error(io::Error),
}

/// Sending half of a device's notification channel
pub type DeviceEventSender = mpsc::UnboundedSender<DeviceEvent>;

/// Receiving half of a device's notification channel
pub type DeviceEventReceiver = mpsc::UnboundedReceiver<DeviceEvent>;

/// Create a notification channel for a device
pub fn device_events() -> (DeviceEventSender, DeviceEventReceiver) {
    mpsc::unbounded_channel()
}

/// Write side of a half-duplex byte-stream device
///
/// Implementations report [`DeviceEvent::Opened`] after a successful
/// [`open`](ByteStream::open) and [`DeviceEvent::Closed`] when the link goes
/// away, on the channel handed to the transport.
pub trait ByteStream: Send + 'static {
    /// Whether the device is currently open
    fn is_open(&self) -> bool;

    /// (Re)open the device
    fn open(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Close the device
    fn close(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Queue bytes for transmission
    fn write(&mut self, data: &[u8]) -> impl Future<Output = io::Result<()>> + Send;

    /// Discard outbound data that has not been transmitted yet
    fn flush(&mut self) -> impl Future<Output = io::Result<()>> + Send;

    /// Wait until everything written has been physically transmitted
    fn drain(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}
