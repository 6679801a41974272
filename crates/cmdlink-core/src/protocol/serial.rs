//! Serial port handling
//!
//! Port discovery and the [`SerialDevice`] implementation of
//! [`ByteStream`]. The open port is owned by a single I/O task that reads
//! continuously and services write/flush/drain requests between reads.

use std::collections::HashMap;
#[cfg(target_os = "linux")]
use std::fs;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serialport::{SerialPortInfo, SerialPortType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};
use tokio_serial::{
    ClearBuffer, DataBits, FlowControl, Parity, SerialPort, SerialPortBuilderExt, SerialStream,
    StopBits,
};
use tracing::{debug, warn};

use super::device::{device_events, ByteStream, DeviceEvent, DeviceEventReceiver, DeviceEventSender};
use super::{TransportError, DEFAULT_BAUD_RATE};

/// Information about an available serial port
#[derive(Debug, Clone)]
pub struct PortInfo {
    /// Port name (e.g., "/dev/ttyUSB0" or "COM3")
    pub name: String,

    /// USB vendor ID (if USB device)
    pub vid: Option<u16>,

    /// USB product ID (if USB device)
    pub pid: Option<u16>,

    /// Product name (if available)
    pub product: Option<String>,
}

impl PortInfo {
    fn bare(name: String) -> Self {
        Self {
            name,
            vid: None,
            pid: None,
            product: None,
        }
    }
}

impl From<SerialPortInfo> for PortInfo {
    fn from(info: SerialPortInfo) -> Self {
        match info.port_type {
            SerialPortType::UsbPort(usb) => Self {
                name: info.port_name,
                vid: Some(usb.vid),
                pid: Some(usb.pid),
                product: usb.product,
            },
            _ => Self::bare(info.port_name),
        }
    }
}

/// Ordering key: ttyACM* first, then ttyUSB*, each numerically, then the rest by name
fn port_sort_key(name: &str) -> (u8, usize, String) {
    let basename = name.rsplit('/').next().unwrap_or(name);
    for (rank, prefix) in [(0u8, "ttyACM"), (1, "ttyUSB")] {
        if let Some(rest) = basename.strip_prefix(prefix) {
            let num = rest.parse::<usize>().unwrap_or(usize::MAX);
            return (rank, num, basename.to_string());
        }
    }
    (2, 0, basename.to_string())
}

/// List available serial ports in a stable order
pub fn list_ports() -> Vec<PortInfo> {
    let mut map: HashMap<String, PortInfo> = HashMap::new();
    for info in serialport::available_ports().unwrap_or_default() {
        let port = PortInfo::from(info);
        map.entry(port.name.clone()).or_insert(port);
    }

    // The enumeration API misses CDC devices on some kernels.
    #[cfg(target_os = "linux")]
    if let Ok(entries) = fs::read_dir("/dev") {
        for entry in entries.flatten() {
            if let Some(fname) = entry.file_name().to_str() {
                if fname.starts_with("ttyACM") || fname.starts_with("ttyUSB") {
                    let full = format!("/dev/{}", fname);
                    map.entry(full.clone()).or_insert_with(|| PortInfo::bare(full));
                }
            }
        }
    }

    let mut ports: Vec<PortInfo> = map.into_values().collect();
    ports.sort_by_key(|p| port_sort_key(&p.name));
    ports
}

/// Open a serial port for the control link (8N1, no flow control)
fn open_stream(name: &str, baud_rate: u32) -> Result<SerialStream, TransportError> {
    let mut stream = tokio_serial::new(name, baud_rate)
        .data_bits(DataBits::Eight)
        .parity(Parity::None)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .open_native_async()?;

    // Keep DTR/RTS asserted; dropping DTR resets many USB-serial boards.
    if let Err(e) = stream.write_data_terminal_ready(true) {
        warn!(port = name, "failed to set DTR high: {e} (continuing)");
    }
    if let Err(e) = stream.write_request_to_send(true) {
        warn!(port = name, "failed to set RTS high: {e} (continuing)");
    }

    Ok(stream)
}

/// Requests serviced by the port's I/O task
enum IoRequest {
    Write {
        data: Vec<u8>,
        reply: oneshot::Sender<io::Result<()>>,
    },
    Discard {
        reply: oneshot::Sender<io::Result<()>>,
    },
    Drain {
        reply: oneshot::Sender<io::Result<()>>,
    },
}

/// A serial port driven as a [`ByteStream`]
#[derive(Debug)]
pub struct SerialDevice {
    port_name: String,
    baud_rate: u32,
    events: DeviceEventSender,
    io: Option<mpsc::Sender<IoRequest>>,
    open: Arc<AtomicBool>,
}

impl SerialDevice {
    /// Open `port_name` and return the device with its notification channel
    ///
    /// [`DeviceEvent::Opened`] is already queued on the channel when this
    /// returns. Must be called from within a Tokio runtime.
    pub fn open_port(
        port_name: impl Into<String>,
        baud_rate: Option<u32>,
    ) -> Result<(Self, DeviceEventReceiver), TransportError> {
        let (events, rx) = device_events();
        let mut device = Self {
            port_name: port_name.into(),
            baud_rate: baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
            events,
            io: None,
            open: Arc::new(AtomicBool::new(false)),
        };
        device.start()?;
        Ok((device, rx))
    }

    /// Port this device talks to
    pub fn port_name(&self) -> &str {
        &self.port_name
    }

    fn start(&mut self) -> Result<(), TransportError> {
        let stream = open_stream(&self.port_name, self.baud_rate)?;
        let (tx, rx) = mpsc::channel(32);
        let open = Arc::new(AtomicBool::new(true));

        tokio::spawn(io_loop(stream, rx, self.events.clone(), open.clone()));

        self.io = Some(tx);
        self.open = open;
        debug!(port = %self.port_name, baud = self.baud_rate, "serial port opened");
        let _ = self.events.send(DeviceEvent::Opened);
        Ok(())
    }

    async fn request(
        &self,
        make: impl FnOnce(oneshot::Sender<io::Result<()>>) -> IoRequest,
    ) -> io::Result<()> {
        let closed = || io::Error::new(io::ErrorKind::NotConnected, "serial port is closed");
        let io = self.io.as_ref().ok_or_else(closed)?;
        let (reply, rx) = oneshot::channel();
        io.send(make(reply)).await.map_err(|_| closed())?;
        rx.await.map_err(|_| closed())?
    }
}

impl ByteStream for SerialDevice {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn open(&mut self) -> io::Result<()> {
        if self.is_open() {
            return Ok(());
        }
        self.start()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
    }

    async fn close(&mut self) -> io::Result<()> {
        // Dropping the request channel ends the I/O task, which reports Closed.
        self.io = None;
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let data = data.to_vec();
        self.request(|reply| IoRequest::Write { data, reply }).await
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.request(|reply| IoRequest::Discard { reply }).await
    }

    async fn drain(&mut self) -> io::Result<()> {
        self.request(|reply| IoRequest::Drain { reply }).await
    }
}

/// Owns the stream: forwards reads as events and serves requests between them
async fn io_loop(
    mut stream: SerialStream,
    mut requests: mpsc::Receiver<IoRequest>,
    events: DeviceEventSender,
    open: Arc<AtomicBool>,
) {
    let mut buf = [0u8; 512];

    let reason = loop {
        tokio::select! {
            req = requests.recv() => match req {
                Some(req) => handle_request(&mut stream, req).await,
                None => break "closed by transport".to_string(),
            },

            read = stream.read(&mut buf) => match read {
                Ok(0) => break "end of stream".to_string(),
                Ok(n) => {
                    let _ = events.send(DeviceEvent::Data(Bytes::copy_from_slice(&buf[..n])));
                }
                Err(ref e)
                    if e.kind() == io::ErrorKind::TimedOut
                        || e.kind() == io::ErrorKind::WouldBlock => {}
                Err(e) => {
                    let reason = e.to_string();
                    let _ = events.send(DeviceEvent::Error(e));
                    break reason;
                }
            },
        }
    };

    open.store(false, Ordering::SeqCst);
    debug!(%reason, "serial I/O task exiting");
    let _ = events.send(DeviceEvent::Closed(reason));
}

async fn handle_request(stream: &mut SerialStream, req: IoRequest) {
    match req {
        IoRequest::Write { data, reply } => {
            let _ = reply.send(stream.write_all(&data).await);
        }
        IoRequest::Discard { reply } => {
            let result = stream
                .clear(ClearBuffer::Output)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
            let _ = reply.send(result);
        }
        IoRequest::Drain { reply } => {
            let _ = reply.send(stream.flush().await);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_list_ports() {
        // Only checks that enumeration does not panic on this machine
        let ports = list_ports();
        for port in &ports {
            println!("Found port: {} - {:?}", port.name, port.product);
        }
    }

    #[test]
    fn test_port_sorting() {
        let mut names = vec![
            "/dev/ttyUSB1",
            "/dev/ttyACM1",
            "/dev/ttyUSB0",
            "/dev/ttyACM0",
            "/dev/someport",
            "/dev/ttyACM10",
        ];
        names.sort_by_key(|n| port_sort_key(n));

        assert_eq!(
            names,
            vec![
                "/dev/ttyACM0",
                "/dev/ttyACM1",
                "/dev/ttyACM10",
                "/dev/ttyUSB0",
                "/dev/ttyUSB1",
                "/dev/someport",
            ]
        );
    }

    #[tokio::test]
    async fn test_open_missing_port_fails() {
        let result = SerialDevice::open_port("/dev/cmdlink-does-not-exist", None);
        assert!(matches!(result, Err(TransportError::SerialError(_))));
    }
}
