//! Scripted in-memory device shared by the integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use cmdlink_core::protocol::{
    device_events, ByteStream, DeviceEvent, DeviceEventReceiver, DeviceEventSender,
};

/// Wire form of the default probe
pub const PROBE: &str = "#get input \r";

/// Something the device saw or did, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    Write(String),
    Reply(String),
    Flush,
    Drain,
    Open,
    Close,
}

#[derive(Debug, Clone)]
struct Reply {
    chunks: Vec<Vec<u8>>,
    delay: Duration,
}

#[derive(Debug, Default)]
struct Script {
    replies: HashMap<String, Reply>,
    log: Vec<Entry>,
    fail_writes: bool,
    open: bool,
}

/// Device half handed to the transport
pub struct MockDevice {
    events: DeviceEventSender,
    script: Arc<Mutex<Script>>,
}

/// Test-side control over the mock device
#[derive(Clone)]
pub struct MockHandle {
    events: DeviceEventSender,
    script: Arc<Mutex<Script>>,
}

/// Create a closed mock device, its control handle and its event channel
pub fn mock_device() -> (MockDevice, MockHandle, DeviceEventReceiver) {
    let (events, rx) = device_events();
    let script = Arc::new(Mutex::new(Script::default()));
    let device = MockDevice {
        events: events.clone(),
        script: script.clone(),
    };
    (device, MockHandle { events, script }, rx)
}

fn send_reply(events: &DeviceEventSender, script: &Mutex<Script>, reply: &Reply) {
    let mut text = String::new();
    for chunk in &reply.chunks {
        text.push_str(&String::from_utf8_lossy(chunk));
        let _ = events.send(DeviceEvent::Data(Bytes::from(chunk.clone())));
    }
    script.lock().unwrap().log.push(Entry::Reply(text));
}

impl MockHandle {
    /// Answer every write of `command` (wire form, with `\r`) with `reply`
    pub fn respond(&self, command: &str, reply: &str) {
        self.respond_chunked(command, &[reply]);
    }

    /// Answer with the reply split across several deliveries
    pub fn respond_chunked(&self, command: &str, chunks: &[&str]) {
        self.insert(command, chunks, Duration::ZERO);
    }

    /// Answer after `delay`
    pub fn respond_after(&self, command: &str, reply: &str, delay: Duration) {
        self.insert(command, &[reply], delay);
    }

    /// Stop answering `command`
    pub fn silence(&self, command: &str) {
        self.script.lock().unwrap().replies.remove(command);
    }

    fn insert(&self, command: &str, chunks: &[&str], delay: Duration) {
        let reply = Reply {
            chunks: chunks.iter().map(|c| c.as_bytes().to_vec()).collect(),
            delay,
        };
        self.script
            .lock()
            .unwrap()
            .replies
            .insert(command.to_string(), reply);
    }

    /// Make every following write fail
    pub fn fail_writes(&self, fail: bool) {
        self.script.lock().unwrap().fail_writes = fail;
    }

    /// Plug the device in
    pub fn open(&self) {
        self.script.lock().unwrap().open = true;
        let _ = self.events.send(DeviceEvent::Opened);
    }

    /// Unplug the device
    pub fn close(&self, reason: &str) {
        self.script.lock().unwrap().open = false;
        let _ = self.events.send(DeviceEvent::Closed(reason.to_string()));
    }

    /// Report a device-level error
    pub fn error(&self, message: &str) {
        let _ = self
            .events
            .send(DeviceEvent::Error(io::Error::new(io::ErrorKind::Other, message)));
    }

    /// Push unsolicited bytes
    pub fn inject(&self, data: &str) {
        let _ = self
            .events
            .send(DeviceEvent::Data(Bytes::copy_from_slice(data.as_bytes())));
    }

    pub fn log(&self) -> Vec<Entry> {
        self.script.lock().unwrap().log.clone()
    }

    pub fn clear_log(&self) {
        self.script.lock().unwrap().log.clear();
    }

    /// Writes of exactly `command` (wire form)
    pub fn count_writes(&self, command: &str) -> usize {
        self.log()
            .iter()
            .filter(|e| matches!(e, Entry::Write(w) if w == command))
            .count()
    }
}

impl ByteStream for MockDevice {
    fn is_open(&self) -> bool {
        self.script.lock().unwrap().open
    }

    async fn open(&mut self) -> io::Result<()> {
        {
            let mut script = self.script.lock().unwrap();
            script.open = true;
            script.log.push(Entry::Open);
        }
        let _ = self.events.send(DeviceEvent::Opened);
        Ok(())
    }

    async fn close(&mut self) -> io::Result<()> {
        let mut script = self.script.lock().unwrap();
        script.open = false;
        script.log.push(Entry::Close);
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(data).into_owned();
        let reply = {
            let mut script = self.script.lock().unwrap();
            if script.fail_writes || !script.open {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
            }
            script.log.push(Entry::Write(text.clone()));
            script.replies.get(&text).cloned()
        };

        if let Some(reply) = reply {
            if reply.delay.is_zero() {
                send_reply(&self.events, &self.script, &reply);
            } else {
                let events = self.events.clone();
                let script = self.script.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(reply.delay).await;
                    send_reply(&events, &script, &reply);
                });
            }
        }
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        self.script.lock().unwrap().log.push(Entry::Flush);
        Ok(())
    }

    async fn drain(&mut self) -> io::Result<()> {
        self.script.lock().unwrap().log.push(Entry::Drain);
        Ok(())
    }
}
