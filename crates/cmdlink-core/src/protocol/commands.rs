//! Protocol commands
//!
//! Text commands sent to the device and the helpers that classify the
//! frames it answers with.

use std::time::Duration;

use super::{COMMAND_TERMINATOR, ERROR_MARKER, FRAME_TERMINATOR};

/// A single command submitted to the transport
///
/// The sequence id only orders commands in logs. Responses are never matched
/// by it; the link has no correlation ids and answers arrive in send order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    /// Submission order (0 is reserved for link probes)
    pub seq: u64,
    /// Command text without the trailing carriage return
    pub payload: String,
    /// How long to wait for the response frame
    pub timeout: Duration,
}

impl Command {
    /// Create a new command
    pub fn new(seq: u64, payload: impl Into<String>, timeout: Duration) -> Self {
        Self {
            seq,
            payload: payload.into(),
            timeout,
        }
    }

    /// Create the status query used to prove frame alignment
    pub fn probe(payload: impl Into<String>, timeout: Duration) -> Self {
        Self::new(0, payload, timeout)
    }

    /// Check if this is a link probe rather than a caller command
    pub fn is_probe(&self) -> bool {
        self.seq == 0
    }

    /// Convert command to bytes, appending the terminator for transmission
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = self.payload.as_bytes().to_vec();
        bytes.push(COMMAND_TERMINATOR);
        bytes
    }
}

/// Check whether a response frame is the device's generic rejection
pub fn is_error_response(frame: &str) -> bool {
    frame.starts_with(ERROR_MARKER)
}

/// Check that a probe response is exactly one frame
///
/// The first terminator has to be the final character; a terminator with
/// trailing text after it means the link is still misaligned.
pub fn is_aligned(response: &str) -> bool {
    match response.find(FRAME_TERMINATOR as char) {
        Some(pos) => pos + 1 == response.len(),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_to_bytes() {
        let cmd = Command::new(1, "#set output 1", Duration::from_secs(10));
        assert_eq!(cmd.to_bytes(), b"#set output 1\r".to_vec());
    }

    #[test]
    fn test_probe_command() {
        let probe = Command::probe("#get input ", Duration::from_secs(1));
        assert!(probe.is_probe());
        assert_eq!(probe.to_bytes(), b"#get input \r".to_vec());
        assert!(!Command::new(7, "x", Duration::from_secs(1)).is_probe());
    }

    #[test]
    fn test_error_response() {
        assert!(is_error_response("ERR\r:"));
        assert!(!is_error_response("OK\r:"));
        assert!(!is_error_response("ERROR:"));
    }

    #[test]
    fn test_alignment_check() {
        assert!(is_aligned("ABC:"));
        assert!(is_aligned(":"));
        assert!(!is_aligned("ABC:XY:"));
        assert!(!is_aligned("ABC"));
        assert!(!is_aligned(""));
    }
}
