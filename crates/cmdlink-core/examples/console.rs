//! Interactive command console
//!
//! Opens a serial control link, waits for it to synchronize, then sends
//! every line typed on stdin as a command and prints the response frame.
//!
//! Usage:
//!   cargo run --example console -- [OPTIONS] [PORT]
//!
//! Options:
//!   --port PORT       Serial port (default: first detected port)
//!   --baud RATE       Baud rate (default: 115200)
//!   --timeout MS      Command timeout in ms (default: 10000)
//!   --config FILE     Load settings from a JSON file
//!   --list            List serial ports and exit
//!
//! Set `RUST_LOG=cmdlink_core=debug` to watch the transport work.

use std::path::Path;

use anyhow::{bail, Context};
use cmdlink_core::prelude::*;
use cmdlink_core::protocol::list_ports;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// Command-line settings, applied on top of the (optional) config file
#[derive(Debug, Default, PartialEq)]
struct Args {
    port: Option<String>,
    baud: Option<u32>,
    timeout_ms: Option<u64>,
    config: Option<String>,
    list: bool,
}

impl Args {
    fn parse(args: &[String]) -> anyhow::Result<Self> {
        let mut parsed = Args::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            match arg.as_str() {
                "--port" | "-p" => {
                    parsed.port = Some(iter.next().context("--port needs a value")?.clone());
                }
                "--baud" | "-b" => {
                    parsed.baud = Some(iter.next().context("--baud needs a value")?.parse()?);
                }
                "--timeout" | "-t" => {
                    parsed.timeout_ms =
                        Some(iter.next().context("--timeout needs a value")?.parse()?);
                }
                "--config" | "-c" => {
                    parsed.config = Some(iter.next().context("--config needs a value")?.clone());
                }
                "--list" | "-l" => parsed.list = true,
                other if !other.starts_with('-') => parsed.port = Some(other.to_string()),
                other => bail!("unknown option {other}"),
            }
        }
        Ok(parsed)
    }

    /// Load the config file (or defaults), then apply explicit options over it
    fn into_config(self) -> anyhow::Result<TransportConfig> {
        let mut config = match &self.config {
            Some(path) => TransportConfig::load(Path::new(path))
                .with_context(|| format!("loading {path}"))?,
            None => TransportConfig::default(),
        };
        if let Some(port) = self.port {
            config.port_name = port;
        }
        if let Some(baud) = self.baud {
            config.baud_rate = baud;
        }
        if let Some(timeout_ms) = self.timeout_ms {
            config.command_timeout_ms = timeout_ms;
        }
        Ok(config)
    }
}

fn print_ports() {
    for port in list_ports() {
        match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => println!(
                "{}  [{:04x}:{:04x}] {}",
                port.name,
                vid,
                pid,
                port.product.unwrap_or_default()
            ),
            _ => println!("{}", port.name),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let args = Args::parse(&args)?;
    if args.list {
        print_ports();
        return Ok(());
    }

    let mut config = args.into_config()?;
    if config.port_name.is_empty() {
        config.port_name = list_ports()
            .into_iter()
            .next()
            .map(|p| p.name)
            .context("no serial ports found, pass --port")?;
    }

    println!("Opening {} at {} baud", config.port_name, config.baud_rate);
    let transport = Transport::open(config)?;

    let mut events = transport.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            eprintln!("[link] {event:?}");
        }
    });

    transport.wait_for(ConnectionState::Connected).await?;
    println!("Connected. Type commands, Ctrl-D to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        match transport.execute(line).await {
            Ok(frame) => println!("{}", frame.escape_debug()),
            Err(e) => println!("error: {e}"),
        }
    }

    transport.shutdown();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_options_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("link.json");
        std::fs::write(
            &path,
            r#"{"port_name": "/dev/ttyACM0", "baud_rate": 9600, "probe_timeout_ms": 500}"#,
        )
        .unwrap();

        // Options given before --config still win over the file.
        let parsed = Args::parse(&args(&[
            "--baud",
            "57600",
            "--timeout",
            "2500",
            "--config",
            path.to_str().unwrap(),
        ]))
        .unwrap();
        let config = parsed.into_config().unwrap();

        assert_eq!(config.port_name, "/dev/ttyACM0");
        assert_eq!(config.baud_rate, 57600);
        assert_eq!(config.command_timeout_ms, 2500);
        assert_eq!(config.probe_timeout_ms, 500);
    }

    #[test]
    fn test_positional_port() {
        let parsed = Args::parse(&args(&["COM3", "-b", "19200"])).unwrap();
        assert_eq!(
            parsed,
            Args {
                port: Some("COM3".into()),
                baud: Some(19200),
                ..Args::default()
            }
        );
    }

    #[test]
    fn test_unknown_option_rejected() {
        assert!(Args::parse(&args(&["--bogus"])).is_err());
        assert!(Args::parse(&args(&["--baud"])).is_err());
    }
}
