//! # Command-Line Interface Module
//!
//! Command-line argument parsing for the forwarding engine's demo binary.
//! Uses the `clap` derive API, matching the argument-group conventions and
//! custom help styling of this codebase's original CLI surface.
//!
//! ## Usage Examples
//!
//! ```bash
//! # Forward to two destinations with all-distribution
//! ipfix-forward --destination 10.0.0.1:4739 --destination 10.0.0.2
//!
//! # Round-robin distribution with a larger packet size
//! ipfix-forward -d round-robin --packet-size 8192 --destination 10.0.0.1
//!
//! # Load a full configuration from a JSON file
//! ipfix-forward --config forwarding.json
//! ```

use clap::builder::styling::{AnsiColor, Styles};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use crate::config::{DestinationConfig, Distribution, ForwardingConfig};
use crate::error::ConfigError;

/// Defines the styles for the help message to replicate clap v3's appearance.
fn styles() -> Styles {
    Styles::styled()
        .header(AnsiColor::Yellow.on_default())
        .usage(AnsiColor::Yellow.on_default())
        .literal(AnsiColor::Green.on_default())
        .placeholder(AnsiColor::Green.on_default())
}

/// IPFIX multi-destination forwarding engine
///
/// Reads already-decoded IPFIX message records from stdin (see `main.rs` for
/// the framing) and forwards them to one or more TCP destinations, sharing a
/// renumbered Template ID space across every Observation Domain ID.
///
/// IPFIX message parsing and XML configuration parsing are external
/// collaborators; this binary is a thin demo harness around the forwarding
/// core, not a full collector.
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None, styles = styles())]
pub struct Args {
    /// Path to a JSON configuration file to load as the base configuration
    ///
    /// When given, the file is deserialized into a `ForwardingConfig` first;
    /// any of the flags below are then applied on top of it. When omitted,
    /// the flags are applied on top of `ForwardingConfig::default()`.
    #[arg(long, help_heading = "Core Options")]
    pub config: Option<PathBuf>,

    /// Destination to forward to, as `host` or `host:port` (repeatable)
    ///
    /// At least one destination is required (either here or in the config
    /// file). Ports omitted here inherit `--port`.
    #[arg(long = "destination", help_heading = "Core Options")]
    pub destinations: Vec<String>,

    /// Default port inherited by destinations that don't specify their own
    #[arg(long, help_heading = "Core Options")]
    pub port: Option<String>,

    /// Packet distribution policy: "all" or "round-robin"
    #[arg(short = 'd', long, help_heading = "Core Options")]
    pub distribution: Option<Distribution>,

    /// Maximum size in bytes of a single emitted IPFIX datagram (256-65535)
    #[arg(long, help_heading = "Core Options")]
    pub packet_size: Option<u16>,

    /// Reconnection probe period in milliseconds
    #[arg(long, help_heading = "Core Options")]
    pub reconnect_ms: Option<u64>,

    /// Silence all user-facing informational output on stdout
    #[arg(short = 'q', long, help_heading = "Output and Logging")]
    pub quiet: bool,

    /// Increase diagnostic log verbosity on stderr.
    ///
    /// Can be used multiple times to increase detail:
    ///  -v: debug
    ///  -vv and above: trace
    /// By default, only INFO and above is shown.
    #[arg(short, long, action = clap::ArgAction::Count, help_heading = "Output and Logging")]
    pub verbose: u8,
}

impl Args {
    /// Builds a [`ForwardingConfig`], starting from `--config` (or the
    /// default configuration) and overlaying any flags the user passed,
    /// mirroring how the original CLI layered flags on top of defaults.
    pub fn build_config(&self) -> Result<ForwardingConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ConfigFileRead {
                    path: path.display().to_string(),
                    source,
                })?;
                serde_json::from_str(&text).map_err(|source| ConfigError::ConfigFileParse {
                    path: path.display().to_string(),
                    source,
                })?
            }
            None => ForwardingConfig::default(),
        };

        if let Some(port) = &self.port {
            config.default_port = port.clone();
        }
        if let Some(distribution) = self.distribution {
            config.distribution = distribution;
        }
        if let Some(packet_size) = self.packet_size {
            config.packet_size = packet_size;
        }
        if let Some(ms) = self.reconnect_ms {
            config.reconnection_period = Duration::from_millis(ms);
        }
        for entry in &self.destinations {
            config.destinations.push(parse_destination(entry));
        }

        config.validate()?;
        Ok(config)
    }
}

/// Parses a `host` or `host:port` CLI entry into a [`DestinationConfig`].
/// IPv6 literals with an explicit port (`[::1]:4739`) are recognized by
/// their bracket; a bare IPv6 address has no unambiguous port separator and
/// is kept whole, inheriting the default port.
fn parse_destination(entry: &str) -> DestinationConfig {
    if let Some(rest) = entry.strip_prefix('[') {
        if let Some((host, after)) = rest.split_once(']') {
            let port = after.strip_prefix(':').map(|p| p.to_string());
            return DestinationConfig { host: host.to_string(), port };
        }
    }

    match entry.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            DestinationConfig { host: host.to_string(), port: Some(port.to_string()) }
        }
        _ => DestinationConfig { host: entry.to_string(), port: None },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_destination_splits_host_and_port() {
        let d = parse_destination("10.0.0.1:2055");
        assert_eq!(d.host, "10.0.0.1");
        assert_eq!(d.port.as_deref(), Some("2055"));
    }

    #[test]
    fn parse_destination_without_port_inherits_default() {
        let d = parse_destination("10.0.0.1");
        assert_eq!(d.host, "10.0.0.1");
        assert_eq!(d.port, None);
    }

    #[test]
    fn parse_destination_handles_bracketed_ipv6() {
        let d = parse_destination("[::1]:4739");
        assert_eq!(d.host, "::1");
        assert_eq!(d.port.as_deref(), Some("4739"));
    }

    #[test]
    fn parse_destination_handles_bare_ipv6() {
        let d = parse_destination("::1");
        assert_eq!(d.host, "::1");
        assert_eq!(d.port, None);
    }

    #[test]
    fn build_config_loads_file_and_overlays_flags() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(
            &mut file,
            br#"{"default_port":"4739","distribution":"All","packet_size":2048,"reconnection_period":{"secs":1,"nanos":0},"destinations":[{"host":"10.0.0.1","port":null}]}"#,
        )
        .unwrap();

        let args = Args {
            config: Some(file.path().to_path_buf()),
            destinations: vec!["10.0.0.2:2055".to_string()],
            port: None,
            distribution: Some(Distribution::RoundRobin),
            packet_size: None,
            reconnect_ms: None,
            quiet: false,
            verbose: 0,
        };

        let config = args.build_config().unwrap();
        assert_eq!(config.distribution, Distribution::RoundRobin);
        assert_eq!(config.packet_size, 2048);
        assert_eq!(config.destinations.len(), 2);
        assert_eq!(config.destinations[1].host, "10.0.0.2");
    }

    #[test]
    fn build_config_rejects_missing_destinations() {
        let args = Args {
            config: None,
            destinations: Vec::new(),
            port: None,
            distribution: None,
            packet_size: None,
            reconnect_ms: None,
            quiet: false,
            verbose: 0,
        };
        assert!(matches!(args.build_config(), Err(ConfigError::NoDestinations)));
    }
}
