//! # Forwarding Configuration
//!
//! Structured configuration consumed by the forwarding engine. In the
//! original collector this struct is the output of an XML configuration
//! parser; here it is the boundary the CLI (or any other external
//! collaborator) must fill in and validate before the engine is built.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::ConfigError;

/// Packet distribution policy across connected destinations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Distribution {
    /// Send every packet to every connected destination.
    All,
    /// Send data to one destination at a time, cycling through the group;
    /// new templates are still replicated to every destination.
    RoundRobin,
}

impl std::str::FromStr for Distribution {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['-', '_'], "").as_str() {
            "all" => Ok(Distribution::All),
            "roundrobin" => Ok(Distribution::RoundRobin),
            other => Err(ConfigError::InvalidDistribution(other.to_string())),
        }
    }
}

/// One configured destination: a host and an optional port.
///
/// When `port` is `None` the destination inherits
/// [`ForwardingConfig::default_port`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DestinationConfig {
    pub host: String,
    pub port: Option<String>,
}

impl DestinationConfig {
    pub fn port_or_default(&self, default_port: &str) -> String {
        self.port.clone().unwrap_or_else(|| default_port.to_string())
    }
}

/// Structured configuration for the forwarding engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForwardingConfig {
    pub default_port: String,
    pub distribution: Distribution,
    pub packet_size: u16,
    pub reconnection_period: Duration,
    pub destinations: Vec<DestinationConfig>,
}

impl Default for ForwardingConfig {
    fn default() -> Self {
        Self {
            default_port: "4739".to_string(),
            distribution: Distribution::All,
            packet_size: 4096,
            reconnection_period: Duration::from_millis(1000),
            destinations: Vec::new(),
        }
    }
}

impl ForwardingConfig {
    /// Validates the configuration against the startup-time rules in
    /// the spec: packet size range, at least one destination, a positive
    /// reconnection period. Distribution parsing already fails at
    /// deserialization/CLI-parse time via [`Distribution::from_str`].
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.destinations.is_empty() {
            return Err(ConfigError::NoDestinations);
        }

        if !(256..=65535).contains(&self.packet_size) {
            return Err(ConfigError::PacketSizeOutOfRange(self.packet_size));
        }

        if self.reconnection_period.is_zero() {
            return Err(ConfigError::InvalidReconnectionPeriod);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distribution_parses_case_insensitively() {
        assert_eq!("All".parse::<Distribution>().unwrap(), Distribution::All);
        assert_eq!("ALL".parse::<Distribution>().unwrap(), Distribution::All);
        assert_eq!(
            "round-robin".parse::<Distribution>().unwrap(),
            Distribution::RoundRobin
        );
        assert_eq!(
            "ROUNDROBIN".parse::<Distribution>().unwrap(),
            Distribution::RoundRobin
        );
        assert!("bogus".parse::<Distribution>().is_err());
    }

    #[test]
    fn validate_rejects_empty_destinations() {
        let cfg = ForwardingConfig::default();
        assert!(matches!(cfg.validate(), Err(ConfigError::NoDestinations)));
    }

    #[test]
    fn validate_rejects_packet_size_out_of_range() {
        let mut cfg = ForwardingConfig {
            destinations: vec![DestinationConfig { host: "127.0.0.1".into(), port: None }],
            ..Default::default()
        };
        cfg.packet_size = 100;
        assert!(matches!(cfg.validate(), Err(ConfigError::PacketSizeOutOfRange(100))));
        cfg.packet_size = 4096;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn destination_port_inherits_default() {
        let d = DestinationConfig { host: "10.0.0.1".into(), port: None };
        assert_eq!(d.port_or_default("4739"), "4739");
        let d2 = DestinationConfig { host: "10.0.0.1".into(), port: Some("2055".into()) };
        assert_eq!(d2.port_or_default("4739"), "2055");
    }
}
