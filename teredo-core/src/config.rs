#![forbid(unsafe_code)]

//! Teredo configuration handling. Parses a TOML file into a strongly-typed
//! structure consumed once at tunnel construction; there is no hot reload,
//! matching the one-shot startup of the daemon.

use serde::Deserialize;
use std::{
    fs,
    net::{Ipv4Addr, Ipv6Addr},
    path::Path,
    time::Duration,
};

use crate::TeredoError;

/// Operating mode of the tunnel endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayType {
    /// Client behind a NAT; runs the qualification procedure.
    Client,
    /// Relay assuming a cone NAT (or none) in front of it.
    Cone,
    /// Relay behind a restricted NAT.
    Restricted,
}

/// Primary configuration structure shared across Teredo components.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TeredoConfig {
    /// Operating mode (`client`, `cone`, `restricted`).
    pub relay_type: RelayType,

    /// Primary Teredo server (client mode).
    pub server_address: Option<Ipv4Addr>,

    /// Secondary Teredo server, used by the restricted/symmetric probes.
    /// Defaults to the primary when omitted.
    pub server_address2: Option<Ipv4Addr>,

    /// Served Teredo prefix (relay mode). Only the top 32 bits are used.
    pub prefix: Option<Ipv6Addr>,

    /// Local IPv4 to bind the UDP socket on.
    pub bind_address: Ipv4Addr,

    /// Local UDP port; 0 picks an ephemeral port.
    pub bind_port: u16,

    /// When set, the cone flag in peer addresses is not trusted and every
    /// new peer goes through the bubble handshake.
    pub ignore_cone_bit: bool,

    /// Logging verbosity (`error`, `warn`, `info`, `debug`, `trace`).
    pub log_level: Option<String>,

    /// Seconds to wait for a router advertisement during qualification.
    pub qualification_timeout: u64,

    /// Consecutive timeouts tolerated before falling back a probe stage.
    pub qualification_retries: u32,

    /// Cool-down in seconds after losing connectivity or detecting a
    /// symmetric NAT.
    pub restart_delay: u64,
}

impl Default for TeredoConfig {
    fn default() -> Self {
        Self {
            relay_type: RelayType::Client,
            server_address: None,
            server_address2: None,
            prefix: None,
            bind_address: Ipv4Addr::UNSPECIFIED,
            bind_port: 0,
            ignore_cone_bit: true,
            log_level: Some("info".to_string()),
            qualification_timeout: 4,
            qualification_retries: 3,
            restart_delay: 300,
        }
    }
}

impl TeredoConfig {
    /// Load a configuration file from the given path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> crate::TeredoResult<Self> {
        let data = fs::read_to_string(&path).map_err(TeredoError::from)?;
        let cfg = toml::from_str::<TeredoConfig>(&data).map_err(TeredoError::ConfigParse)?;
        cfg.validate()?;
        tracing::debug!(path = %path.as_ref().display(), mode = ?cfg.relay_type, "configuration loaded");
        Ok(cfg)
    }

    /// Semantic checks that cannot be expressed in the type structure.
    pub fn validate(&self) -> crate::TeredoResult<()> {
        match self.relay_type {
            RelayType::Client if self.server_address.is_none() => Err(
                TeredoError::InvalidConfig("client mode requires server_address".into()),
            ),
            RelayType::Cone | RelayType::Restricted if self.prefix.is_none() => Err(
                TeredoError::InvalidConfig("relay mode requires prefix".into()),
            ),
            _ => Ok(()),
        }
    }

    pub fn qualification_timeout(&self) -> Duration {
        Duration::from_secs(self.qualification_timeout)
    }

    pub fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn parse_client_config() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
relay_type = "client"
server_address = "198.51.100.9"
bind_port = 3545
ignore_cone_bit = false
"#
        )
        .unwrap();
        let cfg = TeredoConfig::from_file(f.path()).unwrap();
        assert_eq!(cfg.relay_type, RelayType::Client);
        assert_eq!(cfg.server_address, Some(Ipv4Addr::new(198, 51, 100, 9)));
        assert_eq!(cfg.bind_port, 3545);
        assert!(!cfg.ignore_cone_bit);
        // Defaults preserved for unspecified fields.
        assert_eq!(cfg.qualification_timeout, 4);
        assert_eq!(cfg.qualification_retries, 3);
        assert_eq!(cfg.restart_delay, 300);
    }

    #[test]
    fn client_without_server_rejected() {
        let cfg = TeredoConfig {
            relay_type: RelayType::Client,
            server_address: None,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn relay_without_prefix_rejected() {
        let cfg = TeredoConfig {
            relay_type: RelayType::Cone,
            prefix: None,
            ..Default::default()
        };
        assert!(cfg.validate().is_err());
    }
}
