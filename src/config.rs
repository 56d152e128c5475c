//! Typed engine configuration, independent of any particular wire format.
//!
//! Parsing JSON/TOML/etc. into this struct is the embedding application's
//! job; this module only owns the four options the core actually consumes
//! and a cheap validation pass so a misconfigured core refuses to start
//! with a typed error instead of panicking deep inside the session reactor.

use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("tcp-proxy-port and udp-proxy-port must differ (both were {0})")]
    ProxyPortsCollide(u16),
    #[error("allowed-http-dest-ports must not be empty")]
    EmptyHttpPorts,
    #[error("allowed-udp-dest-ports must not be empty")]
    EmptyUdpPorts,
    #[error("port 0 is not a valid destination port")]
    ZeroDestPort,
}

/// Engine configuration: the recognized option set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub tcp_proxy_port: u16,
    pub udp_proxy_port: u16,
    pub allowed_http_dest_ports: Vec<u16>,
    pub allowed_udp_dest_ports: Vec<u16>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tcp_proxy_port: 9876,
            udp_proxy_port: 9877,
            allowed_http_dest_ports: vec![80, 443],
            allowed_udp_dest_ports: vec![53],
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tcp_proxy_port == self.udp_proxy_port {
            return Err(ConfigError::ProxyPortsCollide(self.tcp_proxy_port));
        }
        if self.allowed_http_dest_ports.is_empty() {
            return Err(ConfigError::EmptyHttpPorts);
        }
        if self.allowed_udp_dest_ports.is_empty() {
            return Err(ConfigError::EmptyUdpPorts);
        }
        if self
            .allowed_http_dest_ports
            .iter()
            .chain(self.allowed_udp_dest_ports.iter())
            .any(|&port| port == 0)
        {
            return Err(ConfigError::ZeroDestPort);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_option_set() {
        let config = Config::default();
        assert_eq!(config.tcp_proxy_port, 9876);
        assert_eq!(config.udp_proxy_port, 9877);
        assert_eq!(config.allowed_http_dest_ports, vec![80, 443]);
        assert_eq!(config.allowed_udp_dest_ports, vec![53]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn colliding_proxy_ports_are_rejected() {
        let mut config = Config::default();
        config.udp_proxy_port = config.tcp_proxy_port;
        assert_eq!(
            config.validate(),
            Err(ConfigError::ProxyPortsCollide(config.tcp_proxy_port))
        );
    }

    #[test]
    fn empty_allowlists_are_rejected() {
        let mut config = Config::default();
        config.allowed_http_dest_ports.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyHttpPorts));

        let mut config = Config::default();
        config.allowed_udp_dest_ports.clear();
        assert_eq!(config.validate(), Err(ConfigError::EmptyUdpPorts));
    }

    #[test]
    fn zero_dest_port_is_rejected() {
        let mut config = Config::default();
        config.allowed_udp_dest_ports.push(0);
        assert_eq!(config.validate(), Err(ConfigError::ZeroDestPort));
    }
}
