//! Driver configuration.

use crate::error::DriverError;
use acomms_wire::{ModemId, DEFAULT_MAX_MESSAGE_SIZE, UDP_MAX_PACKET_SIZE};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, ToSocketAddrs};

/// Bytes reserved for transmission fields around the payload frames
pub const TRANSMISSION_OVERHEAD: usize = 256;

/// Largest request/reply message exchanged with a store server
pub const STORE_MAX_MESSAGE_SIZE: usize = u16::MAX as usize;

/// How a byte-stream transport reaches its peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamEndpoint {
    /// Connect out to a listening peer
    TcpClient {
        /// host:port of the peer
        address: String,
    },
    /// Listen and accept a single peer
    TcpServer {
        /// host:port to bind
        bind: String,
    },
}

/// A datagram destination for a modem id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UdpPeer {
    /// Modem reachable at `address`
    pub modem_id: ModemId,
    /// host:port
    pub address: String,
}

/// Transport selection and its extension fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    /// Byte-stuffed, CRC-checked framing over a byte stream
    Framed {
        /// Where the stream comes from
        endpoint: StreamEndpoint,
        /// Largest declared message accepted from the stream
        #[serde(default = "default_max_message_size")]
        max_message_size: usize,
    },
    /// One transmission per UDP datagram
    Udp {
        /// Local host:port
        bind: String,
        /// Known peers; broadcast and unknown destinations go to all of them
        #[serde(default)]
        peers: Vec<UdpPeer>,
    },
    /// Periodic request/reply exchange with a store server
    Store {
        /// Server host:port
        server: String,
        /// Time between requests
        #[serde(default = "default_query_interval")]
        query_interval_seconds: f64,
        /// Time to wait for a reply before resetting the connection
        #[serde(default = "default_request_timeout")]
        request_timeout_seconds: f64,
    },
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_query_interval() -> f64 {
    1.0
}

fn default_request_timeout() -> f64 {
    5.0
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Udp {
            bind: "0.0.0.0:50000".to_string(),
            peers: Vec::new(),
        }
    }
}

impl TransportConfig {
    /// Payload bytes one transmission can carry on this transport
    pub fn payload_budget(&self) -> usize {
        let message_size = match self {
            TransportConfig::Framed { max_message_size, .. } => *max_message_size,
            TransportConfig::Udp { .. } => UDP_MAX_PACKET_SIZE,
            TransportConfig::Store { .. } => DEFAULT_MAX_MESSAGE_SIZE,
        };
        message_size.saturating_sub(TRANSMISSION_OVERHEAD)
    }
}

/// Transport driver configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Local node id
    pub modem_id: ModemId,
    /// Answer DATA that requests acknowledgement with an ACK automatically
    pub auto_ack: bool,
    /// Transport
    pub transport: TransportConfig,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            modem_id: 1,
            auto_ack: true,
            transport: TransportConfig::default(),
        }
    }
}

impl DriverConfig {
    /// Check the configuration
    pub fn validate(&self) -> Result<(), DriverError> {
        match &self.transport {
            TransportConfig::Framed { max_message_size, .. } => {
                if *max_message_size <= TRANSMISSION_OVERHEAD || *max_message_size > u16::MAX as usize {
                    return Err(DriverError::Configuration(format!(
                        "max_message_size must be in {}..={}, got {}",
                        TRANSMISSION_OVERHEAD + 1,
                        u16::MAX,
                        max_message_size
                    )));
                }
            }
            TransportConfig::Udp { .. } => {}
            TransportConfig::Store {
                query_interval_seconds,
                request_timeout_seconds,
                ..
            } => {
                for (name, value) in [
                    ("query_interval_seconds", query_interval_seconds),
                    ("request_timeout_seconds", request_timeout_seconds),
                ] {
                    if !(value.is_finite() && *value > 0.0) {
                        return Err(DriverError::Configuration(format!(
                            "{} must be positive, got {}",
                            name, value
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

/// Resolve host:port to the first matching socket address
pub fn resolve(address: &str) -> Result<SocketAddr, DriverError> {
    address
        .to_socket_addrs()
        .map_err(|e| DriverError::Configuration(format!("cannot resolve {}: {}", address, e)))?
        .next()
        .ok_or_else(|| DriverError::Configuration(format!("no address for {}", address)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_framed_config_from_json() {
        let config: DriverConfig = serde_json::from_str(
            r#"{
                "modem_id": 2,
                "transport": {
                    "type": "framed",
                    "endpoint": {"tcp_client": {"address": "127.0.0.1:6000"}}
                }
            }"#,
        )
        .unwrap();

        assert!(config.auto_ack);
        assert_eq!(
            config.transport,
            TransportConfig::Framed {
                endpoint: StreamEndpoint::TcpClient {
                    address: "127.0.0.1:6000".to_string()
                },
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            }
        );
        assert_eq!(
            config.transport.payload_budget(),
            DEFAULT_MAX_MESSAGE_SIZE - TRANSMISSION_OVERHEAD
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_store_validation() {
        let config = DriverConfig {
            transport: TransportConfig::Store {
                server: "127.0.0.1:1".to_string(),
                query_interval_seconds: 0.0,
                request_timeout_seconds: 1.0,
            },
            ..DriverConfig::default()
        };
        assert!(matches!(config.validate(), Err(DriverError::Configuration(_))));
    }

    #[test]
    fn test_resolve() {
        assert_eq!(resolve("127.0.0.1:9").unwrap().port(), 9);
        assert!(resolve("not an address").is_err());
    }
}
