//! Route manager configuration.

use acomms_wire::ModemId;
use serde::{Deserialize, Serialize};

/// Route manager configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RouteManagerConfig {
    /// Ordered relay chain; messages walk it one neighbour at a time
    pub hops: Vec<ModemId>,
    /// Mask selecting the subnet part of a modem id
    pub subnet_mask: u32,
    /// Next hop for destinations the chain cannot resolve
    pub default_gateway: Option<ModemId>,
}

impl Default for RouteManagerConfig {
    fn default() -> Self {
        Self {
            hops: Vec::new(),
            subnet_mask: 0xFFFF_FF00,
            default_gateway: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: RouteManagerConfig = serde_json::from_str(r#"{"hops": [1, 257, 513]}"#).unwrap();
        assert_eq!(config.hops, vec![1, 257, 513]);
        assert_eq!(config.subnet_mask, 0xFFFF_FF00);
        assert_eq!(config.default_gateway, None);
    }
}
