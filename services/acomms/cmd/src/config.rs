//! Configuration handling for the acomms node.
//!
//! The node reads one YAML file holding a section per component, then applies
//! environment overrides. Command-line overrides are applied by `main`.

use acomms_driver::DriverConfig;
use acomms_mac::MacConfig;
use acomms_queue::QueueManagerConfig;
use acomms_route::RouteManagerConfig;
use acomms_wire::ModemId;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// Node id applied to every component; each section keeps its own when unset
    pub modem_id: Option<ModemId>,
    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Time between component passes, e.g. "100ms"
    pub tick_interval: String,
    /// Wait before restarting after a fatal transport error, e.g. "5s"
    pub restart_backoff: String,
    /// Queue manager section
    pub queue: QueueManagerConfig,
    /// MAC section
    pub mac: MacConfig,
    /// Driver section
    pub driver: DriverConfig,
    /// Route manager section; relaying is off when absent
    pub route: Option<RouteManagerConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            modem_id: None,
            log_level: "info".to_string(),
            tick_interval: "100ms".to_string(),
            restart_backoff: "5s".to_string(),
            queue: QueueManagerConfig::default(),
            mac: MacConfig::default(),
            driver: DriverConfig::default(),
            route: None,
        }
    }
}

impl NodeConfig {
    /// Load configuration from file and environment variables
    pub fn load_from_file<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        let path = config_path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        let mut config = Self::from_yaml(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))?;
        info!("Loaded configuration from {:?}", path);

        config.apply_environment_overrides();
        config.apply_modem_id();

        info!(
            "Final node configuration: modem_id={} mac={:?} log_level={}",
            config.queue.modem_id, config.mac.mode, config.log_level
        );
        Ok(config)
    }

    /// Parse YAML
    pub fn from_yaml(content: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Apply environment variable overrides
    pub fn apply_environment_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(value) = lookup("ACOMMS_MODEM_ID") {
            match value.parse::<ModemId>() {
                Ok(id) => {
                    self.modem_id = Some(id);
                    info!("Modem ID overridden by environment: {}", id);
                }
                Err(_) => tracing::warn!("Ignoring invalid ACOMMS_MODEM_ID: {}", value),
            }
        }

        if let Some(level) = lookup("ACOMMS_LOG_LEVEL") {
            info!("Log level overridden by environment: {}", level);
            self.log_level = level;
        }
    }

    /// Copy the node-wide modem id into every section
    pub fn apply_modem_id(&mut self) {
        if let Some(id) = self.modem_id {
            self.queue.modem_id = id;
            self.mac.modem_id = id;
            self.driver.modem_id = id;
        }
    }

    /// Parsed tick interval
    pub fn tick_interval(&self) -> Result<Duration> {
        humantime::parse_duration(&self.tick_interval)
            .with_context(|| format!("Invalid tick_interval {:?}", self.tick_interval))
    }

    /// Parsed restart backoff
    pub fn restart_backoff(&self) -> Result<Duration> {
        humantime::parse_duration(&self.restart_backoff)
            .with_context(|| format!("Invalid restart_backoff {:?}", self.restart_backoff))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acomms_driver::TransportConfig;
    use acomms_mac::MacMode;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.modem_id, None);
        assert_eq!(config.tick_interval().unwrap(), Duration::from_millis(100));
        assert_eq!(config.restart_backoff().unwrap(), Duration::from_secs(5));
        assert!(config.route.is_none());
    }

    #[test]
    fn test_load_from_file() {
        let yaml_content = r#"
modem_id: 3
tick_interval: 50ms
queue:
  message_entries:
    - type_id: 4
      name: telegram
      ttl_seconds: 600
      roles:
        - kind: destination_id
          source:
            field: dest
mac:
  mode: discovery
  slot_seconds: 5
driver:
  transport:
    type: udp
    bind: 127.0.0.1:0
    peers:
      - modem_id: 1
        address: 127.0.0.1:50001
route:
  hops: [1, 3]
"#;

        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file.write_all(yaml_content.as_bytes()).unwrap();

        let config = NodeConfig::load_from_file(temp_file.path()).unwrap();

        assert_eq!(config.queue.modem_id, 3);
        assert_eq!(config.mac.modem_id, 3);
        assert_eq!(config.driver.modem_id, 3);
        assert_eq!(config.tick_interval().unwrap(), Duration::from_millis(50));
        assert_eq!(config.queue.message_entries[0].ttl_seconds, 600.0);
        assert_eq!(config.mac.mode, MacMode::Discovery);
        assert!(matches!(config.driver.transport, TransportConfig::Udp { ref peers, .. } if peers.len() == 1));
        assert_eq!(config.route.unwrap().hops, vec![1, 3]);
    }

    #[test]
    fn test_missing_file_is_error() {
        assert!(NodeConfig::load_from_file("/nonexistent/acomms.yaml").is_err());
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [("ACOMMS_MODEM_ID", "7"), ("ACOMMS_LOG_LEVEL", "debug")]
            .into_iter()
            .collect();
        let mut config = NodeConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));
        config.apply_modem_id();

        assert_eq!(config.modem_id, Some(7));
        assert_eq!(config.mac.modem_id, 7);
        assert_eq!(config.log_level, "debug");

        let mut config = NodeConfig::default();
        config.apply_overrides(|key| (key == "ACOMMS_MODEM_ID").then(|| "seven".to_string()));
        assert_eq!(config.modem_id, None);
    }
}
