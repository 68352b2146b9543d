//! MAC configuration.

use crate::error::MacError;
use crate::schedule::Slot;
use acomms_wire::{seconds_to_micros, ModemId, Timestamp, MICROS_PER_SECOND};
use serde::{Deserialize, Serialize};

const MICROS_PER_DAY: u64 = 86_400 * MICROS_PER_SECOND;

/// Scheduling policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MacMode {
    /// Decentralised TDMA over a fixed slot list
    #[default]
    Fixed,
    /// Centralised polling: every non-broadcast slot is initiated by this node
    Polled,
    /// Decentralised TDMA over the peers heard recently
    Discovery,
}

/// Origin all nodes align their cycles to
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ReferenceTime {
    /// Midnight UTC of the current day
    #[default]
    StartOfDay,
    /// A fixed UNIX time
    Fixed {
        /// Seconds since the UNIX epoch
        unix_seconds: f64,
    },
}

impl ReferenceTime {
    /// The reference instant in effect at `now`
    pub fn at(&self, now: Timestamp) -> Timestamp {
        match self {
            ReferenceTime::StartOfDay => now - now % MICROS_PER_DAY,
            ReferenceTime::Fixed { unix_seconds } => seconds_to_micros(*unix_seconds),
        }
    }
}

/// MAC scheduler configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MacConfig {
    /// Local node id
    pub modem_id: ModemId,
    /// Scheduling policy
    pub mode: MacMode,
    /// Slots for fixed and polled modes
    pub slots: Vec<Slot>,
    /// Slot length for discovered peers
    pub slot_seconds: f64,
    /// Rate for discovered peers
    pub rate: u32,
    /// Cycles a discovered peer may stay silent before removal
    pub expire_cycles: u32,
    /// Join the current cycle at the next slot instead of waiting for a new cycle
    pub start_cycle_in_middle: bool,
    /// Cycle origin
    pub reference: ReferenceTime,
    /// Lateness beyond which a slot is skipped and the cycle realigned
    pub allowed_skew_seconds: f64,
}

impl Default for MacConfig {
    fn default() -> Self {
        Self {
            modem_id: 1,
            mode: MacMode::Fixed,
            slots: Vec::new(),
            slot_seconds: 15.0,
            rate: 0,
            expire_cycles: 3,
            start_cycle_in_middle: true,
            reference: ReferenceTime::StartOfDay,
            allowed_skew_seconds: 2.0,
        }
    }
}

impl MacConfig {
    /// Check the configuration
    pub fn validate(&self) -> Result<(), MacError> {
        if self.mode == MacMode::Discovery {
            if !(self.slot_seconds.is_finite() && self.slot_seconds > 0.0) {
                return Err(MacError::Configuration(format!(
                    "slot_seconds must be positive, got {}",
                    self.slot_seconds
                )));
            }
            if self.expire_cycles == 0 {
                return Err(MacError::Configuration("expire_cycles must be at least 1".to_string()));
            }
        }
        if !(self.allowed_skew_seconds.is_finite() && self.allowed_skew_seconds >= 0.0) {
            return Err(MacError::Configuration(format!(
                "allowed_skew_seconds must be non-negative, got {}",
                self.allowed_skew_seconds
            )));
        }
        for slot in &self.slots {
            slot.validate()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_of_day_reference() {
        let now = 3 * MICROS_PER_DAY + 5 * MICROS_PER_SECOND;
        assert_eq!(ReferenceTime::StartOfDay.at(now), 3 * MICROS_PER_DAY);
        let fixed = ReferenceTime::Fixed { unix_seconds: 12.5 };
        assert_eq!(fixed.at(now), 12_500_000);
    }

    #[test]
    fn test_config_from_yaml() {
        let config: MacConfig = serde_yaml::from_str(
            r#"
modem_id: 3
mode: polled
reference:
  fixed:
    unix_seconds: 100
slots:
  - src: 1
    slot_seconds: 5
  - src: 3
    dest: 1
    kind: ranging
"#,
        )
        .unwrap();

        assert_eq!(config.mode, MacMode::Polled);
        assert_eq!(config.reference, ReferenceTime::Fixed { unix_seconds: 100.0 });
        assert_eq!(config.slots.len(), 2);
        assert_eq!(config.slots[1].slot_seconds, 10.0);
        assert_eq!(config.allowed_skew_seconds, 2.0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_discovery_validation() {
        let config = MacConfig {
            mode: MacMode::Discovery,
            expire_cycles: 0,
            ..MacConfig::default()
        };
        assert!(matches!(config.validate(), Err(MacError::Configuration(_))));
    }
}
