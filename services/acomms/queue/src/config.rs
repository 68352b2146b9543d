//! Queue manager configuration and per-type message policies.

use crate::error::QueueError;
use acomms_wire::ModemId;
use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

bitflags! {
    /// Per-type manipulators controlling encode/decode/queue behaviour
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct Manipulator: u16 {
        /// Accept on push but never encode for transmission
        const NO_ENCODE = 1 << 0;
        /// Drop received messages of this type
        const NO_DECODE = 1 << 1;
        /// Encode to validate, then discard instead of buffering
        const NO_QUEUE = 1 << 2;
        /// Deliver to the local receive path at push time
        const LOOPBACK = 1 << 3;
        /// Deliver to the local receive path when selected for sending
        const LOOPBACK_AS_SENT = 1 << 4;
        /// Produce content through a callback when bandwidth is granted
        const ON_DEMAND = 1 << 5;
        /// Deliver received messages regardless of their destination
        const PROMISCUOUS = 1 << 6;
    }
}

/// Semantic slot a role fills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleKind {
    /// Originating node
    SourceId,
    /// Final destination node
    DestinationId,
    /// Message creation time
    Timestamp,
}

/// Where a role's value comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleSource {
    /// Dotted path into the message body
    Field(String),
    /// Fixed value for every message of the type
    Static(Value),
}

/// Maps a message field (or constant) to a semantic slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Role {
    /// Slot being filled
    pub kind: RoleKind,
    /// Value source
    pub source: RoleSource,
}

impl Role {
    /// Role read from a message field
    pub fn field(kind: RoleKind, path: impl Into<String>) -> Self {
        Self {
            kind,
            source: RoleSource::Field(path.into()),
        }
    }

    /// Role with a constant value
    pub fn fixed(kind: RoleKind, value: Value) -> Self {
        Self {
            kind,
            source: RoleSource::Static(value),
        }
    }
}

/// Policy for one message type
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuedMessageEntry {
    /// Message type identifier
    pub type_id: u32,
    /// Human readable name for diagnostics
    pub name: String,
    /// Request acknowledgement for unicast messages
    pub ack: bool,
    /// Minimum time between sends from this queue
    pub blackout_time_seconds: f64,
    /// Queue depth bound, unbounded if absent
    pub max_queue: Option<usize>,
    /// Send the newest message first
    pub newest_first: bool,
    /// Message lifetime
    pub ttl_seconds: f64,
    /// Priority weight
    pub value_base: f64,
    /// Field roles
    pub roles: Vec<Role>,
    /// Manipulators
    #[serde(default = "Manipulator::empty")]
    pub manipulators: Manipulator,
}

impl Default for QueuedMessageEntry {
    fn default() -> Self {
        Self {
            type_id: 0,
            name: String::new(),
            ack: true,
            blackout_time_seconds: 0.0,
            max_queue: None,
            newest_first: true,
            ttl_seconds: 1800.0,
            value_base: 1.0,
            roles: Vec::new(),
            manipulators: Manipulator::empty(),
        }
    }
}

impl QueuedMessageEntry {
    /// Create a policy with defaults for `type_id`
    pub fn new(type_id: u32) -> Self {
        Self {
            type_id,
            ..Self::default()
        }
    }

    /// Add a role
    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.push(role);
        self
    }

    /// Add manipulators
    pub fn with_manipulators(mut self, manipulators: Manipulator) -> Self {
        self.manipulators |= manipulators;
        self
    }

    /// Display name
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("type {}", self.type_id)
        } else {
            self.name.clone()
        }
    }

    /// Check the policy for internal consistency
    pub fn validate(&self) -> Result<(), QueueError> {
        let name = self.display_name();

        if !(self.ttl_seconds.is_finite() && self.ttl_seconds > 0.0) {
            return Err(QueueError::Configuration(format!("{}: ttl must be positive", name)));
        }
        if !(self.blackout_time_seconds.is_finite() && self.blackout_time_seconds >= 0.0) {
            return Err(QueueError::Configuration(format!(
                "{}: blackout time must be non-negative",
                name
            )));
        }
        if !self.value_base.is_finite() {
            return Err(QueueError::Configuration(format!("{}: value base must be finite", name)));
        }
        if self.max_queue == Some(0) {
            return Err(QueueError::Configuration(format!("{}: max queue must be at least 1", name)));
        }

        let mut seen = HashSet::new();
        for role in &self.roles {
            if !seen.insert(role.kind) {
                return Err(QueueError::Configuration(format!(
                    "{}: duplicate role {:?}",
                    name, role.kind
                )));
            }

            match (&role.kind, &role.source) {
                (RoleKind::Timestamp, RoleSource::Static(_)) => {
                    return Err(QueueError::Configuration(format!(
                        "{}: timestamp role cannot be static",
                        name
                    )));
                }
                (_, RoleSource::Static(value)) => {
                    if value.as_u64().and_then(|v| ModemId::try_from(v).ok()).is_none() {
                        return Err(QueueError::Configuration(format!(
                            "{}: static {:?} must be a modem id, got {}",
                            name, role.kind, value
                        )));
                    }
                }
                (_, RoleSource::Field(path)) => {
                    if path.is_empty() || path.split('.').any(str::is_empty) {
                        return Err(QueueError::Configuration(format!(
                            "{}: invalid field path `{}`",
                            name, path
                        )));
                    }
                }
            }
        }

        Ok(())
    }
}

/// Queue manager configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueManagerConfig {
    /// Local node id
    pub modem_id: ModemId,
    /// Message type policies
    pub message_entries: Vec<QueuedMessageEntry>,
    /// Window in which an on-demand result is reused instead of regenerated
    pub on_demand_skew_seconds: f64,
    /// Time an awaiting-ack message is held back before it may be resent
    pub minimum_ack_wait_seconds: f64,
    /// Build outbound ACKs here instead of relying on the driver
    pub generate_acks: bool,
}

impl Default for QueueManagerConfig {
    fn default() -> Self {
        Self {
            modem_id: 1,
            message_entries: Vec::new(),
            on_demand_skew_seconds: 1.0,
            minimum_ack_wait_seconds: 0.0,
            generate_acks: false,
        }
    }
}
