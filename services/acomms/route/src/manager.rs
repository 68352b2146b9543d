//! Relay resolution along a configured hop chain and the subnet registry.

use crate::config::RouteManagerConfig;
use crate::error::RoutingError;
use acomms_queue::{DynamicMessage, MessageMeta, MessageRouter, QueuePushHandle};
use acomms_wire::ModemId;
use dashmap::DashMap;
use std::cmp::Ordering;
use tracing::{debug, warn};

/// Forwards messages between the queue managers of one node
pub struct RouteManager {
    config: RouteManagerConfig,
    subnets: DashMap<u32, QueuePushHandle>,
}

impl RouteManager {
    /// Create a route manager with no registered subnets
    pub fn new(config: RouteManagerConfig) -> Self {
        for (i, hop) in config.hops.iter().enumerate() {
            if config.hops[..i].contains(hop) {
                warn!("Hop {} appears more than once in the route, using its first position", hop);
            }
        }
        Self {
            config,
            subnets: DashMap::new(),
        }
    }

    /// Current configuration
    pub fn config(&self) -> &RouteManagerConfig {
        &self.config
    }

    /// Subnet a modem id belongs to
    pub fn subnet(&self, modem_id: ModemId) -> u32 {
        modem_id & self.config.subnet_mask
    }

    /// Neighbour of `us` one step toward `dest`.
    ///
    /// Never skips hops. Falls back to the default gateway when either node is
    /// missing from the chain.
    pub fn find_next_hop(&self, us: ModemId, dest: ModemId) -> Result<ModemId, RoutingError> {
        let hops = &self.config.hops;
        let position = |id: ModemId| hops.iter().position(|&h| h == id);

        let next = match (position(us), position(dest)) {
            (Some(ours), Some(theirs)) => match ours.cmp(&theirs) {
                Ordering::Less => hops.get(ours + 1),
                Ordering::Greater => ours.checked_sub(1).and_then(|i| hops.get(i)),
                Ordering::Equal => hops.get(ours),
            },
            _ => None,
        };

        match (next, self.config.default_gateway) {
            (Some(&hop), _) => Ok(hop),
            (None, Some(gateway)) => {
                debug!("Using default gateway {} for {} -> {}", gateway, us, dest);
                Ok(gateway)
            }
            (None, None) => Err(RoutingError::NoRoute { from: us, to: dest }),
        }
    }

    /// Register the queue manager owning `modem_id`'s subnet. The last registration wins.
    pub fn add_subnet_queue(&self, modem_id: ModemId, handle: Option<QueuePushHandle>) {
        let Some(handle) = handle else {
            warn!("No queue manager given for modem_id={}, ignoring", modem_id);
            return;
        };
        let subnet = self.subnet(modem_id);
        if self.subnets.insert(subnet, handle).is_some() {
            warn!("Subnet {:#x} already mapped, replacing", subnet);
        } else {
            debug!("Registered subnet {:#x} for modem_id={}", subnet, modem_id);
        }
    }

    /// Number of registered subnets
    pub fn subnet_count(&self) -> usize {
        self.subnets.len()
    }

    /// Re-enqueue `msg` on the queue manager serving the next hop toward `meta.dest`.
    ///
    /// Returns the next hop.
    pub fn forward(
        &self,
        meta: &MessageMeta,
        msg: &DynamicMessage,
        local: ModemId,
    ) -> Result<ModemId, RoutingError> {
        let next_hop = self.find_next_hop(local, meta.dest)?;
        let subnet = self.subnet(next_hop);
        let handle = self.subnets.get(&subnet).ok_or(RoutingError::NoSubnet(subnet))?;
        handle.push(msg.clone())?;
        Ok(next_hop)
    }
}

impl MessageRouter for RouteManager {
    fn handle_in(&self, meta: &MessageMeta, msg: &DynamicMessage, local: ModemId) {
        match self.forward(meta, msg, local) {
            Ok(next_hop) => debug!(
                "Requeued message for relay: src={} dest={} next_hop={}",
                meta.src, meta.dest, next_hop
            ),
            Err(e) => warn!("Dropping message for {}: {}", meta.dest, e),
        }
    }

    fn handle_out(&self, meta: &mut MessageMeta, _msg: &DynamicMessage, local: ModemId) {
        match self.find_next_hop(local, meta.dest) {
            Ok(next_hop) => meta.dest = next_hop,
            Err(e) => debug!("Leaving link destination {} unchanged: {}", meta.dest, e),
        }
    }
}
