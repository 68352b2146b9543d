//! Queue priority functions.

use acomms_wire::{Timestamp, MICROS_PER_SECOND};
use std::sync::Arc;

/// Values a priority function may weigh
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PriorityInputs {
    /// Current time
    pub now: Timestamp,
    /// Last time the queue contributed to a transmission
    pub last_send_time: Timestamp,
    /// Message lifetime for the queue's type
    pub ttl_seconds: f64,
    /// Configured priority weight
    pub value_base: f64,
}

/// Pluggable priority function; the highest value wins the next slot
pub type PriorityFn = Arc<dyn Fn(&PriorityInputs) -> f64 + Send + Sync>;

/// Time since the last send, normalised by TTL and scaled by the value base.
///
/// A queue that has waited for a whole TTL is worth exactly `value_base`.
pub fn ttl_weighted_priority(inputs: &PriorityInputs) -> f64 {
    let elapsed = inputs.now.saturating_sub(inputs.last_send_time) as f64 / MICROS_PER_SECOND as f64;
    if inputs.ttl_seconds <= 0.0 {
        return 0.0;
    }
    elapsed / inputs.ttl_seconds * inputs.value_base
}

/// The default priority function
pub fn default_priority_fn() -> PriorityFn {
    Arc::new(ttl_weighted_priority)
}
