//! Routing error types.

use acomms_queue::QueueError;
use acomms_wire::ModemId;
use thiserror::Error;

/// Routing errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RoutingError {
    /// Neither the route nor a default gateway leads toward the destination
    #[error("no route from {from} to {to}")]
    NoRoute {
        /// Node resolving the hop
        from: ModemId,
        /// Final destination
        to: ModemId,
    },

    /// No queue manager is registered for the next hop's subnet
    #[error("no queue registered for subnet {0:#x}")]
    NoSubnet(u32),

    /// The subnet's queue manager rejected the message
    #[error("queue error: {0}")]
    Queue(#[from] QueueError),
}
