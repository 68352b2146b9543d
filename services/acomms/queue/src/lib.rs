//! Priority and acknowledgement aware message queueing for acomms.
//!
//! The queue manager owns one [`Queue`] per configured message type and
//! decides, each time the MAC grants the channel, which buffered messages
//! go into the transmission. It provides:
//!
//! - **Roles**: source, destination and timestamp pulled from message fields
//!   by dotted path
//! - **Manipulators**: per-type loopback, on-demand, no-queue and
//!   promiscuous behaviour
//! - **Priority**: pluggable function, TTL-weighted by default
//! - **Acknowledgement**: frames awaiting ACK are tracked by link
//!   destination and frame number until acknowledged or released
//! - **Expiry**: messages older than their TTL are dropped
//!
//! ## Frame Layout
//!
//! ```text
//! +-------------+-----------+-------------+-----------+-----
//! | len u16 BE  | message 0 | len u16 BE  | message 1 | ...
//! +-------------+-----------+-------------+-----------+-----
//! ```
//!
//! All output is delivered as [`QueueEvent`]s over a bounded channel that the
//! owner drains after each call.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod codec;
pub mod config;
pub mod error;
pub mod manager;
pub mod message;
pub mod priority;
pub mod queue;

// Re-export main types
pub use codec::{pack_frame, packed_len, unpack_frame, CborCodec, Codec};
pub use config::{Manipulator, QueueManagerConfig, QueuedMessageEntry, Role, RoleKind, RoleSource};
pub use error::{CodecError, QueueError};
pub use manager::{MessageRouter, OnDemandFn, QueueEvent, QueueManager, QueuePushHandle};
pub use message::{DynamicMessage, FieldAccess};
pub use priority::{default_priority_fn, ttl_weighted_priority, PriorityFn, PriorityInputs};
pub use queue::{MessageMeta, Queue, QueuedMessage};
