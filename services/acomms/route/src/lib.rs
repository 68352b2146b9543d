//! Single-hop relay routing between acomms queue managers.
//!
//! A node may run several queue managers, one per subnet (a modem id masked
//! with `subnet_mask`). The route manager moves messages between them along a
//! fixed chain of hops:
//!
//! ```text
//! hops:  0.1 ── 1.1 ── 2.1 ── 3.1
//!                ▲      │
//!          received     requeued on the 2.x queue manager,
//!          for 3.1      sent with link destination 3.1
//! ```
//!
//! Resolution always moves exactly one position along the chain. Nodes not on
//! the chain fall back to the default gateway, if one is configured.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod manager;

// Re-export main types
pub use config::RouteManagerConfig;
pub use error::RoutingError;
pub use manager::RouteManager;
