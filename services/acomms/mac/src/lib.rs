//! Time-division medium access control for acomms.
//!
//! Nodes share the acoustic channel by agreeing on a cycle of slots aligned
//! to wall-clock time, so independent nodes stay synchronised without any
//! handshake:
//!
//! - **Fixed**: a configured slot list, each node transmits in its own slots
//! - **Polled**: a master initiates every non-broadcast slot
//! - **Discovery**: one slot per recently heard peer plus a rotating blank slot
//!
//! ## Cycle Alignment
//!
//! ```text
//! reference                    now
//!     |---- C ----|---- C ----|--:-|---- C ----|
//!                                  ^ next cycle: reference + (floor(elapsed / C) + 1) * C
//! ```
//!
//! Schedules are immutable; edits go through a [`ScheduleChangeSet`] that is
//! validated on commit and installed with [`MacManager::update`].

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod manager;
pub mod schedule;

// Re-export main types
pub use config::{MacConfig, MacMode, ReferenceTime};
pub use error::MacError;
pub use manager::{MacEvent, MacManager, MacState};
pub use schedule::{Schedule, ScheduleChangeSet, Slot};
