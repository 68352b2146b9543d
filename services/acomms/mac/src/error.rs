//! MAC error types.

use thiserror::Error;

/// MAC scheduler errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MacError {
    /// A slot with an unusable duration or addressing
    #[error("invalid slot: {0}")]
    InvalidSlot(String),

    /// Inconsistent scheduler configuration
    #[error("configuration error: {0}")]
    Configuration(String),
}
