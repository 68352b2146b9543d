//! Driver error types.

use acomms_wire::WireError;
use thiserror::Error;

/// Transport driver errors
#[derive(Error, Debug)]
pub enum DriverError {
    /// Socket or stream I/O failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The channel could not be opened or was lost
    #[error("connection error: {0}")]
    Connection(String),

    /// Unusable transport configuration
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Encoding failure for an outbound transmission
    #[error("wire error: {0}")]
    Wire(#[from] WireError),

    /// The driver has not been started
    #[error("driver not started")]
    NotStarted,
}

impl DriverError {
    /// Whether the owning application should restart the driver
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DriverError::Io(_) | DriverError::Connection(_) | DriverError::NotStarted
        )
    }
}
