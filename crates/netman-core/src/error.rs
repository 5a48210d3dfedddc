//! Error types for the netman core
//!
//! This module defines all error types used throughout the crate.

use thiserror::Error;

use crate::ip_config::AddrFamily;

/// Result type alias for netman operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the netman core
#[derive(Error, Debug)]
pub enum Error {
    /// A platform (kernel) operation was rejected
    #[error("Platform error: {0}")]
    Platform(String),

    /// The platform is temporarily unable to serve the request (EBUSY/EAGAIN)
    #[error("Platform busy: {0}")]
    PlatformBusy(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid input (bad address, family mismatch, malformed fragment)
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Object not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// No device with this interface index is managed
    #[error("Unknown device: ifindex {0}")]
    UnknownDevice(u32),

    /// The device cannot accept an activation in its current state
    #[error("Device {ifindex} unavailable: {message}")]
    DeviceUnavailable {
        /// Interface index
        ifindex: u32,
        /// Why the request was refused
        message: String,
    },

    /// The profile cannot be activated on this device
    #[error("Profile {profile} is not compatible with device {ifindex}")]
    Incompatible {
        /// Interface index
        ifindex: u32,
        /// Profile id
        profile: String,
    },

    /// Commit could not install the configuration
    #[error("Commit failed ({family}): {message}")]
    Commit {
        /// Address family being committed
        family: AddrFamily,
        /// Error message
        message: String,
    },

    /// Illegal state transition requested
    #[error("Invalid transition {from} -> {to}")]
    InvalidTransition {
        /// Current state
        from: String,
        /// Requested state
        to: String,
    },

    /// Internal invariant breached (programmer error)
    #[error("Invariant violated: {0}")]
    Invariant(String),

    /// An internal channel was closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// IO errors (resolv.conf, config files)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create a platform error
    pub fn platform(msg: impl Into<String>) -> Self {
        Self::Platform(msg.into())
    }

    /// Create a transient platform error
    pub fn busy(msg: impl Into<String>) -> Self {
        Self::PlatformBusy(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Create a "not found" error
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a device-unavailable error
    pub fn unavailable(ifindex: u32, message: impl Into<String>) -> Self {
        Self::DeviceUnavailable {
            ifindex,
            message: message.into(),
        }
    }

    /// Create a commit error
    pub fn commit(family: AddrFamily, message: impl Into<String>) -> Self {
        Self::Commit {
            family,
            message: message.into(),
        }
    }

    /// Create an invariant violation
    pub fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// Whether retrying the same operation may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::PlatformBusy(_))
    }

    /// Whether the error means the device's processing must stop
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_) | Self::InvalidTransition { .. })
    }
}

/// Helper for converting anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Self::Other(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::busy("EBUSY").is_transient());
        assert!(!Error::platform("EEXIST").is_transient());
        assert!(Error::invariant("no config").is_fatal());
        assert!(!Error::commit(AddrFamily::V4, "rejected").is_fatal());
    }

    #[test]
    fn test_error_display() {
        let err = Error::commit(AddrFamily::V6, "address rejected");
        assert_eq!(err.to_string(), "Commit failed (ipv6): address rejected");
    }
}
