//! Error types shared by every layer of the driver.
//!
//! The taxonomy follows how the device misbehaves in practice:
//!
//! | Situation | Surfaced as |
//! |-----------|-------------|
//! | every attempt timed out | [`Error::TransportTimeout`] |
//! | non-200 reply | `Ok(None)` from [`DeviceChannel::request`], logged |
//! | bad secret | `Ok(false)` from [`DeviceChannel::authenticate`] |
//! | `"busy"` reply | [`PortValue::Busy`], never stored |
//! | empty reply where data was expected | [`Error::NoPortData`] |
//! | config page without selectors | [`PortConfig::Unconfigured`] |
//!
//! [`DeviceChannel::request`]: crate::channel::DeviceChannel::request
//! [`DeviceChannel::authenticate`]: crate::channel::DeviceChannel::authenticate
//! [`PortValue::Busy`]: crate::port::PortValue::Busy
//! [`PortConfig::Unconfigured`]: crate::port::PortConfig::Unconfigured

use thiserror::Error;

use crate::port::PortId;

/// Failure of a single transport attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    /// The attempt did not complete within the per-attempt timeout.
    #[error("request timed out")]
    Timeout,

    /// The connection could not be established or was dropped.
    #[error("connection failed: {0}")]
    Connection(String),
}

/// Errors returned by the driver.
#[derive(Debug, Error)]
pub enum Error {
    /// All attempts of a request timed out.
    #[error("device did not answer after {attempts} attempts")]
    TransportTimeout {
        /// Number of attempts made.
        attempts: u32,
    },

    /// All attempts failed and the last failure was not a timeout.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The device answered, but with nothing parseable.
    #[error("no data for port {port}")]
    NoPortData {
        /// Port the request was about, as sent on the wire.
        port: String,
    },

    /// The device root page answered with a non-200 status.
    #[error("cannot connect to device (status {status})")]
    CannotConnect {
        /// HTTP status returned by the device.
        status: u16,
    },

    /// The operation was cancelled before it reached the device.
    #[error("operation cancelled")]
    Cancelled,

    /// A port identifier could not be parsed.
    #[error("invalid port id: {0:?}")]
    InvalidPortId(String),

    /// The priority channel was released while nobody held it.
    #[error("priority channel released without being held")]
    ChannelNotHeld,

    /// A port is not part of the discovered layout.
    #[error("unknown port {0}")]
    UnknownPort(PortId),

    /// A value that cannot be sent to a port.
    #[error("cannot send {value} to port {port}")]
    InvalidValue {
        /// Target port.
        port: PortId,
        /// Rejected value, as displayed.
        value: String,
    },
}

impl Error {
    /// Builds [`Error::NoPortData`] for a port.
    pub fn no_data(port: impl ToString) -> Self {
        Error::NoPortData {
            port: port.to_string(),
        }
    }

    /// Returns true for the channel-level timeout that marks a device offline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::TransportTimeout { .. })
    }

    /// Returns true when the device could not be reached at all.
    pub fn is_unreachable(&self) -> bool {
        matches!(self, Error::TransportTimeout { .. } | Error::Transport(_))
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
