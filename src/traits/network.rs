//! Network abstraction traits.
//!
//! | Item | Purpose |
//! |------|---------|
//! | [`Transport`] | one HTTP GET against the device |
//! | [`HttpReply`] | status and body of that GET |
//! | [`MqttMessage`] | a message received from the broker |
//!
//! Retries, timeouts and serialization are *not* the transport's job; the
//! [`DeviceChannel`](crate::channel::DeviceChannel) layers them on top.

use core::future::Future;

use crate::error::TransportError;

// ============================================================================
// HTTP Transport
// ============================================================================

/// Status and body of one HTTP reply.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HttpReply {
    /// HTTP status code.
    pub status: u16,
    /// Body decoded as text.
    pub body: String,
}

impl HttpReply {
    /// A 200 reply.
    pub fn ok(body: impl Into<String>) -> Self {
        Self {
            status: 200,
            body: body.into(),
        }
    }

    /// A reply with the given status.
    pub fn with_status(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Returns true for status 200.
    pub fn is_ok(&self) -> bool {
        self.status == 200
    }
}

/// Performs a single HTTP GET.
///
/// Implementations should not retry and need not enforce a timeout; the
/// device channel wraps every call in its own timeout.
///
/// # Example
///
/// ```rust
/// use rs_megad::traits::{HttpReply, Transport};
/// use rs_megad::TransportError;
///
/// struct AlwaysOn;
///
/// impl Transport for AlwaysOn {
///     async fn get(&self, _url: &str) -> Result<HttpReply, TransportError> {
///         Ok(HttpReply::ok("ON"))
///     }
/// }
/// ```
pub trait Transport: Send + Sync + 'static {
    /// Fetches `url`.
    fn get(&self, url: &str) -> impl Future<Output = Result<HttpReply, TransportError>> + Send;
}

impl<T: Transport> Transport for std::sync::Arc<T> {
    fn get(&self, url: &str) -> impl Future<Output = Result<HttpReply, TransportError>> + Send {
        (**self).get(url)
    }
}

// ============================================================================
// MQTT
// ============================================================================

/// An MQTT message received from a subscription.
#[derive(Clone, Debug)]
pub struct MqttMessage {
    /// Topic the message was published to.
    pub topic: String,
    /// Message payload as raw bytes.
    pub payload: Vec<u8>,
}

impl MqttMessage {
    /// Create a new MQTT message.
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }

    /// Returns the payload as a UTF-8 string, if valid.
    pub fn payload_str(&self) -> Option<&str> {
        core::str::from_utf8(&self.payload).ok()
    }
}
