//! # rs-megad
//!
//! An async driver for MegaD-style I/O controllers: network boards that
//! expose their ports through loosely-typed HTTP query replies.
//!
//! ## Features
//!
//! - **Prioritized device channel**: one request in flight at a time, user
//!   commands jump ahead of background polling, timeouts retried
//! - **Discovery**: walks every port, follows extenders and buses, and
//!   describes what each port exposes
//! - **Polling**: periodic refresh of every port class, online/offline status
//! - **Smooth transitions**: software ramps or device-side PWM ramps, one
//!   running transition per output
//! - **Push ingress**: device callbacks over HTTP (`web`) or MQTT (`mqtt`)
//!
//! ## Architecture
//!
//! - `port` - Port identifiers, values and configurations
//! - `parsing` - Reply and configuration page parsing
//! - `catalog` - Sensor kinds, I²C device codes and probes
//! - `priority` - Priority-ordered exclusive channel
//! - `channel` - Device channel: URLs, retries, typed requests
//! - `store` - Port state store and push subscriptions
//! - `discovery` - Discovery state machine and device layout
//! - `poller` - Periodic refresh and device status
//! - `transition` - Transition scheduler
//! - `device` - [`DeviceHandle`], tying the above together
//! - `hal` - Transports (mock for testing, reqwest for real devices)
//! - `services` - Push ingress servers (feature-gated)
//!
//! ## Example
//!
//! ```rust
//! use rs_megad::{
//!     hal::MockTransport,
//!     Config, DeviceConfig, DeviceHandle, PortId, PortValue,
//! };
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> rs_megad::Result<()> {
//! let mock = MockTransport::new().with_body("pt=7&cmd=get", "ON");
//! let device = DeviceHandle::new(mock.clone(), Config::new(DeviceConfig::new("10.0.0.14", "sec")));
//!
//! assert_eq!(device.channel().get_port(&PortId::Simple(7)).await?, PortValue::OnOff(true));
//!
//! device.set_port(&PortId::Simple(8), PortValue::OnOff(false)).await?;
//! assert_eq!(mock.requests().last().unwrap(), "pt=8&cmd=8:0");
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

/// Sensor kinds and the I²C device catalog.
pub mod catalog;
/// Device channel with retries and typed requests.
pub mod channel;
/// Configuration for every part of the driver.
pub mod config;
/// The per-device handle.
pub mod device;
/// Discovery state machine.
pub mod discovery;
/// Error types.
pub mod error;
/// Transport implementations.
pub mod hal;
/// Reply and configuration page parsing.
pub mod parsing;
/// Periodic refresh.
pub mod poller;
/// Port identifiers, values and configurations.
pub mod port;
/// Priority-ordered exclusive channel.
pub mod priority;
/// Port state store.
pub mod store;
/// Seams: transport and ramp curves.
pub mod traits;
/// Smooth transitions.
pub mod transition;

/// Push ingress servers (feature-gated).
#[cfg(any(feature = "web", feature = "mqtt"))]
pub mod services;

// Re-exports for convenience
pub use catalog::{BuiltinCatalog, SensorCatalog, SensorChannel, SensorKind};
pub use channel::{DeviceChannel, Query};
pub use config::{
    ChannelConfig, Config, DeviceConfig, DiscoveryConfig, MqttConfig, PlainPortRefresh,
    PollConfig, TransitionConfig,
};
pub use device::{DeviceHandle, PushPayload};
pub use discovery::{DeviceLayout, DiscoveredPort, Discovery, DiscoveryState, EntityDescriptor};
pub use error::{Error, Result, TransportError};
pub use poller::{CycleReport, DeviceStatus, Poller};
pub use port::{PortConfig, PortId, PortValue};
pub use priority::{ChannelPermit, PriorityChannel, PRIORITY_BACKGROUND, PRIORITY_EXPEDITED};
pub use store::{PortStateStore, SubscriptionId};
pub use traits::{Curve, EaseInOut, HttpReply, Linear, MqttMessage, RampCurve, Transport};
pub use transition::{
    Encoding, Leg, TransitionOutcome, TransitionRequest, TransitionScheduler, TransitionTask,
};
