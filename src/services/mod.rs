//! Network services feeding device pushes into a [`DeviceHandle`].
//!
//! - `web` feature: Axum endpoint receiving the device's HTTP pushes
//! - `mqtt` feature: MQTT client mirroring per-port values
//!
//! Both deliver into [`DeviceHandle::ingest_push`], so a device can be wired
//! either way (or both) with the same store and subscriptions:
//!
//! ```ignore
//! let device = Arc::new(DeviceHandle::new(transport, config));
//! let router = build_router(Arc::clone(&device));
//! let mirror = MqttMirror::connect(Arc::clone(&device), &mqtt_config).await;
//! ```
//!
//! [`DeviceHandle`]: crate::device::DeviceHandle
//! [`DeviceHandle::ingest_push`]: crate::device::DeviceHandle::ingest_push

#[cfg(feature = "web")]
pub mod ingress;

#[cfg(feature = "mqtt")]
pub mod mqtt;

#[cfg(feature = "web")]
pub use ingress::*;

#[cfg(feature = "mqtt")]
pub use mqtt::*;
