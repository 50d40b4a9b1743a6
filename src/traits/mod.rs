//! Seams between the driver and the outside world.
//!
//! # Submodules
//!
//! - `network`: the HTTP transport the device channel talks through, and MQTT messages
//! - `strategy`: ramp curves used by software transitions
//!
//! # Transport
//!
//! [`Transport`] is the only thing the driver needs to reach a device. The
//! `http-client` feature provides [`ReqwestTransport`](crate::hal::ReqwestTransport);
//! tests use [`MockTransport`](crate::hal::MockTransport).
//!
//! # Ramp Curves
//!
//! Software transitions sample a [`RampCurve`] every tick:
//!
//! - [`Linear`]: constant rate
//! - [`EaseInOut`]: smoothstep, gentle at both ends

pub mod network;
pub mod strategy;

pub use network::*;
pub use strategy::*;
