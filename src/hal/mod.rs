//! Transport implementations.
//!
//! # Available Implementations
//!
//! - `mock`: scripted transport for tests and offline development
//! - `http`: real HTTP via `reqwest` (requires `http-client` feature)

pub mod mock;

#[cfg(feature = "http-client")]
pub mod http;

pub use mock::*;

#[cfg(feature = "http-client")]
pub use http::*;
