//! HTTP transport backed by `reqwest`.
//!
//! ```rust,no_run
//! use rs_megad::hal::ReqwestTransport;
//! use rs_megad::traits::Transport;
//!
//! # async fn run() -> Result<(), rs_megad::TransportError> {
//! let transport = ReqwestTransport::new()?;
//! let reply = transport.get("http://192.168.0.14/sec/?pt=7&cmd=get").await?;
//! println!("{} {}", reply.status, reply.body);
//! # Ok(())
//! # }
//! ```

use tracing::trace;

use crate::error::TransportError;
use crate::traits::{HttpReply, Transport};

/// [`Transport`] over a shared `reqwest::Client`.
#[derive(Clone, Debug)]
pub struct ReqwestTransport {
    http: reqwest::Client,
}

impl ReqwestTransport {
    /// Builds a transport with a fresh client.
    pub fn new() -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        Ok(Self { http })
    }

    /// Wraps an existing client, e.g. one shared with other integrations.
    pub fn from_client(http: reqwest::Client) -> Self {
        Self { http }
    }
}

fn map_err(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout
    } else {
        TransportError::Connection(err.to_string())
    }
}

impl Transport for ReqwestTransport {
    async fn get(&self, url: &str) -> Result<HttpReply, TransportError> {
        let response = self.http.get(url).send().await.map_err(map_err)?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(map_err)?;
        trace!(%url, status, body = %body, "device reply");
        Ok(HttpReply { status, body })
    }
}
