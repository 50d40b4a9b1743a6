//! Device channel: every request to the device goes through here.
//!
//! A request is one HTTP GET of the form
//!
//! ```text
//! http://{host}/{secret}/?pt=7&cmd=get
//! ```
//!
//! run under the [`PriorityChannel`], so the device only ever sees one request
//! at a time. Each attempt is bounded by a timeout; failed attempts are
//! retried after a pause:
//!
//! | Outcome | Result |
//! |---------|--------|
//! | 200 | `Ok(Some(body))` |
//! | other status | `Ok(None)`, logged at `warn` |
//! | every attempt timed out | `Err(Error::TransportTimeout)` |
//! | every attempt failed, last one not a timeout | `Err(Error::Transport)` |
//!
//! The convenience methods ([`get_port`](DeviceChannel::get_port),
//! [`list_port`](DeviceChannel::list_port), [`read_all`](DeviceChannel::read_all), ...)
//! build the query and parse the reply.

use core::fmt;

use chrono::{Datelike, NaiveDateTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::{ChannelConfig, DeviceConfig};
use crate::error::{Error, Result, TransportError};
use crate::parsing::{self, ParseMode, ScanEntry};
use crate::port::{PortId, PortValue};
use crate::priority::{ChannelPermit, PriorityChannel, PRIORITY_BACKGROUND};
use crate::traits::{HttpReply, Transport};

// ============================================================================
// Query
// ============================================================================

/// Ordered query parameters of one request.
///
/// ```rust
/// use rs_megad::channel::Query;
///
/// let q = Query::new().param("pt", 7).param_opt("ext", None::<u32>).param("cmd", "get");
/// assert_eq!(q.to_string(), "pt=7&cmd=get");
/// ```
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Query {
    params: Vec<(String, String)>,
}

impl Query {
    /// Empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Query addressing one port: `pt=<port>`.
    pub fn port(port: impl fmt::Display) -> Self {
        Self::new().param("pt", port)
    }

    /// Appends a parameter.
    pub fn param(mut self, key: &str, value: impl fmt::Display) -> Self {
        self.params.push((key.to_string(), value.to_string()));
        self
    }

    /// Appends a parameter if `value` is present.
    pub fn param_opt(self, key: &str, value: Option<impl fmt::Display>) -> Self {
        match value {
            Some(v) => self.param(key, v),
            None => self,
        }
    }

    /// Looks up a parameter.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    /// All parameters, in order.
    pub fn pairs(&self) -> &[(String, String)] {
        &self.params
    }

    /// Returns true when there are no parameters.
    pub fn is_empty(&self) -> bool {
        self.params.is_empty()
    }
}

impl From<Vec<(String, String)>> for Query {
    fn from(params: Vec<(String, String)>) -> Self {
        Self { params }
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (k, v)) in self.params.iter().enumerate() {
            if i > 0 {
                f.write_str("&")?;
            }
            write!(f, "{k}={v}")?;
        }
        Ok(())
    }
}

// ============================================================================
// Device Channel
// ============================================================================

/// Serialized, retrying access to one device.
pub struct DeviceChannel<T> {
    transport: T,
    host: String,
    base_url: String,
    config: ChannelConfig,
    lock: PriorityChannel,
}

impl<T: Transport> DeviceChannel<T> {
    /// Creates a channel for the device at `device.host`.
    pub fn new(transport: T, device: &DeviceConfig, config: ChannelConfig) -> Self {
        Self {
            transport,
            host: device.host.clone(),
            base_url: format!("http://{}/{}", device.host, device.secret),
            config,
            lock: PriorityChannel::new(),
        }
    }

    /// The lock every request goes through.
    pub fn priority_channel(&self) -> &PriorityChannel {
        &self.lock
    }

    /// Retry policy in use.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Full URL for a query.
    pub fn url(&self, query: &Query) -> String {
        if query.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/?{}", self.base_url, query)
        }
    }

    /// Runs one request at `priority`.
    pub async fn request(&self, priority: i32, query: &Query) -> Result<Option<String>> {
        let permit = self.lock.acquire(priority).await;
        self.request_held(&permit, query).await
    }

    /// Like [`request`](Self::request), but gives up waiting for the channel
    /// when `token` is cancelled. A request that already holds the channel
    /// runs to completion.
    pub async fn request_cancellable(
        &self,
        priority: i32,
        query: &Query,
        token: &CancellationToken,
    ) -> Result<Option<String>> {
        let permit = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(Error::Cancelled),
            permit = self.lock.acquire(priority) => permit,
        };
        self.request_held(&permit, query).await
    }

    async fn request_held(&self, _permit: &ChannelPermit, query: &Query) -> Result<Option<String>> {
        let reply = self.fetch(query).await?;
        if reply.is_ok() {
            Ok(Some(reply.body))
        } else {
            warn!(%query, status = reply.status, body = %reply.body, "device rejected request");
            Ok(None)
        }
    }

    /// GET with timeout and retries. The caller holds the channel.
    async fn fetch(&self, query: &Query) -> Result<HttpReply> {
        let url = self.url(query);
        let attempts = self.config.attempts.max(1);
        let mut last = TransportError::Timeout;

        for attempt in 1..=attempts {
            debug!(%query, attempt, "request");
            match tokio::time::timeout(self.config.timeout(), self.transport.get(&url)).await {
                Ok(Ok(reply)) => {
                    trace!(%query, status = reply.status, body = %reply.body, "reply");
                    return Ok(reply);
                }
                Ok(Err(err)) => {
                    warn!(%query, attempt, error = %err, "request failed");
                    last = err;
                }
                Err(_) => {
                    warn!(%query, attempt, "request timed out");
                    last = TransportError::Timeout;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.retry_delay()).await;
            }
        }

        match last {
            TransportError::Timeout => Err(Error::TransportTimeout { attempts }),
            other => Err(Error::Transport(other)),
        }
    }

    /// Checks the secret against the device root page.
    ///
    /// Returns `Ok(false)` for a wrong secret and
    /// [`Error::CannotConnect`] for any other non-200 reply.
    pub async fn authenticate(&self) -> Result<bool> {
        let _permit = self.lock.acquire(PRIORITY_BACKGROUND).await;
        let reply = self.fetch(&Query::new()).await?;
        if reply.body.contains("Unauthorized") {
            return Ok(false);
        }
        if !reply.is_ok() {
            return Err(Error::CannotConnect {
                status: reply.status,
            });
        }
        Ok(true)
    }

    // ========================================================================
    // Convenience operations
    // ========================================================================

    /// Config page of a port (`?pt=<port>`).
    pub async fn port_page(&self, port: u32) -> Result<Option<String>> {
        self.request(PRIORITY_BACKGROUND, &Query::port(port)).await
    }

    /// Config page of an extender child (`?pt=<port>&ext=<index>`).
    pub async fn extender_page(&self, port: u32, index: u32) -> Result<Option<String>> {
        let query = Query::port(port).param("ext", index);
        self.request(PRIORITY_BACKGROUND, &query).await
    }

    /// Sends `cmd`, addressed to `port` if given.
    pub async fn send_command(
        &self,
        priority: i32,
        port: Option<&PortId>,
        cmd: &str,
    ) -> Result<Option<String>> {
        let query = Query::new().param_opt("pt", port).param("cmd", cmd);
        self.request(priority, &query).await
    }

    /// Current value of a port (`cmd=get`).
    pub async fn get_port(&self, port: &PortId) -> Result<PortValue> {
        let body = self
            .send_command(PRIORITY_BACKGROUND, Some(port), "get")
            .await?;
        parsing::parse_response(port, body, ParseMode::Get)
    }

    /// Bus listing of a port (`cmd=list`).
    pub async fn list_port(&self, port: u32) -> Result<PortValue> {
        let id = PortId::Simple(port);
        let body = self
            .send_command(PRIORITY_BACKGROUND, Some(&id), "list")
            .await?;
        parsing::parse_response(port, body, ParseMode::List)
    }

    /// Positional fields of a port's `get` reply, e.g. the children of an extender.
    pub async fn get_fields(&self, port: u32) -> Result<Vec<String>> {
        let id = PortId::Simple(port);
        let body = self
            .send_command(PRIORITY_BACKGROUND, Some(&id), "get")
            .await?
            .ok_or_else(|| Error::no_data(port))?;
        Ok(parsing::parse_fields(&body))
    }

    /// Persists the device configuration (`cmd=s`).
    pub async fn save(&self) -> Result<()> {
        self.send_command(PRIORITY_BACKGROUND, None, "s").await?;
        Ok(())
    }

    /// Starts a one-wire temperature conversion on a bus port (`cmd=conv`).
    pub async fn force_conversion(&self, port: u32) -> Result<()> {
        let id = PortId::Simple(port);
        self.send_command(PRIORITY_BACKGROUND, Some(&id), "conv")
            .await?;
        Ok(())
    }

    /// Devices found on an I²C port (`cmd=scan`).
    pub async fn scan_i2c(&self, port: u32) -> Result<Vec<ScanEntry>> {
        let id = PortId::Simple(port);
        let page = self
            .send_command(PRIORITY_BACKGROUND, Some(&id), "scan")
            .await?
            .ok_or_else(|| Error::no_data(port))?;
        Ok(parsing::parse_scan_page(&page))
    }

    /// Values of every port, positionally (`cmd=all`).
    pub async fn read_all(&self) -> Result<Vec<String>> {
        let body = self
            .send_command(PRIORITY_BACKGROUND, None, "all")
            .await?
            .ok_or_else(|| Error::no_data("all"))?;
        Ok(parsing::parse_fields(&body))
    }

    /// MQTT identity configured on the device (`cf=2`, input `mdid`).
    ///
    /// Falls back to `megad/<last host octet>` when the page has none.
    pub async fn mqtt_id(&self) -> Result<String> {
        let page = self
            .request(PRIORITY_BACKGROUND, &Query::new().param("cf", 2))
            .await?;
        let fallback = DeviceConfig::new(self.host.as_str(), "").default_mqtt_id();
        Ok(page
            .and_then(|p| parsing::parse_input_value(&p, "mdid"))
            .unwrap_or(fallback))
    }

    /// Sets the device clock (`cf=7&stime=HH:MM:SS:D`, D = ISO weekday).
    pub async fn sync_time(&self, now: NaiveDateTime) -> Result<()> {
        let stime = format!(
            "{}:{}",
            now.format("%H:%M:%S"),
            now.weekday().number_from_monday()
        );
        let query = Query::new().param("cf", 7).param("stime", stime);
        self.request(PRIORITY_BACKGROUND, &query).await?;
        Ok(())
    }
}

impl<T> fmt::Debug for DeviceChannel<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceChannel")
            .field("host", &self.host)
            .field("config", &self.config)
            .field("lock", &self.lock)
            .finish()
    }
}
