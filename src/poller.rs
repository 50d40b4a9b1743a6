//! Periodic refresh of every known port and the device's online status.
//!
//! One cycle runs these steps in order, each at background priority:
//!
//! | Step | Request | Store update |
//! |------|---------|--------------|
//! | clock | `cf=7&stime=…` | none (only with `sync_time`) |
//! | I²C probes | probe params, then its delay | field of the `Composite` at `Simple(port)` |
//! | extenders | `pt=n&cmd=get` | one `ExtenderChild` per field |
//! | plain ports | `cmd=all` | one `Simple(n)` per known plain port |
//! | DS2413 buses | `pt=n&cmd=list` | two `SubAddressed` entries per address |
//! | one-wire buses | `pt=n&cmd=list` | the whole listing at `Simple(n)` |
//!
//! A failing step is logged and the cycle moves on. The cycle counts as
//! successful when no step found the device unreachable. The device is
//! [`DeviceStatus::Online`] while the last successful cycle is at most
//! `interval + offline_grace` old.

use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::channel::{DeviceChannel, Query};
use crate::config::{PlainPortRefresh, PollConfig};
use crate::discovery::DeviceLayout;
use crate::error::Result;
use crate::parsing::{self, ParseMode};
use crate::port::{PortId, PortValue};
use crate::priority::PRIORITY_BACKGROUND;
use crate::store::PortStateStore;
use crate::traits::Transport;

/// Whether the device answers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum DeviceStatus {
    /// A recent cycle succeeded.
    Online,
    /// No successful cycle within the online window.
    #[default]
    Offline,
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Online => write!(f, "online"),
            DeviceStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Outcome of one poll cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Steps that ran.
    pub steps: usize,
    /// Steps that ended in an error.
    pub failed: Vec<&'static str>,
    /// A step found the device unreachable.
    pub unreachable: bool,
}

impl CycleReport {
    /// Returns true when the device answered throughout the cycle.
    pub fn is_success(&self) -> bool {
        !self.unreachable
    }

    fn record(&mut self, step: &'static str, result: Result<()>) {
        self.steps += 1;
        if let Err(err) = result {
            warn!(step, error = %err, "poll step failed");
            self.unreachable |= err.is_unreachable();
            self.failed.push(step);
        }
    }
}

/// Refreshes the store from the device on a fixed interval.
pub struct Poller<T> {
    channel: Arc<DeviceChannel<T>>,
    store: Arc<PortStateStore>,
    layout: Arc<RwLock<DeviceLayout>>,
    config: PollConfig,
    status: Arc<watch::Sender<DeviceStatus>>,
    last_success: Option<Instant>,
}

impl<T: Transport> Poller<T> {
    /// Creates a poller. The status starts `Offline`.
    pub fn new(
        channel: Arc<DeviceChannel<T>>,
        store: Arc<PortStateStore>,
        layout: Arc<RwLock<DeviceLayout>>,
        config: PollConfig,
    ) -> Self {
        let (status, _) = watch::channel(DeviceStatus::Offline);
        Self {
            channel,
            store,
            layout,
            config,
            status: Arc::new(status),
            last_success: None,
        }
    }

    /// Publishes status on an existing channel instead of a private one.
    pub fn with_status(mut self, status: Arc<watch::Sender<DeviceStatus>>) -> Self {
        self.status = status;
        self
    }

    /// Receiver of status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<DeviceStatus> {
        self.status.subscribe()
    }

    /// Current status.
    pub fn status(&self) -> DeviceStatus {
        *self.status.borrow()
    }

    /// When the last successful cycle finished.
    pub fn last_success(&self) -> Option<Instant> {
        self.last_success
    }

    /// Polls every `interval` until `token` is cancelled.
    pub async fn run(mut self, token: CancellationToken) {
        let span = info_span!("poller", interval_ms = self.config.interval_ms);
        async move {
            info!("poller started");
            let mut interval = tokio::time::interval(self.config.interval());
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            'poll: loop {
                let mut deadline = self.offline_deadline();
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    _ = interval.tick() => {}
                    _ = sleep_until(deadline) => {
                        self.refresh_status();
                        continue;
                    }
                }

                // The device may go offline while a slow cycle is still retrying
                let status = Arc::clone(&self.status);
                let window = self.config.online_window();
                let last_success = self.last_success;
                let cycle = self.poll_once();
                tokio::pin!(cycle);
                loop {
                    tokio::select! {
                        biased;
                        _ = token.cancelled() => break 'poll,
                        _ = &mut cycle => break,
                        _ = sleep_until(deadline) => {
                            publish_status(&status, last_success, window);
                            deadline = None;
                        }
                    }
                }
            }
            info!("poller stopped");
        }
        .instrument(span)
        .await;
    }

    fn offline_deadline(&self) -> Option<Instant> {
        let last = self.last_success?;
        (self.status() == DeviceStatus::Online).then(|| last + self.config.online_window())
    }

    fn refresh_status(&mut self) {
        publish_status(&self.status, self.last_success, self.config.online_window());
    }

    /// Runs one full cycle and updates the status.
    pub async fn poll_once(&mut self) -> CycleReport {
        let layout = self
            .layout
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut report = CycleReport::default();

        if self.config.sync_time {
            let now = chrono::Local::now().naive_local();
            report.record("clock", self.channel.sync_time(now).await);
        }
        if !layout.i2c_probes.is_empty() {
            report.record("i2c", self.poll_probes(&layout).await);
        }
        for &port in &layout.extenders {
            report.record("extender", self.poll_extender(port).await);
        }
        if self.should_refresh_plain_ports() {
            report.record("plain", self.poll_plain_ports(&layout).await);
        }
        for &port in &layout.ds2413_buses {
            report.record("ds2413", self.poll_ds2413(port).await);
        }
        for &port in &layout.one_wire_buses {
            report.record("one_wire", self.poll_one_wire(port).await);
        }

        if report.is_success() {
            self.last_success = Some(Instant::now());
        }
        self.refresh_status();
        debug!(
            steps = report.steps,
            failed = report.failed.len(),
            success = report.is_success(),
            "poll cycle finished"
        );
        report
    }

    fn should_refresh_plain_ports(&self) -> bool {
        match self.config.plain_ports {
            PlainPortRefresh::Always => true,
            PlainPortRefresh::Never => false,
            PlainPortRefresh::UnlessPushed => !self.store.pushed_within(self.config.interval()),
        }
    }

    // ========================================================================
    // Steps
    // ========================================================================

    async fn poll_probes(&self, layout: &DeviceLayout) -> Result<()> {
        let mut first_error = None;
        for probe in &layout.i2c_probes {
            let query = Query::from(probe.params.clone());
            match self.channel.request(PRIORITY_BACKGROUND, &query).await {
                Ok(Some(body)) => {
                    let raw = body.trim();
                    if let Some(suffix) = &probe.id_suffix {
                        if raw.is_empty() || raw.contains("busy") {
                            trace!(port = probe.port, suffix = %suffix, "no reading");
                        } else {
                            self.store.merge_field(
                                PortId::Simple(probe.port),
                                suffix,
                                raw.to_string(),
                            );
                        }
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!(port = probe.port, %query, error = %err, "probe failed");
                    first_error.get_or_insert(err);
                }
            }
            if let Some(delay) = probe.delay() {
                tokio::time::sleep(delay).await;
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    async fn poll_extender(&self, port: u32) -> Result<()> {
        let fields = self.channel.get_fields(port).await?;
        for (index, raw) in fields.iter().enumerate() {
            self.store.set(
                PortId::extender_child(port, index as u32),
                parsing::parse_value(raw, ParseMode::Get),
            );
        }
        Ok(())
    }

    async fn poll_plain_ports(&self, layout: &DeviceLayout) -> Result<()> {
        let fields = self.channel.read_all().await?;
        for port in layout.plain_ports() {
            match fields.get(port as usize) {
                Some(raw) => {
                    self.store
                        .set(PortId::Simple(port), parsing::parse_value(raw, ParseMode::Get));
                }
                None => trace!(port, "missing from bulk read"),
            }
        }
        Ok(())
    }

    async fn poll_ds2413(&self, port: u32) -> Result<()> {
        let PortValue::Composite(devices) = self.channel.list_port(port).await? else {
            debug!(port, "DS2413 bus busy");
            return Ok(());
        };
        for (address, state) in &devices {
            for (index, half) in state.split('/').take(2).enumerate() {
                let id = PortId::ds2413(port, address.as_str(), index as u8);
                self.store.set(id, PortValue::OnOff(half.trim() == "ON"));
            }
        }
        Ok(())
    }

    async fn poll_one_wire(&self, port: u32) -> Result<()> {
        let value = self.channel.list_port(port).await?;
        self.store.set(PortId::Simple(port), value);
        Ok(())
    }
}

impl<T> fmt::Debug for Poller<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Poller")
            .field("config", &self.config)
            .field("status", &*self.status.borrow())
            .field("last_success", &self.last_success)
            .finish()
    }
}

fn publish_status(
    status: &watch::Sender<DeviceStatus>,
    last_success: Option<Instant>,
    window: Duration,
) {
    let online = last_success.is_some_and(|t| t.elapsed() < window);
    let next = if online {
        DeviceStatus::Online
    } else {
        DeviceStatus::Offline
    };
    status.send_if_modified(|current| {
        if *current == next {
            return false;
        }
        info!(from = %current, to = %next, "device status");
        *current = next;
        true
    });
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

// ============================================================================
// Tests
// ============================================================================
