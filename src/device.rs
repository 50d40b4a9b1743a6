//! Device handle: everything the driver owns for one controller.
//!
//! A [`DeviceHandle`] ties the pieces together:
//!
//! | Piece | Role |
//! |-------|------|
//! | [`DeviceChannel`] | every request, serialized and retried |
//! | [`PortStateStore`] | last known values and push subscriptions |
//! | [`DeviceLayout`] | result of the last [`discover`](DeviceHandle::discover) |
//! | [`Poller`] | periodic refresh, spawned by [`start`](DeviceHandle::start) |
//! | [`TransitionScheduler`] | smooth ramps, one per output |
//!
//! # Lifecycle
//!
//! `new` → `authenticate` → `discover` → `start` → … → `stop`.
//!
//! `start` spawns the poller and arms the events flag: pushes are written to
//! the store right away, but subscriber callbacks only run once
//! `events_delay_ms` has passed since `start`. The device sends a burst of
//! pushes when it (re)connects, and callers usually don't want those as events.
//! `stop` cancels the poller, the events timer and every transition.
//!
//! # Example
//!
//! ```rust,no_run
//! use rs_megad::config::{Config, DeviceConfig};
//! use rs_megad::device::DeviceHandle;
//! use rs_megad::hal::ReqwestTransport;
//!
//! # async fn run() -> rs_megad::Result<()> {
//! let config = Config::new(DeviceConfig::new("192.168.0.14", "sec"));
//! let device = DeviceHandle::new(ReqwestTransport::new()?, config);
//!
//! if device.authenticate().await? {
//!     let layout = device.discover().await;
//!     println!("{} ports", layout.ports.len());
//!     device.start();
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, trace, warn, Instrument};

use crate::catalog::{BuiltinCatalog, SensorCatalog};
use crate::channel::DeviceChannel;
use crate::config::Config;
use crate::discovery::{DeviceLayout, Discovery, EntityDescriptor};
use crate::error::{Error, Result};
use crate::parsing::{self, ParseMode};
use crate::poller::{DeviceStatus, Poller};
use crate::port::{PortConfig, PortId, PortValue};
use crate::priority::PRIORITY_EXPEDITED;
use crate::store::{PortStateStore, SubscriptionId};
use crate::transition::{Leg, TransitionRequest, TransitionScheduler, TransitionTask};
use crate::traits::Transport;

// ============================================================================
// Push payload
// ============================================================================

/// A value the device pushed for one port.
#[derive(Clone, Debug, PartialEq)]
pub struct PushPayload {
    /// Port the value is for.
    pub port: PortId,
    /// Parsed value.
    pub value: PortValue,
}

impl PushPayload {
    /// Creates a payload.
    pub fn new(port: PortId, value: PortValue) -> Self {
        Self { port, value }
    }

    /// Builds a payload from the query of a device push (`pt=7&m=1`, `pt=30&v=21.5`).
    ///
    /// | Parameter | Meaning |
    /// |-----------|---------|
    /// | `v` | value, parsed like any reply |
    /// | `m=1` | input released (`OFF`) |
    /// | other `m`, or none | input pressed (`ON`) |
    /// | `ext` | child index, when `pt` is an extender's interrupt port |
    ///
    /// Returns `None` without a usable `pt`.
    pub fn from_query(params: &HashMap<String, String>, layout: &DeviceLayout) -> Option<Self> {
        let pt: u32 = params.get("pt")?.trim().parse().ok()?;

        let port = match (layout.extender_for_interrupt(pt), params.get("ext")) {
            (Some(extender), Some(ext)) => {
                PortId::extender_child(extender, ext.trim().parse().ok()?)
            }
            _ => PortId::Simple(pt),
        };

        let value = match (params.get("v"), params.get("m").map(String::as_str)) {
            (Some(v), _) => parsing::parse_value(v, ParseMode::Get),
            (None, Some("1")) => PortValue::OnOff(false),
            (None, _) => PortValue::OnOff(true),
        };
        Some(Self::new(port, value))
    }
}

// ============================================================================
// Device handle
// ============================================================================

/// Driver state for one device.
pub struct DeviceHandle<T> {
    config: Config,
    channel: Arc<DeviceChannel<T>>,
    store: Arc<PortStateStore>,
    layout: Arc<RwLock<DeviceLayout>>,
    catalog: Arc<dyn SensorCatalog>,
    scheduler: TransitionScheduler<T>,
    status: Arc<watch::Sender<DeviceStatus>>,
    events: Arc<AtomicBool>,
    lifecycle: Mutex<Option<CancellationToken>>,
}

impl<T: Transport> DeviceHandle<T> {
    /// Creates a stopped handle with an empty layout.
    pub fn new(transport: T, config: Config) -> Self {
        let channel = Arc::new(DeviceChannel::new(
            transport,
            &config.device,
            config.channel.clone(),
        ));
        let store = Arc::new(PortStateStore::new());
        let scheduler = TransitionScheduler::new(
            Arc::clone(&channel),
            Arc::clone(&store),
            config.transition.clone(),
        );
        let (status, _) = watch::channel(DeviceStatus::Offline);

        Self {
            config,
            channel,
            store,
            layout: Arc::new(RwLock::new(DeviceLayout::default())),
            catalog: Arc::new(BuiltinCatalog),
            scheduler,
            status: Arc::new(status),
            events: Arc::new(AtomicBool::new(false)),
            lifecycle: Mutex::new(None),
        }
    }

    /// Replaces the sensor catalog used by discovery.
    pub fn with_catalog(mut self, catalog: Arc<dyn SensorCatalog>) -> Self {
        self.catalog = catalog;
        self
    }

    /// Device identifier from the config.
    pub fn id(&self) -> &str {
        &self.config.device.id
    }

    /// Configuration in use.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Device channel.
    pub fn channel(&self) -> &DeviceChannel<T> {
        &self.channel
    }

    /// Port state store.
    pub fn store(&self) -> &Arc<PortStateStore> {
        &self.store
    }

    /// Transition scheduler.
    pub fn scheduler(&self) -> &TransitionScheduler<T> {
        &self.scheduler
    }

    /// Copy of the current layout.
    pub fn layout(&self) -> DeviceLayout {
        self.layout
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replaces the layout, e.g. with one restored from a previous run.
    pub fn set_layout(&self, layout: DeviceLayout) {
        *self.layout.write().unwrap_or_else(PoisonError::into_inner) = layout;
    }

    // ========================================================================
    // Device operations
    // ========================================================================

    /// Checks the secret. `Ok(false)` means the device rejected it.
    pub async fn authenticate(&self) -> Result<bool> {
        let ok = self.channel.authenticate().await?;
        if ok {
            info!(device = %self.id(), "authenticated");
        } else {
            warn!(device = %self.id(), "device rejected the secret");
        }
        Ok(ok)
    }

    /// Walks every port and keeps the resulting layout.
    pub async fn discover(&self) -> DeviceLayout {
        let span = info_span!("device", id = %self.config.device.id);
        let layout = async {
            let mut discovery =
                Discovery::new(&self.channel, self.catalog.as_ref(), &self.config.discovery);
            discovery.run().await
        }
        .instrument(span)
        .await;
        self.set_layout(layout.clone());
        layout
    }

    /// MQTT identity: the configured override, or what the device reports.
    pub async fn mqtt_id(&self) -> Result<String> {
        match &self.config.device.mqtt_id {
            Some(id) => Ok(id.clone()),
            None => self.channel.mqtt_id().await,
        }
    }

    /// Persists the device configuration.
    pub async fn save(&self) -> Result<()> {
        self.channel.save().await
    }

    /// Sends a raw command at expedited priority.
    pub async fn send_command(&self, port: Option<&PortId>, cmd: &str) -> Result<Option<String>> {
        self.channel.send_command(PRIORITY_EXPEDITED, port, cmd).await
    }

    /// Sets an output, cancelling any transition running on it.
    ///
    /// `ON`/`OFF` are sent as `1`/`0`, numbers as they are.
    pub async fn set_port(&self, port: &PortId, value: PortValue) -> Result<()> {
        let wire = match &value {
            PortValue::OnOff(on) => u8::from(*on).to_string(),
            PortValue::Numeric(n) => n.to_string(),
            PortValue::Text(t) => t.clone(),
            PortValue::Busy | PortValue::Composite(_) => {
                return Err(Error::InvalidValue {
                    port: port.clone(),
                    value: value.to_string(),
                })
            }
        };
        if self.scheduler.cancel(&port.to_string()) {
            debug!(%port, "transition cancelled by set");
        }

        self.send_command(Some(port), &format!("{port}:{wire}"))
            .await?;
        self.store.set(port.clone(), value);
        Ok(())
    }

    /// Starts a transition; see [`TransitionScheduler::start_transition`].
    pub fn start_transition(&self, request: TransitionRequest) -> TransitionTask {
        self.scheduler.start_transition(request)
    }

    /// Fades a discovered dimmable output to `to` over `duration`.
    ///
    /// Starts from the stored value (0 if unknown). Uses the device's own
    /// ramp when the port has smooth dimming configured and hardware ramps
    /// are allowed.
    pub fn fade(&self, port: &PortId, to: f64, duration: Duration) -> Result<TransitionTask> {
        let layout = self.layout.read().unwrap_or_else(PoisonError::into_inner);
        let discovered = layout
            .port(port)
            .ok_or_else(|| Error::UnknownPort(port.clone()))?;
        let Some(EntityDescriptor::Output {
            max_value,
            smooth_secs,
            ..
        }) = layout.output(port)
        else {
            return Err(Error::UnknownPort(port.clone()));
        };

        let hardware = self.config.transition.allow_hardware
            && smooth_secs.is_some()
            && port.is_simple()
            && discovered.config == PortConfig::PwmOutput;
        let from = self
            .store
            .get(port)
            .and_then(|v| v.as_f64())
            .unwrap_or(0.0);
        let to = to.clamp(0.0, f64::from(*max_value));

        let request = TransitionRequest::new(
            port.to_string(),
            vec![Leg::new(port.clone(), from, to, *max_value)],
            duration,
        )
        .with_hardware(hardware);
        drop(layout);
        Ok(self.scheduler.start_transition(request))
    }

    // ========================================================================
    // Push ingress
    // ========================================================================

    /// Registers a callback for pushes to `port`.
    pub fn subscribe(
        &self,
        port: PortId,
        callback: impl Fn(&PortId, &PortValue) + Send + Sync + 'static,
    ) -> SubscriptionId {
        self.store.subscribe(port, callback)
    }

    /// Removes a push subscription.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.store.unsubscribe(id)
    }

    /// Records a pushed value, then runs the port's callbacks if events are
    /// enabled. Returns how many callbacks ran.
    pub fn ingest_push(&self, payload: PushPayload) -> usize {
        let PushPayload { port, value } = payload;
        self.store.record_push();
        if !self.store.set(port.clone(), value.clone()) {
            trace!(%port, "busy push ignored");
            return 0;
        }
        if !self.events_enabled() {
            debug!(%port, "push stored, events not enabled yet");
            return 0;
        }
        self.store.notify(&port, &value)
    }

    /// Returns true once push callbacks are dispatched.
    pub fn events_enabled(&self) -> bool {
        self.events.load(Ordering::Acquire)
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Spawns the poller and the events timer. Does nothing if already running.
    ///
    /// Must be called within a tokio runtime.
    pub fn start(&self) {
        let mut lifecycle = self.lifecycle.lock().unwrap_or_else(PoisonError::into_inner);
        if lifecycle.is_some() {
            debug!(device = %self.id(), "already started");
            return;
        }
        let token = CancellationToken::new();
        let span = info_span!("device", id = %self.config.device.id);
        info!(parent: &span, "starting");

        self.events.store(false, Ordering::Release);
        let events = Arc::clone(&self.events);
        let delay = self.config.device.events_delay();
        let events_token = token.clone();
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = events_token.cancelled() => {}
                    _ = tokio::time::sleep(delay) => {
                        events.store(true, Ordering::Release);
                        debug!("events enabled");
                    }
                }
            }
            .instrument(span.clone()),
        );

        if self.config.poll.enabled {
            let poller = Poller::new(
                Arc::clone(&self.channel),
                Arc::clone(&self.store),
                Arc::clone(&self.layout),
                self.config.poll.clone(),
            )
            .with_status(Arc::clone(&self.status));
            tokio::spawn(poller.run(token.clone()).instrument(span));
        }

        *lifecycle = Some(token);
    }

    /// Stops the poller, the events timer and every transition.
    pub fn stop(&self) {
        let token = self
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            info!(device = %self.id(), "stopping");
            token.cancel();
        }
        self.scheduler.cancel_all();
        self.events.store(false, Ordering::Release);
    }

    /// Returns true between `start` and `stop`.
    pub fn is_running(&self) -> bool {
        self.lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Online status published by the poller.
    pub fn status(&self) -> DeviceStatus {
        *self.status.borrow()
    }

    /// Receiver of status changes.
    pub fn subscribe_status(&self) -> watch::Receiver<DeviceStatus> {
        self.status.subscribe()
    }
}

impl<T> Drop for DeviceHandle<T> {
    fn drop(&mut self) {
        let token = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(token) = token {
            token.cancel();
        }
        self.scheduler.cancel_all();
    }
}

impl<T> fmt::Debug for DeviceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.config.device.id)
            .field("host", &self.config.device.host)
            .field("status", &*self.status.borrow())
            .field("events", &self.events.load(Ordering::Relaxed))
            .finish()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeviceConfig, PollConfig};
    use crate::discovery::DiscoveredPort;
    use crate::hal::MockTransport;
    use crate::transition::TransitionOutcome;
    use std::collections::{BTreeMap, BTreeSet};
    use std::sync::atomic::AtomicUsize;

    fn handle(mock: &MockTransport) -> DeviceHandle<MockTransport> {
        let config = Config::new(DeviceConfig::new("10.0.0.14", "sec").with_events_delay_ms(1_000))
            .with_poll(PollConfig::default().with_enabled(false));
        DeviceHandle::new(mock.clone(), config)
    }

    fn query(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn push_payload_from_query() {
        let layout = DeviceLayout {
            interrupts: BTreeMap::from([(5, 30)]),
            extenders: BTreeSet::from([30]),
            ..Default::default()
        };
        let p = |pairs: &[(&str, &str)]| PushPayload::from_query(&query(pairs), &layout);

        assert_eq!(
            p(&[("pt", "3")]),
            Some(PushPayload::new(PortId::Simple(3), PortValue::OnOff(true)))
        );
        assert_eq!(p(&[("pt", "3"), ("m", "1")]).unwrap().value, PortValue::OnOff(false));
        assert_eq!(p(&[("pt", "3"), ("m", "2")]).unwrap().value, PortValue::OnOff(true));
        assert_eq!(p(&[("pt", "8"), ("v", "21.5")]).unwrap().value, PortValue::Numeric(21.5));
        assert_eq!(
            p(&[("pt", "5"), ("ext", "2")]).unwrap().port,
            PortId::extender_child(30, 2)
        );
        assert_eq!(p(&[("pt", "6"), ("ext", "2")]).unwrap().port, PortId::Simple(6));
        assert_eq!(p(&[("m", "1")]), None);
        assert_eq!(p(&[("pt", "x")]), None);
    }

    #[tokio::test(start_paused = true)]
    async fn events_flag_gates_callbacks() {
        let device = handle(&MockTransport::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        device.subscribe(PortId::Simple(3), move |_, _| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        device.start();
        let push = PushPayload::new(PortId::Simple(3), PortValue::OnOff(true));
        assert_eq!(device.ingest_push(push.clone()), 0);
        assert_eq!(device.store().get(&PortId::Simple(3)), Some(PortValue::OnOff(true)));

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(device.events_enabled());
        assert_eq!(device.ingest_push(push.clone()), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        device.stop();
        assert!(!device.events_enabled());
        assert!(!device.is_running());
        assert_eq!(device.ingest_push(push), 0);
    }

    #[tokio::test]
    async fn set_port_sends_and_stores() {
        let mock = MockTransport::new();
        let device = handle(&mock);
        device
            .set_port(&PortId::Simple(7), PortValue::OnOff(true))
            .await
            .unwrap();
        device
            .set_port(&PortId::extender_child(30, 2), PortValue::Numeric(128.0))
            .await
            .unwrap();

        assert_eq!(mock.requests(), vec!["pt=7&cmd=7:1", "pt=30e2&cmd=30e2:128"]);
        assert_eq!(device.store().get(&PortId::Simple(7)), Some(PortValue::OnOff(true)));
        assert!(device
            .set_port(&PortId::Simple(7), PortValue::Busy)
            .await
            .is_err());
    }

    fn dimmer_layout(smooth_secs: Option<f64>) -> DeviceLayout {
        DeviceLayout {
            ports: vec![DiscoveredPort {
                id: PortId::Simple(7),
                config: PortConfig::PwmOutput,
                entities: vec![EntityDescriptor::Output {
                    dimmable: true,
                    max_value: 255,
                    smooth_secs,
                }],
            }],
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn set_port_cancels_running_fade() {
        let mock = MockTransport::new();
        let device = handle(&mock);
        device.set_layout(dimmer_layout(None));

        let task = device
            .fade(&PortId::Simple(7), 255.0, Duration::from_secs(10))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;
        device
            .set_port(&PortId::Simple(7), PortValue::Numeric(0.0))
            .await
            .unwrap();

        assert_eq!(task.join().await.unwrap(), TransitionOutcome::Cancelled);
        assert_eq!(mock.requests().last().unwrap(), "pt=7&cmd=7:0");
        assert!(device.scheduler().active_jobs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_cancels_running_fade() {
        let mock = MockTransport::new();
        let device = handle(&mock);
        device.set_layout(dimmer_layout(None));
        device.start();

        let task = device
            .fade(&PortId::Simple(7), 255.0, Duration::from_secs(10))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(device.scheduler().active_jobs(), vec!["7".to_string()]);

        device.stop();
        assert!(!device.is_running());
        assert!(device.scheduler().active_jobs().is_empty());
        assert_eq!(task.join().await.unwrap(), TransitionOutcome::Cancelled);

        let sent = mock.requests().len();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mock.requests().len(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_the_handle_cancels_running_fade() {
        let mock = MockTransport::new();
        let device = handle(&mock);
        device.set_layout(dimmer_layout(None));

        let task = device
            .fade(&PortId::Simple(7), 255.0, Duration::from_secs(10))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(!mock.requests().is_empty());

        drop(device);
        assert!(task.is_cancelled());
        assert_eq!(task.join().await.unwrap(), TransitionOutcome::Cancelled);

        let sent = mock.requests().len();
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert_eq!(mock.requests().len(), sent);
    }

    #[tokio::test(start_paused = true)]
    async fn fade_uses_hardware_when_configured() {
        let mock = MockTransport::new();
        let device = handle(&mock);
        device.set_layout(dimmer_layout(Some(2.0)));
        device.store().set(PortId::Simple(7), PortValue::Numeric(0.0));

        let task = device
            .fade(&PortId::Simple(7), 255.0, Duration::from_secs(4))
            .unwrap();
        task.join().await.unwrap();
        assert_eq!(mock.requests(), vec!["pt=7&pwm=255&cnt=4"]);
        assert_eq!(device.store().get(&PortId::Simple(7)), Some(PortValue::Numeric(255.0)));

        assert!(matches!(
            device.fade(&PortId::Simple(9), 1.0, Duration::from_secs(1)),
            Err(Error::UnknownPort(_))
        ));
    }

    #[tokio::test]
    async fn mqtt_id_prefers_config() {
        let mock = MockTransport::new();
        let config = Config::new(DeviceConfig::new("10.0.0.14", "sec").with_mqtt_id("home/m1"));
        let device = DeviceHandle::new(mock.clone(), config);
        assert_eq!(device.mqtt_id().await.unwrap(), "home/m1");
        assert!(mock.requests().is_empty());
    }
}
