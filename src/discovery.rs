//! Port discovery state machine.
//!
//! Discovery walks the device's ports one by one, reads each port's config
//! page and works out what the port is and what it exposes. It never creates
//! anything itself: the result is a [`DeviceLayout`] that the caller turns
//! into entities, and that the [`Poller`](crate::poller::Poller) uses to know
//! what to refresh.
//!
//! # States
//!
//! - `Idle`: nothing read yet
//! - `ScanningPort(n)`: reading the config page of port `n`
//! - `ClassifyLeaf(n)`: port `n` is a plain port, record it
//! - `ExpandExtender(n)`: walk the children of an I²C extender
//! - `ExpandDs2413(n)`: list the DS2413 switches on a one-wire bus
//! - `ExpandOneWireBus(n)`: list the sensors on a one-wire bus
//! - `ExpandI2cAny(n)`: scan an I²C bus in free-scan mode
//! - `Done`: every port visited
//!
//! # Valid Transitions
//!
//! - Idle → ScanningPort(0)
//! - ScanningPort(n) → ClassifyLeaf(n) | Expand*(n) → ScanningPort(n + 1)
//! - ScanningPort(port_count) → Done
//!
//! A port that fails (timeout, no data) is logged and skipped; the walk always
//! reaches `Done`.
//!
//! # Example
//!
//! ```rust
//! use rs_megad::catalog::BuiltinCatalog;
//! use rs_megad::channel::DeviceChannel;
//! use rs_megad::config::{ChannelConfig, DeviceConfig, DiscoveryConfig};
//! use rs_megad::discovery::{Discovery, DiscoveryState};
//! use rs_megad::hal::MockTransport;
//! use rs_megad::port::{PortConfig, PortId};
//!
//! # let rt = tokio::runtime::Builder::new_current_thread().enable_time().build().unwrap();
//! # rt.block_on(async {
//! let mock = MockTransport::new()
//!     .with_body("pt=0", "<select name=pty><option value=0 selected></select>");
//! let channel = DeviceChannel::new(mock, &DeviceConfig::new("10.0.0.14", "sec"), ChannelConfig::default());
//! let config = DiscoveryConfig::default().with_port_count(1);
//!
//! let mut discovery = Discovery::new(&channel, &BuiltinCatalog, &config);
//! let layout = discovery.run().await;
//! assert_eq!(discovery.state(), DiscoveryState::Done);
//! assert_eq!(layout.port(&PortId::Simple(0)).unwrap().config, PortConfig::DigitalInput);
//! # });
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use tracing::{debug, info, info_span, warn, Instrument};

use crate::catalog::{classify_field, I2cProbe, SensorCatalog, SensorChannel, SensorKind};
use crate::channel::DeviceChannel;
use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};
use crate::parsing::{self, PortAttributes};
use crate::port::{I2cDeviceKind, PinDirection, PortConfig, PortId, PortValue};
use crate::traits::Transport;

/// Scale of the on-board PWM outputs.
pub const PWM_MAX: u32 = 255;

/// Scale of PCA9685 extender outputs.
pub const PCA9685_MAX: u32 = 4095;

// ============================================================================
// Layout
// ============================================================================

/// Something a port exposes to the outside.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum EntityDescriptor {
    /// On/off input.
    BinarySensor,
    /// Switchable or dimmable output.
    Output {
        /// Accepts values between 0 and `max_value`.
        dimmable: bool,
        /// Highest value the port accepts.
        max_value: u32,
        /// Device-side smooth dimming time, if configured.
        smooth_secs: Option<f64>,
    },
    /// One sensor reading.
    Sensor(SensorChannel),
}

impl EntityDescriptor {
    fn switch() -> Self {
        EntityDescriptor::Output {
            dimmable: false,
            max_value: 1,
            smooth_secs: None,
        }
    }

    fn dimmer(max_value: u32, smooth_secs: Option<f64>) -> Self {
        EntityDescriptor::Output {
            dimmable: true,
            max_value,
            smooth_secs,
        }
    }
}

/// One port found by discovery.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiscoveredPort {
    /// Port identifier.
    pub id: PortId,
    /// What the port is.
    pub config: PortConfig,
    /// What the port exposes. Empty for buses and extenders themselves.
    pub entities: Vec<EntityDescriptor>,
}

impl DiscoveredPort {
    fn new(id: PortId, config: PortConfig, entities: Vec<EntityDescriptor>) -> Self {
        Self {
            id,
            config,
            entities,
        }
    }
}

/// Everything discovery learned about a device.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DeviceLayout {
    /// Every classified port, in walk order.
    pub ports: Vec<DiscoveredPort>,
    /// Ports with an I²C extender attached.
    pub extenders: BTreeSet<u32>,
    /// Interrupt source port → extender port.
    pub interrupts: BTreeMap<u32, u32>,
    /// Requests refreshing free-scan I²C sensors.
    pub i2c_probes: Vec<I2cProbe>,
    /// Ports carrying DS2413 switches.
    pub ds2413_buses: BTreeSet<u32>,
    /// Ports carrying one-wire sensors.
    pub one_wire_buses: BTreeSet<u32>,
}

impl DeviceLayout {
    /// Looks up a discovered port.
    pub fn port(&self, id: &PortId) -> Option<&DiscoveredPort> {
        self.ports.iter().find(|p| &p.id == id)
    }

    /// Physical ports whose value comes from the bulk `cmd=all` read.
    pub fn plain_ports(&self) -> Vec<u32> {
        self.ports
            .iter()
            .filter_map(|p| match (&p.id, &p.config) {
                (
                    PortId::Simple(n),
                    PortConfig::DigitalInput
                    | PortConfig::RelayOutput
                    | PortConfig::PwmOutput
                    | PortConfig::AdcInput
                    | PortConfig::SingleSensor
                    | PortConfig::I2cDevice {
                        kind: I2cDeviceKind::Known(_),
                        ..
                    },
                ) => Some(*n),
                _ => None,
            })
            .collect()
    }

    /// Extender the given interrupt source port belongs to.
    pub fn extender_for_interrupt(&self, source: u32) -> Option<u32> {
        self.interrupts.get(&source).copied()
    }

    /// Output descriptor of a port, if it is an output.
    pub fn output(&self, id: &PortId) -> Option<&EntityDescriptor> {
        self.port(id)?
            .entities
            .iter()
            .find(|e| matches!(e, EntityDescriptor::Output { .. }))
    }
}

// ============================================================================
// State Machine
// ============================================================================

/// Where the walk is.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DiscoveryState {
    /// Nothing read yet.
    Idle,
    /// Reading the config page of a port.
    ScanningPort(u32),
    /// Recording a plain port.
    ClassifyLeaf(u32),
    /// Walking extender children.
    ExpandExtender(u32),
    /// Listing DS2413 switches.
    ExpandDs2413(u32),
    /// Listing one-wire sensors.
    ExpandOneWireBus(u32),
    /// Scanning a free-scan I²C bus.
    ExpandI2cAny(u32),
    /// Every port visited.
    Done,
}

impl DiscoveryState {
    /// Port the state is about, if any.
    pub fn port(&self) -> Option<u32> {
        match *self {
            DiscoveryState::ScanningPort(n)
            | DiscoveryState::ClassifyLeaf(n)
            | DiscoveryState::ExpandExtender(n)
            | DiscoveryState::ExpandDs2413(n)
            | DiscoveryState::ExpandOneWireBus(n)
            | DiscoveryState::ExpandI2cAny(n) => Some(n),
            DiscoveryState::Idle | DiscoveryState::Done => None,
        }
    }
}

impl fmt::Display for DiscoveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscoveryState::Idle => write!(f, "Idle"),
            DiscoveryState::ScanningPort(n) => write!(f, "ScanningPort({n})"),
            DiscoveryState::ClassifyLeaf(n) => write!(f, "ClassifyLeaf({n})"),
            DiscoveryState::ExpandExtender(n) => write!(f, "ExpandExtender({n})"),
            DiscoveryState::ExpandDs2413(n) => write!(f, "ExpandDs2413({n})"),
            DiscoveryState::ExpandOneWireBus(n) => write!(f, "ExpandOneWireBus({n})"),
            DiscoveryState::ExpandI2cAny(n) => write!(f, "ExpandI2cAny({n})"),
            DiscoveryState::Done => write!(f, "Done"),
        }
    }
}

/// One discovery run over a device.
pub struct Discovery<'a, T> {
    channel: &'a DeviceChannel<T>,
    catalog: &'a dyn SensorCatalog,
    config: &'a DiscoveryConfig,
    state: DiscoveryState,
    pending: Option<(PortConfig, PortAttributes)>,
    layout: DeviceLayout,
    history: Vec<DiscoveryState>,
}

impl<'a, T: Transport> Discovery<'a, T> {
    /// Creates a walk in the `Idle` state.
    pub fn new(
        channel: &'a DeviceChannel<T>,
        catalog: &'a dyn SensorCatalog,
        config: &'a DiscoveryConfig,
    ) -> Self {
        Self {
            channel,
            catalog,
            config,
            state: DiscoveryState::Idle,
            pending: None,
            layout: DeviceLayout::default(),
            history: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> DiscoveryState {
        self.state
    }

    /// Every state entered so far, oldest first.
    pub fn history(&self) -> &[DiscoveryState] {
        &self.history
    }

    /// Layout collected so far.
    pub fn layout(&self) -> &DeviceLayout {
        &self.layout
    }

    fn transition_to(&mut self, next: DiscoveryState) {
        debug!(from = %self.state, to = %next, "discovery state");
        self.history.push(self.state);
        self.state = next;
    }

    fn next_port(n: u32) -> DiscoveryState {
        DiscoveryState::ScanningPort(n + 1)
    }

    /// Runs the walk to `Done` and returns the layout.
    pub async fn run(&mut self) -> DeviceLayout {
        let span = info_span!("discovery", ports = self.config.port_count);
        async {
            while self.step().await {}
            info!(
                ports = self.layout.ports.len(),
                extenders = self.layout.extenders.len(),
                probes = self.layout.i2c_probes.len(),
                "discovery finished"
            );
        }
        .instrument(span)
        .await;
        self.layout.clone()
    }

    /// Performs one transition. Returns false once `Done`.
    pub async fn step(&mut self) -> bool {
        let next = match self.state {
            DiscoveryState::Idle => DiscoveryState::ScanningPort(0),
            DiscoveryState::ScanningPort(n) if n >= self.config.port_count => DiscoveryState::Done,
            DiscoveryState::ScanningPort(n) => self.scan_port(n).await,
            DiscoveryState::Done => return false,
            expand => {
                let Some(n) = expand.port() else {
                    return false;
                };
                if let Err(err) = self.expand(expand, n).await {
                    warn!(port = n, error = %err, "skipping port");
                }
                Self::next_port(n)
            }
        };
        self.transition_to(next);
        true
    }

    async fn scan_port(&mut self, n: u32) -> DiscoveryState {
        let page = match self.channel.port_page(n).await {
            Ok(Some(page)) => page,
            Ok(None) => {
                warn!(port = n, "no config page");
                return Self::next_port(n);
            }
            Err(err) => {
                warn!(port = n, error = %err, "skipping port");
                return Self::next_port(n);
            }
        };

        let attrs = parsing::parse_attributes(&page);
        let config = attrs.classify();
        debug!(port = n, ?config, "classified");

        let next = match &config {
            PortConfig::ExtenderMcp230 { .. } | PortConfig::ExtenderPca9685 => {
                DiscoveryState::ExpandExtender(n)
            }
            PortConfig::Ds2413Bus => DiscoveryState::ExpandDs2413(n),
            PortConfig::OneWireBus => DiscoveryState::ExpandOneWireBus(n),
            PortConfig::I2cDevice {
                kind: I2cDeviceKind::Any,
                ..
            } => DiscoveryState::ExpandI2cAny(n),
            _ => DiscoveryState::ClassifyLeaf(n),
        };
        self.pending = Some((config, attrs));
        next
    }

    async fn expand(&mut self, state: DiscoveryState, n: u32) -> Result<()> {
        let (config, attrs) = self.pending.take().unwrap_or_default();
        match state {
            DiscoveryState::ClassifyLeaf(_) => self.classify_leaf(n, config, &attrs).await,
            DiscoveryState::ExpandExtender(_) => self.expand_extender(n, config, &attrs).await,
            DiscoveryState::ExpandDs2413(_) => self.expand_ds2413(n).await,
            DiscoveryState::ExpandOneWireBus(_) => self.expand_one_wire(n).await,
            DiscoveryState::ExpandI2cAny(_) => self.expand_i2c_any(n).await,
            _ => Ok(()),
        }
    }

    // ========================================================================
    // Leaves
    // ========================================================================

    async fn classify_leaf(
        &mut self,
        n: u32,
        config: PortConfig,
        attrs: &PortAttributes,
    ) -> Result<()> {
        let id = PortId::Simple(n);
        let entities = match &config {
            PortConfig::DigitalInput => vec![EntityDescriptor::BinarySensor],
            PortConfig::RelayOutput => vec![EntityDescriptor::switch()],
            PortConfig::PwmOutput => vec![EntityDescriptor::dimmer(PWM_MAX, attrs.smooth_secs())],
            PortConfig::AdcInput => vec![EntityDescriptor::Sensor(SensorChannel {
                kind: SensorKind::Generic,
                key: None,
                suffix: SensorKind::Generic.as_str().to_string(),
            })],
            PortConfig::SingleSensor => {
                let value = self.channel.get_port(&id).await?;
                sensor_channels(&value)
            }
            PortConfig::I2cDevice {
                kind: I2cDeviceKind::Known(kind),
                ..
            } => {
                let channels = self.known_sensor_channels(kind);
                let sub_channels = channels.iter().map(|c| c.suffix.clone()).collect();
                self.layout.ports.push(DiscoveredPort::new(
                    id,
                    PortConfig::I2cDevice {
                        kind: I2cDeviceKind::Known(kind.clone()),
                        sub_channels,
                    },
                    channels.into_iter().map(EntityDescriptor::Sensor).collect(),
                ));
                return Ok(());
            }
            PortConfig::I2cClock | PortConfig::Unconfigured => {
                debug!(port = n, ?config, "nothing to expose");
                return Ok(());
            }
            _ => Vec::new(),
        };
        self.layout.ports.push(DiscoveredPort::new(id, config, entities));
        Ok(())
    }

    fn known_sensor_channels(&self, kind: &str) -> Vec<SensorChannel> {
        let kinds = self.catalog.channels_for_kind(kind);
        match kinds.as_slice() {
            [] => vec![SensorChannel {
                kind: SensorKind::Generic,
                key: None,
                suffix: format!("{kind}_{}", SensorKind::Generic.as_str()),
            }],
            [single] => vec![SensorChannel {
                kind: *single,
                key: None,
                suffix: format!("{kind}_{}", single.as_str()),
            }],
            many => many
                .iter()
                .map(|k| SensorChannel {
                    kind: *k,
                    key: Some(k.reply_key().to_string()),
                    suffix: format!("{kind}_{}", k.as_str()),
                })
                .collect(),
        }
    }

    // ========================================================================
    // Extenders
    // ========================================================================

    async fn expand_extender(
        &mut self,
        n: u32,
        config: PortConfig,
        attrs: &PortAttributes,
    ) -> Result<()> {
        let children = self.channel.get_fields(n).await?.len() as u32;
        debug!(port = n, children, "walking extender");

        self.layout.extenders.insert(n);
        if let Some(source) = attrs.interrupt_port() {
            debug!(port = n, source, "extender interrupt");
            self.layout.interrupts.insert(source, n);
        }

        let config = match config {
            PortConfig::ExtenderPca9685 => {
                for index in 0..children {
                    self.layout.ports.push(DiscoveredPort::new(
                        PortId::extender_child(n, index),
                        PortConfig::PwmOutput,
                        vec![EntityDescriptor::dimmer(PCA9685_MAX, None)],
                    ));
                }
                PortConfig::ExtenderPca9685
            }
            _ => {
                let mut directions = BTreeMap::new();
                for index in 0..children {
                    match self.extender_child(n, index).await {
                        Ok(Some(direction)) => {
                            directions.insert(index, direction);
                        }
                        Ok(None) => debug!(port = n, index, "child not configured"),
                        Err(err) => warn!(port = n, index, error = %err, "skipping child"),
                    }
                }
                PortConfig::ExtenderMcp230 { directions }
            }
        };
        // The extender itself goes before its children.
        let at = self
            .layout
            .ports
            .iter()
            .position(|p| matches!(p.id, PortId::ExtenderChild { parent, .. } if parent == n))
            .unwrap_or(self.layout.ports.len());
        self.layout
            .ports
            .insert(at, DiscoveredPort::new(PortId::Simple(n), config, Vec::new()));
        Ok(())
    }

    async fn extender_child(&mut self, n: u32, index: u32) -> Result<Option<PinDirection>> {
        let Some(page) = self.channel.extender_page(n, index).await? else {
            return Ok(None);
        };
        let direction = parsing::parse_attributes(&page).direction();
        let (config, entity) = match direction {
            Some(PinDirection::In) => (PortConfig::DigitalInput, EntityDescriptor::BinarySensor),
            Some(PinDirection::Out) => (PortConfig::RelayOutput, EntityDescriptor::switch()),
            None => return Ok(None),
        };
        self.layout.ports.push(DiscoveredPort::new(
            PortId::extender_child(n, index),
            config,
            vec![entity],
        ));
        Ok(direction)
    }

    // ========================================================================
    // Buses
    // ========================================================================

    /// Reads a bus listing, retrying while the bus answers busy or nothing.
    async fn read_bus(&self, n: u32) -> Result<PortValue> {
        let attempts = self.config.bus_retry_attempts.max(1);
        for attempt in 1..=attempts {
            match self.channel.list_port(n).await {
                Ok(PortValue::Busy) => debug!(port = n, attempt, "bus busy"),
                Err(Error::NoPortData { .. }) => debug!(port = n, attempt, "bus not ready"),
                other => return other,
            }
            if attempt < attempts {
                tokio::time::sleep(self.config.bus_retry_delay()).await;
            }
        }
        Err(Error::no_data(n))
    }

    async fn expand_ds2413(&mut self, n: u32) -> Result<()> {
        self.layout.ds2413_buses.insert(n);
        self.layout
            .ports
            .push(DiscoveredPort::new(PortId::Simple(n), PortConfig::Ds2413Bus, Vec::new()));

        let PortValue::Composite(devices) = self.read_bus(n).await? else {
            warn!(port = n, "unexpected DS2413 listing");
            return Ok(());
        };
        for address in devices.keys() {
            for channel in 0..2 {
                self.layout.ports.push(DiscoveredPort::new(
                    PortId::ds2413(n, address.as_str(), channel),
                    PortConfig::RelayOutput,
                    vec![EntityDescriptor::switch()],
                ));
            }
        }
        Ok(())
    }

    async fn expand_one_wire(&mut self, n: u32) -> Result<()> {
        let value = self.read_bus(n).await?;
        self.layout.one_wire_buses.insert(n);
        self.layout.ports.push(DiscoveredPort::new(
            PortId::Simple(n),
            PortConfig::OneWireBus,
            sensor_channels(&value),
        ));
        Ok(())
    }

    async fn expand_i2c_any(&mut self, n: u32) -> Result<()> {
        let entries = self.channel.scan_i2c(n).await?;
        let found = self.catalog.resolve_scan(n, &entries);
        debug!(
            port = n,
            devices = entries.len(),
            probes = found.probes.len(),
            "I2C scan resolved"
        );

        let sub_channels = found.channels.iter().map(|c| c.suffix.clone()).collect();
        self.layout.i2c_probes.extend(found.probes);
        self.layout.ports.push(DiscoveredPort::new(
            PortId::Simple(n),
            PortConfig::I2cDevice {
                kind: I2cDeviceKind::Any,
                sub_channels,
            },
            found.channels.into_iter().map(EntityDescriptor::Sensor).collect(),
        ));
        Ok(())
    }
}

impl<T> fmt::Debug for Discovery<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Discovery")
            .field("state", &self.state)
            .field("ports", &self.layout.ports.len())
            .finish()
    }
}

/// Sensor channels of a bus listing or sensor reading.
fn sensor_channels(value: &PortValue) -> Vec<EntityDescriptor> {
    match value {
        PortValue::Composite(fields) => fields
            .iter()
            .map(|(key, raw)| {
                EntityDescriptor::Sensor(SensorChannel {
                    kind: classify_field(key, raw),
                    key: Some(key.clone()),
                    suffix: key.clone(),
                })
            })
            .collect(),
        other => {
            let kind = classify_field("", &other.to_string());
            vec![EntityDescriptor::Sensor(SensorChannel {
                kind,
                key: None,
                suffix: kind.as_str().to_string(),
            })]
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
