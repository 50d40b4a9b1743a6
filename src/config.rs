//! Driver configuration.
//!
//! Everything is passed in as values; the crate never reads files or the
//! environment. Durations are stored as `*_ms` integers (easy to put in a
//! config file) with [`Duration`] accessors for the code that uses them.
//!
//! # Example
//!
//! ```rust
//! use rs_megad::config::{Config, DeviceConfig, PollConfig};
//!
//! // Use defaults
//! let config = Config::new(DeviceConfig::new("192.168.0.14", "sec"));
//!
//! // Or customize
//! let config = Config::new(DeviceConfig::new("192.168.0.14", "sec").with_id("garage"))
//!     .with_poll(PollConfig::default().with_interval_ms(30_000));
//! assert_eq!(config.poll.interval().as_secs(), 30);
//! ```

use std::time::Duration;

use crate::traits::Curve;

// ============================================================================
// Main Config
// ============================================================================

/// Complete configuration of one device.
#[derive(Clone, Debug, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    /// Device address and identity
    pub device: DeviceConfig,
    /// Request timeout and retry policy
    pub channel: ChannelConfig,
    /// Port walk settings
    pub discovery: DiscoveryConfig,
    /// Periodic refresh settings
    pub poll: PollConfig,
    /// Smooth transition settings
    pub transition: TransitionConfig,
    /// MQTT mirror settings
    pub mqtt: MqttConfig,
}

impl Config {
    /// Creates a config for a device with every other section at its default.
    pub fn new(device: DeviceConfig) -> Self {
        Self {
            device,
            ..Self::default()
        }
    }

    /// Set device configuration
    pub fn with_device(mut self, device: DeviceConfig) -> Self {
        self.device = device;
        self
    }

    /// Set channel configuration
    pub fn with_channel(mut self, channel: ChannelConfig) -> Self {
        self.channel = channel;
        self
    }

    /// Set discovery configuration
    pub fn with_discovery(mut self, discovery: DiscoveryConfig) -> Self {
        self.discovery = discovery;
        self
    }

    /// Set poll configuration
    pub fn with_poll(mut self, poll: PollConfig) -> Self {
        self.poll = poll;
        self
    }

    /// Set transition configuration
    pub fn with_transition(mut self, transition: TransitionConfig) -> Self {
        self.transition = transition;
        self
    }

    /// Set MQTT configuration
    pub fn with_mqtt(mut self, mqtt: MqttConfig) -> Self {
        self.mqtt = mqtt;
        self
    }
}

// ============================================================================
// Device Config
// ============================================================================

/// Device address and identity.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DeviceConfig {
    /// Identifier used in logs
    pub id: String,
    /// Host name or IP, optionally with `:port`
    pub host: String,
    /// Shared secret, sent as the first path segment
    pub secret: String,
    /// MQTT identity override; read from the device when absent
    pub mqtt_id: Option<String>,
    /// Delay after start before push callbacks are dispatched
    pub events_delay_ms: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            id: "megad".to_string(),
            host: "192.168.0.14".to_string(),
            secret: "sec".to_string(),
            mqtt_id: None,
            events_delay_ms: 10_000,
        }
    }
}

impl DeviceConfig {
    /// Creates a device config. The id defaults to the host.
    pub fn new(host: impl Into<String>, secret: impl Into<String>) -> Self {
        let host = host.into();
        Self {
            id: host.clone(),
            host,
            secret: secret.into(),
            ..Self::default()
        }
    }

    /// Set the identifier
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Set the MQTT identity
    pub fn with_mqtt_id(mut self, mqtt_id: impl Into<String>) -> Self {
        self.mqtt_id = Some(mqtt_id.into());
        self
    }

    /// Set the events delay
    pub fn with_events_delay_ms(mut self, ms: u64) -> Self {
        self.events_delay_ms = ms;
        self
    }

    /// Events delay as a [`Duration`]
    pub fn events_delay(&self) -> Duration {
        Duration::from_millis(self.events_delay_ms)
    }

    /// MQTT identity the device uses when none is configured: `megad/<last host octet>`.
    pub fn default_mqtt_id(&self) -> String {
        let host = self.host.split(':').next().unwrap_or(&self.host);
        let last = host.rsplit('.').next().unwrap_or(host);
        format!("megad/{last}")
    }
}

// ============================================================================
// Channel Config
// ============================================================================

/// Request timeout and retry policy.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ChannelConfig {
    /// Per-attempt timeout
    pub timeout_ms: u64,
    /// Attempts before giving up
    pub attempts: u32,
    /// Pause between attempts
    pub retry_delay_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            attempts: 3,
            retry_delay_ms: 1_000,
        }
    }
}

impl ChannelConfig {
    /// Set the per-attempt timeout
    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    /// Set the attempt count (at least 1)
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts.max(1);
        self
    }

    /// Set the pause between attempts
    pub fn with_retry_delay_ms(mut self, ms: u64) -> Self {
        self.retry_delay_ms = ms;
        self
    }

    /// Per-attempt timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Pause between attempts as a [`Duration`]
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }
}

// ============================================================================
// Discovery Config
// ============================================================================

/// Port walk settings.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct DiscoveryConfig {
    /// Number of physical ports to walk
    pub port_count: u32,
    /// Reads of a bus listing while it answers busy or nothing
    pub bus_retry_attempts: u32,
    /// Pause between bus reads
    pub bus_retry_delay_ms: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            port_count: 38,
            bus_retry_attempts: 3,
            bus_retry_delay_ms: 1_000,
        }
    }
}

impl DiscoveryConfig {
    /// Set the number of ports walked
    pub fn with_port_count(mut self, count: u32) -> Self {
        self.port_count = count;
        self
    }

    /// Set bus read retries
    pub fn with_bus_retry(mut self, attempts: u32, delay_ms: u64) -> Self {
        self.bus_retry_attempts = attempts.max(1);
        self.bus_retry_delay_ms = delay_ms;
        self
    }

    /// Pause between bus reads as a [`Duration`]
    pub fn bus_retry_delay(&self) -> Duration {
        Duration::from_millis(self.bus_retry_delay_ms)
    }
}

// ============================================================================
// Poll Config
// ============================================================================

/// When the bulk refresh of plain ports runs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum PlainPortRefresh {
    /// Every cycle.
    #[default]
    Always,
    /// Skipped when a push arrived within the last interval.
    UnlessPushed,
    /// Never; rely on pushes.
    Never,
}

/// Periodic refresh settings.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PollConfig {
    /// Time between cycles
    pub interval_ms: u64,
    /// Grace period on top of the interval before going offline
    pub offline_grace_ms: u64,
    /// Push the host clock to the device every cycle
    pub sync_time: bool,
    /// Bulk refresh policy of plain ports
    pub plain_ports: PlainPortRefresh,
    /// Whether the poller runs at all
    pub enabled: bool,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval_ms: 60_000,
            offline_grace_ms: 10_000,
            sync_time: false,
            plain_ports: PlainPortRefresh::Always,
            enabled: true,
        }
    }
}

impl PollConfig {
    /// Set the interval (at least 1 ms)
    pub fn with_interval_ms(mut self, ms: u64) -> Self {
        self.interval_ms = ms.max(1);
        self
    }

    /// Set clock synchronization
    pub fn with_sync_time(mut self, sync: bool) -> Self {
        self.sync_time = sync;
        self
    }

    /// Set the plain port refresh policy
    pub fn with_plain_ports(mut self, policy: PlainPortRefresh) -> Self {
        self.plain_ports = policy;
        self
    }

    /// Enable or disable polling
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Interval as a [`Duration`]
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    /// How long after the last good cycle the device still counts as online
    pub fn online_window(&self) -> Duration {
        self.interval() + Duration::from_millis(self.offline_grace_ms)
    }
}

// ============================================================================
// Transition Config
// ============================================================================

/// Smooth transition settings.
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct TransitionConfig {
    /// Software tick
    pub tick_ms: u64,
    /// Curve used by software ramps
    pub curve: Curve,
    /// Use the device's own ramping for ports that have it configured
    pub allow_hardware: bool,
}

impl Default for TransitionConfig {
    fn default() -> Self {
        Self {
            tick_ms: 50,
            curve: Curve::Linear,
            allow_hardware: true,
        }
    }
}

impl TransitionConfig {
    /// Set the tick (at least 1 ms)
    pub fn with_tick_ms(mut self, ms: u64) -> Self {
        self.tick_ms = ms.max(1);
        self
    }

    /// Set the ramp curve
    pub fn with_curve(mut self, curve: Curve) -> Self {
        self.curve = curve;
        self
    }

    /// Allow or forbid hardware ramps
    pub fn with_allow_hardware(mut self, allow: bool) -> Self {
        self.allow_hardware = allow;
        self
    }

    /// Tick as a [`Duration`]
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }
}

// ============================================================================
// MQTT Config
// ============================================================================

/// MQTT mirror configuration
#[derive(Clone, Debug)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct MqttConfig {
    /// Broker hostname or IP
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Client ID (should be unique per device)
    pub client_id: String,
    /// Username for authentication (empty = no auth)
    pub username: String,
    /// Password for authentication
    pub password: String,
    /// Keep-alive interval in seconds
    pub keep_alive_secs: u16,
    /// Pause after an event loop error
    pub reconnect_delay_ms: u64,
    /// Whether MQTT is enabled
    pub enabled: bool,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "rs-megad".to_string(),
            username: String::new(),
            password: String::new(),
            keep_alive_secs: 30,
            reconnect_delay_ms: 5_000,
            enabled: false,
        }
    }
}

impl MqttConfig {
    /// Set the broker host
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Set the broker port
    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Set the client ID
    pub fn with_client_id(mut self, id: impl Into<String>) -> Self {
        self.client_id = id.into();
        self
    }

    /// Set authentication credentials
    pub fn with_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Enable or disable MQTT
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Check if authentication is configured
    pub fn has_auth(&self) -> bool {
        !self.username.is_empty()
    }

    /// Pause after an event loop error as a [`Duration`]
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert_eq!(config.channel.timeout(), Duration::from_secs(5));
        assert_eq!(config.channel.attempts, 3);
        assert_eq!(config.channel.retry_delay(), Duration::from_secs(1));
        assert_eq!(config.discovery.port_count, 38);
        assert_eq!(config.poll.interval(), Duration::from_secs(60));
        assert_eq!(config.transition.tick(), Duration::from_millis(50));
        assert_eq!(config.device.events_delay(), Duration::from_secs(10));
        assert!(!config.mqtt.enabled);
    }

    #[test]
    fn zero_intervals_are_clamped() {
        let poll = PollConfig::default().with_interval_ms(0);
        assert_eq!(poll.interval_ms, 1);
        assert_eq!(poll.interval(), Duration::from_millis(1));

        // Deserialized or hand-built configs bypass the builder
        let raw = PollConfig {
            interval_ms: 0,
            ..PollConfig::default()
        };
        assert_eq!(raw.interval(), Duration::from_millis(1));
        assert_eq!(raw.online_window(), Duration::from_millis(10_001));

        assert_eq!(TransitionConfig::default().with_tick_ms(0).tick(), Duration::from_millis(1));
    }

    #[test]
    fn device_defaults_to_host_as_id() {
        let device = DeviceConfig::new("10.0.0.14", "sec");
        assert_eq!(device.id, "10.0.0.14");
        assert_eq!(device.with_id("garage").id, "garage");
    }

    #[test]
    fn default_mqtt_id_uses_last_octet() {
        assert_eq!(
            DeviceConfig::new("192.168.0.14", "sec").default_mqtt_id(),
            "megad/14"
        );
        assert_eq!(
            DeviceConfig::new("192.168.0.14:8080", "sec").default_mqtt_id(),
            "megad/14"
        );
    }

    #[test]
    fn online_window_adds_grace() {
        let poll = PollConfig::default().with_interval_ms(1_000);
        assert_eq!(poll.online_window(), Duration::from_millis(11_000));
    }

    #[test]
    fn builders_clamp_degenerate_values() {
        assert_eq!(ChannelConfig::default().with_attempts(0).attempts, 1);
        assert_eq!(TransitionConfig::default().with_tick_ms(0).tick_ms, 1);
        assert_eq!(
            DiscoveryConfig::default().with_bus_retry(0, 10).bus_retry_attempts,
            1
        );
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new(DeviceConfig::new("h", "s"))
            .with_channel(ChannelConfig::default().with_timeout_ms(100))
            .with_mqtt(MqttConfig::default().with_host("broker").with_auth("u", "p"))
            .with_transition(TransitionConfig::default().with_curve(Curve::EaseInOut));
        assert_eq!(config.channel.timeout_ms, 100);
        assert!(config.mqtt.has_auth());
        assert_eq!(config.mqtt.host, "broker");
        assert_eq!(config.transition.curve, Curve::EaseInOut);
    }
}
