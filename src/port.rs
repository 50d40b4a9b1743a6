//! Port identifiers, port values and discovered port configurations.
//!
//! The device addresses its I/O in three different shapes, and the wire
//! format encodes all of them as a string:
//!
//! | Shape | Example | Meaning |
//! |-------|---------|---------|
//! | [`PortId::Simple`] | `7` | a physical port |
//! | [`PortId::ExtenderChild`] | `31e4` | child 4 of the I²C extender on port 31 |
//! | [`PortId::SubAddressed`] | `30A28ff4a6d` | channel A of the DS2413 at that address on bus port 30 |
//!
//! ```rust
//! use rs_megad::PortId;
//!
//! let a: PortId = "3".parse().unwrap();
//! assert_eq!(a, PortId::from(3));
//!
//! let child: PortId = "31e4".parse().unwrap();
//! assert_eq!(child, PortId::ExtenderChild { parent: 31, index: 4 });
//! assert_eq!(child.to_string(), "31e4");
//! ```

use core::fmt;
use core::str::FromStr;
use std::collections::BTreeMap;

use crate::error::Error;

// ============================================================================
// Port Identifier
// ============================================================================

/// Identifier of one addressable port.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PortId {
    /// A directly addressed port.
    Simple(u32),
    /// A port hosted behind an I²C extender.
    ExtenderChild {
        /// Physical port the extender is attached to.
        parent: u32,
        /// Child index on the extender.
        index: u32,
    },
    /// One channel of a two-channel one-wire device on a bus port.
    SubAddressed {
        /// Physical bus port.
        port: u32,
        /// One-wire address of the device.
        address: String,
        /// Channel, 0 (`A`) or 1 (`B`).
        index: u8,
    },
}

impl PortId {
    /// Creates a DS2413 channel identifier. Any channel above 1 is treated as 1.
    pub fn ds2413(port: u32, address: impl Into<String>, channel: u8) -> Self {
        PortId::SubAddressed {
            port,
            address: address.into(),
            index: channel.min(1),
        }
    }

    /// Creates an extender child identifier.
    pub fn extender_child(parent: u32, index: u32) -> Self {
        PortId::ExtenderChild { parent, index }
    }

    /// The physical port every request for this identifier goes through.
    pub fn base_port(&self) -> u32 {
        match self {
            PortId::Simple(n) => *n,
            PortId::ExtenderChild { parent, .. } => *parent,
            PortId::SubAddressed { port, .. } => *port,
        }
    }

    /// Returns true for [`PortId::Simple`].
    pub fn is_simple(&self) -> bool {
        matches!(self, PortId::Simple(_))
    }
}

impl From<u32> for PortId {
    fn from(n: u32) -> Self {
        PortId::Simple(n)
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortId::Simple(n) => write!(f, "{n}"),
            PortId::ExtenderChild { parent, index } => write!(f, "{parent}e{index}"),
            PortId::SubAddressed {
                port,
                address,
                index,
            } => {
                let channel = if *index == 0 { 'A' } else { 'B' };
                write!(f, "{port}{channel}{address}")
            }
        }
    }
}

impl FromStr for PortId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = || Error::InvalidPortId(s.to_string());

        let digits = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        if digits == 0 {
            return Err(invalid());
        }
        let port: u32 = s[..digits].parse().map_err(|_| invalid())?;
        let rest = &s[digits..];

        let mut chars = rest.chars();
        match chars.next() {
            None => Ok(PortId::Simple(port)),
            Some('e') => {
                let index = chars.as_str();
                if index.is_empty() || !index.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(invalid());
                }
                let index = index.parse().map_err(|_| invalid())?;
                Ok(PortId::ExtenderChild {
                    parent: port,
                    index,
                })
            }
            Some(channel @ ('A' | 'B')) => {
                let address = chars.as_str();
                if address.is_empty() || !address.chars().all(|c| c.is_ascii_alphanumeric()) {
                    return Err(invalid());
                }
                Ok(PortId::SubAddressed {
                    port,
                    address: address.to_string(),
                    index: if channel == 'A' { 0 } else { 1 },
                })
            }
            Some(_) => Err(invalid()),
        }
    }
}

#[cfg(feature = "serde")]
impl serde::Serialize for PortId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[cfg(feature = "serde")]
impl<'de> serde::Deserialize<'de> for PortId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

// ============================================================================
// Port Value
// ============================================================================

/// A parsed device reply.
///
/// Every raw response goes through [`parse_value`](crate::parsing::parse_value)
/// and ends up as one of these; nothing downstream looks at raw text.
#[derive(Clone, Debug, PartialEq)]
pub enum PortValue {
    /// `ON` / `OFF`.
    OnOff(bool),
    /// A number.
    Numeric(f64),
    /// The device was busy; the previous value is still the best known one.
    Busy,
    /// `key:value` pairs, e.g. a one-wire bus listing or a multi-channel sensor.
    Composite(BTreeMap<String, String>),
    /// Anything else, kept verbatim.
    Text(String),
}

impl PortValue {
    /// Returns true for [`PortValue::Busy`].
    pub fn is_busy(&self) -> bool {
        matches!(self, PortValue::Busy)
    }

    /// Interprets the value as on/off. Numbers are on when non-zero.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            PortValue::OnOff(on) => Some(*on),
            PortValue::Numeric(n) => Some(*n != 0.0),
            _ => None,
        }
    }

    /// Interprets the value as a number. `ON` is 1, `OFF` is 0.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PortValue::Numeric(n) => Some(*n),
            PortValue::OnOff(on) => Some(if *on { 1.0 } else { 0.0 }),
            PortValue::Text(t) => t.trim().parse().ok(),
            _ => None,
        }
    }

    /// Looks up one field of a composite value.
    pub fn field(&self, key: &str) -> Option<&str> {
        match self {
            PortValue::Composite(map) => map.get(key).map(String::as_str),
            _ => None,
        }
    }
}

impl fmt::Display for PortValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortValue::OnOff(true) => f.write_str("ON"),
            PortValue::OnOff(false) => f.write_str("OFF"),
            PortValue::Numeric(n) => write!(f, "{n}"),
            PortValue::Busy => f.write_str("busy"),
            PortValue::Composite(map) => {
                let mut first = true;
                for (k, v) in map {
                    if !first {
                        f.write_str(";")?;
                    }
                    write!(f, "{k}:{v}")?;
                    first = false;
                }
                Ok(())
            }
            PortValue::Text(t) => f.write_str(t),
        }
    }
}

// ============================================================================
// Port Configuration
// ============================================================================

/// Direction of one MCP230xx extender pin.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum PinDirection {
    /// Input pin, exposed as a binary sensor.
    In,
    /// Output pin, exposed as a switch.
    Out,
}

/// Kind of sensor configured on an I²C port.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum I2cDeviceKind {
    /// Free-scan mode: the device lists whatever it finds on the bus.
    Any,
    /// A specific sensor, by catalog name (e.g. `htu21d`).
    Known(String),
}

/// The static shape of a port, derived once during discovery.
#[derive(Clone, Debug, PartialEq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum PortConfig {
    /// Digital input (button, contact).
    DigitalInput,
    /// On/off output.
    RelayOutput,
    /// 8-bit dimmable output.
    PwmOutput,
    /// One-wire bus of DS2413 two-channel switches.
    Ds2413Bus,
    /// MCP230xx I/O expander. Directions are filled in while its children are walked.
    ExtenderMcp230 {
        /// Direction of each discovered child.
        directions: BTreeMap<u32, PinDirection>,
    },
    /// PCA9685 12-bit PWM driver.
    ExtenderPca9685,
    /// One-wire sensor bus.
    OneWireBus,
    /// A single digital sensor (DHT, lone DS18B20).
    SingleSensor,
    /// I²C sensor port.
    I2cDevice {
        /// Configured sensor kind.
        kind: I2cDeviceKind,
        /// Channel names the sensor reports.
        sub_channels: Vec<String>,
    },
    /// SCL half of an I²C pair; carries no data.
    I2cClock,
    /// Analog input.
    AdcInput,
    /// Nothing recognizable.
    #[default]
    Unconfigured,
}

impl PortConfig {
    /// Returns true for ports that accept output commands.
    pub fn is_output(&self) -> bool {
        matches!(self, PortConfig::RelayOutput | PortConfig::PwmOutput)
    }

    /// Returns true for the two extender kinds.
    pub fn is_extender(&self) -> bool {
        matches!(
            self,
            PortConfig::ExtenderMcp230 { .. } | PortConfig::ExtenderPca9685
        )
    }
}
