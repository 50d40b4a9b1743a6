//! Sensor catalog: which channels a sensor reports and how to read them.
//!
//! The device itself only knows raw numbers. Turning an I²C scan result or a
//! configured sensor kind into named channels is table data, supplied by a
//! [`SensorCatalog`]. [`BuiltinCatalog`] ships the table for the sensors the
//! device firmware supports out of the box.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::parsing::ScanEntry;

/// Physical quantity measured by a sensor channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum SensorKind {
    /// °C
    Temperature,
    /// %
    Humidity,
    /// bar
    Pressure,
    /// lx
    Illuminance,
    /// ppm
    Co2,
    /// Unitless value.
    Generic,
}

impl SensorKind {
    /// Unit of measurement.
    pub fn unit(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "°C",
            SensorKind::Humidity => "%",
            SensorKind::Pressure => "bar",
            SensorKind::Illuminance => "lx",
            SensorKind::Co2 => "ppm",
            SensorKind::Generic => "",
        }
    }

    /// Short name used in channel suffixes.
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temperature",
            SensorKind::Humidity => "humidity",
            SensorKind::Pressure => "pressure",
            SensorKind::Illuminance => "illuminance",
            SensorKind::Co2 => "co2",
            SensorKind::Generic => "value",
        }
    }

    /// Field name the device uses for this quantity in a composite reply
    /// such as `temp:21.5/hum:40`.
    pub fn reply_key(&self) -> &'static str {
        match self {
            SensorKind::Temperature => "temp",
            SensorKind::Humidity => "hum",
            SensorKind::Pressure => "press",
            SensorKind::Illuminance => "light",
            SensorKind::Co2 => "co2",
            SensorKind::Generic => "value",
        }
    }
}

static TEMP_PATT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\btemp").unwrap());
static HUM_PATT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bhum").unwrap());
static PRESS_PATT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bpress").unwrap());
static LUX_PATT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(lux|light)").unwrap());

/// Classifies a sensor field by its key and raw text.
///
/// One-wire buses mostly carry DS18B20 thermometers keyed by address, so
/// anything unrecognized is a temperature.
pub fn classify_field(key: &str, raw: &str) -> SensorKind {
    for text in [key, raw] {
        if TEMP_PATT.is_match(text) {
            return SensorKind::Temperature;
        }
        if HUM_PATT.is_match(text) {
            return SensorKind::Humidity;
        }
        if PRESS_PATT.is_match(text) {
            return SensorKind::Pressure;
        }
        if LUX_PATT.is_match(text) {
            return SensorKind::Illuminance;
        }
    }
    SensorKind::Temperature
}

/// One channel reported by a sensor.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SensorChannel {
    /// Quantity measured.
    pub kind: SensorKind,
    /// Field of the reply carrying this channel, if the reply is composite.
    pub key: Option<String>,
    /// Stable suffix distinguishing this channel from its siblings on the same port.
    pub suffix: String,
}

/// One request the poller issues to refresh I²C sensors.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct I2cProbe {
    /// Port the sensor hangs off.
    pub port: u32,
    /// Ordered query parameters of the request.
    pub params: Vec<(String, String)>,
    /// Time to wait after this request before the next one (measurement triggers).
    pub delay_ms: Option<u64>,
    /// Key under which the reply is merged into the port's composite value.
    /// `None` for requests whose reply carries no reading.
    pub id_suffix: Option<String>,
}

impl I2cProbe {
    /// Delay as a [`Duration`].
    pub fn delay(&self) -> Option<Duration> {
        self.delay_ms.map(Duration::from_millis)
    }
}

/// What an I²C sensor contributes: probes to poll and channels to expose.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CatalogMatch {
    /// Requests to issue every poll cycle.
    pub probes: Vec<I2cProbe>,
    /// Channels to expose, with the probe suffix each one is read from.
    pub channels: Vec<SensorChannel>,
}

/// Maps sensor kinds and scan results to channels.
pub trait SensorCatalog: Send + Sync {
    /// Channels of a sensor kind configured directly on a port.
    fn channels_for_kind(&self, kind: &str) -> Vec<SensorKind>;

    /// Resolves the devices found by an I²C scan on `port`.
    fn resolve_scan(&self, port: u32, entries: &[ScanEntry]) -> CatalogMatch;
}

/// One slot of a device's reply layout.
#[derive(Clone, Copy, Debug)]
enum Slot {
    /// Index not used.
    Skip,
    /// A request that triggers a measurement, followed by a delay in ms.
    Trigger(Option<u64>),
    /// A reading.
    Reading(SensorKind, Option<&'static str>),
}

const I2C_DEVICES: &[(&str, &[Slot])] = &[
    (
        "htu21d",
        &[
            Slot::Reading(SensorKind::Humidity, None),
            Slot::Reading(SensorKind::Temperature, None),
        ],
    ),
    (
        "sht31",
        &[
            Slot::Reading(SensorKind::Humidity, None),
            Slot::Reading(SensorKind::Temperature, None),
        ],
    ),
    ("max44009", &[Slot::Reading(SensorKind::Illuminance, None)]),
    ("bh1750", &[Slot::Reading(SensorKind::Illuminance, None)]),
    ("tsl2591", &[Slot::Reading(SensorKind::Illuminance, None)]),
    (
        "bmp180",
        &[
            Slot::Reading(SensorKind::Pressure, None),
            Slot::Reading(SensorKind::Temperature, None),
        ],
    ),
    (
        "bmx280",
        &[
            Slot::Reading(SensorKind::Pressure, None),
            Slot::Reading(SensorKind::Temperature, None),
            Slot::Reading(SensorKind::Humidity, None),
        ],
    ),
    (
        "mlx90614",
        &[
            Slot::Skip,
            Slot::Reading(SensorKind::Temperature, Some("temp")),
            Slot::Reading(SensorKind::Temperature, Some("object")),
        ],
    ),
    (
        "ptsensor",
        &[
            Slot::Skip,
            Slot::Trigger(Some(1000)),
            Slot::Reading(SensorKind::Pressure, None),
            Slot::Reading(SensorKind::Temperature, None),
        ],
    ),
    (
        "mcp9600",
        &[
            // thermocouple, then the chip's own sensor
            Slot::Reading(SensorKind::Temperature, None),
            Slot::Reading(SensorKind::Temperature, Some("chip")),
        ],
    ),
    ("t67xx", &[Slot::Reading(SensorKind::Co2, None)]),
    ("tmp117", &[Slot::Reading(SensorKind::Temperature, None)]),
];

/// Firmware codes of the `d` selector on an I²C data port.
const I2C_CODES: &[(&str, &str)] = &[
    ("1", "htu21d"),
    ("2", "bh1750"),
    ("3", "tsl2591"),
    ("5", "bmp180"),
    ("6", "bmx280"),
    ("7", "max44009"),
    ("8", "sht31"),
    ("9", "mlx90614"),
    ("10", "ptsensor"),
    ("11", "mcp9600"),
    ("12", "t67xx"),
    ("13", "tmp117"),
];

/// Catalog name for an I²C `d` selector code. Unknown codes get a synthetic name.
pub fn kind_for_code(code: &str) -> String {
    I2C_CODES
        .iter()
        .find(|(c, _)| *c == code)
        .map(|(_, name)| name.to_string())
        .unwrap_or_else(|| format!("d{code}"))
}

fn slots(kind: &str) -> &'static [Slot] {
    I2C_DEVICES
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, slots)| *slots)
        .unwrap_or(&[])
}

/// Catalog backed by the built-in device table.
#[derive(Clone, Copy, Debug, Default)]
pub struct BuiltinCatalog;

impl SensorCatalog for BuiltinCatalog {
    fn channels_for_kind(&self, kind: &str) -> Vec<SensorKind> {
        slots(kind)
            .iter()
            .filter_map(|slot| match slot {
                Slot::Reading(kind, _) => Some(*kind),
                _ => None,
            })
            .collect()
    }

    fn resolve_scan(&self, port: u32, entries: &[ScanEntry]) -> CatalogMatch {
        let mut out = CatalogMatch::default();

        for entry in entries {
            let base = entry.params.clone();
            for (i, slot) in slots(&entry.device).iter().enumerate() {
                match *slot {
                    Slot::Skip => {}
                    Slot::Trigger(delay_ms) => out.probes.push(I2cProbe {
                        port,
                        params: base.clone(),
                        delay_ms,
                        id_suffix: None,
                    }),
                    Slot::Reading(kind, suffix) => {
                        let mut suffix = suffix.unwrap_or(kind.as_str()).to_string();
                        if let Some(addr) = entry.param("addr") {
                            suffix.push('_');
                            suffix.push_str(addr);
                        }
                        let id_suffix = format!("{}_{}", entry.device, suffix);

                        let mut params = base.clone();
                        if i > 0 {
                            params.push(("i2c_par".to_string(), i.to_string()));
                        }
                        out.probes.push(I2cProbe {
                            port,
                            params,
                            delay_ms: None,
                            id_suffix: Some(id_suffix.clone()),
                        });
                        out.channels.push(SensorChannel {
                            kind,
                            key: Some(id_suffix.clone()),
                            suffix: id_suffix,
                        });
                    }
                }
            }
        }
        out
    }
}
