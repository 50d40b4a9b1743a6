//! Parsers for everything the device sends back.
//!
//! Replies come in two flavors:
//!
//! - **Value replies** (`?pt=7&cmd=get`, `?cmd=all`, `?pt=30&cmd=list`): terse
//!   text such as `ON`, `128`, `temp:21.5/hum:40` or `28ff01:ON/OFF;28ff02:OFF/ON`.
//!   [`parse_value`] turns them into a [`PortValue`].
//! - **Config pages** (`?pt=7`, `?cf=2`, `?pt=30&cmd=scan`): small HTML forms.
//!   [`parse_attributes`], [`parse_input_value`] and [`parse_scan_page`] pull
//!   the interesting fields out of them.
//!
//! # Value grammar
//!
//! Rules are tried in order:
//!
//! 1. anything containing `busy` is [`PortValue::Busy`]
//! 2. anything containing `:` is a [`PortValue::Composite`]. It is split on
//!    `;` if present, otherwise on `/` (except in [`ParseMode::List`], where `/`
//!    separates the two channels of one DS2413). Tokens with exactly one `:`
//!    become pairs; the rest are dropped.
//! 3. `ON` / `OFF`
//! 4. a number, otherwise the raw text
//!
//! ```rust
//! use rs_megad::parsing::{parse_value, ParseMode};
//! use rs_megad::PortValue;
//!
//! assert_eq!(parse_value("ON", ParseMode::Get), PortValue::OnOff(true));
//! assert_eq!(parse_value("3.14", ParseMode::Get), PortValue::Numeric(3.14));
//! assert_eq!(parse_value("busy", ParseMode::Get), PortValue::Busy);
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use crate::error::{Error, Result};
use crate::port::{I2cDeviceKind, PinDirection, PortConfig, PortValue};

// ============================================================================
// Value replies
// ============================================================================

/// Which kind of request produced a reply.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ParseMode {
    /// `cmd=get` and everything else.
    #[default]
    Get,
    /// `cmd=list` bus listings, where `/` belongs to the value.
    List,
}

/// Parses one value reply.
pub fn parse_value(raw: &str, mode: ParseMode) -> PortValue {
    let raw = raw.trim();

    if raw.contains("busy") {
        return PortValue::Busy;
    }

    if raw.contains(':') {
        let tokens: Vec<&str> = if raw.contains(';') {
            raw.split(';').collect()
        } else if mode != ParseMode::List {
            raw.split('/').collect()
        } else {
            vec![raw]
        };

        let map: BTreeMap<String, String> = tokens
            .into_iter()
            .filter(|token| token.matches(':').count() == 1)
            .filter_map(|token| token.split_once(':'))
            .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
            .collect();
        return PortValue::Composite(map);
    }

    match raw {
        "ON" => PortValue::OnOff(true),
        "OFF" => PortValue::OnOff(false),
        _ => match raw.parse::<f64>() {
            Ok(n) if n.is_finite() => PortValue::Numeric(n),
            _ => PortValue::Text(raw.to_string()),
        },
    }
}

/// Parses an optional reply, treating a missing or blank body as an error.
pub fn parse_response(
    port: impl fmt::Display,
    raw: Option<String>,
    mode: ParseMode,
) -> Result<PortValue> {
    match raw {
        Some(body) if !body.trim().is_empty() => Ok(parse_value(&body, mode)),
        _ => Err(Error::no_data(port)),
    }
}

/// Splits a semicolon-separated listing into positional fields.
///
/// Used for extender `get` replies (one field per child) and the bulk
/// `cmd=all` reply (one field per port). Empty positions are kept.
pub fn parse_fields(raw: &str) -> Vec<String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Vec::new();
    }
    raw.split(';').map(|f| f.trim().to_string()).collect()
}

// ============================================================================
// Config pages
// ============================================================================

static SELECT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<select\b([^>]*)>(.*?)</select>").unwrap());
static OPTION_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<option\b([^>]*)>").unwrap());
static INPUT_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<input\b([^>]*)>").unwrap());
static ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?is)<a\b([^>]*)>").unwrap());
static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?is)([a-z_-]+)(?:\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s"'>]+)))?"#).unwrap()
});

/// Attributes of one HTML tag, lowercased names, in order.
fn tag_attrs(inner: &str) -> Vec<(String, Option<String>)> {
    ATTR_RE
        .captures_iter(inner)
        .map(|c| {
            let name = c[1].to_ascii_lowercase();
            let value = c
                .get(2)
                .or_else(|| c.get(3))
                .or_else(|| c.get(4))
                .map(|m| m.as_str().to_string());
            (name, value)
        })
        .collect()
}

fn attr<'a>(attrs: &'a [(String, Option<String>)], name: &str) -> Option<&'a (String, Option<String>)> {
    attrs.iter().find(|(n, _)| n == name)
}

fn attr_value<'a>(attrs: &'a [(String, Option<String>)], name: &str) -> Option<&'a str> {
    attr(attrs, name).and_then(|(_, v)| v.as_deref())
}

/// Selected option of every `<select>` on the page, by name.
fn selected_options(page: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for select in SELECT_RE.captures_iter(page) {
        let attrs = tag_attrs(&select[1]);
        let Some(name) = attr_value(&attrs, "name") else {
            continue;
        };
        let selected = OPTION_RE
            .captures_iter(&select[2])
            .map(|o| tag_attrs(&o[1]))
            .find(|o| attr(o, "selected").is_some());
        if let Some(value) = selected.as_deref().and_then(|o| attr_value(o, "value")) {
            out.insert(name.to_string(), value.to_string());
        }
    }
    out
}

/// Effective value of a named `<input>`: its `value`, or `"1"` for a bare
/// checked box. Unchecked checkboxes have none.
fn input_value(page: &str, name: &str) -> Option<String> {
    for input in INPUT_RE.captures_iter(page) {
        let attrs = tag_attrs(&input[1]);
        if attr_value(&attrs, "name") != Some(name) {
            continue;
        }
        let checked = attr(&attrs, "checked").is_some();
        let is_checkbox = attr_value(&attrs, "type")
            .is_some_and(|t| t.eq_ignore_ascii_case("checkbox"));

        return match (is_checkbox, checked, attr_value(&attrs, "value")) {
            (true, false, _) => None,
            (_, _, Some(v)) => Some(v.to_string()),
            (_, true, None) => Some("1".to_string()),
            (false, false, None) => None,
        };
    }
    None
}

/// Value of the named `<input>` on a page.
///
/// ```rust
/// use rs_megad::parsing::parse_input_value;
///
/// let page = r#"<form><input name=mdid value="megad/kitchen"></form>"#;
/// assert_eq!(parse_input_value(page, "mdid").as_deref(), Some("megad/kitchen"));
/// ```
pub fn parse_input_value(page: &str, name: &str) -> Option<String> {
    input_value(page, name).filter(|v| !v.is_empty())
}

/// Raw attributes of a port config page.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PortAttributes {
    /// Port type.
    pub pty: Option<String>,
    /// Mode.
    pub m: Option<String>,
    /// Group (I²C role).
    pub gr: Option<String>,
    /// Device selector.
    pub d: Option<String>,
    /// Extender child type.
    pub ety: Option<String>,
    /// Interrupt source port of an extender.
    pub inta: Option<String>,
    /// Mode-dependent extra field (smooth time for PWM).
    pub misc: Option<String>,
    /// Default action.
    pub eact: Option<String>,
}

impl PortAttributes {
    fn is(field: &Option<String>, value: &str) -> bool {
        field.as_deref() == Some(value)
    }

    fn is_or_absent(field: &Option<String>, value: &str) -> bool {
        field.as_deref().map_or(true, |v| v == value)
    }

    /// Maps the attributes to a [`PortConfig`]. The first matching row wins.
    ///
    /// I²C sensor channels are left empty; discovery fills them from the catalog.
    pub fn classify(&self) -> PortConfig {
        let pty = self.pty.as_deref();

        match pty {
            Some("4") => {
                if Self::is(&self.m, "1") && Self::is(&self.gr, "3") && Self::is(&self.d, "20") {
                    PortConfig::ExtenderMcp230 {
                        directions: BTreeMap::new(),
                    }
                } else if Self::is(&self.m, "1")
                    && Self::is(&self.gr, "3")
                    && Self::is(&self.d, "21")
                {
                    PortConfig::ExtenderPca9685
                } else if Self::is(&self.m, "2") {
                    PortConfig::I2cClock
                } else if Self::is(&self.m, "1") {
                    let kind = match self.d.as_deref() {
                        None | Some("0") => I2cDeviceKind::Any,
                        Some(code) => I2cDeviceKind::Known(crate::catalog::kind_for_code(code)),
                    };
                    PortConfig::I2cDevice {
                        kind,
                        sub_channels: Vec::new(),
                    }
                } else {
                    PortConfig::Unconfigured
                }
            }
            Some("3") if Self::is(&self.d, "5") => PortConfig::OneWireBus,
            Some("3") => PortConfig::SingleSensor,
            Some("2") => PortConfig::AdcInput,
            Some("1") if Self::is(&self.m, "2") => PortConfig::Ds2413Bus,
            Some("1") if Self::is(&self.m, "1") => PortConfig::PwmOutput,
            Some("1") if Self::is_or_absent(&self.m, "0") => PortConfig::RelayOutput,
            Some("0") => PortConfig::DigitalInput,
            _ => PortConfig::Unconfigured,
        }
    }

    /// Direction of an extender child page.
    pub fn direction(&self) -> Option<PinDirection> {
        match self.ety.as_deref() {
            Some("0") => Some(PinDirection::In),
            Some("1") => Some(PinDirection::Out),
            _ => None,
        }
    }

    /// Interrupt source port, for extenders.
    pub fn interrupt_port(&self) -> Option<u32> {
        self.inta.as_deref().and_then(|v| v.trim().parse().ok())
    }

    /// Smooth-dimming time in seconds, for PWM ports.
    pub fn smooth_secs(&self) -> Option<f64> {
        self.misc
            .as_deref()
            .and_then(|v| v.trim().parse::<f64>().ok())
            .filter(|s| *s > 0.0)
    }
}

/// Extracts the classification attributes of a port config page.
pub fn parse_attributes(page: &str) -> PortAttributes {
    let mut selects = selected_options(page);
    PortAttributes {
        pty: selects.remove("pty"),
        m: selects.remove("m"),
        gr: selects.remove("gr"),
        d: selects.remove("d"),
        ety: selects.remove("ety"),
        inta: input_value(page, "inta"),
        misc: input_value(page, "misc"),
        eact: input_value(page, "eact"),
    }
}

/// Classifies a port config page. Never fails; unknown pages are
/// [`PortConfig::Unconfigured`].
pub fn parse_config(page: &str) -> PortConfig {
    parse_attributes(page).classify()
}

// ============================================================================
// I²C scan page
// ============================================================================

/// One device link on the I²C scan page.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ScanEntry {
    /// Device name (`i2c_dev`).
    pub device: String,
    /// All query parameters of the link, in order.
    pub params: Vec<(String, String)>,
}

impl ScanEntry {
    /// Looks up one parameter.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Extracts every link with an `i2c_dev` parameter from the scan page.
pub fn parse_scan_page(page: &str) -> Vec<ScanEntry> {
    ANCHOR_RE
        .captures_iter(page)
        .filter_map(|a| {
            let attrs = tag_attrs(&a[1]);
            let href = attr_value(&attrs, "href")?.replace("&amp;", "&");
            let query = href.split_once('?').map_or(href.as_str(), |(_, q)| q);

            let params: Vec<(String, String)> = query
                .split('&')
                .filter(|kv| !kv.is_empty())
                .map(|kv| match kv.split_once('=') {
                    Some((k, v)) => (k.to_string(), v.to_string()),
                    None => (kv.to_string(), String::new()),
                })
                .collect();

            let device = params
                .iter()
                .find(|(k, _)| k == "i2c_dev")
                .map(|(_, v)| v.clone())?;
            Some(ScanEntry { device, params })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn composite(pairs: &[(&str, &str)]) -> PortValue {
        PortValue::Composite(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        )
    }

    // =========================================================================
    // Value grammar
    // =========================================================================

    #[test]
    fn on_off_and_numbers() {
        assert_eq!(parse_value("ON", ParseMode::Get), PortValue::OnOff(true));
        assert_eq!(parse_value("OFF\r\n", ParseMode::Get), PortValue::OnOff(false));
        assert_eq!(parse_value("3.14", ParseMode::Get), PortValue::Numeric(3.14));
        assert_eq!(parse_value("255", ParseMode::Get), PortValue::Numeric(255.0));
        assert_eq!(
            parse_value("NA", ParseMode::Get),
            PortValue::Text("NA".into())
        );
    }

    #[test]
    fn busy_wins_over_everything() {
        assert_eq!(parse_value("busy", ParseMode::Get), PortValue::Busy);
        assert_eq!(parse_value("temp:busy", ParseMode::List), PortValue::Busy);
    }

    #[test]
    fn semicolon_pairs() {
        assert_eq!(
            parse_value("1:25;2:30", ParseMode::Get),
            composite(&[("1", "25"), ("2", "30")])
        );
    }

    #[test]
    fn slash_pairs_only_in_get_mode() {
        assert_eq!(
            parse_value("28FF1:ON/28FF2:OFF", ParseMode::Get),
            composite(&[("28FF1", "ON"), ("28FF2", "OFF")])
        );
        assert_eq!(
            parse_value("28FF1:ON/28FF2:OFF", ParseMode::List),
            composite(&[])
        );
    }

    #[test]
    fn ds2413_listing_keeps_both_channels() {
        assert_eq!(
            parse_value("a1:ON/OFF;b2:OFF/OFF", ParseMode::List),
            composite(&[("a1", "ON/OFF"), ("b2", "OFF/OFF")])
        );
        assert_eq!(
            parse_value("a1:ON/OFF", ParseMode::List),
            composite(&[("a1", "ON/OFF")])
        );
    }

    #[test]
    fn sensor_reply_with_slashes() {
        assert_eq!(
            parse_value("temp:21.5/hum:40", ParseMode::Get),
            composite(&[("temp", "21.5"), ("hum", "40")])
        );
    }

    #[test]
    fn missing_reply_is_no_data() {
        let err = parse_response("7", None, ParseMode::Get).unwrap_err();
        assert!(matches!(err, Error::NoPortData { ref port } if port == "7"));
        assert!(parse_response("7", Some("  ".into()), ParseMode::Get).is_err());
        assert_eq!(
            parse_response("7", Some("ON".into()), ParseMode::Get).unwrap(),
            PortValue::OnOff(true)
        );
    }

    #[test]
    fn fields_are_positional() {
        assert_eq!(parse_fields("ON;OFF;;12"), vec!["ON", "OFF", "", "12"]);
        assert!(parse_fields("").is_empty());
    }

    // =========================================================================
    // Config pages
    // =========================================================================

    fn page(pty: &str, m: Option<&str>, extra: &str) -> String {
        let options: String = ["255", "0", "1", "2", "3", "4"]
            .iter()
            .map(|v| {
                let selected = if *v == pty { " selected" } else { "" };
                format!("<option value={v}{selected}>{v}")
            })
            .collect();
        let mut html = format!(
            "<a href=/sec>Back</a><br><form action=/sec/>\
             <input type=hidden name=pt value=7><select name=pty>{options}</select>"
        );
        if let Some(m) = m {
            html.push_str(&format!(
                "<select name=m><option value=0>SW<option value={m} selected>X</select>"
            ));
        }
        html.push_str(extra);
        html.push_str("</form>");
        html
    }

    #[test]
    fn reads_selected_options() {
        let attrs = parse_attributes(&page("1", Some("1"), "<input name=misc value=3>"));
        assert_eq!(attrs.pty.as_deref(), Some("1"));
        assert_eq!(attrs.m.as_deref(), Some("1"));
        assert_eq!(attrs.smooth_secs(), Some(3.0));
        assert_eq!(attrs.classify(), PortConfig::PwmOutput);
    }

    #[test]
    fn end_to_end_classification() {
        assert_eq!(parse_config(&page("0", None, "")), PortConfig::DigitalInput);
        assert_eq!(parse_config(&page("1", Some("2"), "")), PortConfig::Ds2413Bus);
        assert_eq!(parse_config(&page("1", None, "")), PortConfig::RelayOutput);
    }

    #[test]
    fn quoted_attributes() {
        let html = r#"<select name="pty"><option value="2" selected="selected">ADC</option></select>"#;
        assert_eq!(parse_config(html), PortConfig::AdcInput);
    }

    #[test]
    fn checkbox_inputs() {
        let html = "<input type=checkbox name=misc checked><input type=checkbox name=eact value=1>";
        let attrs = parse_attributes(html);
        assert_eq!(attrs.misc.as_deref(), Some("1"));
        assert_eq!(attrs.eact, None);
    }

    #[test]
    fn page_without_selectors_is_unconfigured() {
        assert_eq!(parse_config("<html>oops</html>"), PortConfig::Unconfigured);
        assert_eq!(parse_config(""), PortConfig::Unconfigured);
    }

    fn attrs(pty: &str, m: Option<&str>, gr: Option<&str>, d: Option<&str>) -> PortAttributes {
        PortAttributes {
            pty: Some(pty.into()),
            m: m.map(Into::into),
            gr: gr.map(Into::into),
            d: d.map(Into::into),
            ..Default::default()
        }
    }

    #[test]
    fn classification_table() {
        let cases = [
            (attrs("4", Some("1"), Some("3"), Some("20")), "mcp"),
            (attrs("4", Some("1"), Some("3"), Some("21")), "pca"),
            (attrs("4", Some("2"), None, None), "scl"),
            (attrs("4", Some("1"), None, Some("0")), "any"),
            (attrs("4", Some("1"), None, None), "any"),
            (attrs("4", Some("1"), None, Some("1")), "htu21d"),
            (attrs("3", None, None, Some("5")), "1w"),
            (attrs("3", None, None, Some("3")), "single"),
            (attrs("2", None, None, None), "adc"),
            (attrs("1", Some("2"), None, None), "ds2413"),
            (attrs("1", Some("1"), None, None), "pwm"),
            (attrs("1", Some("0"), None, None), "relay"),
            (attrs("0", None, None, None), "in"),
            (attrs("255", None, None, None), "nc"),
        ];

        for (attrs, expected) in cases {
            let got = attrs.classify();
            let ok = match (expected, &got) {
                ("mcp", PortConfig::ExtenderMcp230 { directions }) => directions.is_empty(),
                ("pca", PortConfig::ExtenderPca9685) => true,
                ("scl", PortConfig::I2cClock) => true,
                (
                    "any",
                    PortConfig::I2cDevice {
                        kind: I2cDeviceKind::Any,
                        ..
                    },
                ) => true,
                (
                    "htu21d",
                    PortConfig::I2cDevice {
                        kind: I2cDeviceKind::Known(k),
                        ..
                    },
                ) => k == "htu21d",
                ("1w", PortConfig::OneWireBus) => true,
                ("single", PortConfig::SingleSensor) => true,
                ("adc", PortConfig::AdcInput) => true,
                ("ds2413", PortConfig::Ds2413Bus) => true,
                ("pwm", PortConfig::PwmOutput) => true,
                ("relay", PortConfig::RelayOutput) => true,
                ("in", PortConfig::DigitalInput) => true,
                ("nc", PortConfig::Unconfigured) => true,
                _ => false,
            };
            assert!(ok, "{attrs:?} classified as {got:?}, expected {expected}");
        }
    }

    #[test]
    fn extender_child_direction() {
        let input = parse_attributes("<select name=ety><option value=0 selected>In</select>");
        let output = parse_attributes("<select name=ety><option value=1 selected>Out</select>");
        assert_eq!(input.direction(), Some(PinDirection::In));
        assert_eq!(output.direction(), Some(PinDirection::Out));
        assert_eq!(PortAttributes::default().direction(), None);
    }

    #[test]
    fn interrupt_source() {
        let attrs = parse_attributes("<input name=inta value=12>");
        assert_eq!(attrs.interrupt_port(), Some(12));
    }

    #[test]
    fn mqtt_id_input() {
        let page = "<input name=mdid value=megad/kitchen><input name=empty value=''>";
        assert_eq!(parse_input_value(page, "mdid").as_deref(), Some("megad/kitchen"));
        assert_eq!(parse_input_value(page, "empty"), None);
        assert_eq!(parse_input_value(page, "missing"), None);
    }

    // =========================================================================
    // Scan page
    // =========================================================================

    #[test]
    fn scan_page_links() {
        let page = "<a href=/sec/?pt=30>Back</a><br>\
                    <a href=\"/sec/?pt=30&i2c_dev=htu21d\">htu21d</a><br>\
                    <a href=/sec/?pt=30&amp;i2c_dev=bh1750&amp;addr=35>bh1750</a>";
        let entries = parse_scan_page(page);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].device, "htu21d");
        assert_eq!(entries[0].param("pt"), Some("30"));
        assert_eq!(entries[1].device, "bh1750");
        assert_eq!(entries[1].param("addr"), Some("35"));
    }
}
