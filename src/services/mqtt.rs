//! MQTT mirror of a device's port values.
//!
//! A device with MQTT enabled publishes every port change to
//! `<mqtt_id>/<port>` and accepts commands on `<mqtt_id>/cmd`:
//!
//! **Subscribe Topics:**
//! - `<mqtt_id>/+` - Port values, `{"value": "ON"}` / `{"value": 21.5}` or a raw string
//!
//! **Publish Topics:**
//! - `<mqtt_id>/cmd` - `get:<port>`, asking the device to publish a port
//!
//! Received values go through [`DeviceHandle::ingest_push`], exactly like the
//! HTTP pushes handled by the ingress router.
//!
//! ```ignore
//! let device = Arc::new(DeviceHandle::new(transport, config));
//! let mirror = MqttMirror::connect(Arc::clone(&device), &mqtt_config).await;
//! let requester = mirror.requester();
//! tokio::spawn(mirror.run(token.clone()));
//! requester.request_port(&PortId::Simple(7)).await?;
//! ```

use std::sync::Arc;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Deserialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::MqttConfig;
use crate::device::{DeviceHandle, PushPayload};
use crate::parsing::{self, ParseMode};
use crate::port::{PortId, PortValue};
use crate::traits::{MqttMessage, Transport};

/// MQTT-related errors
#[derive(Debug, Error)]
pub enum MqttError {
    /// Failed to subscribe to a topic
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    /// Failed to publish a message
    #[error("publish failed: {0}")]
    Publish(String),
}

// ============================================================================
// Decoding
// ============================================================================

#[derive(Deserialize)]
struct ValueMessage {
    value: serde_json::Value,
}

/// Turns a message from `<mqtt_id>/<port>` into a push.
///
/// Returns `None` for other topics, for `<mqtt_id>/cmd` and for payloads
/// that are not text.
pub fn decode_message(mqtt_id: &str, message: &MqttMessage) -> Option<PushPayload> {
    let suffix = message
        .topic
        .strip_prefix(mqtt_id)?
        .strip_prefix('/')?;
    let port: PortId = suffix.parse().ok()?;
    let text = message.payload_str()?;

    let value = match serde_json::from_str::<ValueMessage>(text) {
        Ok(ValueMessage { value }) => match value {
            serde_json::Value::Number(n) => PortValue::Numeric(n.as_f64()?),
            serde_json::Value::Bool(b) => PortValue::OnOff(b),
            serde_json::Value::String(s) => parsing::parse_value(&s, ParseMode::Get),
            other => parsing::parse_value(&other.to_string(), ParseMode::Get),
        },
        Err(_) => parsing::parse_value(text, ParseMode::Get),
    };
    Some(PushPayload::new(port, value))
}

// ============================================================================
// Requester
// ============================================================================

/// Publishes `get:<port>` requests to the device.
#[derive(Clone, Debug)]
pub struct PortRequester {
    client: AsyncClient,
    topic: String,
}

impl PortRequester {
    /// Asks the device to publish the current value of `port`.
    pub async fn request_port(&self, port: &PortId) -> Result<(), MqttError> {
        debug!(%port, "requesting port over mqtt");
        self.client
            .publish(&self.topic, QoS::AtMostOnce, false, format!("get:{port}"))
            .await
            .map_err(|e| MqttError::Publish(e.to_string()))
    }
}

// ============================================================================
// Mirror
// ============================================================================

/// Feeds MQTT port messages into a [`DeviceHandle`].
pub struct MqttMirror<T> {
    handle: Arc<DeviceHandle<T>>,
    client: AsyncClient,
    eventloop: EventLoop,
    mqtt_id: String,
    reconnect_delay: Duration,
}

impl<T: Transport> MqttMirror<T> {
    /// Creates a mirror for the given MQTT identity. Nothing is sent until [`run`](Self::run).
    pub fn new(handle: Arc<DeviceHandle<T>>, config: &MqttConfig, mqtt_id: impl Into<String>) -> Self {
        let mut options = MqttOptions::new(&config.client_id, &config.host, config.port);
        options.set_keep_alive(Duration::from_secs(u64::from(config.keep_alive_secs)));
        if config.has_auth() {
            options.set_credentials(&config.username, &config.password);
        }
        let (client, eventloop) = AsyncClient::new(options, 16);

        Self {
            handle,
            client,
            eventloop,
            mqtt_id: mqtt_id.into(),
            reconnect_delay: config.reconnect_delay(),
        }
    }

    /// Creates a mirror, reading the MQTT identity from the device.
    ///
    /// Falls back to the host-derived identity if the device can't be asked.
    pub async fn connect(handle: Arc<DeviceHandle<T>>, config: &MqttConfig) -> Self {
        let mqtt_id = match handle.mqtt_id().await {
            Ok(id) => id,
            Err(err) => {
                let fallback = handle.config().device.default_mqtt_id();
                warn!(error = %err, %fallback, "could not read mqtt id");
                fallback
            }
        };
        Self::new(handle, config, mqtt_id)
    }

    /// MQTT identity in use.
    pub fn mqtt_id(&self) -> &str {
        &self.mqtt_id
    }

    /// Handle for publishing port requests while the mirror runs.
    pub fn requester(&self) -> PortRequester {
        PortRequester {
            client: self.client.clone(),
            topic: format!("{}/cmd", self.mqtt_id),
        }
    }

    /// Runs the event loop until `token` is cancelled.
    ///
    /// Connection errors are logged and retried after the reconnect delay.
    /// Subscriptions are renewed on every connect.
    pub async fn run(mut self, token: CancellationToken) -> Result<(), MqttError> {
        let filter = format!("{}/+", self.mqtt_id);
        info!(mqtt_id = %self.mqtt_id, "mqtt mirror starting");

        loop {
            let event = tokio::select! {
                _ = token.cancelled() => break,
                event = self.eventloop.poll() => event,
            };

            match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!(%filter, "mqtt connected");
                    self.client
                        .try_subscribe(&filter, QoS::AtMostOnce)
                        .map_err(|e| MqttError::Subscribe(e.to_string()))?;
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let message = MqttMessage::new(publish.topic, publish.payload.to_vec());
                    self.handle_message(&message);
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, delay = ?self.reconnect_delay, "mqtt error");
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = tokio::time::sleep(self.reconnect_delay) => {}
                    }
                }
            }
        }

        info!("mqtt mirror stopped");
        let _ = self.client.try_disconnect();
        Ok(())
    }

    fn handle_message(&self, message: &MqttMessage) {
        match decode_message(&self.mqtt_id, message) {
            Some(payload) => {
                trace!(port = %payload.port, value = %payload.value, "mqtt value");
                self.handle.ingest_push(payload);
            }
            None => trace!(topic = %message.topic, "ignored mqtt message"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(topic: &str, payload: &str) -> Option<PushPayload> {
        decode_message("megad/14", &MqttMessage::new(topic, payload))
    }

    #[test]
    fn decodes_json_values() {
        assert_eq!(
            decode("megad/14/7", r#"{"value": "ON"}"#),
            Some(PushPayload::new(PortId::Simple(7), PortValue::OnOff(true)))
        );
        assert_eq!(
            decode("megad/14/30", r#"{"value": 21.5}"#).unwrap().value,
            PortValue::Numeric(21.5)
        );
        assert_eq!(
            decode("megad/14/31e2", r#"{"value": "OFF"}"#).unwrap().port,
            PortId::extender_child(31, 2)
        );
    }

    #[test]
    fn decodes_raw_payloads() {
        assert_eq!(decode("megad/14/8", "OFF").unwrap().value, PortValue::OnOff(false));
        assert_eq!(decode("megad/14/8", "128").unwrap().value, PortValue::Numeric(128.0));
    }

    #[test]
    fn ignores_foreign_topics() {
        assert_eq!(decode("megad/14/cmd", "get:7"), None);
        assert_eq!(decode("megad/15/7", "ON"), None);
        assert_eq!(decode("megad/147", "ON"), None);
        assert_eq!(
            decode_message("megad/14", &MqttMessage::new("megad/14/7", vec![0xff, 0xfe])),
            None
        );
    }

    #[tokio::test]
    async fn ingests_into_the_store() {
        use crate::config::{Config, DeviceConfig};
        use crate::hal::MockTransport;

        let handle = Arc::new(DeviceHandle::new(
            MockTransport::new(),
            Config::new(DeviceConfig::new("10.0.0.14", "sec")),
        ));
        let mirror = MqttMirror::new(Arc::clone(&handle), &MqttConfig::default(), "megad/14");
        assert_eq!(mirror.mqtt_id(), "megad/14");

        mirror.handle_message(&MqttMessage::new("megad/14/3", r#"{"value": "ON"}"#));
        assert_eq!(handle.store().get(&PortId::Simple(3)), Some(PortValue::OnOff(true)));
        assert!(handle.store().last_push().is_some());
    }
}
