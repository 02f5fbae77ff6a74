/// Outbound topic mapping
///
/// Pure construction of bus messages: the engine decides *when* to publish,
/// this module decides *where* and *what*. Readings and derived state go out
/// retained so a freshly connected dashboard immediately has last-known
/// values; heartbeats and alerts are deliberately not retained so their
/// absence is visible.
use std::collections::HashMap;

use serde::Serialize;
use serde_json::json;

use crate::models::command::Mode;
use crate::models::telemetry::{Channel, Derived, Heartbeat, ReadingFrame};

/// Minimum spacing between two alerts of the same kind (s).
const ALERT_THROTTLE_S: i64 = 300;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: String,
    pub retained: bool,
}

impl OutboundMessage {
    /// Alerts and retained state ride QoS 1; the per-tick firehose rides
    /// QoS 0 where a lost sample costs nothing.
    pub fn wants_ack(&self) -> bool {
        self.retained || self.topic.contains("/alerts/") || self.topic.contains("/status/")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// One alert per kind per five minutes; everything else is dropped at the
/// source instead of flooding the bus.
#[derive(Debug, Default)]
pub struct AlertThrottle {
    last_sent: HashMap<String, i64>,
}

impl AlertThrottle {
    pub fn allow(&mut self, kind: &str, wall: i64) -> bool {
        match self.last_sent.get(kind) {
            Some(last) if wall - last < ALERT_THROTTLE_S => false,
            _ => {
                self.last_sent.insert(kind.to_string(), wall);
                true
            }
        }
    }
}

pub struct Publisher {
    prefix: String,
    discovery_prefix: String,
    throttle: AlertThrottle,
}

impl Publisher {
    pub fn new(topic_prefix: &str, discovery_prefix: &str) -> Self {
        Self {
            prefix: topic_prefix.trim_end_matches('/').to_string(),
            discovery_prefix: discovery_prefix.trim_end_matches('/').to_string(),
            throttle: AlertThrottle::default(),
        }
    }

    fn topic(&self, suffix: &str) -> String {
        format!("{}/{}", self.prefix, suffix)
    }

    pub fn availability_topic(&self) -> String {
        self.topic("status/availability")
    }

    pub fn heartbeat_topic(&self) -> String {
        self.topic("heartbeat")
    }

    pub fn command_filter(&self) -> String {
        self.topic("control/#")
    }

    pub fn alert_topic(&self, kind: &str) -> String {
        self.topic(&format!("alerts/{}", kind))
    }

    /// Strip the configured prefix off an inbound topic.
    pub fn strip_prefix<'a>(&self, topic: &'a str) -> Option<&'a str> {
        topic
            .strip_prefix(self.prefix.as_str())
            .and_then(|rest| rest.strip_prefix('/'))
    }

    // ── Outbound state ──────────────────────────────────────────────────────

    pub fn availability(&self, online: bool) -> OutboundMessage {
        OutboundMessage {
            topic: self.availability_topic(),
            payload: if online { "online" } else { "offline" }.to_string(),
            retained: true,
        }
    }

    pub fn frame_messages(&self, frame: &ReadingFrame) -> Vec<OutboundMessage> {
        frame
            .readings
            .iter()
            .map(|(id, reading)| OutboundMessage {
                topic: self.topic(&format!("temperature/{}", id)),
                payload: json!({
                    "value_c": reading.value_c,
                    "status": reading.status,
                    "wall": frame.wall,
                })
                .to_string(),
                retained: true,
            })
            .collect()
    }

    pub fn derived_messages(&self, derived: &Derived, wall: i64) -> Vec<OutboundMessage> {
        let fields: [(&str, serde_json::Value, &str); 11] = [
            ("collector_dt_c", json!(derived.collector_dt_c), "°C"),
            ("stored_energy_kwh", json!(derived.stored_energy_kwh), "kWh"),
            ("stored_energy_top_kwh", json!(derived.stored_energy_top_kwh), "kWh"),
            ("stored_energy_bottom_kwh", json!(derived.stored_energy_bottom_kwh), "kWh"),
            ("tank_mean_c", json!(derived.tank_mean_c), "°C"),
            ("stratification_c_per_cm", json!(derived.stratification_c_per_cm), "°C/cm"),
            ("hx_efficiency_pct", json!(derived.hx_efficiency_pct), "%"),
            ("energy_rate_kw", json!(derived.energy_rate_kw), "kW"),
            ("temp_rate_c_per_h", json!(derived.temp_rate_c_per_h), "°C/h"),
            ("sensor_health_pct", json!(derived.sensor_health_pct), "%"),
            ("overheating_risk_pct", json!(derived.overheating_risk_pct), "%"),
        ];
        fields
            .into_iter()
            .map(|(name, value, unit)| OutboundMessage {
                topic: self.topic(&format!("derived/{}", name)),
                payload: json!({ "value": value, "unit": unit, "wall": wall }).to_string(),
                retained: true,
            })
            .collect()
    }

    #[allow(clippy::too_many_arguments)]
    pub fn system_status(
        &self,
        mode: Mode,
        pump_on: bool,
        heater_on: bool,
        emergency_latched: bool,
        sensor_health_pct: f64,
        uptime_s: u64,
        shutdown: bool,
    ) -> OutboundMessage {
        let mut payload = json!({
            "mode": mode,
            "pump_on": pump_on,
            "heater_on": heater_on,
            "emergency_latched": emergency_latched,
            "sensor_health_pct": sensor_health_pct,
            "uptime_s": uptime_s,
        });
        if shutdown {
            payload["shutdown"] = json!(true);
        }
        OutboundMessage {
            topic: self.topic("status/system"),
            payload: payload.to_string(),
            retained: true,
        }
    }

    pub fn pump_status(&self, heater: bool, on: bool, wall: i64, reason: &str) -> OutboundMessage {
        let suffix = if heater { "status/pump/heater" } else { "status/pump/primary" };
        OutboundMessage {
            topic: self.topic(suffix),
            payload: json!({ "on": on, "wall": wall, "reason": reason }).to_string(),
            retained: true,
        }
    }

    pub fn heartbeat(&self, heartbeat: &Heartbeat) -> OutboundMessage {
        OutboundMessage {
            topic: self.heartbeat_topic(),
            payload: serde_json::to_string(heartbeat).unwrap_or_default(),
            retained: false,
        }
    }

    /// Throttled alert; `None` when this kind fired within the last five
    /// minutes.
    pub fn alert(
        &mut self,
        kind: &str,
        severity: AlertSeverity,
        wall: i64,
        detail: &str,
    ) -> Option<OutboundMessage> {
        if !self.throttle.allow(kind, wall) {
            return None;
        }
        Some(OutboundMessage {
            topic: self.alert_topic(kind),
            payload: json!({
                "kind": kind,
                "severity": severity,
                "wall": wall,
                "detail": detail,
            })
            .to_string(),
            retained: false,
        })
    }

    // ── Discovery ───────────────────────────────────────────────────────────

    /// Home Assistant discovery documents: one sensor per temperature
    /// channel, the principal derived entities, and the two relays. Published
    /// retained, once at startup.
    pub fn discovery_messages(&self, channels: &[Channel]) -> Vec<OutboundMessage> {
        let device = json!({
            "identifiers": ["solar_heating_controller"],
            "name": "Solar Heating Controller",
        });
        let mut out = Vec::new();

        for ch in channels {
            out.push(OutboundMessage {
                topic: format!(
                    "{}/sensor/solar_heating/{}/config",
                    self.discovery_prefix, ch.id
                ),
                payload: json!({
                    "name": format!("Solar heating {}", ch.id.replace('_', " ")),
                    "unique_id": format!("solar_heating_{}", ch.id),
                    "state_topic": self.topic(&format!("temperature/{}", ch.id)),
                    "value_template": "{{ value_json.value_c }}",
                    "unit_of_measurement": "°C",
                    "device_class": "temperature",
                    "availability_topic": self.availability_topic(),
                    "device": device.clone(),
                })
                .to_string(),
                retained: true,
            });
        }

        for (field, unit, device_class) in [
            ("stored_energy_kwh", "kWh", Some("energy")),
            ("tank_mean_c", "°C", Some("temperature")),
            ("hx_efficiency_pct", "%", None),
            ("energy_rate_kw", "kW", Some("power")),
            ("sensor_health_pct", "%", None),
        ] {
            let mut payload = json!({
                "name": format!("Solar heating {}", field.replace('_', " ")),
                "unique_id": format!("solar_heating_{}", field),
                "state_topic": self.topic(&format!("derived/{}", field)),
                "value_template": "{{ value_json.value }}",
                "unit_of_measurement": unit,
                "availability_topic": self.availability_topic(),
                "device": device.clone(),
            });
            if let Some(class) = device_class {
                payload["device_class"] = json!(class);
            }
            out.push(OutboundMessage {
                topic: format!(
                    "{}/sensor/solar_heating/{}/config",
                    self.discovery_prefix, field
                ),
                payload: payload.to_string(),
                retained: true,
            });
        }

        for (key, suffix) in [("pump", "status/pump/primary"), ("heater", "status/pump/heater")] {
            out.push(OutboundMessage {
                topic: format!(
                    "{}/binary_sensor/solar_heating/{}/config",
                    self.discovery_prefix, key
                ),
                payload: json!({
                    "name": format!("Solar heating {}", key),
                    "unique_id": format!("solar_heating_{}", key),
                    "state_topic": self.topic(suffix),
                    "value_template": "{{ 'ON' if value_json.on else 'OFF' }}",
                    "availability_topic": self.availability_topic(),
                    "device": device.clone(),
                })
                .to_string(),
                retained: true,
            });
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;

    use crate::models::telemetry::Reading;

    fn publisher() -> Publisher {
        Publisher::new("solar_heating_v3/", "homeassistant/")
    }

    fn heartbeat() -> Heartbeat {
        Heartbeat {
            alive: true,
            wall: 1_717_000_000,
            uptime_s: 120,
            mode: Mode::Auto,
            pump_on: false,
            heater_on: false,
            sensor_count: 14,
            last_frame_age_s: 0,
            emergency_latched: false,
        }
    }

    #[test]
    fn temperatures_are_retained_with_status() {
        let mut readings = StdHashMap::new();
        readings.insert("collector".to_string(), Reading::ok(61.25));
        let frame = ReadingFrame { t_mono_ns: 0, wall: 1000, readings };

        let msgs = publisher().frame_messages(&frame);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].topic, "solar_heating_v3/temperature/collector");
        assert!(msgs[0].retained, "readings must be retained for late subscribers");
        let v: serde_json::Value = serde_json::from_str(&msgs[0].payload).unwrap();
        assert_eq!(v["value_c"], 61.25);
        assert_eq!(v["status"], "ok");
        assert_eq!(v["wall"], 1000);
    }

    #[test]
    fn derived_fields_each_get_a_topic_with_unit() {
        let msgs = publisher().derived_messages(&Derived::default(), 5);
        assert_eq!(msgs.len(), 11, "every derived field is published");
        assert!(msgs.iter().all(|m| m.retained));
        let energy = msgs
            .iter()
            .find(|m| m.topic == "solar_heating_v3/derived/stored_energy_kwh")
            .expect("stored energy topic");
        let v: serde_json::Value = serde_json::from_str(&energy.payload).unwrap();
        assert_eq!(v["unit"], "kWh");
        assert!(v["value"].is_null(), "an absent derivation publishes an explicit null");
    }

    #[test]
    fn heartbeat_is_not_retained_and_keeps_its_schema() {
        let msg = publisher().heartbeat(&heartbeat());
        assert_eq!(msg.topic, "solar_heating_v3/heartbeat");
        assert!(!msg.retained, "heartbeat absence must be observable");
        let v: serde_json::Value = serde_json::from_str(&msg.payload).unwrap();
        for key in [
            "alive",
            "wall",
            "uptime_s",
            "mode",
            "pump_on",
            "heater_on",
            "sensor_count",
            "last_frame_age_s",
            "emergency_latched",
        ] {
            assert!(v.get(key).is_some(), "heartbeat contract field '{}' missing", key);
        }
    }

    #[test]
    fn alerts_throttle_per_kind() {
        let mut p = publisher();
        assert!(p.alert("OVERHEAT", AlertSeverity::Critical, 1000, "x").is_some());
        assert!(
            p.alert("OVERHEAT", AlertSeverity::Critical, 1100, "x").is_none(),
            "same kind within five minutes is dropped"
        );
        assert!(
            p.alert("SENSOR_FAULT", AlertSeverity::Warning, 1100, "y").is_some(),
            "a different kind is not affected"
        );
        assert!(p.alert("OVERHEAT", AlertSeverity::Critical, 1300 + 300, "x").is_some());
    }

    #[test]
    fn shutdown_flag_only_appears_on_shutdown() {
        let p = publisher();
        let running = p.system_status(Mode::Auto, true, false, false, 100.0, 10, false);
        let v: serde_json::Value = serde_json::from_str(&running.payload).unwrap();
        assert!(v.get("shutdown").is_none());

        let last = p.system_status(Mode::Auto, false, false, false, 100.0, 10, true);
        let v: serde_json::Value = serde_json::from_str(&last.payload).unwrap();
        assert_eq!(v["shutdown"], true);
    }

    #[test]
    fn discovery_covers_channels_derived_and_relays() {
        let channels = crate::config::Config::default().channels;
        let msgs = publisher().discovery_messages(&channels);
        assert_eq!(msgs.len(), channels.len() + 5 + 2);
        assert!(msgs.iter().all(|m| m.retained));
        assert!(msgs.iter().all(|m| m.topic.starts_with("homeassistant/")));
    }

    #[test]
    fn prefix_stripping_matches_only_our_namespace() {
        let p = publisher();
        assert_eq!(p.strip_prefix("solar_heating_v3/control/mode"), Some("control/mode"));
        assert_eq!(p.strip_prefix("other/control/mode"), None);
    }

    #[test]
    fn qos_policy_follows_topic_class() {
        let p = publisher();
        assert!(p.availability(true).wants_ack());
        assert!(!p.heartbeat(&heartbeat()).wants_ack());
    }
}
