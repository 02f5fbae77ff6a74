use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::models::command::Mode;

// ─── Channels ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Rtd,
    Analog,
}

/// The role a channel plays in the installation. Determines which control
/// signal and which derivation a reading feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelRole {
    /// Solar collector outlet temperature.
    Collector,
    /// Stratification sensor, 0 = tank bottom, highest index = tank top.
    TankLevel(u8),
    /// Solar loop return line.
    ReturnLine,
    /// Ventilation heat exchanger: air leaving the building.
    ExhaustAir,
    /// Ventilation heat exchanger: air delivered to the building.
    SupplyAir,
    /// Ventilation heat exchanger: fresh outdoor intake.
    OutdoorAir,
    /// Ventilation heat exchanger: air extracted from rooms.
    ExtractAir,
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelRole::Collector => write!(f, "collector"),
            ChannelRole::TankLevel(n) => write!(f, "tank_level_{}", n),
            ChannelRole::ReturnLine => write!(f, "return_line"),
            ChannelRole::ExhaustAir => write!(f, "exhaust_air"),
            ChannelRole::SupplyAir => write!(f, "supply_air"),
            ChannelRole::OutdoorAir => write!(f, "outdoor_air"),
            ChannelRole::ExtractAir => write!(f, "extract_air"),
        }
    }
}

impl FromStr for ChannelRole {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "collector" => Ok(ChannelRole::Collector),
            // The bottom stratification sensor doubles as the cold control
            // sensor, so both spellings are accepted.
            "tank_bottom" => Ok(ChannelRole::TankLevel(0)),
            "return_line" => Ok(ChannelRole::ReturnLine),
            "exhaust_air" => Ok(ChannelRole::ExhaustAir),
            "supply_air" => Ok(ChannelRole::SupplyAir),
            "outdoor_air" => Ok(ChannelRole::OutdoorAir),
            "extract_air" => Ok(ChannelRole::ExtractAir),
            other => match other.strip_prefix("tank_level_") {
                Some(n) => n
                    .parse::<u8>()
                    .map(ChannelRole::TankLevel)
                    .map_err(|_| format!("bad tank level in role '{}'", other)),
                None => Err(format!("unknown channel role '{}'", other)),
            },
        }
    }
}

impl Serialize for ChannelRole {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ChannelRole {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

fn default_scale() -> f64 { 1.0 }

/// One configured temperature channel. Immutable after startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: String,
    pub kind: ChannelKind,
    /// Calibration offset added after scaling (°C).
    #[serde(default)]
    pub offset_c: f64,
    /// Calibration scale applied to the raw value.
    #[serde(default = "default_scale")]
    pub scale: f64,
    pub role: ChannelRole,
}

// ─── Reading frames ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingStatus {
    Ok,
    /// The read was abandoned but a recent good value is carried forward.
    /// Usable for display, never for control decisions.
    Stale,
    Error,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Reading {
    pub value_c: Option<f64>,
    pub status: ReadingStatus,
}

impl Reading {
    pub fn ok(value_c: f64) -> Self {
        Self { value_c: Some(value_c), status: ReadingStatus::Ok }
    }

    pub fn stale(value_c: f64) -> Self {
        Self { value_c: Some(value_c), status: ReadingStatus::Stale }
    }

    pub fn error() -> Self {
        Self { value_c: None, status: ReadingStatus::Error }
    }
}

/// One sampling pass over every configured channel. Invariant: every
/// configured channel appears exactly once, failed reads included.
#[derive(Debug, Clone)]
pub struct ReadingFrame {
    /// Monotonic timestamp, nanoseconds since engine start.
    pub t_mono_ns: u64,
    /// Wall clock, seconds since epoch.
    pub wall: i64,
    pub readings: HashMap<String, Reading>,
}

impl ReadingFrame {
    /// Reading for the first channel carrying `role`, if configured.
    pub fn reading_for(&self, channels: &[Channel], role: ChannelRole) -> Option<&Reading> {
        channels
            .iter()
            .find(|c| c.role == role)
            .and_then(|c| self.readings.get(&c.id))
    }

    /// Value for `role`, only when the reading is `Ok`.
    pub fn ok_value(&self, channels: &[Channel], role: ChannelRole) -> Option<f64> {
        self.reading_for(channels, role)
            .filter(|r| r.status == ReadingStatus::Ok)
            .and_then(|r| r.value_c)
    }

    /// Tank level values ordered bottom to top; `None` for unreadable levels.
    pub fn tank_levels(&self, channels: &[Channel]) -> Vec<Option<f64>> {
        let mut levels: Vec<(u8, Option<f64>)> = channels
            .iter()
            .filter_map(|c| match c.role {
                ChannelRole::TankLevel(n) => Some((n, self.ok_value(channels, c.role))),
                _ => None,
            })
            .collect();
        levels.sort_by_key(|(n, _)| *n);
        levels.into_iter().map(|(_, v)| v).collect()
    }

    pub fn tank_bottom_c(&self, channels: &[Channel]) -> Option<f64> {
        self.ok_value(channels, ChannelRole::TankLevel(0))
    }

    pub fn tank_top_c(&self, channels: &[Channel]) -> Option<f64> {
        let top = channels
            .iter()
            .filter_map(|c| match c.role {
                ChannelRole::TankLevel(n) => Some(n),
                _ => None,
            })
            .max()?;
        self.ok_value(channels, ChannelRole::TankLevel(top))
    }

    pub fn ok_count(&self) -> usize {
        self.readings
            .values()
            .filter(|r| r.status == ReadingStatus::Ok)
            .count()
    }
}

// ─── Derived values ──────────────────────────────────────────────────────────

/// Quantities computed from one or more recent frames. Pure data: every field
/// is either a finite number or explicitly absent.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Derived {
    /// Collector minus tank bottom (°C) — the primary control signal.
    pub collector_dt_c: Option<f64>,
    /// Energy stored in the whole tank relative to the cold-in reference (kWh).
    pub stored_energy_kwh: Option<f64>,
    /// Upper-half / lower-half split of the stored energy (kWh).
    pub stored_energy_top_kwh: Option<f64>,
    pub stored_energy_bottom_kwh: Option<f64>,
    /// Mean of the readable stratification sensors (°C).
    pub tank_mean_c: Option<f64>,
    /// Mean absolute adjacent-level gradient (°C/cm).
    pub stratification_c_per_cm: Option<f64>,
    /// Ventilation heat-exchanger efficiency (%), null when the outdoor /
    /// extract spread is too small to divide by.
    pub hx_efficiency_pct: Option<f64>,
    /// Rolling stored-energy slope (kW).
    pub energy_rate_kw: f64,
    /// Rolling tank-mean slope (°C/h).
    pub temp_rate_c_per_h: f64,
    /// Fraction of configured channels reporting ok on this frame (%).
    pub sensor_health_pct: f64,
    /// 0 % at the safe threshold, 100 % at the risk ceiling, linear between.
    pub overheating_risk_pct: Option<f64>,
}

// ─── Heartbeat ───────────────────────────────────────────────────────────────

/// Emitted on every tick, non-retained. The schema is an external contract
/// for uptime probes — field renames are breaking changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    pub alive: bool,
    pub wall: i64,
    pub uptime_s: u64,
    pub mode: Mode,
    pub pump_on: bool,
    pub heater_on: bool,
    pub sensor_count: usize,
    pub last_frame_age_s: u64,
    pub emergency_latched: bool,
}
