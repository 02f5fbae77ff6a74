/// Durable operational counters
///
/// One JSON document holds everything the controller must remember across
/// restarts: lifetime counters, the daily accumulators with their midnight
/// roll, the operating mode, manual overrides, and the emergency latch.
/// Writes are atomic (temp file + rename) so a crash mid-write leaves the
/// previous document intact.
use std::path::PathBuf;
use std::time::Duration;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::models::command::{ManualOverride, Mode};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to serialize operational state: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("failed to write {path}: {reason}")]
    Write { path: String, reason: String },
    #[error("state write exceeded its deadline")]
    Deadline,
}

/// Yesterday's totals, kept so the dashboard can show the completed day
/// after the accumulators reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DayRollup {
    pub date: NaiveDate,
    pub energy_collected_kwh: f64,
    pub solar_energy_kwh: f64,
    pub pump_runtime_s: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationalState {
    pub pump_runtime_s: u64,
    pub heating_cycles: u64,
    pub last_pump_start: Option<i64>,
    pub last_cycle_duration_s: u64,
    pub energy_collected_today_kwh: f64,
    pub solar_energy_today_kwh: f64,
    pub pump_runtime_today_s: u64,
    pub day_marker: NaiveDate,
    pub mode: Mode,
    pub manual_override: ManualOverride,
    pub emergency_latched: bool,
    #[serde(default)]
    pub last_day: Option<DayRollup>,
    /// Fields written by newer versions survive a load/save cycle here.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl OperationalState {
    pub fn new(today: NaiveDate, mode: Mode) -> Self {
        Self {
            pump_runtime_s: 0,
            heating_cycles: 0,
            last_pump_start: None,
            last_cycle_duration_s: 0,
            energy_collected_today_kwh: 0.0,
            solar_energy_today_kwh: 0.0,
            pump_runtime_today_s: 0,
            day_marker: today,
            mode,
            manual_override: ManualOverride::default(),
            emergency_latched: false,
            last_day: None,
            extra: serde_json::Map::new(),
        }
    }

    /// Advance the runtime and energy accumulators by one tick.
    /// `energy_rate_kw` integrates into the collected counter always and into
    /// the solar counter only while the pump runs; negative rates (a cooling
    /// tank) are not "collected" and are skipped.
    pub fn tick_update(&mut self, pump_on: bool, energy_rate_kw: f64, dt_s: u64) {
        let gained_kwh = energy_rate_kw.max(0.0) * dt_s as f64 / 3600.0;
        self.energy_collected_today_kwh += gained_kwh;
        if pump_on {
            self.pump_runtime_s += dt_s;
            self.pump_runtime_today_s += dt_s;
            self.solar_energy_today_kwh += gained_kwh;
        }
    }

    /// Roll the daily accumulators when the local date has advanced. Returns
    /// true when a roll happened. Calling it again the same day is a no-op,
    /// which also makes the reset idempotent across restarts.
    pub fn roll_midnight_if_needed(&mut self, today: NaiveDate) -> bool {
        if today <= self.day_marker {
            return false;
        }
        info!(
            day = %self.day_marker,
            energy_collected_kwh = format!("{:.2}", self.energy_collected_today_kwh),
            solar_kwh = format!("{:.2}", self.solar_energy_today_kwh),
            "rolling daily counters at midnight"
        );
        self.last_day = Some(DayRollup {
            date: self.day_marker,
            energy_collected_kwh: self.energy_collected_today_kwh,
            solar_energy_kwh: self.solar_energy_today_kwh,
            pump_runtime_s: self.pump_runtime_today_s,
        });
        self.energy_collected_today_kwh = 0.0;
        self.solar_energy_today_kwh = 0.0;
        self.pump_runtime_today_s = 0;
        self.day_marker = today;
        true
    }
}

// ─── Persistence ─────────────────────────────────────────────────────────────

/// Deadline for the blocking write; expiry fails the save, never the tick.
const WRITE_DEADLINE: Duration = Duration::from_secs(2);

pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Load the persisted record. A missing or unreadable file is a normal
    /// first-boot condition, not an error: defaults are returned and noted at
    /// info level.
    pub fn load(&self, today: NaiveDate, default_mode: Mode) -> OperationalState {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => match serde_json::from_str(&content) {
                Ok(state) => state,
                Err(e) => {
                    info!(
                        path = %self.path.display(),
                        error = %e,
                        "state file unreadable, starting from defaults"
                    );
                    OperationalState::new(today, default_mode)
                }
            },
            Err(_) => {
                info!(path = %self.path.display(), "no state file, starting from defaults");
                OperationalState::new(today, default_mode)
            }
        }
    }

    /// Atomic write: serialize, write a sibling temp file, rename over the
    /// target.
    pub async fn save(&self, state: &OperationalState) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(state)?;
        let path = self.path.clone();
        let write = tokio::task::spawn_blocking(move || {
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, json.as_bytes()).map_err(|e| StoreError::Write {
                path: tmp.display().to_string(),
                reason: e.to_string(),
            })?;
            std::fs::rename(&tmp, &path).map_err(|e| StoreError::Write {
                path: path.display().to_string(),
                reason: e.to_string(),
            })
        });
        match tokio::time::timeout(WRITE_DEADLINE, write).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => Err(StoreError::Write {
                path: self.path.display().to_string(),
                reason: join_err.to_string(),
            }),
            Err(_) => Err(StoreError::Deadline),
        }
    }
}
