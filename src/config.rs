use std::path::Path;

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::models::command::{Mode, ParamChange, RateSmoothing, RateWindow};
use crate::models::telemetry::{Channel, ChannelKind, ChannelRole};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read { path: String, source: std::io::Error },
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("environment override {var}={value} is not valid: {reason}")]
    Env { var: String, value: String, reason: String },
    #[error("invalid configuration: {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid { key, reason: reason.into() }
}

// ─── Defaults ────────────────────────────────────────────────────────────────

fn default_sample_period_s() -> u64 { 30 }
fn default_bus_host() -> String { "localhost".to_string() }
fn default_bus_port() -> u16 { 1883 }
fn default_topic_prefix() -> String { "solar_heating_v3/".to_string() }
fn default_discovery_prefix() -> String { "homeassistant/".to_string() }
fn default_volume_l() -> f64 { 360.0 }
fn default_levels() -> usize { 8 }
fn default_level_height_cm() -> f64 { 20.0 }
fn default_t_cold_in_c() -> f64 { 4.0 }
fn default_dt_start() -> f64 { 8.0 }
fn default_dt_stop() -> f64 { 4.0 }
fn default_tank_target_c() -> f64 { 70.0 }
fn default_collector_cooling_c() -> f64 { 90.0 }
fn default_boiling_c() -> f64 { 150.0 }
fn default_temp_high_warn_c() -> f64 { 85.0 }
fn default_temp_low_warn_c() -> f64 { 45.0 }
fn default_hysteresis_c() -> f64 { 5.0 }
fn default_eco_dt_start() -> f64 { 10.0 }
fn default_eco_dt_stop() -> f64 { 6.0 }
fn default_eco_tank_target_c() -> f64 { 60.0 }
fn default_ema_alpha() -> f64 { 0.3 }
fn default_safe_threshold_c() -> f64 { 90.0 }
fn default_risk_ceiling_c() -> f64 { 170.0 }
fn default_storage_path() -> String { "./operational_state.json".to_string() }
fn default_persist_every_s() -> u64 { 60 }
fn default_watchdog_enabled() -> bool { true }
fn default_check_period_s() -> u64 { 30 }
fn default_stale_after_s() -> u64 { 60 }
fn default_max_health_age_s() -> u64 { 86_400 }

// ─── Sections ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    pub sample_period_s: u64,
    pub simulation: bool,
    pub bus: BusConfig,
    pub tank: TankConfig,
    pub control: ControlConfig,
    pub rate: RateConfig,
    pub derived: DerivedConfig,
    pub storage: StorageConfig,
    pub watchdog: WatchdogConfig,
    pub advisor: AdvisorConfig,
    pub channels: Vec<Channel>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_period_s: default_sample_period_s(),
            simulation: false,
            bus: BusConfig::default(),
            tank: TankConfig::default(),
            control: ControlConfig::default(),
            rate: RateConfig::default(),
            derived: DerivedConfig::default(),
            storage: StorageConfig::default(),
            watchdog: WatchdogConfig::default(),
            advisor: AdvisorConfig::default(),
            channels: default_channels(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub topic_prefix: String,
    pub discovery_prefix: String,
    pub client_id: Option<String>,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: default_bus_host(),
            port: default_bus_port(),
            user: None,
            pass: None,
            topic_prefix: default_topic_prefix(),
            discovery_prefix: default_discovery_prefix(),
            client_id: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TankConfig {
    pub volume_l: f64,
    pub levels: usize,
    /// Uniform vertical sensor spacing shorthand (cm).
    pub level_height_cm: f64,
    /// Per-gap spacing list; wins over the shorthand when present.
    pub level_heights_cm: Option<Vec<f64>>,
    pub t_cold_in_c: f64,
}

impl Default for TankConfig {
    fn default() -> Self {
        Self {
            volume_l: default_volume_l(),
            levels: default_levels(),
            level_height_cm: default_level_height_cm(),
            level_heights_cm: None,
            t_cold_in_c: default_t_cold_in_c(),
        }
    }
}

impl TankConfig {
    /// Vertical spacing between each adjacent sensor pair, expanded from
    /// either the explicit list or the uniform shorthand.
    pub fn gap_heights_cm(&self) -> Vec<f64> {
        let gaps = self.levels.saturating_sub(1);
        match &self.level_heights_cm {
            Some(list) => list.clone(),
            None => vec![self.level_height_cm; gaps],
        }
    }

    pub fn mass_kg(&self) -> f64 {
        // rho_w ~ 1 kg/L
        self.volume_l
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ControlConfig {
    #[serde(rename = "dT_start")]
    pub dt_start: f64,
    #[serde(rename = "dT_stop")]
    pub dt_stop: f64,
    pub tank_target_c: f64,
    pub collector_cooling_c: f64,
    pub boiling_c: f64,
    pub temp_high_warn_c: f64,
    pub temp_low_warn_c: f64,
    pub mode: Mode,
    pub hysteresis_c: f64,
    /// Cartridge-heater floor; `null` disables the heater entirely in auto.
    pub heater_minimum_c: Option<f64>,
    pub eco_dt_start: f64,
    pub eco_dt_stop: f64,
    pub eco_tank_target_c: f64,
    /// When true the heater floor also applies in eco mode.
    pub eco_heater_floor: bool,
    pub preserve_manual_on_shutdown: bool,
    pub test_mode: bool,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            dt_start: default_dt_start(),
            dt_stop: default_dt_stop(),
            tank_target_c: default_tank_target_c(),
            collector_cooling_c: default_collector_cooling_c(),
            boiling_c: default_boiling_c(),
            temp_high_warn_c: default_temp_high_warn_c(),
            temp_low_warn_c: default_temp_low_warn_c(),
            mode: Mode::Auto,
            hysteresis_c: default_hysteresis_c(),
            heater_minimum_c: None,
            eco_dt_start: default_eco_dt_start(),
            eco_dt_stop: default_eco_dt_stop(),
            eco_tank_target_c: default_eco_tank_target_c(),
            eco_heater_floor: false,
            preserve_manual_on_shutdown: false,
            test_mode: false,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RateConfig {
    pub window: RateWindow,
    pub smoothing: RateSmoothing,
    pub ema_alpha: f64,
}

impl Default for RateConfig {
    fn default() -> Self {
        Self {
            window: RateWindow::Medium,
            smoothing: RateSmoothing::Ema,
            ema_alpha: default_ema_alpha(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DerivedConfig {
    pub safe_threshold_c: f64,
    pub risk_ceiling_c: f64,
}

impl Default for DerivedConfig {
    fn default() -> Self {
        Self {
            safe_threshold_c: default_safe_threshold_c(),
            risk_ceiling_c: default_risk_ceiling_c(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub path: String,
    pub persist_every_s: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
            persist_every_s: default_persist_every_s(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WatchdogConfig {
    pub enabled: bool,
    /// `host:port` pairs probed for network reachability.
    pub ping_hosts: Vec<String>,
    pub check_period_s: u64,
    pub stale_after_s: u64,
    /// Service-manager unit to query for process liveness.
    pub service_name: Option<String>,
    pub allow_restart: bool,
    pub max_health_age_s: u64,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            enabled: default_watchdog_enabled(),
            ping_hosts: Vec::new(),
            check_period_s: default_check_period_s(),
            stale_after_s: default_stale_after_s(),
            service_name: None,
            allow_restart: false,
            max_health_age_s: default_max_health_age_s(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AdvisorConfig {
    /// External task-service endpoint; `null` selects the built-in fallback.
    pub url: Option<String>,
}

// ─── Default channel topology ────────────────────────────────────────────────

fn default_channels() -> Vec<Channel> {
    let mut out = vec![Channel {
        id: "collector".into(),
        kind: ChannelKind::Rtd,
        offset_c: 0.0,
        scale: 1.0,
        role: ChannelRole::Collector,
    }];
    for n in 0..8u8 {
        out.push(Channel {
            id: format!("tank_level_{}", n),
            kind: ChannelKind::Rtd,
            offset_c: 0.0,
            scale: 1.0,
            role: ChannelRole::TankLevel(n),
        });
    }
    out.push(Channel {
        id: "return_line".into(),
        kind: ChannelKind::Rtd,
        offset_c: 0.0,
        scale: 1.0,
        role: ChannelRole::ReturnLine,
    });
    for (id, role) in [
        ("exhaust_air", ChannelRole::ExhaustAir),
        ("supply_air", ChannelRole::SupplyAir),
        ("outdoor_air", ChannelRole::OutdoorAir),
        ("extract_air", ChannelRole::ExtractAir),
    ] {
        out.push(Channel {
            id: id.into(),
            kind: ChannelKind::Analog,
            offset_c: 0.0,
            scale: 1.0,
            role,
        });
    }
    out
}

// ─── Load / validate ─────────────────────────────────────────────────────────

impl Config {
    /// Load from `path`, apply environment overrides, and validate. A missing
    /// file yields the defaults (fully simulated setups run with no file at
    /// all); a present but malformed file is fatal.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let mut config = if Path::new(path).exists() {
            let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_string(),
                source,
            })?;
            serde_json::from_str(&content)?
        } else {
            info!(path, "no config file found, using defaults");
            Config::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        fn parsed<T: std::str::FromStr>(var: &str, value: String) -> Result<T, ConfigError> {
            value.parse().map_err(|_| ConfigError::Env {
                var: var.to_string(),
                value,
                reason: format!("expected a {}", std::any::type_name::<T>()),
            })
        }

        if let Ok(v) = std::env::var("BUS_HOST") {
            self.bus.host = v;
        }
        if let Ok(v) = std::env::var("BUS_PORT") {
            self.bus.port = parsed("BUS_PORT", v)?;
        }
        if let Ok(v) = std::env::var("BUS_USER") {
            self.bus.user = Some(v);
        }
        if let Ok(v) = std::env::var("BUS_PASS") {
            self.bus.pass = Some(v);
        }
        if let Ok(v) = std::env::var("SAMPLE_PERIOD_S") {
            self.sample_period_s = parsed("SAMPLE_PERIOD_S", v)?;
        }
        if let Ok(v) = std::env::var("SIMULATION") {
            self.simulation = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("STORAGE_PATH") {
            self.storage.path = v;
        }
        Ok(())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_period_s < 1 {
            return Err(invalid("sample_period_s", "must be at least 1 second"));
        }
        let c = &self.control;
        if c.dt_stop >= c.dt_start {
            return Err(invalid(
                "control.dT_stop",
                format!("must be below dT_start ({} >= {})", c.dt_stop, c.dt_start),
            ));
        }
        if c.eco_dt_stop >= c.eco_dt_start {
            return Err(invalid("control.eco_dt_stop", "must be below eco_dt_start"));
        }
        let ladder = [
            ("control.temp_low_warn_c", c.temp_low_warn_c),
            ("control.tank_target_c", c.tank_target_c),
            ("control.temp_high_warn_c", c.temp_high_warn_c),
            ("control.collector_cooling_c", c.collector_cooling_c),
            ("control.boiling_c", c.boiling_c),
        ];
        for pair in ladder.windows(2) {
            if pair[0].1 >= pair[1].1 {
                return Err(invalid(
                    pair[0].0,
                    format!("must be below {} ({} >= {})", pair[1].0, pair[0].1, pair[1].1),
                ));
            }
        }
        if !(self.rate.ema_alpha > 0.0 && self.rate.ema_alpha < 1.0) {
            return Err(invalid("rate.ema_alpha", "must lie strictly between 0 and 1"));
        }
        if self.tank.levels < 2 {
            return Err(invalid("tank.levels", "need at least two stratification sensors"));
        }
        if let Some(list) = &self.tank.level_heights_cm {
            if list.len() != self.tank.levels - 1 {
                return Err(invalid(
                    "tank.level_heights_cm",
                    format!("expected {} gap entries, got {}", self.tank.levels - 1, list.len()),
                ));
            }
        }
        if self.derived.safe_threshold_c >= self.derived.risk_ceiling_c {
            return Err(invalid("derived.safe_threshold_c", "must be below risk_ceiling_c"));
        }

        let mut seen = std::collections::HashSet::new();
        for ch in &self.channels {
            if !seen.insert(ch.id.as_str()) {
                return Err(invalid("channels", format!("duplicate channel id '{}'", ch.id)));
            }
        }
        let has_role = |r: ChannelRole| self.channels.iter().any(|c| c.role == r);
        if !has_role(ChannelRole::Collector) {
            return Err(invalid("channels", "a collector channel is required"));
        }
        if !has_role(ChannelRole::TankLevel(0)) {
            return Err(invalid("channels", "a tank_level_0 (tank bottom) channel is required"));
        }
        Ok(())
    }

    /// The runtime control parameters, mutable afterwards only through the
    /// command queue.
    pub fn control_params(&self) -> ControlParams {
        ControlParams {
            dt_start: self.control.dt_start,
            dt_stop: self.control.dt_stop,
            tank_target_c: self.control.tank_target_c,
            collector_cooling_c: self.control.collector_cooling_c,
            boiling_c: self.control.boiling_c,
            temp_high_warn_c: self.control.temp_high_warn_c,
            temp_low_warn_c: self.control.temp_low_warn_c,
            hysteresis_c: self.control.hysteresis_c,
            heater_minimum_c: self.control.heater_minimum_c,
            eco_dt_start: self.control.eco_dt_start,
            eco_dt_stop: self.control.eco_dt_stop,
            eco_tank_target_c: self.control.eco_tank_target_c,
            eco_heater_floor: self.control.eco_heater_floor,
            sample_period_s: self.sample_period_s,
            rate_window: self.rate.window,
            rate_smoothing: self.rate.smoothing,
            ema_alpha: self.rate.ema_alpha,
            mode: self.control.mode,
        }
    }
}

// ─── Runtime control parameters ──────────────────────────────────────────────

/// The mutable slice of configuration the dashboard may change at runtime.
/// Owned by the tick task; updated only while draining the command queue.
#[derive(Debug, Clone)]
pub struct ControlParams {
    pub dt_start: f64,
    pub dt_stop: f64,
    pub tank_target_c: f64,
    pub collector_cooling_c: f64,
    pub boiling_c: f64,
    pub temp_high_warn_c: f64,
    pub temp_low_warn_c: f64,
    pub hysteresis_c: f64,
    pub heater_minimum_c: Option<f64>,
    pub eco_dt_start: f64,
    pub eco_dt_stop: f64,
    pub eco_tank_target_c: f64,
    pub eco_heater_floor: bool,
    pub sample_period_s: u64,
    pub rate_window: RateWindow,
    pub rate_smoothing: RateSmoothing,
    pub ema_alpha: f64,
    pub mode: Mode,
}

impl ControlParams {
    /// dT threshold pair for the active mode (eco widens the gap).
    pub fn active_dt(&self) -> (f64, f64) {
        match self.mode {
            Mode::Eco => (self.eco_dt_start, self.eco_dt_stop),
            _ => (self.dt_start, self.dt_stop),
        }
    }

    pub fn active_tank_target_c(&self) -> f64 {
        match self.mode {
            Mode::Eco => self.eco_tank_target_c,
            _ => self.tank_target_c,
        }
    }

    /// Heater floor for the active mode; `None` means the heater stays off.
    pub fn active_heater_floor(&self) -> Option<f64> {
        match self.mode {
            Mode::Auto => self.heater_minimum_c,
            Mode::Eco if self.eco_heater_floor => self.heater_minimum_c,
            _ => None,
        }
    }

    pub fn apply(&mut self, change: ParamChange) {
        match change {
            ParamChange::DtStart(v) => self.dt_start = v,
            ParamChange::DtStop(v) => self.dt_stop = v,
            ParamChange::TankTargetC(v) => self.tank_target_c = v,
            ParamChange::RateWindow(w) => self.rate_window = w,
            ParamChange::RateSmoothing(s) => self.rate_smoothing = s,
            ParamChange::EmaAlpha(a) => self.ema_alpha = a,
        }
    }
}
