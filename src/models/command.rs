use serde::{Deserialize, Serialize};

// ─── Operating mode ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Auto,
    Manual,
    Eco,
}

impl Mode {
    pub fn parse(s: &str) -> Option<Mode> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Some(Mode::Auto),
            "manual" => Some(Mode::Manual),
            "eco" => Some(Mode::Eco),
            _ => None,
        }
    }
}

// ─── Rate configuration (command-settable) ───────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateWindow {
    Fast,
    #[default]
    Medium,
    Slow,
}

impl RateWindow {
    pub fn seconds(self) -> i64 {
        match self {
            RateWindow::Fast => 30,
            RateWindow::Medium => 120,
            RateWindow::Slow => 300,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fast" => Some(RateWindow::Fast),
            "medium" => Some(RateWindow::Medium),
            "slow" => Some(RateWindow::Slow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RateSmoothing {
    Raw,
    Sma,
    #[default]
    Ema,
}

impl RateSmoothing {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "raw" => Some(RateSmoothing::Raw),
            "sma" => Some(RateSmoothing::Sma),
            "ema" => Some(RateSmoothing::Ema),
            _ => None,
        }
    }
}

// ─── Relays ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RelayId {
    Pump,
    Heater,
}

/// Desired relay state, originated by the controller and applied by the
/// engine loop through the hardware capability.
#[derive(Debug, Clone)]
pub struct RelayCommand {
    pub id: RelayId,
    pub desired: bool,
    pub reason: String,
}

// ─── Inbound commands ────────────────────────────────────────────────────────

/// A validated parameter change. Only names on the allowlist ever become one
/// of these; range checks happen at parse time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ParamChange {
    DtStart(f64),
    DtStop(f64),
    TankTargetC(f64),
    RateWindow(RateWindow),
    RateSmoothing(RateSmoothing),
    EmaAlpha(f64),
}

#[derive(Debug, Clone, PartialEq)]
pub enum InboundCommand {
    SetMode(Mode),
    SetManualRelay(RelayId, bool),
    SetParam(ParamChange),
    ClearEmergency,
    Ping,
}

impl InboundCommand {
    /// Safety commands survive queue overflow; everything else may be evicted.
    pub fn is_safety(&self) -> bool {
        matches!(self, InboundCommand::ClearEmergency)
    }
}

// ─── Manual override ─────────────────────────────────────────────────────────

/// Operator-requested relay states, only honored in manual mode. `None`
/// means "not requested", which reads as off.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManualOverride {
    pub pump: Option<bool>,
    pub heater: Option<bool>,
}

// ─── Controller transition events ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventReason {
    DtStart,
    DtStop,
    TargetReached,
    CollectorCoolingIn,
    CollectorCoolingOut,
    Overheat,
    ClearEmergency,
    Manual,
    AutoResume,
}

impl EventReason {
    /// The stable wire spelling, also used as the alert `kind`.
    pub fn as_str(self) -> &'static str {
        match self {
            EventReason::DtStart => "DT_START",
            EventReason::DtStop => "DT_STOP",
            EventReason::TargetReached => "TARGET_REACHED",
            EventReason::CollectorCoolingIn => "COLLECTOR_COOLING_IN",
            EventReason::CollectorCoolingOut => "COLLECTOR_COOLING_OUT",
            EventReason::Overheat => "OVERHEAT",
            EventReason::ClearEmergency => "CLEAR_EMERGENCY",
            EventReason::Manual => "MANUAL",
            EventReason::AutoResume => "AUTO_RESUME",
        }
    }
}
