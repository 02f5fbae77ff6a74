/// Hardware I/O capability
///
/// The controller never talks to RTD, analog-input, or relay boards directly;
/// it goes through the `HardwareIO` trait. The only backend compiled in here
/// is the deterministic simulation used for development and tests — on a real
/// installation the driver crate provides the implementation and this module
/// refuses to initialize without it.
use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Timelike;
use thiserror::Error;

use crate::config::Config;
use crate::models::command::RelayId;
use crate::models::telemetry::{Channel, ChannelRole};

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("driver read failed on channel {channel}: {reason}")]
    ReadFailed { channel: String, reason: String },
    #[error("relay write failed on {relay:?}: {reason}")]
    RelayFailed { relay: RelayId, reason: String },
    #[error("no hardware driver available; set simulation=true or install a driver backend")]
    Unavailable,
}

/// Calibrated temperature reads and relay writes. `read_temp` receives the
/// tick's wall timestamp so backends that synthesize values stay a pure
/// function of it; it returns `Ok(None)` when the driver reports its sentinel
/// "no reading" code.
#[async_trait]
pub trait HardwareIO: Send {
    async fn read_temp(&mut self, channel: &Channel, wall: i64)
        -> Result<Option<f64>, HardwareError>;
    async fn set_relay(&mut self, relay: RelayId, on: bool) -> Result<(), HardwareError>;
}

/// Build the configured backend. Outside simulation there is nothing to
/// return, which the caller treats as an unrecoverable init failure.
pub fn init(config: &Config) -> Result<Box<dyn HardwareIO>, HardwareError> {
    if config.simulation {
        Ok(Box::new(SimulatedHardware::new()))
    } else {
        Err(HardwareError::Unavailable)
    }
}

// ─── Simulated backend ───────────────────────────────────────────────────────

/// Plays back a plausible summer day: the collector follows a parabolic sun
/// curve between 06:00 and 18:00 local, the tank sits stratified and drifts
/// gently with the day, and the ventilation channels model a fixed-efficiency
/// heat exchanger. Values are a pure function of the wall timestamp handed
/// in per read, so repeated reads for the same instant agree.
pub struct SimulatedHardware {
    relays: HashMap<RelayId, bool>,
}

impl SimulatedHardware {
    pub fn new() -> Self {
        Self { relays: HashMap::new() }
    }

    pub fn relay(&self, relay: RelayId) -> bool {
        self.relays.get(&relay).copied().unwrap_or(false)
    }

    fn local_hour(wall: i64) -> f64 {
        use chrono::TimeZone;
        match chrono::Local.timestamp_opt(wall, 0).single() {
            Some(t) => t.hour() as f64 + t.minute() as f64 / 60.0 + t.second() as f64 / 3600.0,
            None => 12.0,
        }
    }
}

impl Default for SimulatedHardware {
    fn default() -> Self {
        Self::new()
    }
}

/// Normalized sun intensity for a local decimal hour: 0 at night, 1 at the
/// 13:00 peak.
fn sun_curve(hour: f64) -> f64 {
    let x = (hour - 13.0) / 6.5;
    (1.0 - x * x).max(0.0)
}

/// Simulated temperature for a role at a local decimal hour (°C).
pub fn simulated_temp_c(role: ChannelRole, hour: f64) -> f64 {
    let g = sun_curve(hour);
    let outdoor = 8.0 + 12.0 * g;
    let extract = 21.5;
    // Fixed 75 % exchanger effectiveness for the ventilation loop.
    let eff = 0.75;
    match role {
        ChannelRole::Collector => 12.0 + 85.0 * g,
        ChannelRole::TankLevel(n) => 38.0 + 2.2 * n as f64 + 6.0 * g,
        ChannelRole::ReturnLine => 40.0 + 6.0 * g,
        ChannelRole::OutdoorAir => outdoor,
        ChannelRole::ExtractAir => extract,
        ChannelRole::SupplyAir => outdoor + eff * (extract - outdoor),
        ChannelRole::ExhaustAir => extract - eff * (extract - outdoor),
    }
}

#[async_trait]
impl HardwareIO for SimulatedHardware {
    async fn read_temp(
        &mut self,
        channel: &Channel,
        wall: i64,
    ) -> Result<Option<f64>, HardwareError> {
        Ok(Some(simulated_temp_c(channel.role, Self::local_hour(wall))))
    }

    async fn set_relay(&mut self, relay: RelayId, on: bool) -> Result<(), HardwareError> {
        self.relays.insert(relay, on);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::telemetry::ChannelKind;

    #[test]
    fn simulation_is_deterministic() {
        let a = simulated_temp_c(ChannelRole::Collector, 13.0);
        let b = simulated_temp_c(ChannelRole::Collector, 13.0);
        assert_eq!(a, b, "same hour must produce the same value");
        assert!((a - 97.0).abs() < 0.01, "noon collector should be near peak, got {}", a);
    }

    #[test]
    fn night_collector_is_cold() {
        let t = simulated_temp_c(ChannelRole::Collector, 2.0);
        assert!((t - 12.0).abs() < 0.01, "collector at 02:00 should be at base, got {}", t);
    }

    #[test]
    fn tank_is_stratified_bottom_to_top() {
        let bottom = simulated_temp_c(ChannelRole::TankLevel(0), 10.0);
        let top = simulated_temp_c(ChannelRole::TankLevel(7), 10.0);
        assert!(top > bottom, "upper levels must be warmer ({} <= {})", top, bottom);
    }

    #[test]
    fn hx_supply_sits_between_outdoor_and_extract() {
        let outdoor = simulated_temp_c(ChannelRole::OutdoorAir, 9.0);
        let supply = simulated_temp_c(ChannelRole::SupplyAir, 9.0);
        let extract = simulated_temp_c(ChannelRole::ExtractAir, 9.0);
        assert!(outdoor < supply && supply < extract);
    }

    #[tokio::test]
    async fn relays_remember_their_state() {
        let mut hw = SimulatedHardware::new();
        hw.set_relay(RelayId::Pump, true).await.unwrap();
        assert!(hw.relay(RelayId::Pump));
        assert!(!hw.relay(RelayId::Heater));
    }

    #[test]
    fn init_refuses_without_simulation() {
        let config = Config::default();
        assert!(!config.simulation);
        assert!(matches!(init(&config), Err(HardwareError::Unavailable)));
    }

    #[tokio::test]
    async fn reads_are_deterministic_at_the_trait_boundary() {
        let channel = Channel {
            id: "collector".into(),
            kind: ChannelKind::Rtd,
            offset_c: 0.0,
            scale: 1.0,
            role: ChannelRole::Collector,
        };
        let wall = 1_717_000_000;
        let mut hw = SimulatedHardware::new();
        let a = hw.read_temp(&channel, wall).await.unwrap();
        let b = hw.read_temp(&channel, wall).await.unwrap();
        let c = SimulatedHardware::new().read_temp(&channel, wall).await.unwrap();
        assert!(a.is_some());
        assert_eq!(a, b, "same wall timestamp must read the same value");
        assert_eq!(a, c, "a fresh backend at the same instant agrees too");
    }
}
