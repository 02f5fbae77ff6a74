/// Derived-value pipeline
///
/// Everything in here is arithmetic over the current frame plus a short ring
/// of recent samples. No I/O, no capability access: the same inputs always
/// produce the same outputs, which is what makes the controller testable with
/// literal frames.
use std::collections::VecDeque;

use tracing::warn;

use crate::config::{ControlParams, DerivedConfig, TankConfig};
use crate::models::command::RateSmoothing;
use crate::models::telemetry::{Channel, ChannelRole, Derived, ReadingFrame};

/// Specific heat of water, kJ/(kg·K).
pub const C_P_KJ_PER_KG_K: f64 = 4.186;

/// Ring capacity: enough to cover the slow window at the default cadence.
const RING_CAPACITY: usize = 20;

/// Moving-average length for the `sma` smoothing mode.
const SMA_POINTS: usize = 3;

#[derive(Debug, Clone, Copy)]
struct RateSample {
    wall: i64,
    energy_kwh: f64,
    tank_mean_c: f64,
}

pub struct DerivationEngine {
    ring: VecDeque<RateSample>,
    energy_slopes: VecDeque<f64>,
    temp_slopes: VecDeque<f64>,
    energy_ema: Option<f64>,
    temp_ema: Option<f64>,
    /// Gates the over-capacity warning so it fires once per excursion.
    energy_bound_warned: bool,
}

impl DerivationEngine {
    pub fn new() -> Self {
        Self {
            ring: VecDeque::with_capacity(RING_CAPACITY),
            energy_slopes: VecDeque::with_capacity(SMA_POINTS),
            temp_slopes: VecDeque::with_capacity(SMA_POINTS),
            energy_ema: None,
            temp_ema: None,
            energy_bound_warned: false,
        }
    }

    /// Compute the full derived record for one frame.
    pub fn compute(
        &mut self,
        frame: &ReadingFrame,
        channels: &[Channel],
        params: &ControlParams,
        tank: &TankConfig,
        bounds: &DerivedConfig,
    ) -> Derived {
        let collector = frame.ok_value(channels, ChannelRole::Collector);
        let tank_bottom = frame.tank_bottom_c(channels);
        let collector_dt_c = match (collector, tank_bottom) {
            (Some(c), Some(b)) => Some(c - b),
            _ => None,
        };

        let levels = frame.tank_levels(channels);
        let max_energy = max_energy_kwh(tank, params.boiling_c);
        let energy = stored_energy_kwh(&levels, tank, max_energy);

        if let Some(e) = energy.raw_total {
            if e > max_energy * 1.1 {
                if !self.energy_bound_warned {
                    warn!(
                        stored_kwh = format!("{:.1}", e),
                        max_kwh = format!("{:.1}", max_energy),
                        "stored energy exceeds tank capacity bound"
                    );
                    self.energy_bound_warned = true;
                }
            } else {
                self.energy_bound_warned = false;
            }
        }

        let tank_mean_c = mean(&levels);
        let stratification_c_per_cm = stratification(&levels, &tank.gap_heights_cm());
        let hx_efficiency_pct = hx_efficiency(frame, channels);

        let (energy_rate_kw, temp_rate_c_per_h) =
            match (energy.total, tank_mean_c) {
                (Some(e), Some(t)) => {
                    self.push_sample(RateSample { wall: frame.wall, energy_kwh: e, tank_mean_c: t });
                    self.rates(params)
                }
                _ => (0.0, 0.0),
            };

        let total = frame.readings.len();
        let sensor_health_pct = if total == 0 {
            0.0
        } else {
            frame.ok_count() as f64 / total as f64 * 100.0
        };

        let overheating_risk_pct = collector.map(|c| overheating_risk(c, bounds));

        Derived {
            collector_dt_c,
            stored_energy_kwh: energy.total,
            stored_energy_top_kwh: energy.top,
            stored_energy_bottom_kwh: energy.bottom,
            tank_mean_c,
            stratification_c_per_cm,
            hx_efficiency_pct,
            energy_rate_kw,
            temp_rate_c_per_h,
            sensor_health_pct,
            overheating_risk_pct,
        }
    }

    fn push_sample(&mut self, sample: RateSample) {
        if self.ring.len() == RING_CAPACITY {
            self.ring.pop_front();
        }
        self.ring.push_back(sample);
    }

    /// Window slope of the ring, then the configured smoothing. Both the SMA
    /// and EMA states advance every tick so switching modes at runtime does
    /// not replay stale history.
    fn rates(&mut self, params: &ControlParams) -> (f64, f64) {
        let window_s = params.rate_window.seconds();
        let newest = match self.ring.back() {
            Some(s) => *s,
            None => return (0.0, 0.0),
        };
        let cutoff = newest.wall - window_s;
        let oldest = self
            .ring
            .iter()
            .find(|s| s.wall >= cutoff)
            .copied()
            .unwrap_or(newest);

        let dt_h = (newest.wall - oldest.wall) as f64 / 3600.0;
        let (raw_energy, raw_temp) = if dt_h > 0.0 {
            (
                (newest.energy_kwh - oldest.energy_kwh) / dt_h,
                (newest.tank_mean_c - oldest.tank_mean_c) / dt_h,
            )
        } else {
            (0.0, 0.0)
        };

        push_capped(&mut self.energy_slopes, raw_energy, SMA_POINTS);
        push_capped(&mut self.temp_slopes, raw_temp, SMA_POINTS);
        let energy_ema = ema_step(&mut self.energy_ema, raw_energy, params.ema_alpha);
        let temp_ema = ema_step(&mut self.temp_ema, raw_temp, params.ema_alpha);

        match params.rate_smoothing {
            RateSmoothing::Raw => (raw_energy, raw_temp),
            RateSmoothing::Sma => (avg(&self.energy_slopes), avg(&self.temp_slopes)),
            RateSmoothing::Ema => (energy_ema, temp_ema),
        }
    }
}

impl Default for DerivationEngine {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Energy ──────────────────────────────────────────────────────────────────

struct StoredEnergy {
    total: Option<f64>,
    top: Option<f64>,
    bottom: Option<f64>,
    /// Pre-clamp total, kept for the capacity warning.
    raw_total: Option<f64>,
}

/// Usable capacity of the tank relative to the cold-in reference (kWh).
pub fn max_energy_kwh(tank: &TankConfig, t_max_c: f64) -> f64 {
    tank.mass_kg() * C_P_KJ_PER_KG_K * (t_max_c - tank.t_cold_in_c) / 3600.0
}

/// Stored energy per stratification level, summed whole / upper half / lower
/// half. Unreadable levels contribute nothing; a fully unreadable tank yields
/// no value at all rather than a misleading zero.
fn stored_energy_kwh(levels: &[Option<f64>], tank: &TankConfig, max_energy: f64) -> StoredEnergy {
    if levels.iter().all(Option::is_none) {
        return StoredEnergy { total: None, top: None, bottom: None, raw_total: None };
    }

    let kg_per_level = tank.mass_kg() / tank.levels.max(1) as f64;
    let level_kwh = |t: f64| kg_per_level * C_P_KJ_PER_KG_K * (t - tank.t_cold_in_c) / 3600.0;

    let half = levels.len() / 2;
    let mut total = 0.0;
    let mut top = 0.0;
    let mut bottom = 0.0;
    for (i, level) in levels.iter().enumerate() {
        if let Some(t) = level {
            let e = level_kwh(*t);
            total += e;
            if i >= half {
                top += e;
            } else {
                bottom += e;
            }
        }
    }

    StoredEnergy {
        total: Some(total.clamp(0.0, max_energy)),
        top: Some(top.clamp(0.0, max_energy)),
        bottom: Some(bottom.clamp(0.0, max_energy)),
        raw_total: Some(total),
    }
}

// ─── Tank shape ──────────────────────────────────────────────────────────────

fn mean(levels: &[Option<f64>]) -> Option<f64> {
    let present: Vec<f64> = levels.iter().flatten().copied().collect();
    if present.is_empty() {
        None
    } else {
        Some(present.iter().sum::<f64>() / present.len() as f64)
    }
}

/// Mean absolute adjacent-level gradient in °C/cm. Pairs with an unreadable
/// member are skipped.
fn stratification(levels: &[Option<f64>], gaps_cm: &[f64]) -> Option<f64> {
    let mut gradients = Vec::new();
    for (i, pair) in levels.windows(2).enumerate() {
        if let (Some(lower), Some(upper)) = (pair[0], pair[1]) {
            let gap = gaps_cm.get(i).copied().unwrap_or(0.0);
            if gap > 0.0 {
                gradients.push((upper - lower).abs() / gap);
            }
        }
    }
    if gradients.is_empty() {
        None
    } else {
        Some(gradients.iter().sum::<f64>() / gradients.len() as f64)
    }
}

// ─── Ventilation heat exchanger ──────────────────────────────────────────────

/// Minimum extract/outdoor spread before the efficiency quotient means
/// anything (°C).
const HX_MIN_SPREAD_C: f64 = 0.5;

fn hx_efficiency(frame: &ReadingFrame, channels: &[Channel]) -> Option<f64> {
    let supply = frame.ok_value(channels, ChannelRole::SupplyAir)?;
    let outdoor = frame.ok_value(channels, ChannelRole::OutdoorAir)?;
    let extract = frame.ok_value(channels, ChannelRole::ExtractAir)?;

    let denom = extract - outdoor;
    if denom.abs() < HX_MIN_SPREAD_C {
        return None;
    }
    Some(((supply - outdoor) / denom * 100.0).clamp(0.0, 100.0))
}

// ─── Overheating risk ────────────────────────────────────────────────────────

/// Linear ramp: 0 % at the safe threshold, 100 % at the risk ceiling.
pub fn overheating_risk(collector_c: f64, bounds: &DerivedConfig) -> f64 {
    let span = bounds.risk_ceiling_c - bounds.safe_threshold_c;
    ((collector_c - bounds.safe_threshold_c) / span * 100.0).clamp(0.0, 100.0)
}

// ─── Small helpers ───────────────────────────────────────────────────────────

fn push_capped(deque: &mut VecDeque<f64>, value: f64, cap: usize) {
    if deque.len() == cap {
        deque.pop_front();
    }
    deque.push_back(value);
}

fn avg(deque: &VecDeque<f64>) -> f64 {
    if deque.is_empty() {
        0.0
    } else {
        deque.iter().sum::<f64>() / deque.len() as f64
    }
}

fn ema_step(state: &mut Option<f64>, raw: f64, alpha: f64) -> f64 {
    let next = match *state {
        Some(prev) => alpha * raw + (1.0 - alpha) * prev,
        None => raw,
    };
    *state = Some(next);
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::config::Config;
    use crate::models::command::{RateSmoothing, RateWindow};
    use crate::models::telemetry::{ChannelKind, Reading};

    fn channels() -> Vec<Channel> {
        Config::default().channels
    }

    fn frame(wall: i64, values: &[(&str, f64)]) -> ReadingFrame {
        let mut readings = HashMap::new();
        for ch in channels() {
            readings.insert(ch.id.clone(), Reading::error());
        }
        for (id, v) in values {
            readings.insert(id.to_string(), Reading::ok(*v));
        }
        ReadingFrame { t_mono_ns: wall as u64 * 1_000_000_000, wall, readings }
    }

    fn uniform_tank_frame(wall: i64, t: f64) -> ReadingFrame {
        let pairs: Vec<(String, f64)> = (0..8).map(|n| (format!("tank_level_{}", n), t)).collect();
        let borrowed: Vec<(&str, f64)> =
            pairs.iter().map(|(id, v)| (id.as_str(), *v)).collect();
        frame(wall, &borrowed)
    }

    fn engine_inputs() -> (ControlParams, TankConfig, DerivedConfig) {
        let config = Config::default();
        (config.control_params(), config.tank, config.derived)
    }

    #[test]
    fn stored_energy_stays_inside_bounds() {
        let (params, tank, bounds) = engine_inputs();
        let mut engine = DerivationEngine::new();

        // Whole tank at the cold-in reference: zero energy, not negative.
        let d = engine.compute(&uniform_tank_frame(0, 4.0), &channels(), &params, &tank, &bounds);
        assert_eq!(d.stored_energy_kwh, Some(0.0));

        // Below the reference still clamps at zero.
        let d = engine.compute(&uniform_tank_frame(30, 1.0), &channels(), &params, &tank, &bounds);
        assert_eq!(d.stored_energy_kwh, Some(0.0), "energy must never go negative");

        // Absurdly hot clamps at the capacity bound.
        let max = max_energy_kwh(&tank, params.boiling_c);
        let d = engine.compute(&uniform_tank_frame(60, 240.0), &channels(), &params, &tank, &bounds);
        assert_eq!(d.stored_energy_kwh, Some(max));
    }

    #[test]
    fn fully_unreadable_tank_yields_nulls() {
        let (params, tank, bounds) = engine_inputs();
        let mut engine = DerivationEngine::new();
        let d = engine.compute(&frame(0, &[("collector", 60.0)]), &channels(), &params, &tank, &bounds);
        assert_eq!(d.stored_energy_kwh, None);
        assert_eq!(d.tank_mean_c, None);
        assert_eq!(d.stratification_c_per_cm, None);
        assert_eq!(d.collector_dt_c, None, "dt needs a readable tank bottom");
    }

    #[test]
    fn top_and_bottom_split_the_total() {
        let (params, tank, bounds) = engine_inputs();
        let mut engine = DerivationEngine::new();
        let d = engine.compute(&uniform_tank_frame(0, 50.0), &channels(), &params, &tank, &bounds);
        let total = d.stored_energy_kwh.unwrap();
        let top = d.stored_energy_top_kwh.unwrap();
        let bottom = d.stored_energy_bottom_kwh.unwrap();
        assert!((top + bottom - total).abs() < 1e-9);
        assert!((top - bottom).abs() < 1e-9, "a uniform tank splits evenly");
    }

    #[test]
    fn stratification_uses_gap_heights() {
        let levels: Vec<Option<f64>> = (0..8).map(|n| Some(40.0 + 4.0 * n as f64)).collect();
        let grad = stratification(&levels, &vec![20.0; 7]).unwrap();
        assert!((grad - 0.2).abs() < 1e-9, "4 °C over 20 cm is 0.2 °C/cm, got {}", grad);
    }

    #[test]
    fn hx_efficiency_clamps_and_nulls() {
        let ch = channels();
        let f = frame(0, &[("supply_air", 18.0), ("outdoor_air", 0.0), ("extract_air", 22.0)]);
        let eff = hx_efficiency(&f, &ch).unwrap();
        assert!((eff - 81.818).abs() < 0.01, "got {}", eff);

        // Tiny spread: the quotient is meaningless.
        let f = frame(0, &[("supply_air", 20.0), ("outdoor_air", 21.8), ("extract_air", 22.0)]);
        assert_eq!(hx_efficiency(&f, &ch), None);

        // Supply above extract clamps at 100.
        let f = frame(0, &[("supply_air", 30.0), ("outdoor_air", 0.0), ("extract_air", 22.0)]);
        assert_eq!(hx_efficiency(&f, &ch), Some(100.0));
    }

    #[test]
    fn raw_energy_rate_follows_the_window_slope() {
        let (mut params, tank, bounds) = engine_inputs();
        params.rate_window = RateWindow::Fast;
        params.rate_smoothing = RateSmoothing::Raw;
        let mut engine = DerivationEngine::new();

        engine.compute(&uniform_tank_frame(0, 40.0), &channels(), &params, &tank, &bounds);
        let d = engine.compute(&uniform_tank_frame(30, 42.0), &channels(), &params, &tank, &bounds);

        // 8 levels × 45 kg × 4.186 kJ/kgK × 2 K / 3600 = 0.8372 kWh in 30 s.
        let expected_kw = 0.8372 / (30.0 / 3600.0);
        assert!(
            (d.energy_rate_kw - expected_kw).abs() < 0.01,
            "expected ~{:.2} kW, got {:.2}",
            expected_kw,
            d.energy_rate_kw
        );
        // 2 °C in 30 s is 240 °C/h.
        assert!((d.temp_rate_c_per_h - 240.0).abs() < 0.01);
    }

    #[test]
    fn single_sample_rates_are_zero() {
        let (mut params, tank, bounds) = engine_inputs();
        params.rate_smoothing = RateSmoothing::Raw;
        let mut engine = DerivationEngine::new();
        let d = engine.compute(&uniform_tank_frame(0, 40.0), &channels(), &params, &tank, &bounds);
        assert_eq!(d.energy_rate_kw, 0.0);
        assert_eq!(d.temp_rate_c_per_h, 0.0);
    }

    #[test]
    fn ema_smoothing_blends_toward_raw() {
        let (mut params, tank, bounds) = engine_inputs();
        params.rate_window = RateWindow::Fast;
        params.rate_smoothing = RateSmoothing::Ema;
        params.ema_alpha = 0.5;
        let mut engine = DerivationEngine::new();

        engine.compute(&uniform_tank_frame(0, 40.0), &channels(), &params, &tank, &bounds);
        let first = engine.compute(&uniform_tank_frame(30, 42.0), &channels(), &params, &tank, &bounds);
        // Temperature holds: raw slope over the window drops but EMA remembers.
        let second = engine.compute(&uniform_tank_frame(60, 42.0), &channels(), &params, &tank, &bounds);
        assert!(second.temp_rate_c_per_h > 0.0, "EMA should still carry the earlier rise");
        assert!(second.temp_rate_c_per_h < first.temp_rate_c_per_h);
    }

    #[test]
    fn sma_smoothing_averages_three_slopes() {
        let (mut params, tank, bounds) = engine_inputs();
        params.rate_window = RateWindow::Fast;
        params.rate_smoothing = RateSmoothing::Sma;
        let mut engine = DerivationEngine::new();

        engine.compute(&uniform_tank_frame(0, 40.0), &channels(), &params, &tank, &bounds);
        engine.compute(&uniform_tank_frame(30, 41.0), &channels(), &params, &tank, &bounds);
        let d = engine.compute(&uniform_tank_frame(60, 42.0), &channels(), &params, &tank, &bounds);
        // Raw slopes: 0 (single sample), 120, 120 °C/h → SMA 80.
        assert!((d.temp_rate_c_per_h - 80.0).abs() < 0.01, "got {}", d.temp_rate_c_per_h);
    }

    #[test]
    fn overheating_risk_ramps_linearly() {
        let bounds = DerivedConfig::default();
        assert_eq!(overheating_risk(20.0, &bounds), 0.0);
        assert_eq!(overheating_risk(90.0, &bounds), 0.0);
        assert!((overheating_risk(130.0, &bounds) - 50.0).abs() < 1e-9);
        assert_eq!(overheating_risk(170.0, &bounds), 100.0);
        assert_eq!(overheating_risk(400.0, &bounds), 100.0);
    }

    #[test]
    fn sensor_health_counts_ok_fraction() {
        let (params, tank, bounds) = engine_inputs();
        let mut engine = DerivationEngine::new();
        let d = engine.compute(&uniform_tank_frame(0, 40.0), &channels(), &params, &tank, &bounds);
        // 8 of 14 default channels are readable in this frame.
        assert!((d.sensor_health_pct - 8.0 / 14.0 * 100.0).abs() < 0.01);
    }

    #[test]
    fn same_inputs_same_outputs() {
        let (params, tank, bounds) = engine_inputs();
        let f = uniform_tank_frame(0, 47.5);
        let a = DerivationEngine::new().compute(&f, &channels(), &params, &tank, &bounds);
        let b = DerivationEngine::new().compute(&f, &channels(), &params, &tank, &bounds);
        assert_eq!(format!("{:?}", a), format!("{:?}", b), "derivations must be referentially transparent");
    }
}
