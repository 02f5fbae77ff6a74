/// Sampler
///
/// Produces exactly one `ReadingFrame` per tick, never aborting the tick:
/// every configured channel appears in the frame even when its read fails.
/// Failure logging is de-spammed per channel — one notice on the way down,
/// one on recovery — so a dead sensor does not flood the journal overnight.
use std::collections::HashMap;
use std::time::Duration;

use tracing::{error, info, warn};

use crate::hardware::HardwareIO;
use crate::models::telemetry::{Channel, Reading, ReadingFrame};

/// Raw values outside this range are treated as a failed read regardless of
/// what the driver claims.
const MIN_PHYSICAL_C: f64 = -50.0;
const MAX_PHYSICAL_C: f64 = 250.0;

/// Per-read deadline; an overrunning driver call is abandoned, not awaited.
const READ_DEADLINE: Duration = Duration::from_secs(2);

/// Suppresses repeats of the same log class per channel. Warnings (range and
/// deadline trouble) and errors (driver failures) are gated independently, so
/// an escalation still gets through.
#[derive(Debug, Default)]
struct LogGate {
    warn_active: bool,
    error_active: bool,
}

impl LogGate {
    fn note_warn(&mut self, channel: &str, detail: &str) {
        if !self.warn_active {
            warn!(channel, detail, "sensor read degraded");
            self.warn_active = true;
        }
    }

    fn note_error(&mut self, channel: &str, detail: &str) {
        if !self.error_active {
            error!(channel, detail, "sensor read failed");
            self.error_active = true;
        }
    }

    fn note_ok(&mut self, channel: &str) {
        if self.warn_active || self.error_active {
            info!(channel, "sensor recovered");
            self.warn_active = false;
            self.error_active = false;
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LastOk {
    value_c: f64,
    wall: i64,
}

pub struct Sampler {
    channels: Vec<Channel>,
    gates: HashMap<String, LogGate>,
    last_ok: HashMap<String, LastOk>,
    /// How long a carried-forward value still counts as stale rather than
    /// lost entirely.
    stale_window_s: i64,
}

impl Sampler {
    pub fn new(channels: Vec<Channel>, sample_period_s: u64) -> Self {
        Self {
            channels,
            gates: HashMap::new(),
            last_ok: HashMap::new(),
            stale_window_s: (sample_period_s * 3) as i64,
        }
    }

    pub fn channels(&self) -> &[Channel] {
        &self.channels
    }

    /// Read every channel once and assemble the tick's frame.
    pub async fn sample(
        &mut self,
        hw: &mut dyn HardwareIO,
        t_mono_ns: u64,
        wall: i64,
    ) -> ReadingFrame {
        let mut readings = HashMap::with_capacity(self.channels.len());

        for channel in &self.channels {
            let gate = self.gates.entry(channel.id.clone()).or_default();
            let outcome = tokio::time::timeout(READ_DEADLINE, hw.read_temp(channel, wall)).await;

            let reading = match outcome {
                Ok(Ok(Some(raw))) => {
                    if !(MIN_PHYSICAL_C..=MAX_PHYSICAL_C).contains(&raw) {
                        gate.note_warn(&channel.id, &format!("value {:.1} °C out of range", raw));
                        Reading::error()
                    } else {
                        let value = raw * channel.scale + channel.offset_c;
                        gate.note_ok(&channel.id);
                        self.last_ok.insert(channel.id.clone(), LastOk { value_c: value, wall });
                        Reading::ok(value)
                    }
                }
                Ok(Ok(None)) => {
                    gate.note_error(&channel.id, "driver returned no reading");
                    Reading::error()
                }
                Ok(Err(e)) => {
                    gate.note_error(&channel.id, &e.to_string());
                    Reading::error()
                }
                Err(_) => {
                    gate.note_warn(&channel.id, "read deadline exceeded");
                    // A timed-out read still has a usable recent value for
                    // display; control logic ignores anything not Ok.
                    match self.last_ok.get(&channel.id) {
                        Some(last) if wall - last.wall <= self.stale_window_s => {
                            Reading::stale(last.value_c)
                        }
                        _ => Reading::error(),
                    }
                }
            };

            readings.insert(channel.id.clone(), reading);
        }

        ReadingFrame { t_mono_ns, wall, readings }
    }

    #[cfg(test)]
    fn gate(&self, channel: &str) -> (bool, bool) {
        self.gates
            .get(channel)
            .map(|g| (g.warn_active, g.error_active))
            .unwrap_or((false, false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    use crate::hardware::HardwareError;
    use crate::models::command::RelayId;
    use crate::models::telemetry::{ChannelKind, ChannelRole, ReadingStatus};

    /// Scripted hardware: each channel pops its next outcome per read.
    #[derive(Default)]
    struct ScriptedHardware {
        script: HashMap<String, VecDeque<Result<Option<f64>, String>>>,
    }

    impl ScriptedHardware {
        fn push(&mut self, channel: &str, outcome: Result<Option<f64>, &str>) {
            self.script
                .entry(channel.to_string())
                .or_default()
                .push_back(outcome.map_err(|e| e.to_string()));
        }
    }

    #[async_trait]
    impl HardwareIO for ScriptedHardware {
        async fn read_temp(
            &mut self,
            channel: &Channel,
            _wall: i64,
        ) -> Result<Option<f64>, HardwareError> {
            match self.script.get_mut(&channel.id).and_then(|q| q.pop_front()) {
                Some(Ok(v)) => Ok(v),
                Some(Err(reason)) => {
                    Err(HardwareError::ReadFailed { channel: channel.id.clone(), reason })
                }
                None => Ok(Some(20.0)),
            }
        }

        async fn set_relay(&mut self, _relay: RelayId, _on: bool) -> Result<(), HardwareError> {
            Ok(())
        }
    }

    fn channel(id: &str, role: ChannelRole) -> Channel {
        Channel { id: id.into(), kind: ChannelKind::Rtd, offset_c: 0.0, scale: 1.0, role }
    }

    fn two_channel_sampler() -> Sampler {
        Sampler::new(
            vec![
                channel("collector", ChannelRole::Collector),
                channel("tank_level_0", ChannelRole::TankLevel(0)),
            ],
            30,
        )
    }

    #[tokio::test]
    async fn every_channel_appears_even_when_all_fail() {
        let mut sampler = two_channel_sampler();
        let mut hw = ScriptedHardware::default();
        hw.push("collector", Err("bus fault"));
        hw.push("tank_level_0", Ok(None));

        let frame = sampler.sample(&mut hw, 0, 1_000).await;
        assert_eq!(frame.readings.len(), 2, "failed channels must still be present");
        assert!(frame.readings.values().all(|r| r.status == ReadingStatus::Error));
    }

    #[tokio::test]
    async fn calibration_is_applied_to_ok_reads() {
        let mut sampler = Sampler::new(
            vec![Channel {
                id: "collector".into(),
                kind: ChannelKind::Rtd,
                offset_c: -1.5,
                scale: 2.0,
                role: ChannelRole::Collector,
            }],
            30,
        );
        let mut hw = ScriptedHardware::default();
        hw.push("collector", Ok(Some(30.0)));

        let frame = sampler.sample(&mut hw, 0, 1_000).await;
        let r = frame.readings.get("collector").unwrap();
        assert_eq!(r.value_c, Some(58.5), "v = raw * scale + offset");
        assert_eq!(r.status, ReadingStatus::Ok);
    }

    #[tokio::test]
    async fn out_of_range_is_an_error_not_a_value() {
        let mut sampler = two_channel_sampler();
        let mut hw = ScriptedHardware::default();
        hw.push("collector", Ok(Some(412.0)));

        let frame = sampler.sample(&mut hw, 0, 1_000).await;
        let r = frame.readings.get("collector").unwrap();
        assert_eq!(r.status, ReadingStatus::Error);
        assert_eq!(r.value_c, None);
    }

    #[tokio::test]
    async fn failure_warns_once_and_recovery_clears_the_gate() {
        let mut sampler = two_channel_sampler();
        let mut hw = ScriptedHardware::default();
        hw.push("collector", Err("bus fault"));
        hw.push("collector", Err("bus fault"));
        hw.push("collector", Ok(Some(55.0)));

        sampler.sample(&mut hw, 0, 1_000).await;
        assert_eq!(sampler.gate("collector"), (false, true), "first failure arms the gate");

        sampler.sample(&mut hw, 1, 1_030).await;
        assert_eq!(sampler.gate("collector"), (false, true), "repeat failure stays gated");

        sampler.sample(&mut hw, 2, 1_060).await;
        assert_eq!(sampler.gate("collector"), (false, false), "recovery clears the gate");
    }

    #[tokio::test]
    async fn warn_and_error_gates_are_independent() {
        let mut sampler = two_channel_sampler();
        let mut hw = ScriptedHardware::default();
        hw.push("collector", Ok(Some(400.0))); // warn class
        hw.push("collector", Err("bus fault")); // error class

        sampler.sample(&mut hw, 0, 1_000).await;
        assert_eq!(sampler.gate("collector"), (true, false));
        sampler.sample(&mut hw, 1, 1_030).await;
        assert_eq!(sampler.gate("collector"), (true, true));
    }
}
