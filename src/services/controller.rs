/// Pump/heater state machine
///
/// Transition rules are evaluated in a fixed priority order, first match
/// wins: emergency latch, latch release, manual override, collector cooling,
/// then the dT hysteresis pair. The controller owns nothing but its own
/// state; relay writes and counter updates happen in the engine from the
/// decision it returns.
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::config::ControlParams;
use crate::models::command::{EventReason, ManualOverride, Mode};
use crate::models::telemetry::{Channel, ChannelRole, Derived, ReadingFrame, ReadingStatus};

/// Margin below `boiling_c` every sensor must reach before the emergency
/// latch may release (°C).
const CLEAR_MARGIN_C: f64 = 10.0;

/// Post-target bias on the heating exit so the pump does not chatter at the
/// setpoint (°C).
const TARGET_EXIT_BIAS_C: f64 = 1.0;

/// How long the controlling sensors may be unreadable before a running pump
/// is commanded off (s).
const UNREADABLE_GRACE_S: i64 = 30;

/// Dwell below the heater floor before the cartridge heater engages (s).
const HEATER_QUALIFY_S: i64 = 60;

/// Release margin above the heater floor (°C).
const HEATER_RELEASE_C: f64 = 2.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    Startup,
    Standby,
    Heating,
    CollectorCooling,
    ManualOverride,
    Overheated,
    Test,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TransitionEvent {
    pub from: ControllerState,
    pub to: ControllerState,
    pub reason: EventReason,
}

/// What the engine applies at the end of the tick.
#[derive(Debug, Clone)]
pub struct ControlDecision {
    pub state: ControllerState,
    pub pump_on: bool,
    pub heater_on: bool,
    pub emergency_latched: bool,
    pub events: Vec<TransitionEvent>,
}

pub struct Controller {
    state: ControllerState,
    latched: bool,
    frames_seen: u64,
    pump_on: bool,
    heater_on: bool,
    heater_low_since: Option<i64>,
    unreadable_since: Option<i64>,
    test_mode: bool,
}

impl Controller {
    /// `latched` restores a persisted emergency latch across restarts: the
    /// machine resumes in `Overheated` so only an explicit clear releases it.
    pub fn new(test_mode: bool, latched: bool) -> Self {
        Self {
            state: if test_mode {
                ControllerState::Test
            } else if latched {
                ControllerState::Overheated
            } else {
                ControllerState::Startup
            },
            latched,
            frames_seen: 0,
            pump_on: false,
            heater_on: false,
            heater_low_since: None,
            unreadable_since: None,
            test_mode,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Evaluate one frame. `clear_requested` is true when a `ClearEmergency`
    /// command was drained this tick.
    pub fn evaluate(
        &mut self,
        frame: &ReadingFrame,
        channels: &[Channel],
        derived: &Derived,
        params: &ControlParams,
        manual: &ManualOverride,
        clear_requested: bool,
    ) -> ControlDecision {
        self.frames_seen += 1;
        let wall = frame.wall;
        let mut events = Vec::new();

        let collector = frame.ok_value(channels, ChannelRole::Collector);
        let tank_bottom = frame.tank_bottom_c(channels);
        let tank_top = frame.tank_top_c(channels);

        // Rule 1: safety latch beats everything, including manual mode.
        let over_boiling = collector.is_some_and(|c| c >= params.boiling_c)
            || frame
                .tank_levels(channels)
                .iter()
                .flatten()
                .any(|t| *t >= params.boiling_c);
        if over_boiling {
            if self.state != ControllerState::Overheated {
                error!(
                    collector = ?collector,
                    boiling_c = params.boiling_c,
                    "CRITICAL: boiling threshold reached, latching emergency stop"
                );
                events.push(self.transition(ControllerState::Overheated, EventReason::Overheat));
            }
            self.latched = true;
            return self.all_off(events);
        }

        // Rule 2: the latch releases only on an explicit command, and only
        // once everything has cooled clear of the threshold. A sensor bank
        // with nothing readable cannot confirm cooling, so it refuses too.
        if self.state == ControllerState::Overheated {
            let readable: Vec<f64> = frame
                .readings
                .values()
                .filter(|r| r.status == ReadingStatus::Ok)
                .filter_map(|r| r.value_c)
                .collect();
            let all_cooled = !readable.is_empty()
                && readable.iter().all(|t| *t <= params.boiling_c - CLEAR_MARGIN_C);
            if clear_requested && all_cooled {
                info!("emergency latch cleared by operator");
                events.push(self.transition(ControllerState::Standby, EventReason::ClearEmergency));
                self.latched = false;
                // First match wins: the released machine idles this tick and
                // re-evaluates from standby on the next frame.
                return self.all_off(events);
            }
            if clear_requested {
                warn!(
                    margin_c = CLEAR_MARGIN_C,
                    readable = readable.len(),
                    "clear_emergency refused: temperatures unreadable or still too close to boiling"
                );
            }
            return self.all_off(events);
        }

        // Test installations evaluate the full ladder but never get past
        // this point with live relays; the state reads Test throughout.
        if self.test_mode {
            self.state = ControllerState::Test;
            return self.all_off(events);
        }

        // Rule 3: manual override.
        if params.mode == Mode::Manual {
            if self.state != ControllerState::ManualOverride {
                events.push(self.transition(ControllerState::ManualOverride, EventReason::Manual));
            }
            self.pump_on = manual.pump.unwrap_or(false);
            self.heater_on = manual.heater.unwrap_or(false);
            return self.decision(events);
        }
        if self.state == ControllerState::ManualOverride {
            events.push(self.transition(ControllerState::Standby, EventReason::AutoResume));
        }

        // Unreadable-control tracking feeds the pump protection below.
        if collector.is_some() && tank_bottom.is_some() {
            self.unreadable_since = None;
        } else if self.unreadable_since.is_none() {
            self.unreadable_since = Some(wall);
        }
        let unreadable_too_long = self
            .unreadable_since
            .is_some_and(|since| wall - since > UNREADABLE_GRACE_S);

        // Rule 4: proactive collector cooling, regardless of dT. A matched
        // rule ends this tick's evaluation, so a cooling exit cannot fall
        // straight into a heating start on the same frame.
        if let Some(c) = collector {
            if c >= params.collector_cooling_c && self.state != ControllerState::CollectorCooling {
                events.push(self.transition(
                    ControllerState::CollectorCooling,
                    EventReason::CollectorCoolingIn,
                ));
                self.pump_on = true;
                self.heater_on = self.heater_decision(tank_top, params, wall);
                return self.decision(events);
            }
            if self.state == ControllerState::CollectorCooling {
                if c <= params.collector_cooling_c - params.hysteresis_c {
                    events.push(
                        self.transition(ControllerState::Standby, EventReason::CollectorCoolingOut),
                    );
                    self.pump_on = false;
                } else {
                    self.pump_on = true;
                }
                self.heater_on = self.heater_decision(tank_top, params, wall);
                return self.decision(events);
            }
        } else if self.state == ControllerState::CollectorCooling {
            if unreadable_too_long {
                warn!("collector unreadable while cooling, stopping pump");
                events.push(
                    self.transition(ControllerState::Standby, EventReason::CollectorCoolingOut),
                );
                self.pump_on = false;
            } else {
                self.pump_on = true;
            }
            self.heater_on = self.heater_decision(tank_top, params, wall);
            return self.decision(events);
        }

        // Rule 7: the first two frames only populate the rate rings.
        if self.state == ControllerState::Startup {
            if self.frames_seen > 2 {
                self.state = ControllerState::Standby;
            } else {
                return self.all_off(events);
            }
        }

        let (dt_start, dt_stop) = params.active_dt();
        let target = params.active_tank_target_c();

        match self.state {
            // Rule 5: unreadable control sensors inhibit starting a cycle;
            // `collector_dt_c` is only present when both ends read ok.
            ControllerState::Standby => {
                if let (Some(dt), Some(bottom)) = (derived.collector_dt_c, tank_bottom) {
                    if dt >= dt_start && bottom < target {
                        events.push(self.transition(ControllerState::Heating, EventReason::DtStart));
                    }
                }
            }
            // Rule 6: a running cycle ends on closed dT, reached target, or
            // a sustained loss of its controlling sensors.
            ControllerState::Heating => {
                if unreadable_too_long {
                    warn!(
                        grace_s = UNREADABLE_GRACE_S,
                        "control temperatures unreadable, stopping pump"
                    );
                    events.push(self.transition(ControllerState::Standby, EventReason::DtStop));
                } else if let (Some(dt), Some(bottom)) = (derived.collector_dt_c, tank_bottom) {
                    if dt <= dt_stop {
                        events.push(self.transition(ControllerState::Standby, EventReason::DtStop));
                    } else if bottom >= target + TARGET_EXIT_BIAS_C {
                        events.push(
                            self.transition(ControllerState::Standby, EventReason::TargetReached),
                        );
                    }
                }
            }
            _ => {}
        }

        self.pump_on =
            matches!(self.state, ControllerState::Heating | ControllerState::CollectorCooling);
        self.heater_on = self.heater_decision(tank_top, params, wall);
        self.decision(events)
    }

    /// Cartridge-heater floor: engage after a sustained dip below the floor,
    /// release a couple of degrees above it. No floor (or no readable tank
    /// top) means no heater.
    fn heater_decision(&mut self, tank_top: Option<f64>, params: &ControlParams, wall: i64) -> bool {
        let Some(floor) = params.active_heater_floor() else {
            self.heater_low_since = None;
            return false;
        };
        let Some(top) = tank_top else {
            self.heater_low_since = None;
            return false;
        };

        if self.heater_on {
            if top >= floor + HEATER_RELEASE_C {
                self.heater_low_since = None;
                false
            } else {
                true
            }
        } else if top < floor {
            let since = *self.heater_low_since.get_or_insert(wall);
            wall - since >= HEATER_QUALIFY_S
        } else {
            self.heater_low_since = None;
            false
        }
    }

    fn transition(&mut self, to: ControllerState, reason: EventReason) -> TransitionEvent {
        let event = TransitionEvent { from: self.state, to, reason };
        info!(from = ?event.from, to = ?event.to, reason = ?reason, "state transition");
        self.state = to;
        event
    }

    fn all_off(&mut self, events: Vec<TransitionEvent>) -> ControlDecision {
        self.pump_on = false;
        self.heater_on = false;
        self.decision(events)
    }

    fn decision(&self, events: Vec<TransitionEvent>) -> ControlDecision {
        ControlDecision {
            state: self.state,
            pump_on: self.pump_on,
            heater_on: self.heater_on,
            emergency_latched: self.latched,
            events,
        }
    }
}
