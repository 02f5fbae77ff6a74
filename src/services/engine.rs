/// Engine loop
///
/// The single owner of hardware, state, and counters. One tick runs the
/// whole chain in order — drain commands, sample, derive, control, drive
/// relays, account, publish, heartbeat, persist — and nothing in that chain
/// is allowed to abort the tick: every failure becomes state or an alert.
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{Local, Utc};
use serde_json::json;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::{Config, ControlParams, DerivedConfig, TankConfig};
use crate::hardware::HardwareIO;
use crate::models::command::{
    EventReason, InboundCommand, ManualOverride, Mode, ParamChange, RelayCommand, RelayId,
};
use crate::models::telemetry::{Heartbeat, ReadingFrame};
use crate::services::advisor::TaskAdvisor;
use crate::services::bus::BusHandle;
use crate::services::commands::CommandQueue;
use crate::services::controller::{ControlDecision, Controller, ControllerState};
use crate::services::derivations::DerivationEngine;
use crate::services::op_state::{OperationalState, StateStore};
use crate::services::publisher::{AlertSeverity, OutboundMessage, Publisher};
use crate::services::sampler::Sampler;

/// Relay write deadline; expiry counts as a failed attempt.
const RELAY_DEADLINE: Duration = Duration::from_secs(2);

/// Consecutive persistence failures before escalating to an alert.
const STORE_FAILURES_BEFORE_ALERT: u32 = 3;

pub struct Engine {
    params: ControlParams,
    tank: TankConfig,
    derived_cfg: DerivedConfig,
    preserve_manual_on_shutdown: bool,
    persist_every: Duration,

    hw: Box<dyn HardwareIO>,
    sampler: Sampler,
    derivations: DerivationEngine,
    controller: Controller,
    op_state: OperationalState,
    store: StateStore,
    publisher: Publisher,
    commands: Arc<CommandQueue>,
    bus: BusHandle,
    advisor: Arc<dyn TaskAdvisor>,

    started: Instant,
    /// Last state actually written to each relay; writes happen only on
    /// change.
    relay_known: HashMap<RelayId, bool>,
    last_persist: Instant,
    store_failures: u32,
    /// Set when a safety-off relay write keeps failing; forces the reported
    /// emergency latch until a write succeeds again.
    actuator_degraded: bool,
}

impl Engine {
    pub fn new(
        config: &Config,
        hw: Box<dyn HardwareIO>,
        commands: Arc<CommandQueue>,
        bus: BusHandle,
        advisor: Arc<dyn TaskAdvisor>,
    ) -> Self {
        let store = StateStore::new(config.storage.path.clone());
        let op_state = store.load(Local::now().date_naive(), config.control.mode);
        let mut params = config.control_params();
        // The persisted mode wins over the configured initial mode.
        params.mode = op_state.mode;
        let controller = Controller::new(config.control.test_mode, op_state.emergency_latched);

        Self {
            params,
            tank: config.tank.clone(),
            derived_cfg: config.derived.clone(),
            preserve_manual_on_shutdown: config.control.preserve_manual_on_shutdown,
            persist_every: Duration::from_secs(config.storage.persist_every_s),
            hw,
            sampler: Sampler::new(config.channels.clone(), config.sample_period_s),
            derivations: DerivationEngine::new(),
            controller,
            op_state,
            store,
            publisher: Publisher::new(&config.bus.topic_prefix, &config.bus.discovery_prefix),
            commands,
            bus,
            advisor,
            started: Instant::now(),
            relay_known: HashMap::new(),
            last_persist: Instant::now(),
            store_failures: 0,
            actuator_degraded: false,
        }
    }

    /// Run until the shutdown signal flips, then wind down cleanly.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            period_s = self.params.sample_period_s,
            mode = ?self.params.mode,
            channels = self.sampler.channels().len(),
            "engine started"
        );
        self.bus.send(self.publisher.availability(true));
        self.bus
            .send_all(self.publisher.discovery_messages(self.sampler.channels()));

        let mut ticker =
            tokio::time::interval(Duration::from_secs(self.params.sample_period_s.max(1)));
        // A late tick schedules the next one from now rather than bursting to
        // catch up, keeping the cadence drift-free.
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                result = shutdown.changed() => {
                    if result.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        self.shutdown().await;
    }

    pub(crate) async fn tick(&mut self) {
        let wall = Utc::now().timestamp();

        // 1. Commands drained first so their effects land in this tick.
        let clear_requested = self.apply_commands(wall);

        // 2–3. One frame, then the pure pipeline over it.
        let t_mono_ns = self.started.elapsed().as_nanos() as u64;
        let frame = self.sampler.sample(&mut *self.hw, t_mono_ns, wall).await;
        let derived = self.derivations.compute(
            &frame,
            self.sampler.channels(),
            &self.params,
            &self.tank,
            &self.derived_cfg,
        );

        // 4. Control decision.
        let decision = self.controller.evaluate(
            &frame,
            self.sampler.channels(),
            &derived,
            &self.params,
            &self.op_state.manual_override,
            clear_requested,
        );

        // 5. Relays, change-driven.
        let reason = decision
            .events
            .last()
            .map(|e| e.reason.as_str().to_string())
            .unwrap_or_else(|| format!("{:?}", decision.state).to_lowercase());
        for command in [
            RelayCommand { id: RelayId::Pump, desired: decision.pump_on, reason: reason.clone() },
            RelayCommand { id: RelayId::Heater, desired: decision.heater_on, reason: reason.clone() },
        ] {
            self.apply_relay(&command, wall).await;
        }

        // 6. Transition bookkeeping and alerts.
        self.process_events(&decision, &frame, wall);

        // 7. Counters, midnight roll, latch aggregation.
        self.op_state
            .tick_update(decision.pump_on, derived.energy_rate_kw, self.params.sample_period_s);
        let rolled = self.op_state.roll_midnight_if_needed(Local::now().date_naive());
        self.op_state.mode = self.params.mode;
        self.op_state.emergency_latched = decision.emergency_latched || self.actuator_degraded;

        // 8. Temperature warn band.
        self.warn_band_alerts(&frame, wall);

        // 9. Publications for this frame.
        self.bus.send_all(self.publisher.frame_messages(&frame));
        self.bus.send_all(self.publisher.derived_messages(&derived, wall));
        self.bus.send(self.publisher.system_status(
            self.params.mode,
            decision.pump_on,
            decision.heater_on,
            self.op_state.emergency_latched,
            derived.sensor_health_pct,
            self.started.elapsed().as_secs(),
            false,
        ));
        self.bus.send(self.publisher.heartbeat(&self.heartbeat(&frame, &decision, wall)));

        // 10. Persist on transitions, otherwise on the slow cadence.
        if !decision.events.is_empty() || rolled || self.last_persist.elapsed() >= self.persist_every
        {
            self.persist(wall).await;
        }
    }

    // ── Commands ────────────────────────────────────────────────────────────

    /// Drain the FIFO; returns whether a `ClearEmergency` arrived.
    fn apply_commands(&mut self, wall: i64) -> bool {
        let mut clear_requested = false;
        for command in self.commands.drain() {
            match command {
                InboundCommand::SetMode(mode) => {
                    info!(?mode, "mode change requested");
                    self.params.mode = mode;
                    if mode != Mode::Manual {
                        // Overrides are meaningless outside manual; drop them
                        // so a later manual entry starts neutral.
                        self.op_state.manual_override = ManualOverride::default();
                    }
                }
                InboundCommand::SetManualRelay(relay, on) => {
                    if self.params.mode == Mode::Manual {
                        match relay {
                            RelayId::Pump => self.op_state.manual_override.pump = Some(on),
                            RelayId::Heater => self.op_state.manual_override.heater = Some(on),
                        }
                    } else {
                        self.nack(wall, &format!("{:?} override only honored in manual mode", relay));
                    }
                }
                InboundCommand::SetParam(change) => self.apply_param(change, wall),
                InboundCommand::ClearEmergency => clear_requested = true,
                InboundCommand::Ping => debug!("ping"),
            }
        }
        clear_requested
    }

    /// Single-value range checks happened at parse time; this enforces the
    /// cross-field invariants before anything takes effect.
    fn apply_param(&mut self, change: ParamChange, wall: i64) {
        let mut candidate = self.params.clone();
        candidate.apply(change);

        let violation = if candidate.dt_stop >= candidate.dt_start {
            Some("dT_stop must stay below dT_start")
        } else if candidate.tank_target_c <= candidate.temp_low_warn_c
            || candidate.tank_target_c >= candidate.temp_high_warn_c
        {
            Some("tank_target_c must stay inside the warn band")
        } else {
            None
        };

        match violation {
            Some(reason) => self.nack(wall, &format!("{:?} rejected: {}", change, reason)),
            None => {
                info!(?change, "parameter updated");
                self.params = candidate;
            }
        }
    }

    fn nack(&mut self, wall: i64, detail: &str) {
        warn!(detail, "command not applied");
        if let Some(msg) = self.publisher.alert("command", AlertSeverity::Warning, wall, detail) {
            self.bus.send(msg);
        }
    }

    // ── Relays ──────────────────────────────────────────────────────────────

    /// Write a relay only when its desired state differs from the last state
    /// known to be applied. One immediate retry; a failing safety-off
    /// additionally degrades into a forced emergency latch.
    async fn apply_relay(&mut self, command: &RelayCommand, wall: i64) {
        if self.relay_known.get(&command.id) == Some(&command.desired) {
            return;
        }

        let mut attempt = self.write_relay(command.id, command.desired).await;
        if attempt.is_err() {
            attempt = self.write_relay(command.id, command.desired).await;
        }

        match attempt {
            Ok(()) => {
                self.relay_known.insert(command.id, command.desired);
                if self.actuator_degraded {
                    info!(relay = ?command.id, "actuator recovered");
                    self.actuator_degraded = false;
                }
                self.bus.send(self.publisher.pump_status(
                    command.id == RelayId::Heater,
                    command.desired,
                    wall,
                    &command.reason,
                ));
            }
            Err(detail) => {
                self.relay_known.remove(&command.id);
                if !command.desired {
                    self.actuator_degraded = true;
                }
                if let Some(msg) =
                    self.publisher.alert("actuator", AlertSeverity::Critical, wall, &detail)
                {
                    self.bus.send(msg);
                }
            }
        }
    }

    async fn write_relay(&mut self, relay: RelayId, on: bool) -> Result<(), String> {
        match tokio::time::timeout(RELAY_DEADLINE, self.hw.set_relay(relay, on)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("relay {:?} write deadline exceeded", relay)),
        }
    }

    // ── Events ──────────────────────────────────────────────────────────────

    fn process_events(&mut self, decision: &ControlDecision, frame: &ReadingFrame, wall: i64) {
        for event in &decision.events {
            match event.reason {
                EventReason::DtStart => {
                    self.op_state.heating_cycles += 1;
                    self.op_state.last_pump_start = Some(wall);
                }
                EventReason::DtStop | EventReason::TargetReached
                    if event.from == ControllerState::Heating =>
                {
                    if let Some(start) = self.op_state.last_pump_start {
                        self.op_state.last_cycle_duration_s = (wall - start).max(0) as u64;
                    }
                }
                EventReason::Overheat => self.consult_advisor(frame, wall),
                _ => {}
            }

            let severity = match event.reason {
                EventReason::Overheat => AlertSeverity::Critical,
                EventReason::CollectorCoolingIn | EventReason::CollectorCoolingOut => {
                    AlertSeverity::Warning
                }
                _ => AlertSeverity::Info,
            };
            let detail = format!("{:?} -> {:?}", event.from, event.to);
            if let Some(msg) = self.publisher.alert(event.reason.as_str(), severity, wall, &detail)
            {
                self.bus.send(msg);
            }
        }
    }

    /// Fire-and-forget: the advisor may comment on an emergency, the tick
    /// never waits for it.
    fn consult_advisor(&self, frame: &ReadingFrame, wall: i64) {
        let advisor = self.advisor.clone();
        let bus = self.bus.clone();
        let topic = self.publisher.alert_topic("advisor");
        let context = json!({
            "wall": frame.wall,
            "readings": frame
                .readings
                .iter()
                .map(|(id, r)| (id.clone(), json!({ "value_c": r.value_c, "status": r.status })))
                .collect::<serde_json::Map<_, _>>(),
        });
        tokio::spawn(async move {
            if let Some(rec) = advisor.propose("overheat_review", &context).await {
                bus.send(OutboundMessage {
                    topic,
                    payload: json!({
                        "kind": "ADVISOR",
                        "severity": "INFO",
                        "wall": wall,
                        "detail": rec.summary,
                    })
                    .to_string(),
                    retained: false,
                });
            }
        });
    }

    // ── Alerts ──────────────────────────────────────────────────────────────

    fn warn_band_alerts(&mut self, frame: &ReadingFrame, wall: i64) {
        let channels = self.sampler.channels();
        let levels = frame.tank_levels(channels);
        if let Some(hottest) = levels.iter().flatten().copied().fold(None, |acc: Option<f64>, t| {
            Some(acc.map_or(t, |a| a.max(t)))
        }) {
            if hottest >= self.params.temp_high_warn_c {
                let detail = format!("tank at {:.1} °C", hottest);
                if let Some(msg) =
                    self.publisher.alert("temp_high", AlertSeverity::Warning, wall, &detail)
                {
                    self.bus.send(msg);
                }
            }
        }
        if let Some(top) = frame.tank_top_c(channels) {
            if top < self.params.temp_low_warn_c {
                let detail = format!("tank top at {:.1} °C", top);
                if let Some(msg) =
                    self.publisher.alert("temp_low", AlertSeverity::Warning, wall, &detail)
                {
                    self.bus.send(msg);
                }
            }
        }
    }

    // ── Heartbeat / persistence / shutdown ──────────────────────────────────

    fn heartbeat(&self, frame: &ReadingFrame, decision: &ControlDecision, wall: i64) -> Heartbeat {
        Heartbeat {
            alive: true,
            wall,
            uptime_s: self.started.elapsed().as_secs(),
            mode: self.params.mode,
            pump_on: decision.pump_on,
            heater_on: decision.heater_on,
            sensor_count: frame.readings.len(),
            last_frame_age_s: (Utc::now().timestamp() - frame.wall).max(0) as u64,
            emergency_latched: self.op_state.emergency_latched,
        }
    }

    async fn persist(&mut self, wall: i64) {
        match self.store.save(&self.op_state).await {
            Ok(()) => {
                self.store_failures = 0;
                self.last_persist = Instant::now();
            }
            Err(e) => {
                self.store_failures += 1;
                warn!(error = %e, failures = self.store_failures, "state persistence failed");
                if self.store_failures == STORE_FAILURES_BEFORE_ALERT {
                    if let Some(msg) = self.publisher.alert(
                        "persistence",
                        AlertSeverity::Warning,
                        wall,
                        &e.to_string(),
                    ) {
                        self.bus.send(msg);
                    }
                }
            }
        }
    }

    async fn shutdown(&mut self) {
        let wall = Utc::now().timestamp();
        let keep_relays =
            self.preserve_manual_on_shutdown && self.params.mode == Mode::Manual;
        info!(keep_relays, "engine shutting down");

        if !keep_relays {
            for relay in [RelayId::Pump, RelayId::Heater] {
                let command = RelayCommand {
                    id: relay,
                    desired: false,
                    reason: "shutdown".to_string(),
                };
                self.apply_relay(&command, wall).await;
            }
        }

        self.persist(wall).await;
        self.bus.send(self.publisher.system_status(
            self.params.mode,
            false,
            false,
            self.op_state.emergency_latched,
            0.0,
            self.started.elapsed().as_secs(),
            true,
        ));
        info!("engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    use crate::hardware::HardwareError;
    use crate::models::telemetry::Channel;
    use crate::services::advisor::NoAdvisor;
    use crate::services::bus;

    /// Fixed-temperature hardware that counts relay writes.
    struct FixedHardware {
        collector_c: f64,
        tank_c: f64,
        relay_writes: Arc<AtomicUsize>,
        fail_relays: bool,
    }

    #[async_trait]
    impl HardwareIO for FixedHardware {
        async fn read_temp(
            &mut self,
            channel: &Channel,
            _wall: i64,
        ) -> Result<Option<f64>, HardwareError> {
            use crate::models::telemetry::ChannelRole;
            Ok(Some(match channel.role {
                ChannelRole::Collector => self.collector_c,
                ChannelRole::TankLevel(_) => self.tank_c,
                _ => 20.0,
            }))
        }

        async fn set_relay(&mut self, relay: RelayId, _on: bool) -> Result<(), HardwareError> {
            self.relay_writes.fetch_add(1, Ordering::SeqCst);
            if self.fail_relays {
                Err(HardwareError::RelayFailed { relay, reason: "stuck".to_string() })
            } else {
                Ok(())
            }
        }
    }

    fn test_engine(
        collector_c: f64,
        tank_c: f64,
        fail_relays: bool,
    ) -> (Engine, mpsc::Receiver<OutboundMessage>, Arc<AtomicUsize>) {
        let mut config = Config::default();
        config.simulation = true;
        config.storage.path = std::env::temp_dir()
            .join(format!("engine-test-{}.json", uuid::Uuid::new_v4()))
            .display()
            .to_string();

        let writes = Arc::new(AtomicUsize::new(0));
        let hw = Box::new(FixedHardware {
            collector_c,
            tank_c,
            relay_writes: writes.clone(),
            fail_relays,
        });
        let (handle, rx) = bus::pair(4096);
        let engine = Engine::new(
            &config,
            hw,
            Arc::new(CommandQueue::new()),
            handle,
            Arc::new(NoAdvisor),
        );
        (engine, rx, writes)
    }

    fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<OutboundMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    #[tokio::test]
    async fn exactly_one_heartbeat_per_tick() {
        let (mut engine, mut rx, _) = test_engine(20.0, 40.0, false);
        engine.tick().await;
        let first: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|m| m.topic.ends_with("/heartbeat"))
            .collect();
        assert_eq!(first.len(), 1);
        assert!(!first[0].retained);

        engine.tick().await;
        let second: Vec<_> = drain(&mut rx)
            .into_iter()
            .filter(|m| m.topic.ends_with("/heartbeat"))
            .collect();
        assert_eq!(second.len(), 1, "each tick emits exactly one heartbeat");
    }

    #[tokio::test]
    async fn relay_writes_only_on_change() {
        let (mut engine, _rx, writes) = test_engine(20.0, 40.0, false);
        engine.tick().await;
        // First tick establishes known state for both relays.
        assert_eq!(writes.load(Ordering::SeqCst), 2);
        engine.tick().await;
        engine.tick().await;
        assert_eq!(
            writes.load(Ordering::SeqCst),
            2,
            "unchanged desired state must not rewrite relays"
        );
    }

    #[tokio::test]
    async fn overheat_tick_ends_safe_and_latched() {
        let (mut engine, mut rx, _) = test_engine(151.0, 60.0, false);
        engine.tick().await;
        assert!(engine.op_state.emergency_latched);
        let msgs = drain(&mut rx);
        assert!(
            msgs.iter().any(|m| m.topic.ends_with("/alerts/OVERHEAT")),
            "an overheat alert must be published"
        );
        let hb = msgs.iter().find(|m| m.topic.ends_with("/heartbeat")).unwrap();
        let v: serde_json::Value = serde_json::from_str(&hb.payload).unwrap();
        assert_eq!(v["pump_on"], false);
        assert_eq!(v["heater_on"], false);
        assert_eq!(v["emergency_latched"], true);
    }

    #[tokio::test]
    async fn mode_command_applies_before_the_controller_runs() {
        let (mut engine, _rx, _) = test_engine(20.0, 40.0, false);
        engine.commands.push(InboundCommand::SetMode(Mode::Eco));
        engine.tick().await;
        assert_eq!(engine.params.mode, Mode::Eco);
        assert_eq!(engine.op_state.mode, Mode::Eco, "the persisted record follows");
    }

    #[tokio::test]
    async fn cross_field_param_violation_is_nacked() {
        let (mut engine, mut rx, _) = test_engine(20.0, 40.0, false);
        // dT_stop 9 would invert the hysteresis pair (start is 8).
        engine.commands.push(InboundCommand::SetParam(ParamChange::DtStop(9.0)));
        engine.tick().await;
        assert_eq!(engine.params.dt_stop, 4.0, "the bad value must not apply");
        let msgs = drain(&mut rx);
        assert!(
            msgs.iter().any(|m| m.topic.ends_with("/alerts/command")),
            "a nack alert must be published"
        );
    }

    #[tokio::test]
    async fn manual_relay_outside_manual_mode_is_rejected() {
        let (mut engine, mut rx, _) = test_engine(20.0, 40.0, false);
        engine.commands.push(InboundCommand::SetManualRelay(RelayId::Pump, true));
        engine.tick().await;
        assert_eq!(engine.op_state.manual_override, ManualOverride::default());
        let msgs = drain(&mut rx);
        assert!(msgs.iter().any(|m| m.topic.ends_with("/alerts/command")));
    }

    #[tokio::test]
    async fn failing_safety_off_forces_the_latch() {
        let (mut engine, _rx, _) = test_engine(20.0, 40.0, true);
        engine.tick().await;
        // Both relays want off at startup; the writes fail, so the engine
        // must report the emergency latch.
        assert!(engine.actuator_degraded);
        assert!(engine.op_state.emergency_latched);
    }

    #[tokio::test]
    async fn same_command_twice_is_idempotent() {
        let (mut engine, _rx, _) = test_engine(20.0, 40.0, false);
        engine.commands.push(InboundCommand::SetMode(Mode::Manual));
        engine.commands.push(InboundCommand::SetMode(Mode::Manual));
        engine.tick().await;
        let once = (engine.params.mode, engine.op_state.manual_override);
        engine.commands.push(InboundCommand::SetMode(Mode::Manual));
        engine.tick().await;
        assert_eq!((engine.params.mode, engine.op_state.manual_override), once);
    }
}
