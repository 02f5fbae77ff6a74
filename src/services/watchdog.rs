/// Heartbeat & watchdog supervisor
///
/// Runs beside the engine with its own bus connection, so a wedged tick task
/// cannot take its supervisor down with it. Three probe channels: heartbeat
/// freshness on the bus, TCP reachability of configured hosts, and process
/// liveness via the service manager. Three consecutive failures of one
/// channel raise an alert; sustained ill health may request a restart.
use std::collections::HashMap;
use std::time::{Duration, Instant};

use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::config::{BusConfig, WatchdogConfig};
use crate::models::telemetry::Heartbeat;
use crate::services::publisher::{AlertThrottle, Publisher};

/// Consecutive failures of one channel before an alert goes out.
const FAILURES_BEFORE_ALERT: u32 = 3;

/// Consecutive catastrophic passes (heartbeat gone and nothing reachable)
/// before a restart may be requested.
const CATASTROPHIC_STREAK_FOR_RESTART: u32 = 3;

/// TCP probe deadline per host.
const PROBE_DEADLINE: Duration = Duration::from_secs(2);

/// Pure bookkeeping behind the watchdog loop: failure streaks, alert
/// throttling, and the restart decision.
struct Monitor {
    config: WatchdogConfig,
    last_heartbeat: Option<Instant>,
    failures: HashMap<String, u32>,
    throttle: AlertThrottle,
    last_healthy: Instant,
    catastrophic_streak: u32,
}

/// Outcome of one check pass.
struct Verdict {
    alerts: Vec<String>,
    restart_due: bool,
}

impl Monitor {
    fn new(config: WatchdogConfig, now: Instant) -> Self {
        Self {
            config,
            last_heartbeat: None,
            failures: HashMap::new(),
            throttle: AlertThrottle::default(),
            last_healthy: now,
            catastrophic_streak: 0,
        }
    }

    fn note_heartbeat(&mut self, now: Instant) {
        self.last_heartbeat = Some(now);
    }

    fn heartbeat_fresh(&self, now: Instant) -> bool {
        self.last_heartbeat
            .is_some_and(|t| now.duration_since(t).as_secs() <= self.config.stale_after_s)
    }

    /// Record one channel result; returns an alert detail when the failure
    /// streak crosses the threshold and the throttle lets it through.
    fn record(&mut self, channel: &str, ok: bool, wall: i64) -> Option<String> {
        if ok {
            if self.failures.remove(channel).is_some_and(|n| n >= FAILURES_BEFORE_ALERT) {
                info!(channel, "watchdog channel recovered");
            }
            return None;
        }
        let count = self.failures.entry(channel.to_string()).or_insert(0);
        *count += 1;
        if *count >= FAILURES_BEFORE_ALERT && self.throttle.allow(channel, wall) {
            Some(format!("{} failed {} consecutive checks", channel, count))
        } else {
            None
        }
    }

    /// Close a pass: update overall health and decide on a restart.
    fn conclude(&mut self, now: Instant, heartbeat_ok: bool, pings: &[bool], service_ok: bool) -> bool {
        let all_ok = heartbeat_ok && service_ok && pings.iter().all(|p| *p);
        if all_ok {
            self.last_healthy = now;
            self.catastrophic_streak = 0;
            return false;
        }

        let nothing_reachable = !pings.is_empty() && pings.iter().all(|p| !p);
        if !heartbeat_ok && (pings.is_empty() || nothing_reachable) {
            self.catastrophic_streak += 1;
        } else {
            self.catastrophic_streak = 0;
        }

        let too_old =
            now.duration_since(self.last_healthy).as_secs() >= self.config.max_health_age_s;
        self.config.allow_restart
            && self.config.service_name.is_some()
            && (too_old || self.catastrophic_streak >= CATASTROPHIC_STREAK_FOR_RESTART)
    }
}

pub async fn run(config: WatchdogConfig, bus: BusConfig, mut shutdown: watch::Receiver<bool>) {
    if !config.enabled {
        info!("watchdog disabled by configuration");
        return;
    }

    let publisher = Publisher::new(&bus.topic_prefix, &bus.discovery_prefix);
    let heartbeat_topic = publisher.heartbeat_topic();
    let check_period = Duration::from_secs(config.check_period_s.max(1));
    let mut monitor = Monitor::new(config.clone(), Instant::now());

    let client_id = format!("solar-heating-watchdog-{}", uuid::Uuid::new_v4());
    let mut options = MqttOptions::new(&client_id, &bus.host, bus.port);
    options.set_keep_alive(Duration::from_secs(30));
    options.set_clean_session(true);
    if let (Some(user), Some(pass)) = (&bus.user, &bus.pass) {
        options.set_credentials(user, pass);
    }
    let (client, mut eventloop) = AsyncClient::new(options, 16);

    let mut ticker = tokio::time::interval(check_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(
        check_period_s = config.check_period_s,
        stale_after_s = config.stale_after_s,
        hosts = config.ping_hosts.len(),
        "watchdog started"
    );

    loop {
        tokio::select! {
            result = shutdown.changed() => {
                if result.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            event = eventloop.poll() => {
                match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        if let Err(e) =
                            client.subscribe(heartbeat_topic.clone(), QoS::AtMostOnce).await
                        {
                            warn!(error = %e, "heartbeat subscription failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(p))) if p.topic == heartbeat_topic => {
                        if serde_json::from_slice::<Heartbeat>(&p.payload).is_ok() {
                            monitor.note_heartbeat(Instant::now());
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "watchdog bus error");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
            _ = ticker.tick() => {
                let verdict = check_pass(&mut monitor).await;
                for detail in &verdict.alerts {
                    warn!(detail, "watchdog alert");
                    let payload = serde_json::json!({
                        "kind": "WATCHDOG",
                        "severity": "CRITICAL",
                        "wall": chrono::Utc::now().timestamp(),
                        "detail": detail,
                    });
                    let _ = client
                        .publish(publisher.alert_topic("watchdog"), QoS::AtLeastOnce, false, payload.to_string())
                        .await;
                }
                if verdict.restart_due {
                    request_restart(&monitor.config).await;
                }
            }
        }
    }
    info!("watchdog stopped");
}

/// One full probe pass over every channel.
async fn check_pass(monitor: &mut Monitor) -> Verdict {
    let now = Instant::now();
    let wall = chrono::Utc::now().timestamp();
    let mut alerts = Vec::new();

    let heartbeat_ok = monitor.heartbeat_fresh(now);
    if let Some(detail) = monitor.record("heartbeat", heartbeat_ok, wall) {
        alerts.push(detail);
    }

    let hosts = monitor.config.ping_hosts.clone();
    let mut pings = Vec::with_capacity(hosts.len());
    for host in &hosts {
        let ok = probe_host(host).await;
        pings.push(ok);
        if let Some(detail) = monitor.record(&format!("ping:{}", host), ok, wall) {
            alerts.push(detail);
        }
    }

    let service_ok = match &monitor.config.service_name {
        Some(unit) => service_alive(unit).await,
        None => true,
    };
    if monitor.config.service_name.is_some() {
        if let Some(detail) = monitor.record("service", service_ok, wall) {
            alerts.push(detail);
        }
    }

    let restart_due = monitor.conclude(now, heartbeat_ok, &pings, service_ok);
    Verdict { alerts, restart_due }
}

async fn probe_host(host: &str) -> bool {
    matches!(
        tokio::time::timeout(PROBE_DEADLINE, TcpStream::connect(host)).await,
        Ok(Ok(_))
    )
}

async fn service_alive(unit: &str) -> bool {
    tokio::process::Command::new("systemctl")
        .args(["is-active", "--quiet", unit])
        .status()
        .await
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn request_restart(config: &WatchdogConfig) {
    let Some(unit) = &config.service_name else {
        return;
    };
    error!(unit, "watchdog requesting service restart");
    match tokio::process::Command::new("systemctl")
        .args(["restart", unit])
        .status()
        .await
    {
        Ok(status) if status.success() => info!(unit, "restart requested"),
        Ok(status) => error!(unit, code = ?status.code(), "restart request failed"),
        Err(e) => error!(unit, error = %e, "could not reach the service manager"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> WatchdogConfig {
        WatchdogConfig {
            enabled: true,
            ping_hosts: vec!["192.0.2.1:9".to_string()],
            check_period_s: 30,
            stale_after_s: 60,
            service_name: Some("solar-heating".to_string()),
            allow_restart: true,
            max_health_age_s: 86_400,
        }
    }

    #[test]
    fn heartbeat_freshness_tracks_the_stale_window() {
        let now = Instant::now();
        let mut monitor = Monitor::new(config(), now);
        assert!(!monitor.heartbeat_fresh(now), "no heartbeat yet means not fresh");

        monitor.note_heartbeat(now);
        assert!(monitor.heartbeat_fresh(now + Duration::from_secs(59)));
        assert!(!monitor.heartbeat_fresh(now + Duration::from_secs(61)));
    }

    #[test]
    fn three_consecutive_failures_alert_once() {
        let now = Instant::now();
        let mut monitor = Monitor::new(config(), now);
        assert!(monitor.record("heartbeat", false, 0).is_none());
        assert!(monitor.record("heartbeat", false, 30).is_none());
        assert!(
            monitor.record("heartbeat", false, 60).is_some(),
            "the third failure crosses the threshold"
        );
        // Within the five-minute throttle: silent even though still failing.
        assert!(monitor.record("heartbeat", false, 90).is_none());
        // Past the throttle it may fire again.
        assert!(monitor.record("heartbeat", false, 60 + 300).is_some());
    }

    #[test]
    fn recovery_resets_the_streak() {
        let now = Instant::now();
        let mut monitor = Monitor::new(config(), now);
        monitor.record("ping:a", false, 0);
        monitor.record("ping:a", false, 30);
        monitor.record("ping:a", true, 60);
        assert!(
            monitor.record("ping:a", false, 90).is_none(),
            "the streak restarts after a success"
        );
    }

    #[test]
    fn catastrophic_streak_requests_restart() {
        let now = Instant::now();
        let mut monitor = Monitor::new(config(), now);
        assert!(!monitor.conclude(now, false, &[false], true));
        assert!(!monitor.conclude(now, false, &[false], true));
        assert!(
            monitor.conclude(now, false, &[false], true),
            "three catastrophic passes in a row may restart"
        );
    }

    #[test]
    fn partial_failures_do_not_restart() {
        let now = Instant::now();
        let mut monitor = Monitor::new(config(), now);
        for _ in 0..5 {
            // Heartbeat gone but the network is reachable: degraded, not
            // catastrophic.
            assert!(!monitor.conclude(now, false, &[true], true));
        }
    }

    #[test]
    fn restart_needs_the_config_opt_in() {
        let now = Instant::now();
        let mut cfg = config();
        cfg.allow_restart = false;
        let mut monitor = Monitor::new(cfg, now);
        for _ in 0..5 {
            assert!(!monitor.conclude(now, false, &[false], true));
        }
    }

    #[test]
    fn stale_health_eventually_requests_restart() {
        let now = Instant::now();
        let mut cfg = config();
        cfg.max_health_age_s = 0;
        let mut monitor = Monitor::new(cfg, now);
        assert!(
            monitor.conclude(now, false, &[true], true),
            "with a zero max age any unhealthy pass is overdue"
        );
    }
}
