/// Inbound command adapter
///
/// Every message from the bus becomes a tagged `InboundCommand` or an
/// explicit rejection — nothing is silently ignored. Parsed commands sit in a
/// bounded FIFO until the engine drains them at the start of its next tick.
use std::collections::VecDeque;
use std::sync::Mutex;

use thiserror::Error;
use tracing::warn;

use crate::models::command::{InboundCommand, Mode, ParamChange, RateSmoothing, RateWindow, RelayId};

/// Queue bound; overflow evicts the oldest non-safety command.
const QUEUE_CAPACITY: usize = 64;

#[derive(Debug, Error, PartialEq)]
pub enum CommandError {
    #[error("unknown command topic '{0}'")]
    UnknownTopic(String),
    #[error("parameter '{0}' is not on the allowlist")]
    NotAllowed(String),
    #[error("bad value '{value}' for {what}")]
    BadValue { what: String, value: String },
    #[error("{name}={value} is out of range ({range})")]
    OutOfRange { name: String, value: f64, range: &'static str },
}

/// Whether a topic's payload is free-form text or must parse as JSON. The
/// control family is plain text by contract (`on`, `auto`, `7.5`), so a
/// non-JSON payload there is normal and must never draw a parse warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicClass {
    FreeForm,
    Json,
}

pub fn classify(suffix: &str) -> TopicClass {
    if suffix == "control" || suffix.starts_with("control/") {
        TopicClass::FreeForm
    } else {
        TopicClass::Json
    }
}

/// Parse a prefix-stripped topic plus payload into a command.
pub fn parse_inbound(suffix: &str, payload: &str) -> Result<InboundCommand, CommandError> {
    let payload = payload.trim();
    match suffix {
        "control/mode" => Mode::parse(payload)
            .map(InboundCommand::SetMode)
            .ok_or_else(|| CommandError::BadValue {
                what: "mode".to_string(),
                value: payload.to_string(),
            }),
        "control/pump" => parse_switch(payload)
            .map(|on| InboundCommand::SetManualRelay(RelayId::Pump, on))
            .ok_or_else(|| CommandError::BadValue {
                what: "pump switch".to_string(),
                value: payload.to_string(),
            }),
        "control/heater" => parse_switch(payload)
            .map(|on| InboundCommand::SetManualRelay(RelayId::Heater, on))
            .ok_or_else(|| CommandError::BadValue {
                what: "heater switch".to_string(),
                value: payload.to_string(),
            }),
        // Any payload clears; the controller still refuses while hot.
        "control/clear_emergency" => Ok(InboundCommand::ClearEmergency),
        "control/ping" => Ok(InboundCommand::Ping),
        other => match other.strip_prefix("control/param/") {
            Some(name) => parse_param(name, payload).map(InboundCommand::SetParam),
            None => Err(CommandError::UnknownTopic(suffix.to_string())),
        },
    }
}

fn parse_switch(payload: &str) -> Option<bool> {
    match payload.to_ascii_lowercase().as_str() {
        "on" | "true" | "1" => Some(true),
        "off" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_param(name: &str, payload: &str) -> Result<ParamChange, CommandError> {
    let numeric = |range: &'static str, lo: f64, hi: f64| -> Result<f64, CommandError> {
        let v: f64 = payload.parse().map_err(|_| CommandError::BadValue {
            what: format!("parameter {}", name),
            value: payload.to_string(),
        })?;
        if !v.is_finite() || v < lo || v > hi {
            return Err(CommandError::OutOfRange { name: name.to_string(), value: v, range });
        }
        Ok(v)
    };

    match name {
        "dT_start" => Ok(ParamChange::DtStart(numeric("0.5..50", 0.5, 50.0)?)),
        "dT_stop" => Ok(ParamChange::DtStop(numeric("0.1..50", 0.1, 50.0)?)),
        "tank_target_c" => Ok(ParamChange::TankTargetC(numeric("20..95", 20.0, 95.0)?)),
        "rate_window" => RateWindow::parse(payload)
            .map(ParamChange::RateWindow)
            .ok_or_else(|| CommandError::BadValue {
                what: "rate_window".to_string(),
                value: payload.to_string(),
            }),
        "rate_smoothing" => RateSmoothing::parse(payload)
            .map(ParamChange::RateSmoothing)
            .ok_or_else(|| CommandError::BadValue {
                what: "rate_smoothing".to_string(),
                value: payload.to_string(),
            }),
        "ema_alpha" => {
            let v = numeric("0..1 exclusive", f64::MIN_POSITIVE, 1.0)?;
            if v >= 1.0 {
                return Err(CommandError::OutOfRange {
                    name: name.to_string(),
                    value: v,
                    range: "0..1 exclusive",
                });
            }
            Ok(ParamChange::EmaAlpha(v))
        }
        _ => Err(CommandError::NotAllowed(name.to_string())),
    }
}

// ─── Bounded FIFO ────────────────────────────────────────────────────────────

/// Single producer (bus task), single consumer (tick task). The mutex guards
/// nothing but push/drain, both of which are a few pointer moves.
#[derive(Default)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<InboundCommand>>,
}

impl CommandQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue a command. On overflow the oldest non-safety entry is dropped
    /// so a `ClearEmergency` can never be pushed out by a flood of parameter
    /// tweaks.
    pub fn push(&self, command: InboundCommand) {
        let Ok(mut queue) = self.inner.lock() else {
            warn!(?command, "command queue lock unavailable, dropping command");
            return;
        };
        if queue.len() >= QUEUE_CAPACITY {
            let victim = queue.iter().position(|c| !c.is_safety());
            match victim {
                Some(i) => {
                    let dropped = queue.remove(i);
                    warn!(?dropped, "command queue full, dropping oldest non-safety command");
                }
                None => {
                    warn!("command queue full of safety commands, dropping incoming");
                    return;
                }
            }
        }
        queue.push_back(command);
    }

    /// Take everything queued, in arrival order. A poisoned queue reads as
    /// empty rather than taking the tick down with it.
    pub fn drain(&self) -> Vec<InboundCommand> {
        if let Ok(mut queue) = self.inner.lock() {
            queue.drain(..).collect()
        } else {
            Vec::new()
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|queue| queue.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
