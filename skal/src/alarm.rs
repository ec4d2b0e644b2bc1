//! Alarms
//!
//! An alarm is a named, severity-tagged notification raised by a worker.
//! Alarms travel as message attachments; the router keeps a deduplicated
//! live-alarm table keyed by `(origin, name)` and an `is_on = false` alarm
//! clears a previously-on entry.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::domain::{self, Name};
use crate::error::SkalError;

/// Alarm severity
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Important information
    Notice,
    /// Very important, near miss
    Warning,
    /// Something is broken somewhere
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Notice => "notice",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

impl FromStr for Severity {
    type Err = SkalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "notice" => Ok(Severity::Notice),
            "warning" => Ok(Severity::Warning),
            "error" => Ok(Severity::Error),
            other => Err(SkalError::format(format!("invalid alarm severity `{other}`"))),
        }
    }
}

/// A named, severity-tagged notification
///
/// Names starting with `skal-` are reserved for the framework.
#[derive(Debug, Clone, PartialEq)]
pub struct Alarm {
    name: String,
    severity: Severity,
    is_on: bool,
    auto_off: bool,
    note: String,
    origin: Name,
    timestamp: DateTime<Utc>,
}

impl Alarm {
    /// Create an alarm
    ///
    /// The origin is the calling worker's full name, or empty when raised
    /// outside any worker. `auto_off` is purely informational: it tells
    /// whether software (rather than a human) is expected to clear the
    /// alarm.
    pub fn new(
        name: impl Into<String>,
        severity: Severity,
        is_on: bool,
        auto_off: bool,
        note: impl Into<String>,
    ) -> Self {
        let name = name.into();
        debug_assert!(!name.is_empty());
        let origin = domain::current_worker().unwrap_or_else(|| Name::resolve(""));
        Self {
            name,
            severity,
            is_on,
            auto_off,
            note: note.into(),
            origin,
            timestamp: Utc::now(),
        }
    }

    /// Reassemble an alarm received from elsewhere, with every field given.
    pub fn from_parts(
        name: impl Into<String>,
        severity: Severity,
        is_on: bool,
        auto_off: bool,
        note: impl Into<String>,
        origin: Name,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            severity,
            is_on,
            auto_off,
            note: note.into(),
            origin,
            timestamp,
        }
    }

    /// Alarm name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Alarm severity
    pub fn severity(&self) -> Severity {
        self.severity
    }

    /// Whether the alarm is being raised (`true`) or cleared (`false`)
    pub fn is_on(&self) -> bool {
        self.is_on
    }

    /// Whether software is expected to clear this alarm
    pub fn auto_off(&self) -> bool {
        self.auto_off
    }

    /// Free-form, human-readable note
    pub fn note(&self) -> &str {
        &self.note
    }

    /// Full name of the worker that raised the alarm; empty if raised
    /// outside any worker
    pub fn origin(&self) -> &Name {
        &self.origin
    }

    /// When the alarm was raised
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

/// Raise an alarm process-wide
///
/// The alarm is forwarded to the router when one is installed, and logged
/// either way.
pub fn raise(alarm: Alarm) {
    match alarm.severity() {
        Severity::Notice => info!(
            alarm = alarm.name(),
            origin = %alarm.origin(),
            on = alarm.is_on(),
            "{}", alarm.note()
        ),
        _ => warn!(
            alarm = alarm.name(),
            origin = %alarm.origin(),
            on = alarm.is_on(),
            "{}", alarm.note()
        ),
    }
    if crate::router::is_installed() {
        let mut msg = crate::msg::Message::internal(
            domain::me(),
            Name::resolve(domain::ROUTER_NAME),
            crate::actions::ALARM,
        );
        msg.attach_alarm(alarm);
        crate::worker::send(msg);
    }
}
