//! Conversion of a day of hourly cumulative readings into backdated states.
//!
//! `ImportMode::Cumulative` replays the raw meter totals,
//! `ImportMode::Delta` the hourly consumption derived from them.
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tracing::{debug, warn};

use crate::readings::{Classification, Delta, PublishedState, Reading};

pub const HISTORY_SOURCE: &str = "fwmyh2o_history";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Re-emit each reading unmodified as a cumulative point.
    Cumulative,
    /// Emit the non-negative difference between consecutive readings.
    Delta,
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportMode::Cumulative => write!(f, "cumulative"),
            ImportMode::Delta => write!(f, "delta"),
        }
    }
}

impl FromStr for ImportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "cumulative" => Ok(ImportMode::Cumulative),
            "delta" | "deltas" | "hourly" => Ok(ImportMode::Delta),
            other => Err(format!(
                "unknown import mode '{other}' (expected 'cumulative' or 'delta')"
            )),
        }
    }
}

/// Sorts readings chronologically and drops the incomplete ones.
///
/// The sort is stable, so readings sharing a timestamp keep their input order.
fn sorted_valid(readings: Vec<Reading>) -> Vec<(DateTime<Tz>, f64)> {
    let mut sorted = readings;
    sorted.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));

    sorted
        .into_iter()
        .filter_map(|r| match (&r.timestamp, r.cumulative) {
            (Some(ts), Some(cum)) if cum.is_finite() => Some((*ts, cum)),
            _ => {
                warn!(reading = ?r, "Skipping invalid reading");
                None
            }
        })
        .collect()
}

/// Derives hourly consumption from cumulative readings.
///
/// The first reading has no baseline and yields its raw cumulative value.
/// A decrease (rollover or bad data) yields zero, never a negative value,
/// and so does a negative first reading.
pub fn derive_deltas(readings: Vec<Reading>) -> Vec<Delta> {
    let mut previous: Option<f64> = None;
    let mut deltas = Vec::new();

    for (timestamp, cumulative) in sorted_valid(readings) {
        let delta = match previous {
            None => cumulative,
            Some(prev) => cumulative - prev,
        };
        let value = if delta < 0.0 {
            warn!(
                at = %timestamp.to_rfc3339(),
                prev = ?previous,
                curr = cumulative,
                "Negative delta detected; clamping to 0"
            );
            0.0
        } else {
            delta
        };
        previous = Some(cumulative);
        deltas.push(Delta { timestamp, value });
    }

    deltas
}

/// Rounds to six decimal places to keep float noise out of the host.
fn round6(value: f64) -> f64 {
    (value * 1_000_000.0).round() / 1_000_000.0
}

/// Builds the backdated states to publish for `entity_id`.
///
/// Output is in ascending timestamp order, every timestamp converted to UTC.
pub fn to_published_states(
    entity_id: &str,
    readings: Vec<Reading>,
    mode: ImportMode,
) -> Vec<PublishedState> {
    if readings.is_empty() {
        debug!(entity_id, "No readings to import");
        return Vec::new();
    }

    let states: Vec<PublishedState> = match mode {
        ImportMode::Cumulative => sorted_valid(readings)
            .into_iter()
            .map(|(ts, cumulative)| {
                PublishedState::gallons(
                    entity_id,
                    cumulative,
                    ts.with_timezone(&Utc),
                    Classification::Cumulative,
                )
                .with_attribute("device_class", "water")
            })
            .collect(),
        ImportMode::Delta => derive_deltas(readings)
            .into_iter()
            .map(|delta| {
                PublishedState::gallons(
                    entity_id,
                    round6(delta.value),
                    delta.timestamp.with_timezone(&Utc),
                    Classification::Incremental,
                )
                .with_attribute("device_class", "water")
                .with_attribute("source", HISTORY_SOURCE)
            })
            .collect(),
    };

    for state in &states {
        debug!(
            entity_id,
            at = %state.timestamp.to_rfc3339(),
            value = state.value,
            unit = state.unit,
            %mode,
            "Prepared historical state"
        );
    }

    states
}
