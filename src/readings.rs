use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use serde_json::{Map, Value};

pub const UNIT_GALLONS: &str = "gal";

/// One cumulative meter reading as reported by the portal.
///
/// Either field may be missing when the upstream entry was incomplete; the
/// backfill converter drops such readings.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub timestamp: Option<DateTime<Tz>>,
    pub cumulative: Option<f64>,
}

impl Reading {
    pub fn new(timestamp: DateTime<Tz>, cumulative: f64) -> Self {
        Self {
            timestamp: Some(timestamp),
            cumulative: Some(cumulative),
        }
    }
}

/// Consumption within one interval.
#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub timestamp: DateTime<Tz>,
    pub value: f64,
}

/// How the host should interpret a published value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Running total that only grows (meter reading).
    Cumulative,
    /// Amount for one interval or a value that resets.
    Incremental,
}

impl Classification {
    /// Home Assistant `state_class` for this classification.
    pub fn state_class(&self) -> &'static str {
        match self {
            Classification::Cumulative => "total_increasing",
            Classification::Incremental => "measurement",
        }
    }
}

/// A value ready to be written to the host's state store.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedState {
    pub entity_id: String,
    pub value: f64,
    pub unit: &'static str,
    pub timestamp: DateTime<Utc>,
    pub classification: Classification,
    /// Extra attributes merged into the host state (friendly name, account, ...).
    pub attributes: Map<String, Value>,
}

impl PublishedState {
    pub fn gallons(
        entity_id: impl Into<String>,
        value: f64,
        timestamp: DateTime<Utc>,
        classification: Classification,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            value,
            unit: UNIT_GALLONS,
            timestamp,
            classification,
            attributes: Map::new(),
        }
    }

    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }
}
