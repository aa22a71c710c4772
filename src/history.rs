//! Client for the portal's hourly usage API.
//!
//! `LoadWaterUsage` answers with an ASP.NET page-method envelope whose `d`
//! field is itself a JSON document encoded as a string.
use std::time::Duration;

use chrono::{DateTime, NaiveDate, NaiveTime, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::error::BridgeResult;
use crate::portal::{PortalClient, LOAD_WATER_USAGE_PATH};
use crate::readings::Reading;

pub const HISTORY_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
pub const PORTAL_DATE_FORMAT: &str = "%m/%d/%Y";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoadWaterUsageRequest {
    #[serde(rename = "Type")]
    pub usage_type: String,
    #[serde(rename = "Mode")]
    pub mode: String,
    pub str_date: String,
    pub hourly_type: String,
    pub season_id: String,
    pub weather_overlay: u8,
    pub usageyear: String,
    #[serde(rename = "MeterNumber")]
    pub meter_number: String,
    #[serde(rename = "DateFromDaily")]
    pub date_from_daily: String,
    #[serde(rename = "DateToDaily")]
    pub date_to_daily: String,
    pub is_no_dashboard: bool,
}

impl LoadWaterUsageRequest {
    /// Hourly water usage for one calendar day.
    pub fn hourly(date: NaiveDate, meter_number: &str) -> Self {
        Self {
            usage_type: "W".to_string(),
            mode: "H".to_string(),
            str_date: format_portal_date(date),
            hourly_type: "H".to_string(),
            season_id: String::new(),
            weather_overlay: 0,
            usageyear: String::new(),
            meter_number: meter_number.to_string(),
            date_from_daily: String::new(),
            date_to_daily: String::new(),
            is_no_dashboard: true,
        }
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    d: String,
}

/// Rows stay untyped until `HourlyEntry::from_row`, so one malformed row
/// cannot fail the whole document.
#[derive(Debug, Default, Deserialize)]
struct UsageResult {
    #[serde(rename = "objUsageGenerationResultSetTwo", default)]
    hourly: Vec<Value>,
}

/// One hourly row; any field may be missing or of an unexpected JSON type.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HourlyEntry {
    #[serde(rename = "UsageDate", default)]
    pub usage_date: Option<Value>,
    #[serde(rename = "Hourly", default)]
    pub hourly: Option<Value>,
    #[serde(rename = "UsageValue", default)]
    pub usage_value: Option<Value>,
}

pub fn format_portal_date(date: NaiveDate) -> String {
    date.format(PORTAL_DATE_FORMAT).to_string()
}

/// Combines a portal date (`MM/DD/YYYY`, optional trailing time ignored) and
/// a 12-hour clock time (`1:00 AM`) into an instant in `tz`.
///
/// Local times skipped by a DST transition yield `None`; repeated ones
/// resolve to the earlier instant.
pub fn parse_portal_timestamp(date: &str, time: &str, tz: Tz) -> Option<DateTime<Tz>> {
    let date_part = date.split_whitespace().next()?;
    let date = NaiveDate::parse_from_str(date_part, PORTAL_DATE_FORMAT).ok()?;
    let time = NaiveTime::parse_from_str(time.trim(), "%I:%M %p").ok()?;
    tz.from_local_datetime(&date.and_time(time)).earliest()
}

fn usage_value(value: &Value) -> Option<f64> {
    let number = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().replace(',', "").parse().ok(),
        _ => None,
    }?;
    number.is_finite().then_some(number)
}

impl HourlyEntry {
    /// Decodes one raw row; anything but a JSON object yields `None`.
    fn from_row(row: &Value) -> Option<Self> {
        serde_json::from_value(row.clone()).ok()
    }

    fn to_reading(&self, tz: Tz) -> Option<Reading> {
        let date = self.usage_date.as_ref()?.as_str()?;
        let time = self.hourly.as_ref()?.as_str()?;
        let timestamp = parse_portal_timestamp(date, time, tz)?;
        let cumulative = usage_value(self.usage_value.as_ref()?)?;
        Some(Reading::new(timestamp, cumulative))
    }
}

/// Decodes both envelope layers and converts each hourly row into a reading.
///
/// Rows with a missing or malformed date, time or value are logged and
/// skipped. Only a broken envelope is an error.
pub fn parse_usage_response(body: &str, tz: Tz) -> BridgeResult<Vec<Reading>> {
    let envelope: Envelope = serde_json::from_str(body)?;
    let result: UsageResult = if envelope.d.trim().is_empty() {
        UsageResult::default()
    } else {
        serde_json::from_str(&envelope.d)?
    };

    let readings = result
        .hourly
        .iter()
        .filter_map(|row| {
            let reading = HourlyEntry::from_row(row).and_then(|entry| entry.to_reading(tz));
            if reading.is_none() {
                warn!(%row, "Dropping hourly entry with unparseable timestamp or value");
            }
            reading
        })
        .collect();

    Ok(readings)
}

/// Fetches the hourly cumulative readings of `date`.
///
/// Never fails: transport or decode problems are logged and produce an
/// empty batch.
pub async fn fetch_cumulative_readings_for_date(
    portal: &PortalClient,
    date: NaiveDate,
    meter_number: &str,
    tz: Tz,
) -> Vec<Reading> {
    let request = LoadWaterUsageRequest::hourly(date, meter_number);

    let body = match portal
        .post_json(LOAD_WATER_USAGE_PATH, &request, HISTORY_REQUEST_TIMEOUT)
        .await
    {
        Ok(body) => body,
        Err(e) => {
            error!(date = %request.str_date, error = %e, "Historical usage request failed");
            return Vec::new();
        }
    };

    match parse_usage_response(&body, tz) {
        Ok(readings) => {
            info!(date = %request.str_date, count = readings.len(), "Fetched hourly readings");
            readings
        }
        Err(e) => {
            error!(date = %request.str_date, error = %e, "Could not decode historical usage");
            Vec::new()
        }
    }
}
