//! Runtime configuration for the bridge.
//!
//! Everything is read from environment variables once at start-up (a `.env`
//! file is honoured by `main`) and then shared read-only by both pipelines.
use std::env;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;

use crate::backfill::ImportMode;

pub const DEFAULT_BASE_URL: &str = "https://fwmyh2o.smartcmobile.com";
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 3600;
pub const DEFAULT_IMPORT_TIME: &str = "02:00";
pub const DEFAULT_HISTORY_ENTITY: &str = "sensor.fwmyh2o_cumulative";
pub const DEFAULT_ENTITY_PREFIX: &str = "sensor.fort_worth_myh2o";
pub const DEFAULT_TIMEZONE: Tz = chrono_tz::America::Chicago;
pub const DEFAULT_USERNAME_FIELD: &str = "ctl00$ContentPlaceHolder1$txtUsername";
pub const DEFAULT_PASSWORD_FIELD: &str = "ctl00$ContentPlaceHolder1$txtPassword";

macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

fn env_or(var_name: &str, default: &str) -> String {
    env::var(var_name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

/// Immutable configuration snapshot.
#[derive(Debug, Clone)]
pub struct Config {
    pub username: String,
    pub password: String,
    /// Portal origin, without a trailing slash.
    pub base_url: String,
    pub username_field: String,
    pub password_field: String,
    pub meter_number: String,
    pub scan_interval: Duration,
    /// Local wall-clock time of the daily history import.
    pub import_time: NaiveTime,
    pub import_mode: ImportMode,
    pub import_on_start: bool,
    pub history_entity_id: String,
    pub entity_prefix: String,
    pub timezone: Tz,
    pub ha_url: String,
    pub ha_token: String,
}

impl Config {
    /// Configuration with every optional setting at its default.
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
            username_field: DEFAULT_USERNAME_FIELD.to_string(),
            password_field: DEFAULT_PASSWORD_FIELD.to_string(),
            meter_number: String::new(),
            scan_interval: Duration::from_secs(DEFAULT_SCAN_INTERVAL_SECS),
            import_time: NaiveTime::from_hms_opt(2, 0, 0).unwrap_or_default(),
            import_mode: ImportMode::Cumulative,
            import_on_start: true,
            history_entity_id: DEFAULT_HISTORY_ENTITY.to_string(),
            entity_prefix: DEFAULT_ENTITY_PREFIX.to_string(),
            timezone: DEFAULT_TIMEZONE,
            ha_url: String::new(),
            ha_token: String::new(),
        }
    }

    /// Loads the configuration from the process environment.
    ///
    /// Required: `MYH2O_USERNAME`, `MYH2O_PASSWORD`. Every other setting
    /// falls back to its default; malformed values are rejected.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::new(
            require_env!("MYH2O_USERNAME"),
            require_env!("MYH2O_PASSWORD"),
        );

        config.base_url = env_or("MYH2O_BASE_URL", DEFAULT_BASE_URL)
            .trim_end_matches('/')
            .to_string();
        config.username_field = env_or("MYH2O_USERNAME_FIELD", DEFAULT_USERNAME_FIELD);
        config.password_field = env_or("MYH2O_PASSWORD_FIELD", DEFAULT_PASSWORD_FIELD);
        config.meter_number = env_or("MYH2O_METER_NUMBER", "");
        config.scan_interval = parse_scan_interval(&env_or(
            "MYH2O_SCAN_INTERVAL",
            &DEFAULT_SCAN_INTERVAL_SECS.to_string(),
        ))?;
        config.import_time = parse_import_time(&env_or("MYH2O_IMPORT_TIME", DEFAULT_IMPORT_TIME))?;
        config.import_mode = env_or("MYH2O_IMPORT_MODE", "cumulative")
            .parse()
            .map_err(|e| anyhow!("Invalid MYH2O_IMPORT_MODE: {e}"))?;
        config.import_on_start = env::var("MYH2O_IMPORT_ON_START")
            .map(|v| parse_bool_safe(Some(v)))
            .unwrap_or(true);
        config.history_entity_id = env_or("MYH2O_HISTORY_ENTITY", DEFAULT_HISTORY_ENTITY);
        config.entity_prefix = env_or("MYH2O_ENTITY_PREFIX", DEFAULT_ENTITY_PREFIX);
        config.timezone = parse_timezone(&env_or("MYH2O_TIMEZONE", DEFAULT_TIMEZONE.name()))?;
        config.ha_url = env_or("HA_URL", "").trim_end_matches('/').to_string();
        config.ha_token = env_or("HA_TOKEN", "");

        Ok(config)
    }

    /// Logs the loaded configuration with secrets masked.
    pub fn log_config(&self) {
        tracing::info!("Configuration loaded:");
        tracing::info!("  MYH2O_USERNAME       : {}", self.username);
        tracing::info!("  MYH2O_PASSWORD       : ****");
        tracing::info!("  MYH2O_BASE_URL       : {}", self.base_url);
        tracing::info!("  MYH2O_SCAN_INTERVAL  : {}s", self.scan_interval.as_secs());
        tracing::info!("  MYH2O_IMPORT_TIME    : {}", self.import_time.format("%H:%M"));
        tracing::info!("  MYH2O_IMPORT_MODE    : {}", self.import_mode);
        tracing::info!("  MYH2O_IMPORT_ON_START: {}", self.import_on_start);
        tracing::info!("  MYH2O_HISTORY_ENTITY : {}", self.history_entity_id);
        tracing::info!("  MYH2O_ENTITY_PREFIX  : {}", self.entity_prefix);
        tracing::info!("  MYH2O_TIMEZONE       : {}", self.timezone.name());
        tracing::info!(
            "  HA_URL               : {}",
            if self.ha_url.is_empty() {
                "none"
            } else {
                &self.ha_url
            }
        );
    }
}

/// Parses a polling interval given in whole seconds. Zero is rejected.
pub fn parse_scan_interval(raw: &str) -> Result<Duration> {
    let secs: u64 = raw
        .trim()
        .parse()
        .map_err(|e| anyhow!("Invalid MYH2O_SCAN_INTERVAL '{raw}': {e}"))?;
    if secs == 0 {
        bail!("MYH2O_SCAN_INTERVAL must be greater than zero");
    }
    Ok(Duration::from_secs(secs))
}

/// Parses an `HH:MM` wall-clock time.
pub fn parse_import_time(raw: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(raw.trim(), "%H:%M")
        .map_err(|e| anyhow!("Invalid MYH2O_IMPORT_TIME '{raw}', expected HH:MM: {e}"))
}

pub fn parse_timezone(raw: &str) -> Result<Tz> {
    raw.trim()
        .parse::<Tz>()
        .map_err(|e| anyhow!("Invalid MYH2O_TIMEZONE '{raw}': {e}"))
}

/// Safely parses a boolean from an optional string, defaulting to false
pub fn parse_bool_safe(val: Option<String>) -> bool {
    val.unwrap_or_default()
        .to_ascii_lowercase()
        .parse()
        .unwrap_or_default()
}
