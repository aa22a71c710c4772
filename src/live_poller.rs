use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::error::{BridgeError, BridgeResult};
use crate::home_assistant::StateSink;
use crate::portal::PortalClient;
use crate::readings::{Classification, PublishedState};
use crate::usage_parser::{parse_usage, UsageSnapshot};

const MAX_RETRIES: u32 = 3;

/// Entity ids of the three live sensors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveEntities {
    pub current_reading: String,
    pub daily_usage: String,
    pub monthly_usage: String,
}

impl LiveEntities {
    pub fn with_prefix(prefix: &str) -> Self {
        Self {
            current_reading: format!("{prefix}_current_reading"),
            daily_usage: format!("{prefix}_daily_usage"),
            monthly_usage: format!("{prefix}_monthly_usage"),
        }
    }
}

/// Periodically scrapes the usage page and republishes it as three sensors.
pub struct LivePoller {
    portal: Arc<PortalClient>,
    sink: Arc<dyn StateSink>,
    entities: LiveEntities,
    scan_interval: Duration,
}

impl LivePoller {
    pub fn new(
        portal: Arc<PortalClient>,
        sink: Arc<dyn StateSink>,
        entities: LiveEntities,
        scan_interval: Duration,
    ) -> Self {
        info!("Live poller config:");
        info!("  Current reading: {}", entities.current_reading);
        info!("  Daily usage:     {}", entities.daily_usage);
        info!("  Monthly usage:   {}", entities.monthly_usage);
        info!("  Scan interval:   {}s", scan_interval.as_secs());

        Self {
            portal,
            sink,
            entities,
            scan_interval,
        }
    }

    /// Spawns the poller on its own task.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.run().await;
        })
    }

    async fn run(&self) {
        info!("Starting MyH2O live poller");

        let mut poll_interval = interval(self.scan_interval);
        poll_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            poll_interval.tick().await;

            match self.refresh().await {
                Ok(published) => debug!(published, "Live poll complete"),
                Err(e) => error!(error = %e, "Error fetching MyH2O data; update failed"),
            }
        }
    }

    /// One complete cycle: fetch with retry, then publish.
    ///
    /// Returns the number of states published.
    pub async fn refresh(&self) -> BridgeResult<usize> {
        let snapshot = self.poll_with_retry().await?;
        self.publish(&snapshot).await
    }

    /// Polls with automatic retry on transport failure
    async fn poll_with_retry(&self) -> BridgeResult<UsageSnapshot> {
        let mut attempt = 1;
        loop {
            match self.poll_once().await {
                Ok(snapshot) => return Ok(snapshot),
                Err(e) if attempt < MAX_RETRIES => {
                    warn!(attempt, error = %e, "MyH2O poll attempt failed. Retrying...");
                    sleep(Duration::from_millis(200 * attempt as u64)).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Logs in (best effort), fetches and parses the usage page.
    pub async fn poll_once(&self) -> BridgeResult<UsageSnapshot> {
        let auth = self.portal.login().await;
        debug!(authenticated = auth.is_authenticated(), "Fetching usage page");

        let html = self.portal.fetch_usage_page().await?;
        let snapshot = parse_usage(&html);

        if snapshot.is_empty() {
            warn!("Usage page contained none of the expected readings");
        }
        info!(
            current = ?snapshot.current_reading,
            daily = ?snapshot.daily_usage,
            monthly = ?snapshot.monthly_usage,
            account = ?snapshot.account,
            "MyH2O usage parsed"
        );
        Ok(snapshot)
    }

    /// Builds the states for the fields present in `snapshot`.
    pub fn states_for(&self, snapshot: &UsageSnapshot) -> Vec<PublishedState> {
        let now = Utc::now();
        let fields = [
            (
                &self.entities.current_reading,
                snapshot.current_reading,
                Classification::Cumulative,
                "MyH2O Current Reading",
            ),
            (
                &self.entities.daily_usage,
                snapshot.daily_usage,
                Classification::Incremental,
                "MyH2O Daily Usage",
            ),
            (
                &self.entities.monthly_usage,
                snapshot.monthly_usage,
                Classification::Incremental,
                "MyH2O Monthly Usage",
            ),
        ];

        fields
            .into_iter()
            .filter_map(|(entity_id, value, classification, name)| {
                let Some(value) = value else {
                    debug!(entity_id = %entity_id, "No value scraped; leaving state untouched");
                    return None;
                };
                let mut state = PublishedState::gallons(entity_id.as_str(), value, now, classification)
                    .with_attribute("friendly_name", name);
                if classification == Classification::Cumulative {
                    state = state.with_attribute("device_class", "water");
                }
                if let Some(account) = &snapshot.account {
                    state = state.with_attribute("account", account.as_str());
                }
                Some(state)
            })
            .collect()
    }

    async fn publish(&self, snapshot: &UsageSnapshot) -> BridgeResult<usize> {
        let states = self.states_for(snapshot);
        let mut last_error: Option<BridgeError> = None;
        let mut published = 0;

        for state in &states {
            match self.sink.publish_state(state).await {
                Ok(()) => published += 1,
                Err(e) => {
                    warn!(entity_id = %state.entity_id, error = %e, "Failed to publish state");
                    last_error = Some(e);
                }
            }
        }

        match last_error {
            Some(e) if published == 0 => Err(e),
            _ => Ok(published),
        }
    }
}
