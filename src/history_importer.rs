use std::sync::Arc;

use chrono::{NaiveDate, NaiveTime};
use chrono_tz::Tz;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::backfill::{to_published_states, ImportMode};
use crate::config::Config;
use crate::history::fetch_cumulative_readings_for_date;
use crate::home_assistant::StateSink;
use crate::portal::PortalClient;
use crate::scheduler::{next_daily_occurrence, previous_day, Clock, RepeatingTimer, TimerHandle};

/// Daily import of yesterday's hourly readings into the host's history.
pub struct HistoryImporter {
    portal: Arc<PortalClient>,
    sink: Arc<dyn StateSink>,
    entity_id: String,
    mode: ImportMode,
    meter_number: String,
    timezone: Tz,
    import_time: NaiveTime,
    import_on_start: bool,
}

impl HistoryImporter {
    pub fn new(portal: Arc<PortalClient>, sink: Arc<dyn StateSink>, config: &Config) -> Self {
        Self {
            portal,
            sink,
            entity_id: config.history_entity_id.clone(),
            mode: config.import_mode,
            meter_number: config.meter_number.clone(),
            timezone: config.timezone,
            import_time: config.import_time,
            import_on_start: config.import_on_start,
        }
    }

    /// Fetches `date` and records every resulting state.
    ///
    /// Returns how many states were recorded. An empty fetch is not an error.
    /// A state the sink rejects does not stop the rest of the day; the
    /// failures are reported together afterwards.
    pub async fn import_for_date(&self, date: NaiveDate) -> anyhow::Result<usize> {
        info!(%date, entity_id = %self.entity_id, mode = %self.mode, "Starting history import");

        let readings =
            fetch_cumulative_readings_for_date(&self.portal, date, &self.meter_number, self.timezone)
                .await;
        if readings.is_empty() {
            warn!(%date, "No readings returned");
            return Ok(0);
        }

        let states = to_published_states(&self.entity_id, readings, self.mode);
        let mut inserted = 0;
        let mut failed = 0;
        let mut last_error = None;
        for state in &states {
            match self.sink.record_history(state).await {
                Ok(()) => inserted += 1,
                Err(e) => {
                    warn!(
                        entity_id = %state.entity_id,
                        at = %state.timestamp.to_rfc3339(),
                        error = %e,
                        "Failed to record historical state"
                    );
                    failed += 1;
                    last_error = Some(e);
                }
            }
        }

        if let Some(e) = last_error {
            anyhow::bail!("{failed} of {} states for {date} were not recorded: {e}", states.len());
        }

        info!(%date, inserted, "History import completed");
        Ok(inserted)
    }

    /// Runs the start-up import (if enabled) and then the daily timer until
    /// the returned handle is cancelled.
    pub fn spawn<C>(self, clock: C) -> (JoinHandle<u64>, TimerHandle)
    where
        C: Clock + 'static,
    {
        let started_at = clock.now();
        let import_time = self.import_time;
        let (timer, handle) = RepeatingTimer::new("myh2o_history", clock, move |now| {
            next_daily_occurrence(now, import_time)
        });
        let importer = Arc::new(self);

        let task = tokio::spawn(async move {
            if importer.import_on_start {
                let yesterday = previous_day(&started_at);
                if let Err(e) = importer.import_for_date(yesterday).await {
                    warn!(error = %e, "Start-up history import failed");
                }
            }

            timer
                .run(|fire_at| {
                    let importer = importer.clone();
                    async move {
                        importer.import_for_date(previous_day(&fire_at)).await?;
                        Ok(())
                    }
                })
                .await
        });

        (task, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BridgeError, BridgeResult};
    use crate::portal::LOAD_WATER_USAGE_PATH;
    use crate::readings::{Classification, PublishedState};
    use async_trait::async_trait;
    use chrono::{DateTime, TimeZone};
    use chrono_tz::America::Chicago;
    use mockito::Matcher;
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct RecordingSink {
        history: Mutex<Vec<PublishedState>>,
        fail: bool,
        reject_values: Vec<f64>,
    }

    #[async_trait]
    impl StateSink for RecordingSink {
        async fn publish_state(&self, _state: &PublishedState) -> BridgeResult<()> {
            unreachable!("history importer never sets live state")
        }

        async fn record_history(&self, state: &PublishedState) -> BridgeResult<()> {
            if self.fail || self.reject_values.contains(&state.value) {
                return Err(BridgeError::HomeAssistantUnavailable);
            }
            self.history.lock().unwrap().push(state.clone());
            Ok(())
        }
    }

    /// Clock that jumps to each deadline, then stalls once its budget of
    /// sleeps is used up.
    struct BudgetClock {
        now: Mutex<DateTime<Tz>>,
        budget: Mutex<u32>,
    }

    #[async_trait]
    impl Clock for BudgetClock {
        fn now(&self) -> DateTime<Tz> {
            *self.now.lock().unwrap()
        }

        async fn sleep_until(&self, deadline: DateTime<Tz>) {
            let exhausted = {
                let mut budget = self.budget.lock().unwrap();
                if *budget == 0 {
                    true
                } else {
                    *budget -= 1;
                    *self.now.lock().unwrap() = deadline;
                    false
                }
            };
            if exhausted {
                std::future::pending::<()>().await;
            }
        }
    }

    fn usage_body(date: &str, values: &[(&str, f64)]) -> String {
        let rows: Vec<_> = values
            .iter()
            .map(|(hour, value)| json!({"UsageDate": date, "Hourly": hour, "UsageValue": value}))
            .collect();
        json!({ "d": json!({ "objUsageGenerationResultSetTwo": rows }).to_string() }).to_string()
    }

    fn importer_config(server_url: &str, mode: ImportMode) -> Config {
        let mut config = Config::new("alice", "s3cret");
        config.base_url = server_url.to_string();
        config.import_mode = mode;
        config.timezone = Chicago;
        config
    }

    #[tokio::test]
    async fn test_import_for_date_records_deltas() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", LOAD_WATER_USAGE_PATH)
            .match_body(Matcher::PartialJson(json!({"strDate": "03/15/2024"})))
            .with_status(200)
            .with_body(usage_body(
                "03/15/2024",
                &[("2:00 AM", 103.5), ("1:00 AM", 100.0), ("3:00 AM", 99.0)],
            ))
            .create_async()
            .await;

        let config = importer_config(&server.url(), ImportMode::Delta);
        let sink = Arc::new(RecordingSink::default());
        let importer =
            HistoryImporter::new(Arc::new(PortalClient::new(&config)), sink.clone(), &config);

        let inserted = importer
            .import_for_date(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap())
            .await
            .unwrap();
        assert_eq!(inserted, 3);

        let history = sink.history.lock().unwrap();
        let values: Vec<f64> = history.iter().map(|s| s.value).collect();
        assert_eq!(values, vec![100.0, 3.5, 0.0]);
        assert!(history
            .iter()
            .all(|s| s.entity_id == "sensor.fwmyh2o_cumulative"
                && s.classification == Classification::Incremental));
    }

    #[tokio::test]
    async fn test_empty_fetch_is_not_an_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", LOAD_WATER_USAGE_PATH)
            .with_status(500)
            .create_async()
            .await;

        let config = importer_config(&server.url(), ImportMode::Cumulative);
        let sink = Arc::new(RecordingSink::default());
        let importer =
            HistoryImporter::new(Arc::new(PortalClient::new(&config)), sink.clone(), &config);

        let inserted = importer
            .import_for_date(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap())
            .await
            .unwrap();
        assert_eq!(inserted, 0);
        assert!(sink.history.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sink_failure_is_reported() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", LOAD_WATER_USAGE_PATH)
            .with_status(200)
            .with_body(usage_body("03/15/2024", &[("1:00 AM", 100.0)]))
            .create_async()
            .await;

        let config = importer_config(&server.url(), ImportMode::Cumulative);
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let importer = HistoryImporter::new(Arc::new(PortalClient::new(&config)), sink, &config);

        let result = importer
            .import_for_date(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_rejected_state_does_not_stop_the_day() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", LOAD_WATER_USAGE_PATH)
            .with_status(200)
            .with_body(usage_body(
                "03/15/2024",
                &[("1:00 AM", 100.0), ("2:00 AM", 103.5), ("3:00 AM", 110.0)],
            ))
            .create_async()
            .await;

        let config = importer_config(&server.url(), ImportMode::Cumulative);
        let sink = Arc::new(RecordingSink {
            reject_values: vec![100.0],
            ..Default::default()
        });
        let importer =
            HistoryImporter::new(Arc::new(PortalClient::new(&config)), sink.clone(), &config);

        let result = importer
            .import_for_date(NaiveDate::from_ymd_opt(2024, 3, 15).unwrap())
            .await;
        let err = result.unwrap_err();
        assert!(err.to_string().contains("1 of 3"));

        let recorded: Vec<f64> = sink.history.lock().unwrap().iter().map(|s| s.value).collect();
        assert_eq!(recorded, vec![103.5, 110.0]);
    }

    #[tokio::test]
    async fn test_spawn_imports_yesterday_then_each_day() {
        let mut server = mockito::Server::new_async().await;
        let mut mocks = Vec::new();
        for date in ["03/14/2024", "03/15/2024", "03/16/2024"] {
            mocks.push(
                server
                    .mock("POST", LOAD_WATER_USAGE_PATH)
                    .match_body(Matcher::PartialJson(json!({ "strDate": date })))
                    .with_status(200)
                    .with_body(usage_body(date, &[("1:00 AM", 10.0)]))
                    .expect(1)
                    .create_async()
                    .await,
            );
        }

        let config = importer_config(&server.url(), ImportMode::Cumulative);
        let sink = Arc::new(RecordingSink::default());
        let importer =
            HistoryImporter::new(Arc::new(PortalClient::new(&config)), sink.clone(), &config);

        let clock = BudgetClock {
            now: Mutex::new(Chicago.with_ymd_and_hms(2024, 3, 15, 12, 0, 0).unwrap()),
            budget: Mutex::new(2),
        };
        let (task, handle) = importer.spawn(clock);

        tokio::time::timeout(Duration::from_secs(10), async {
            while sink.history.lock().unwrap().len() < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("three imports should complete");

        handle.cancel();
        let fired = task.await.unwrap();
        assert_eq!(fired, 2);

        for mock in &mocks {
            mock.assert_async().await;
        }
    }
}
