use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::history_importer::HistoryImporter;
use crate::home_assistant::{HomeAssistantAPI, StateSink};
use crate::live_poller::{LiveEntities, LivePoller};
use crate::portal::PortalClient;
use crate::scheduler::{SystemClock, TimerHandle};

/// Starts the live poller and the history importer and keeps their handles
/// for teardown.
pub struct BridgeCoordinator {
    poller_task: JoinHandle<()>,
    history_task: JoinHandle<u64>,
    history_timer: TimerHandle,
}

impl BridgeCoordinator {
    /// Starts both pipelines, publishing to the Home Assistant instance in `config`.
    pub fn start(config: &Config) -> Self {
        let sink: Arc<dyn StateSink> = Arc::new(HomeAssistantAPI::new(&config.ha_url, &config.ha_token));
        Self::start_with_sink(config, sink)
    }

    /// Starts both pipelines against an arbitrary sink.
    pub fn start_with_sink(config: &Config, sink: Arc<dyn StateSink>) -> Self {
        info!("Initializing MyH2O bridge coordinator");

        // Shared session; closed when both pipelines have dropped it.
        let portal = Arc::new(PortalClient::new(config));

        let poller = LivePoller::new(
            portal.clone(),
            sink.clone(),
            LiveEntities::with_prefix(&config.entity_prefix),
            config.scan_interval,
        );
        let poller_task = poller.spawn();

        let importer = HistoryImporter::new(portal, sink, config);
        let (history_task, history_timer) = importer.spawn(SystemClock::new(config.timezone));

        info!("All bridge pipelines started");

        Self {
            poller_task,
            history_task,
            history_timer,
        }
    }

    /// Stops both pipelines. In-flight requests are abandoned, not retried.
    pub async fn shutdown(self) {
        info!("Shutting down MyH2O bridge");
        self.history_timer.cancel();
        self.poller_task.abort();
        self.history_task.abort();

        // Both tasks were aborted; their cancellation errors are expected.
        let _ = self.poller_task.await;
        let _ = self.history_task.await;
        info!("MyH2O bridge stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeResult;
    use crate::readings::PublishedState;
    use async_trait::async_trait;
    use std::time::Duration;

    struct NullSink;

    #[async_trait]
    impl StateSink for NullSink {
        async fn publish_state(&self, _state: &PublishedState) -> BridgeResult<()> {
            Ok(())
        }

        async fn record_history(&self, _state: &PublishedState) -> BridgeResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_coordinator_starts_and_stops() {
        let mut config = Config::new("alice", "s3cret");
        // Nothing listens here; every request fails fast.
        config.base_url = "http://127.0.0.1:9".to_string();
        config.import_on_start = false;

        let coordinator = BridgeCoordinator::start_with_sink(&config, Arc::new(NullSink));
        tokio::time::sleep(Duration::from_millis(50)).await;

        tokio::time::timeout(Duration::from_secs(5), coordinator.shutdown())
            .await
            .expect("shutdown should not hang");
    }
}
