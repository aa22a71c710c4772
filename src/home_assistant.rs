use async_trait::async_trait;
use chrono::SecondsFormat;
use serde_derive::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::{BridgeError, BridgeResult};
use crate::readings::PublishedState;

/// The narrow slice of the host platform the pipelines are allowed to use.
#[async_trait]
pub trait StateSink: Send + Sync {
    /// Sets the current state of an entity.
    async fn publish_state(&self, state: &PublishedState) -> BridgeResult<()>;

    /// Records a state at its historical timestamp rather than now.
    async fn record_history(&self, state: &PublishedState) -> BridgeResult<()>;
}

pub struct HomeAssistantAPI {
    endpoint_url: String,
    auth_token: String,
    client: reqwest::Client,
}

impl HomeAssistantAPI {
    pub fn new(endpoint_url: &str, auth_token: &str) -> Self {
        Self {
            endpoint_url: endpoint_url.trim_end_matches('/').to_string(),
            auth_token: auth_token.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn ensure_connection(&self) -> BridgeResult<()> {
        if self.endpoint_url.is_empty() {
            return Err(BridgeError::HomeAssistantUnavailable);
        }
        Ok(())
    }

    /// `POST /api/states/<entity_id>`; returns the state Home Assistant stored.
    pub async fn set_state(&self, state: &PublishedState) -> BridgeResult<HASensor> {
        self.ensure_connection()?;
        let url = format!("{}/api/states/{}", self.endpoint_url, state.entity_id);
        let body = json!({
            "state": format_state_value(state.value),
            "attributes": attributes(state),
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.auth_token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Status {
                url,
                status: status.as_u16(),
            });
        }
        Ok(response.json().await?)
    }

    /// Fires a `state_changed` event whose new state carries the historical
    /// timestamp in both `last_changed` and `last_updated`.
    pub async fn fire_state_changed(&self, state: &PublishedState) -> BridgeResult<()> {
        self.ensure_connection()?;
        let url = format!("{}/api/events/state_changed", self.endpoint_url);
        let timestamp = state.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, false);
        let body = json!({
            "entity_id": state.entity_id,
            "old_state": null,
            "new_state": {
                "entity_id": state.entity_id,
                "state": format_state_value(state.value),
                "attributes": attributes(state),
                "last_changed": timestamp,
                "last_updated": timestamp,
            }
        });

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.auth_token)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Status {
                url,
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl StateSink for HomeAssistantAPI {
    async fn publish_state(&self, state: &PublishedState) -> BridgeResult<()> {
        self.set_state(state).await.map(|_| ())
    }

    async fn record_history(&self, state: &PublishedState) -> BridgeResult<()> {
        self.fire_state_changed(state).await
    }
}

fn format_state_value(value: f64) -> String {
    value.to_string()
}

fn attributes(state: &PublishedState) -> Map<String, Value> {
    let mut attrs = state.attributes.clone();
    attrs.insert("unit_of_measurement".into(), state.unit.into());
    attrs.insert(
        "state_class".into(),
        state.classification.state_class().into(),
    );
    attrs
}

#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HASensor {
    #[serde(rename = "entity_id")]
    pub entity_id: String,
    pub state: String,
    #[serde(rename = "last_changed")]
    pub last_changed: String,
    #[serde(rename = "last_reported", default)]
    pub last_reported: String,
    #[serde(rename = "last_updated")]
    pub last_updated: String,
}
