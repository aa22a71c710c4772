//! HTTP session against the MyH2O customer portal.
//!
//! One cookie-carrying `reqwest::Client` is created on first use and shared
//! by the live poller and the history importer.
use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::{BridgeError, BridgeResult};

pub const LOGIN_PATH: &str = "/portal/login.aspx";
pub const USAGE_PATH: &str = "/portal/usages.aspx?type=WU";
pub const LOAD_WATER_USAGE_PATH: &str = "/Portal/Usages.aspx/LoadWaterUsage";

/// Result of the best-effort login that precedes every poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authenticated,
    /// Login did not succeed; the caller carries on without a session.
    Unauthenticated { reason: String },
}

impl AuthOutcome {
    pub fn is_authenticated(&self) -> bool {
        matches!(self, AuthOutcome::Authenticated)
    }
}

pub struct PortalClient {
    base_url: String,
    username: String,
    password: String,
    username_field: String,
    password_field: String,
    session: OnceCell<reqwest::Client>,
}

impl PortalClient {
    pub fn new(config: &Config) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            username: config.username.clone(),
            password: config.password.clone(),
            username_field: config.username_field.clone(),
            password_field: config.password_field.clone(),
            session: OnceCell::new(),
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn session(&self) -> BridgeResult<&reqwest::Client> {
        self.session
            .get_or_try_init(|| async {
                debug!("Creating portal HTTP session");
                reqwest::Client::builder()
                    .cookie_store(true)
                    .build()
                    .map_err(BridgeError::from)
            })
            .await
    }

    async fn read_text(url: &str, response: reqwest::Response) -> BridgeResult<String> {
        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response.text().await?)
    }

    pub async fn get_text(&self, path: &str) -> BridgeResult<String> {
        let url = self.url(path);
        let response = self.session().await?.get(&url).send().await?;
        Self::read_text(&url, response).await
    }

    pub async fn post_form(&self, path: &str, form: &HashMap<String, String>) -> BridgeResult<String> {
        let url = self.url(path);
        let response = self.session().await?.post(&url).form(form).send().await?;
        Self::read_text(&url, response).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &T,
        timeout: Duration,
    ) -> BridgeResult<String> {
        let url = self.url(path);
        let response = self
            .session()
            .await?
            .post(&url)
            .json(body)
            .timeout(timeout)
            .send()
            .await?;
        Self::read_text(&url, response).await
    }

    /// Posts the login form with the configured credentials.
    ///
    /// Every named input of the login page is echoed back (hidden ASP.NET
    /// state included) with the username and password fields overwritten.
    /// Failures never propagate; they are reported as `Unauthenticated`.
    pub async fn login(&self) -> AuthOutcome {
        let outcome = match self.try_login().await {
            Ok(()) => AuthOutcome::Authenticated,
            Err(e) => AuthOutcome::Unauthenticated {
                reason: e.to_string(),
            },
        };
        match &outcome {
            AuthOutcome::Authenticated => info!(user = %self.username, "Portal login succeeded"),
            AuthOutcome::Unauthenticated { reason } => {
                warn!(%reason, "Portal login failed; continuing without a session")
            }
        }
        outcome
    }

    async fn try_login(&self) -> BridgeResult<()> {
        let page = self.get_text(LOGIN_PATH).await?;
        let mut form = form_inputs(&page);
        debug!(fields = form.len(), "Login form fields found");

        form.insert(self.username_field.clone(), self.username.clone());
        form.insert(self.password_field.clone(), self.password.clone());

        self.post_form(LOGIN_PATH, &form).await?;
        Ok(())
    }

    pub async fn fetch_usage_page(&self) -> BridgeResult<String> {
        self.get_text(USAGE_PATH).await
    }
}

/// Collects `name -> value` for every named `<input>` in `html`.
///
/// Inputs without a `value` attribute map to an empty string.
pub fn form_inputs(html: &str) -> HashMap<String, String> {
    let mut fields = HashMap::new();
    let lower = html.to_ascii_lowercase();
    let mut cursor = 0;

    while let Some(found) = lower[cursor..].find("<input") {
        let start = cursor + found + "<input".len();
        let end = lower[start..].find('>').map(|e| start + e).unwrap_or(html.len());
        let attrs = parse_attributes(&html[start..end]);
        if let Some(name) = attrs.get("name").filter(|n| !n.is_empty()) {
            let value = attrs.get("value").cloned().unwrap_or_default();
            fields.insert(name.clone(), value);
        }
        cursor = end;
    }

    fields
}

/// Parses `key="value"`, `key='value'`, `key=value` and bare `key` attributes.
/// Keys are lowercased; values are kept verbatim apart from `&amp;`.
fn parse_attributes(raw: &str) -> HashMap<String, String> {
    let mut attrs = HashMap::new();
    let mut rest = raw.trim_start_matches('/').trim();

    while !rest.is_empty() {
        let key_end = rest
            .find(|c: char| c == '=' || c.is_whitespace() || c == '/')
            .unwrap_or(rest.len());
        let key = rest[..key_end].to_ascii_lowercase();
        rest = rest[key_end..].trim_start();

        let mut value = String::new();
        if let Some(after_eq) = rest.strip_prefix('=') {
            let after_eq = after_eq.trim_start();
            let (raw_value, remaining) = match after_eq.chars().next() {
                Some(quote @ ('"' | '\'')) => {
                    let body = &after_eq[1..];
                    match body.find(quote) {
                        Some(close) => (&body[..close], &body[close + 1..]),
                        None => (body, ""),
                    }
                }
                _ => {
                    let stop = after_eq.find(char::is_whitespace).unwrap_or(after_eq.len());
                    (&after_eq[..stop], &after_eq[stop..])
                }
            };
            value = raw_value.replace("&amp;", "&");
            rest = remaining;
        }

        if !key.is_empty() {
            attrs.insert(key, value);
        }
        rest = rest.trim_start_matches(|c: char| c == '/' || c.is_whitespace());
    }

    attrs
}
