use thiserror::Error;

/// Errors raised by the portal client and the Home Assistant sink.
///
/// Parse problems are never represented here: the scrapers degrade to
/// absent fields instead.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("{url} answered with HTTP {status}")]
    Status { url: String, status: u16 },

    #[error("could not decode response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("No HA connection")]
    HomeAssistantUnavailable,
}

pub type BridgeResult<T> = Result<T, BridgeError>;
