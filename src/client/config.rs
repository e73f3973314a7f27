use std::env;

use url::Url;

use crate::client::services::error::ExchangeError;

/// Client-side configuration, loaded once from the environment.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the exchange backend, e.g. `http://127.0.0.1:8080`.
    pub api_base_url: String,
    /// WebSocket endpoint for chat; derived from the API base when not set.
    pub ws_url: String,
    /// Delay before a reconnection attempt after an abnormal close.
    pub reconnect_delay_secs: u64,
    /// Interval for polling the pending friend-request badge count.
    pub request_poll_secs: u64,
    /// Capacity of the in-memory notification feed.
    pub notification_capacity: usize,
    pub http_timeout_secs: u64,
}

impl ClientConfig {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let api_base_url = env::var("EXCHANGE_API_URL")
            .unwrap_or_else(|_| "http://127.0.0.1:8080".to_string());
        let ws_url = env::var("EXCHANGE_WS_URL")
            .unwrap_or_else(|_| derive_ws_url(&api_base_url));

        Self {
            api_base_url,
            ws_url,
            reconnect_delay_secs: env::var("EXCHANGE_RECONNECT_DELAY_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(3),
            request_poll_secs: env::var("EXCHANGE_REQUEST_POLL_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(60),
            notification_capacity: env::var("EXCHANGE_NOTIFICATION_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
            http_timeout_secs: env::var("EXCHANGE_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(30),
        }
    }

    /// Full chat socket URL for a user, e.g. `ws://host/ws/chat?username=alice`.
    pub fn chat_ws_url(&self, username: &str) -> Result<Url, ExchangeError> {
        let mut url = Url::parse(&self.ws_url)
            .map_err(|e| ExchangeError::Transport(format!("invalid ws url: {}", e)))?;
        url.query_pairs_mut().append_pair("username", username);
        Ok(url)
    }

    /// SSE subscription URL, e.g. `http://host/subscribe/alice`.
    pub fn subscribe_url(&self, username: &str) -> Result<Url, ExchangeError> {
        let base = Url::parse(&self.api_base_url)
            .map_err(|e| ExchangeError::Transport(format!("invalid api url: {}", e)))?;
        base.join(&format!("subscribe/{}", username))
            .map_err(|e| ExchangeError::Transport(format!("invalid subscribe url: {}", e)))
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            api_base_url: "http://127.0.0.1:8080".to_string(),
            ws_url: "ws://127.0.0.1:8080/ws/chat".to_string(),
            reconnect_delay_secs: 3,
            request_poll_secs: 60,
            notification_capacity: 20,
            http_timeout_secs: 30,
        }
    }
}

/// The original web client built the socket URL by swapping the API scheme,
/// so `https` backends get `wss` automatically.
fn derive_ws_url(api_base_url: &str) -> String {
    let swapped = if let Some(rest) = api_base_url.strip_prefix("https") {
        format!("wss{}", rest)
    } else if let Some(rest) = api_base_url.strip_prefix("http") {
        format!("ws{}", rest)
    } else {
        api_base_url.to_string()
    };
    format!("{}/ws/chat", swapped.trim_end_matches('/'))
}
