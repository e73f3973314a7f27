pub mod client;

pub use client::config::ClientConfig;
pub use client::services::connection::{
    ChatHandle, ConnectionRegistry, LinkState, NotificationHandle,
};
pub use client::services::error::ExchangeError;
pub use client::services::http::ApiClient;
