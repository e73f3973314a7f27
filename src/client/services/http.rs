use std::time::Duration;

use serde::Deserialize;
use serde_json::json;

use crate::client::config::ClientConfig;
use crate::client::models::article::Article;
use crate::client::models::conversation::Message;
use crate::client::services::downloads::{DownloadApi, DownloadCheck, FilePayload};
use crate::client::services::error::ExchangeError;
use crate::client::services::favorites::FavoritesApi;
use crate::client::services::friends::{FriendRequest, FriendsApi, SearchRow, UserInfo};
use crate::client::services::wire::resolve_filename;

/// Conversation history, separate from the live socket.
pub trait MessagesApi {
    fn history(
        &self,
        username: &str,
        friend: &str,
    ) -> impl std::future::Future<Output = Result<Vec<Message>, ExchangeError>> + Send;
}

/// REST client for the exchange backend. One instance per session; reqwest
/// pools connections underneath.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base: String,
}

// Response envelopes; the backend wraps every list in an object.

#[derive(Deserialize)]
struct FriendsEnvelope {
    #[serde(default)]
    friends: Vec<UserInfo>,
}

#[derive(Deserialize)]
struct RequestsEnvelope {
    #[serde(default)]
    requests: Vec<FriendRequest>,
}

#[derive(Deserialize)]
struct CountEnvelope {
    count: u32,
}

#[derive(Deserialize)]
struct SearchEnvelope {
    #[serde(default)]
    users: Vec<SearchRow>,
}

#[derive(Deserialize)]
struct FavoriteStatus {
    #[serde(rename = "isFavorited", default)]
    is_favorited: bool,
}

#[derive(Deserialize)]
struct FavoritesEnvelope {
    #[serde(default)]
    favorites: Vec<Article>,
}

#[derive(Deserialize)]
struct MessagesEnvelope {
    #[serde(default)]
    messages: Vec<Message>,
}

#[derive(Deserialize)]
pub struct ArticlePage {
    #[serde(rename = "totalCount", default)]
    pub total_count: i64,
    #[serde(default)]
    pub data: Vec<Article>,
}

#[derive(Deserialize)]
struct Profile {
    #[allow(dead_code)]
    username: String,
    points: i64,
}

#[derive(Deserialize, Default)]
struct ErrorBody {
    #[serde(default)]
    error: String,
    #[serde(rename = "alreadyFavorited", default)]
    already_favorited: bool,
}

impl ApiClient {
    pub fn new(cfg: &ClientConfig) -> Result<Self, ExchangeError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.http_timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base: cfg.api_base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base, path.trim_start_matches('/'))
    }

    /// Map a non-2xx response onto the error taxonomy, keeping the server's
    /// own message when it sent one.
    async fn error_for(resp: reqwest::Response) -> ExchangeError {
        let status = resp.status().as_u16();
        let body: ErrorBody = resp.json().await.unwrap_or_default();
        let message = if body.error.is_empty() {
            "request failed".to_string()
        } else {
            body.error
        };
        if status == 409 && body.already_favorited {
            ExchangeError::Conflict(message)
        } else {
            ExchangeError::request(status, message)
        }
    }

    async fn parse<T: serde::de::DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<T, ExchangeError> {
        if !resp.status().is_success() {
            return Err(Self::error_for(resp).await);
        }
        Ok(resp.json().await?)
    }

    /// Paged article listing for the browse view.
    pub async fn articles(
        &self,
        username: &str,
        page: u32,
        page_size: u32,
    ) -> Result<ArticlePage, ExchangeError> {
        let resp = self
            .http
            .get(self.url("articles"))
            .query(&[
                ("page", page.to_string()),
                ("pageSize", page_size.to_string()),
                ("username", username.to_string()),
            ])
            .send()
            .await?;
        Self::parse(resp).await
    }

    /// The user's bookmarked articles, newest bookmark first.
    pub async fn favorites(&self, username: &str) -> Result<Vec<Article>, ExchangeError> {
        let resp = self
            .http
            .get(self.url("favorites"))
            .query(&[("username", username)])
            .send()
            .await?;
        Ok(Self::parse::<FavoritesEnvelope>(resp).await?.favorites)
    }
}

impl MessagesApi for ApiClient {
    async fn history(&self, username: &str, friend: &str) -> Result<Vec<Message>, ExchangeError> {
        let resp = self
            .http
            .get(self.url("messages"))
            .query(&[("username", username), ("friendUsername", friend)])
            .send()
            .await?;
        Ok(Self::parse::<MessagesEnvelope>(resp).await?.messages)
    }
}

impl FriendsApi for ApiClient {
    async fn friends(&self, username: &str) -> Result<Vec<UserInfo>, ExchangeError> {
        let resp = self
            .http
            .get(self.url("friends"))
            .query(&[("username", username)])
            .send()
            .await?;
        Ok(Self::parse::<FriendsEnvelope>(resp).await?.friends)
    }

    async fn friend_requests(&self, username: &str) -> Result<Vec<FriendRequest>, ExchangeError> {
        let resp = self
            .http
            .get(self.url("friend-requests"))
            .query(&[("username", username)])
            .send()
            .await?;
        Ok(Self::parse::<RequestsEnvelope>(resp).await?.requests)
    }

    async fn friend_request_count(&self, username: &str) -> Result<u32, ExchangeError> {
        let resp = self
            .http
            .get(self.url("friend-request-count"))
            .query(&[("username", username)])
            .send()
            .await?;
        Ok(Self::parse::<CountEnvelope>(resp).await?.count)
    }

    async fn send_friend_request(&self, from: &str, to: &str) -> Result<(), ExchangeError> {
        let resp = self
            .http
            .post(self.url("friend-requests"))
            .json(&json!({ "username": from, "targetUsername": to }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp).await);
        }
        Ok(())
    }

    async fn respond_friend_request(
        &self,
        username: &str,
        request_id: i64,
        accept: bool,
    ) -> Result<(), ExchangeError> {
        let resp = self
            .http
            .put(self.url(&format!("friend-requests/{}", request_id)))
            .json(&json!({ "accept": accept, "username": username }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp).await);
        }
        Ok(())
    }

    async fn delete_friend(&self, username: &str, friend: &str) -> Result<(), ExchangeError> {
        let resp = self
            .http
            .delete(self.url("friend"))
            .json(&json!({ "username": username, "friendUsername": friend }))
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp).await);
        }
        Ok(())
    }

    async fn search_users(&self, viewer: &str, query: &str) -> Result<Vec<SearchRow>, ExchangeError> {
        let resp = self
            .http
            .get(self.url("users/search"))
            .query(&[("query", query), ("username", viewer)])
            .send()
            .await?;
        Ok(Self::parse::<SearchEnvelope>(resp).await?.users)
    }
}

impl FavoritesApi for ApiClient {
    async fn favorite_status(&self, username: &str, article_id: i64) -> Result<bool, ExchangeError> {
        let resp = self
            .http
            .get(self.url("favorites/check"))
            .query(&[
                ("username", username.to_string()),
                ("articleId", article_id.to_string()),
            ])
            .send()
            .await?;
        Ok(Self::parse::<FavoriteStatus>(resp).await?.is_favorited)
    }

    async fn add_favorite(&self, username: &str, article_id: i64) -> Result<bool, ExchangeError> {
        let resp = self
            .http
            .post(self.url("favorites"))
            .json(&json!({ "username": username, "articleId": article_id }))
            .send()
            .await?;
        Ok(Self::parse::<FavoriteStatus>(resp).await?.is_favorited)
    }

    async fn remove_favorite(&self, username: &str, article_id: i64) -> Result<bool, ExchangeError> {
        let resp = self
            .http
            .delete(self.url("favorites"))
            .json(&json!({ "username": username, "articleId": article_id }))
            .send()
            .await?;
        Ok(Self::parse::<FavoriteStatus>(resp).await?.is_favorited)
    }
}

impl DownloadApi for ApiClient {
    async fn check_download(
        &self,
        username: &str,
        article_id: i64,
    ) -> Result<DownloadCheck, ExchangeError> {
        let resp = self
            .http
            .post(self.url("download"))
            .query(&[
                ("id", article_id.to_string()),
                ("username", username.to_string()),
                ("check", "true".to_string()),
            ])
            .send()
            .await?;
        Self::parse(resp).await
    }

    async fn fetch_file(
        &self,
        username: &str,
        article_id: i64,
        suggested_name: &str,
    ) -> Result<FilePayload, ExchangeError> {
        let resp = self
            .http
            .post(self.url("download"))
            .query(&[
                ("id", article_id.to_string()),
                ("username", username.to_string()),
            ])
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(Self::error_for(resp).await);
        }
        let disposition = resp
            .headers()
            .get(reqwest::header::CONTENT_DISPOSITION)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());
        let filename = resolve_filename(disposition.as_deref(), suggested_name);
        let bytes = resp.bytes().await?.to_vec();
        Ok(FilePayload { filename, bytes })
    }

    async fn balance(&self, username: &str) -> Result<i64, ExchangeError> {
        let resp = self
            .http
            .get(self.url("profile"))
            .query(&[("username", username)])
            .send()
            .await?;
        Ok(Self::parse::<Profile>(resp).await?.points)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slashes() {
        let cfg = ClientConfig {
            api_base_url: "http://127.0.0.1:8080/".to_string(),
            ..ClientConfig::default()
        };
        let api = ApiClient::new(&cfg).unwrap();
        assert_eq!(api.url("/friends"), "http://127.0.0.1:8080/friends");
        assert_eq!(api.url("friend-requests"), "http://127.0.0.1:8080/friend-requests");
    }

    #[test]
    fn error_body_decodes_the_conflict_marker() {
        let body: ErrorBody =
            serde_json::from_str(r#"{"error":"already bookmarked","alreadyFavorited":true}"#)
                .unwrap();
        assert!(body.already_favorited);
        assert_eq!(body.error, "already bookmarked");
    }

    #[test]
    fn check_payload_decodes() {
        let check: DownloadCheck = serde_json::from_str(
            r#"{"can_download":true,"required_points":15,"current_points":20}"#,
        )
        .unwrap();
        assert!(check.can_download);
        assert_eq!(check.required_points, 15);
        assert_eq!(check.current_points, 20);
    }
}
