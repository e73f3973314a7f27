use std::collections::HashMap;
use std::future::Future;

use tokio::sync::Mutex;

use crate::client::services::error::ExchangeError;

/// Bookmark calls the coordinator needs from the backend.
pub trait FavoritesApi {
    fn favorite_status(
        &self,
        username: &str,
        article_id: i64,
    ) -> impl Future<Output = Result<bool, ExchangeError>> + Send;
    fn add_favorite(
        &self,
        username: &str,
        article_id: i64,
    ) -> impl Future<Output = Result<bool, ExchangeError>> + Send;
    fn remove_favorite(
        &self,
        username: &str,
        article_id: i64,
    ) -> impl Future<Output = Result<bool, ExchangeError>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToggleOutcome {
    /// The toggle ran; carries the new favorited status.
    Applied(bool),
    /// Another toggle was still in flight; this one was refused.
    Busy,
}

/// Idempotent add/remove of a bookmark.
///
/// Status is fetched lazily once per (user, article) pair and then only
/// updated by local toggles. A single toggle may be outstanding at a time so
/// interleaved add/remove pairs cannot leave the cache and the server
/// disagreeing.
pub struct FavoriteCoordinator<A> {
    api: A,
    statuses: Mutex<HashMap<(String, i64), bool>>,
    busy: Mutex<bool>,
}

impl<A: FavoritesApi> FavoriteCoordinator<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            statuses: Mutex::new(HashMap::new()),
            busy: Mutex::new(false),
        }
    }

    /// Current status, hitting the server only on the first ask per pair.
    pub async fn status(&self, username: &str, article_id: i64) -> Result<bool, ExchangeError> {
        let key = (username.to_string(), article_id);
        if let Some(cached) = self.statuses.lock().await.get(&key) {
            return Ok(*cached);
        }
        let fetched = self.api.favorite_status(username, article_id).await?;
        self.statuses.lock().await.insert(key, fetched);
        Ok(fetched)
    }

    pub async fn toggle(
        &self,
        username: &str,
        article_id: i64,
    ) -> Result<ToggleOutcome, ExchangeError> {
        {
            let mut busy = self.busy.lock().await;
            if *busy {
                return Ok(ToggleOutcome::Busy);
            }
            *busy = true;
        }
        let result = self.toggle_inner(username, article_id).await;
        *self.busy.lock().await = false;
        result.map(ToggleOutcome::Applied)
    }

    async fn toggle_inner(&self, username: &str, article_id: i64) -> Result<bool, ExchangeError> {
        let key = (username.to_string(), article_id);
        let current = self.status(username, article_id).await?;
        let next = if current {
            self.api.remove_favorite(username, article_id).await?
        } else {
            match self.api.add_favorite(username, article_id).await {
                Ok(status) => status,
                // The edge already existed server-side; that is the state we
                // wanted, so report success rather than an error.
                Err(ExchangeError::Conflict(msg)) => {
                    log::debug!(target: "favorites", "add raced an existing edge: {}", msg);
                    true
                }
                Err(e) => return Err(e),
            }
        };
        self.statuses.lock().await.insert(key, next);
        Ok(next)
    }
}
