use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::client::services::error::ExchangeError;

/// Relationship between the viewing user and another user, as the list and
/// search views render it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FriendViewStatus {
    /// No edge in either direction.
    #[default]
    None,
    /// The viewer sent a request that is still unanswered.
    Pending,
    /// The other user sent the viewer a request awaiting an answer.
    Request,
    Friends,
}

impl FriendViewStatus {
    pub fn parse(raw: &str) -> Result<Self, ExchangeError> {
        match raw {
            "none" => Ok(FriendViewStatus::None),
            "pending" => Ok(FriendViewStatus::Pending),
            "request" => Ok(FriendViewStatus::Request),
            "friends" => Ok(FriendViewStatus::Friends),
            other => Err(ExchangeError::Protocol(format!(
                "unknown friend status: {}",
                other
            ))),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FriendViewStatus::None => "none",
            FriendViewStatus::Pending => "pending",
            FriendViewStatus::Request => "request",
            FriendViewStatus::Friends => "friends",
        }
    }

    /// Whether `self -> next` is a legal edge of the relationship machine.
    pub fn can_transition(self, next: Self) -> bool {
        use FriendViewStatus::*;
        matches!(
            (self, next),
            (None, Pending)        // viewer sends a request
                | (None, Request)  // the other side sends one first
                | (Pending, Friends)
                | (Request, Friends)
                | (Pending, None)  // request rejected or withdrawn
                | (Request, None)
                | (Friends, None)  // unfriend
        )
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct UserInfo {
    pub id: i64,
    pub username: String,
}

/// An incoming friend request, as the requests list shows it.
#[derive(Debug, Clone, Deserialize)]
pub struct FriendRequest {
    pub id: i64,
    pub requester: UserInfo,
    #[serde(default)]
    pub status: String,
    #[serde(rename = "createTime", default)]
    pub created_at: String,
}

/// One row of a user search result.
#[derive(Debug, Clone)]
pub struct SearchEntry {
    pub user: UserInfo,
    pub status: FriendViewStatus,
}

#[derive(Debug, Clone, Default)]
pub struct FriendListSnapshot {
    pub requests: Vec<FriendRequest>,
    pub friends: Vec<UserInfo>,
}

/// Raw search row as the backend serves it; status arrives as a string.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchRow {
    pub id: i64,
    pub username: String,
    #[serde(rename = "friendStatus", default)]
    pub friend_status: String,
}

/// Backend calls the relationship engine needs.
pub trait FriendsApi {
    fn friends(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<Vec<UserInfo>, ExchangeError>> + Send;
    fn friend_requests(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<Vec<FriendRequest>, ExchangeError>> + Send;
    fn friend_request_count(
        &self,
        username: &str,
    ) -> impl Future<Output = Result<u32, ExchangeError>> + Send;
    fn send_friend_request(
        &self,
        from: &str,
        to: &str,
    ) -> impl Future<Output = Result<(), ExchangeError>> + Send;
    /// `accept = false` rejects the request.
    fn respond_friend_request(
        &self,
        username: &str,
        request_id: i64,
        accept: bool,
    ) -> impl Future<Output = Result<(), ExchangeError>> + Send;
    fn delete_friend(
        &self,
        username: &str,
        friend: &str,
    ) -> impl Future<Output = Result<(), ExchangeError>> + Send;
    fn search_users(
        &self,
        viewer: &str,
        query: &str,
    ) -> impl Future<Output = Result<Vec<SearchRow>, ExchangeError>> + Send;
}

/// Drives friend relationships for one client session.
///
/// The server owns the relationship state; this keeps a per-pair cache so the
/// search and list views agree on what they render between refetches.
pub struct FriendService<A> {
    api: A,
    statuses: Mutex<HashMap<(String, String), FriendViewStatus>>,
}

impl<A: FriendsApi> FriendService<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            statuses: Mutex::new(HashMap::new()),
        }
    }

    pub async fn cached_status(&self, viewer: &str, other: &str) -> FriendViewStatus {
        self.statuses
            .lock()
            .await
            .get(&(viewer.to_string(), other.to_string()))
            .copied()
            .unwrap_or_default()
    }

    /// Search users by name fragment. A row whose status string the client
    /// does not recognize is kept but rendered as no-relationship.
    pub async fn search(
        &self,
        viewer: &str,
        query: &str,
    ) -> Result<Vec<SearchEntry>, ExchangeError> {
        let rows = self.api.search_users(viewer, query).await?;
        let mut statuses = self.statuses.lock().await;
        let mut entries = Vec::with_capacity(rows.len());
        for row in rows {
            let status = match FriendViewStatus::parse(&row.friend_status) {
                Ok(s) => s,
                Err(e) => {
                    log::warn!(target: "friends", "{}; treating {} as none", e, row.username);
                    FriendViewStatus::None
                }
            };
            statuses.insert((viewer.to_string(), row.username.clone()), status);
            entries.push(SearchEntry {
                user: UserInfo {
                    id: row.id,
                    username: row.username,
                },
                status,
            });
        }
        Ok(entries)
    }

    /// Send a friend request. Refused locally when the pair already has an
    /// edge, so a stale button cannot double-send.
    pub async fn send_request(&self, viewer: &str, target: &str) -> Result<(), ExchangeError> {
        if viewer == target {
            return Err(ExchangeError::Protocol(
                "cannot befriend yourself".to_string(),
            ));
        }
        let current = self.cached_status(viewer, target).await;
        if !current.can_transition(FriendViewStatus::Pending) {
            return Err(ExchangeError::Protocol(format!(
                "cannot send a request while {}",
                current.as_str()
            )));
        }
        self.api.send_friend_request(viewer, target).await?;
        self.statuses.lock().await.insert(
            (viewer.to_string(), target.to_string()),
            FriendViewStatus::Pending,
        );
        Ok(())
    }

    /// Accept or reject an incoming request, then refetch both lists so the
    /// view reflects whatever the server actually recorded.
    pub async fn respond(
        &self,
        viewer: &str,
        request_id: i64,
        accept: bool,
    ) -> Result<FriendListSnapshot, ExchangeError> {
        self.api
            .respond_friend_request(viewer, request_id, accept)
            .await?;
        self.refresh(viewer).await
    }

    pub async fn remove_friend(
        &self,
        viewer: &str,
        friend: &str,
    ) -> Result<Vec<UserInfo>, ExchangeError> {
        self.api.delete_friend(viewer, friend).await?;
        self.statuses.lock().await.insert(
            (viewer.to_string(), friend.to_string()),
            FriendViewStatus::None,
        );
        self.api.friends(viewer).await
    }

    pub async fn refresh(&self, viewer: &str) -> Result<FriendListSnapshot, ExchangeError> {
        let requests = self.api.friend_requests(viewer).await?;
        let friends = self.api.friends(viewer).await?;
        let mut statuses = self.statuses.lock().await;
        // A rejected or withdrawn request must read as no-relationship again,
        // so drop the viewer's stale Request/Friends entries before
        // re-inserting from the fetched lists. Outgoing Pending entries are
        // kept; the incoming lists say nothing about them.
        statuses.retain(|(v, _), status| v != viewer || *status == FriendViewStatus::Pending);
        for req in &requests {
            statuses.insert(
                (viewer.to_string(), req.requester.username.clone()),
                FriendViewStatus::Request,
            );
        }
        for friend in &friends {
            statuses.insert(
                (viewer.to_string(), friend.username.clone()),
                FriendViewStatus::Friends,
            );
        }
        Ok(FriendListSnapshot { requests, friends })
    }
}

impl<A> FriendService<A>
where
    A: FriendsApi + Send + Sync + 'static,
{
    /// Poll the pending-request count on a fixed interval for the badge.
    ///
    /// A failed poll keeps the last published value; the next tick retries.
    /// Dropping the receiver or aborting the handle stops the loop.
    pub fn spawn_request_count_poller(
        self: Arc<Self>,
        username: String,
        interval: Duration,
    ) -> (watch::Receiver<u32>, JoinHandle<()>) {
        let (tx, rx) = watch::channel(0u32);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                match self.api.friend_request_count(&username).await {
                    Ok(count) => {
                        if tx.send(count).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log::warn!(target: "friends", "request count poll failed: {}", e);
                        if tx.is_closed() {
                            break;
                        }
                    }
                }
            }
        });
        (rx, handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Two-user relationship store keyed on sorted usernames; enough to
    /// exercise the client-side machine end to end.
    #[derive(Default)]
    struct FakeApi {
        // (requester, target) pairs still pending
        pending: Mutex<Vec<(String, String, i64)>>,
        friends: Mutex<Vec<(String, String)>>,
        next_id: AtomicU32,
        count_calls: AtomicU32,
    }

    impl FakeApi {
        async fn status_for(&self, viewer: &str, other: &str) -> &'static str {
            for (a, b) in self.friends.lock().await.iter() {
                if (a == viewer && b == other) || (a == other && b == viewer) {
                    return "friends";
                }
            }
            for (from, to, _) in self.pending.lock().await.iter() {
                if from == viewer && to == other {
                    return "pending";
                }
                if from == other && to == viewer {
                    return "request";
                }
            }
            "none"
        }
    }

    impl FriendsApi for Arc<FakeApi> {
        async fn friends(&self, username: &str) -> Result<Vec<UserInfo>, ExchangeError> {
            let mut out = Vec::new();
            for (a, b) in self.friends.lock().await.iter() {
                let other = if a == username {
                    b
                } else if b == username {
                    a
                } else {
                    continue;
                };
                out.push(UserInfo {
                    id: 0,
                    username: other.clone(),
                });
            }
            Ok(out)
        }

        async fn friend_requests(
            &self,
            username: &str,
        ) -> Result<Vec<FriendRequest>, ExchangeError> {
            let mut out = Vec::new();
            for (from, to, id) in self.pending.lock().await.iter() {
                if to == username {
                    out.push(FriendRequest {
                        id: *id,
                        requester: UserInfo {
                            id: 0,
                            username: from.clone(),
                        },
                        status: "pending".to_string(),
                        created_at: String::new(),
                    });
                }
            }
            Ok(out)
        }

        async fn friend_request_count(&self, username: &str) -> Result<u32, ExchangeError> {
            self.count_calls.fetch_add(1, Ordering::SeqCst);
            Ok(self
                .friend_requests(username)
                .await?
                .len() as u32)
        }

        async fn send_friend_request(&self, from: &str, to: &str) -> Result<(), ExchangeError> {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1;
            self.pending
                .lock()
                .await
                .push((from.to_string(), to.to_string(), id));
            Ok(())
        }

        async fn respond_friend_request(
            &self,
            _username: &str,
            request_id: i64,
            accept: bool,
        ) -> Result<(), ExchangeError> {
            let mut pending = self.pending.lock().await;
            let pos = pending
                .iter()
                .position(|(_, _, id)| *id == request_id)
                .ok_or_else(|| ExchangeError::request(404, "no such request"))?;
            let (from, to, _) = pending.remove(pos);
            if accept {
                self.friends.lock().await.push((from, to));
            }
            Ok(())
        }

        async fn delete_friend(&self, username: &str, friend: &str) -> Result<(), ExchangeError> {
            self.friends.lock().await.retain(|(a, b)| {
                !((a == username && b == friend) || (a == friend && b == username))
            });
            Ok(())
        }

        async fn search_users(
            &self,
            viewer: &str,
            query: &str,
        ) -> Result<Vec<SearchRow>, ExchangeError> {
            let mut rows = Vec::new();
            for name in ["bruno", "carla", "dario"] {
                if name.contains(query) && name != viewer {
                    rows.push(SearchRow {
                        id: 0,
                        username: name.to_string(),
                        friend_status: self.status_for(viewer, name).await.to_string(),
                    });
                }
            }
            Ok(rows)
        }
    }

    #[test]
    fn transition_table_matches_the_relationship_machine() {
        use FriendViewStatus::*;
        assert!(None.can_transition(Pending));
        assert!(None.can_transition(Request));
        assert!(Pending.can_transition(Friends));
        assert!(Request.can_transition(Friends));
        assert!(Friends.can_transition(None));
        assert!(!Friends.can_transition(Pending));
        assert!(!Pending.can_transition(Request));
        assert!(!None.can_transition(Friends));
    }

    #[test]
    fn unknown_status_string_is_a_protocol_error() {
        assert!(matches!(
            FriendViewStatus::parse("blocked"),
            Err(ExchangeError::Protocol(_))
        ));
        assert_eq!(
            FriendViewStatus::parse("request").unwrap(),
            FriendViewStatus::Request
        );
    }

    #[tokio::test]
    async fn request_accept_unfriend_round_trip() {
        let api = Arc::new(FakeApi::default());
        let bruno = FriendService::new(api.clone());
        let carla = FriendService::new(api.clone());

        bruno.send_request("bruno", "carla").await.unwrap();
        assert_eq!(
            bruno.cached_status("bruno", "carla").await,
            FriendViewStatus::Pending
        );
        // Carla sees the mirrored side.
        let seen = carla.search("carla", "bru").await.unwrap();
        assert_eq!(seen[0].status, FriendViewStatus::Request);

        let snapshot = carla.refresh("carla").await.unwrap();
        assert_eq!(snapshot.requests.len(), 1);
        let req_id = snapshot.requests[0].id;
        let after = carla.respond("carla", req_id, true).await.unwrap();
        assert!(after.requests.is_empty());
        assert_eq!(after.friends[0].username, "bruno");
        assert_eq!(
            carla.cached_status("carla", "bruno").await,
            FriendViewStatus::Friends
        );

        let left = carla.remove_friend("carla", "bruno").await.unwrap();
        assert!(left.is_empty());
        assert_eq!(
            carla.cached_status("carla", "bruno").await,
            FriendViewStatus::None
        );
    }

    #[tokio::test]
    async fn duplicate_request_is_refused_locally() {
        let api = Arc::new(FakeApi::default());
        let svc = FriendService::new(api.clone());
        svc.send_request("bruno", "carla").await.unwrap();
        let err = svc.send_request("bruno", "carla").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Protocol(_)));
        assert_eq!(api.pending.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn self_request_is_refused() {
        let api = Arc::new(FakeApi::default());
        let svc = FriendService::new(api);
        assert!(svc.send_request("bruno", "bruno").await.is_err());
    }

    #[tokio::test]
    async fn reject_leaves_no_edge() {
        let api = Arc::new(FakeApi::default());
        let bruno = FriendService::new(api.clone());
        let carla = FriendService::new(api.clone());
        bruno.send_request("bruno", "carla").await.unwrap();
        let snapshot = carla.refresh("carla").await.unwrap();
        assert_eq!(
            carla.cached_status("carla", "bruno").await,
            FriendViewStatus::Request
        );
        let after = carla
            .respond("carla", snapshot.requests[0].id, false)
            .await
            .unwrap();
        assert!(after.requests.is_empty());
        assert!(after.friends.is_empty());
        // Rejection resets the pair; carla is free to invite bruno herself.
        assert_eq!(
            carla.cached_status("carla", "bruno").await,
            FriendViewStatus::None
        );
        carla.send_request("carla", "bruno").await.unwrap();
        assert_eq!(
            carla.cached_status("carla", "bruno").await,
            FriendViewStatus::Pending
        );
    }

    #[tokio::test]
    async fn refresh_keeps_outgoing_pending_entries() {
        let api = Arc::new(FakeApi::default());
        let svc = FriendService::new(api.clone());
        svc.send_request("bruno", "carla").await.unwrap();
        // Neither fetched list mentions an outgoing request.
        svc.refresh("bruno").await.unwrap();
        assert_eq!(
            svc.cached_status("bruno", "carla").await,
            FriendViewStatus::Pending
        );
        assert!(svc.send_request("bruno", "carla").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn poller_publishes_the_badge_count() {
        let api = Arc::new(FakeApi::default());
        api.send_friend_request("bruno", "carla").await.unwrap();
        let svc = Arc::new(FriendService::new(api.clone()));
        let (mut rx, handle) = svc.spawn_request_count_poller(
            "carla".to_string(),
            Duration::from_secs(60),
        );
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
        // Another request lands; the next tick picks it up.
        api.send_friend_request("dario", "carla").await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 2);
        handle.abort();
    }
}
