use std::collections::HashMap;
use std::future::Future;

use serde::Deserialize;
use tokio::sync::Mutex;

use crate::client::services::error::ExchangeError;

/// Server answer to a `check=true` download probe. Read-only server-side.
#[derive(Debug, Clone, Deserialize)]
pub struct DownloadCheck {
    #[serde(default)]
    pub can_download: bool,
    pub required_points: i64,
    pub current_points: i64,
}

/// A downloaded payload with its resolved save name.
#[derive(Debug, Clone)]
pub struct FilePayload {
    pub filename: String,
    pub bytes: Vec<u8>,
}

/// What the confirmation prompt shows the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadQuote {
    pub article_id: i64,
    pub cost: i64,
    pub balance: i64,
}

impl DownloadQuote {
    pub fn remaining_after(&self) -> i64 {
        self.balance - self.cost
    }
}

/// Transaction phase per (user, article). Terminal phases clear the entry, so
/// a finished or failed transaction reads as Idle again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DownloadPhase {
    #[default]
    Idle,
    Checking,
    AwaitingConfirmation,
    Committing,
}

#[derive(Debug)]
pub enum DownloadOutcome {
    Completed {
        file: FilePayload,
        /// Refetched balance; None when the refresh itself failed (the stale
        /// display value is tolerable until the next check).
        balance: Option<i64>,
    },
    /// The user declined at the confirmation step.
    Cancelled,
    /// A transaction for this (user, article) was already running; the press
    /// was ignored.
    InFlight,
}

/// Endpoints the download transaction drives.
pub trait DownloadApi {
    fn check_download(
        &self,
        username: &str,
        article_id: i64,
    ) -> impl Future<Output = Result<DownloadCheck, ExchangeError>> + Send;
    fn fetch_file(
        &self,
        username: &str,
        article_id: i64,
        suggested_name: &str,
    ) -> impl Future<Output = Result<FilePayload, ExchangeError>> + Send;
    /// Authoritative point balance, from the profile endpoint.
    fn balance(&self, username: &str) -> impl Future<Output = Result<i64, ExchangeError>> + Send;
}

/// Orchestrates the check → confirm → commit spend of points on a file.
///
/// The server is the sole source of truth for whether a spend occurred; the
/// coordinator never does balance arithmetic, it only re-reads the balance
/// after a successful commit.
pub struct DownloadCoordinator<A> {
    api: A,
    phases: Mutex<HashMap<(String, i64), DownloadPhase>>,
    balances: Mutex<HashMap<String, i64>>,
}

impl<A: DownloadApi> DownloadCoordinator<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            phases: Mutex::new(HashMap::new()),
            balances: Mutex::new(HashMap::new()),
        }
    }

    pub async fn phase(&self, username: &str, article_id: i64) -> DownloadPhase {
        self.phases
            .lock()
            .await
            .get(&(username.to_string(), article_id))
            .copied()
            .unwrap_or_default()
    }

    /// Last balance seen from the server, for display only.
    pub async fn cached_balance(&self, username: &str) -> Option<i64> {
        self.balances.lock().await.get(username).copied()
    }

    /// Handle a download press.
    ///
    /// `confirm` is awaited between check and commit with no network call in
    /// flight; resolving it to false cancels the transaction. A press while
    /// the same article is already non-Idle for this user is a no-op.
    pub async fn press<C, F>(
        &self,
        username: &str,
        article_id: i64,
        suggested_name: &str,
        confirm: C,
    ) -> Result<DownloadOutcome, ExchangeError>
    where
        C: FnOnce(DownloadQuote) -> F,
        F: Future<Output = bool>,
    {
        let key = (username.to_string(), article_id);
        {
            // Check-then-act under the lock, before any suspension point, so
            // a double-click cannot start two transactions.
            let mut phases = self.phases.lock().await;
            if phases.get(&key).copied().unwrap_or_default() != DownloadPhase::Idle {
                return Ok(DownloadOutcome::InFlight);
            }
            phases.insert(key.clone(), DownloadPhase::Checking);
        }

        let result = self
            .run(&key, username, article_id, suggested_name, confirm)
            .await;
        // Completion, cancellation and failure all destroy the transaction.
        self.phases.lock().await.remove(&key);
        result
    }

    async fn run<C, F>(
        &self,
        key: &(String, i64),
        username: &str,
        article_id: i64,
        suggested_name: &str,
        confirm: C,
    ) -> Result<DownloadOutcome, ExchangeError>
    where
        C: FnOnce(DownloadQuote) -> F,
        F: Future<Output = bool>,
    {
        let check = self.api.check_download(username, article_id).await?;
        self.balances
            .lock()
            .await
            .insert(username.to_string(), check.current_points);

        let quote = DownloadQuote {
            article_id,
            cost: check.required_points,
            balance: check.current_points,
        };
        self.phases
            .lock()
            .await
            .insert(key.clone(), DownloadPhase::AwaitingConfirmation);
        if !confirm(quote).await {
            return Ok(DownloadOutcome::Cancelled);
        }

        self.phases
            .lock()
            .await
            .insert(key.clone(), DownloadPhase::Committing);
        let file = self
            .api
            .fetch_file(username, article_id, suggested_name)
            .await?;

        // Correct the cached balance from the server rather than subtracting
        // locally; another tab may have spent points meanwhile.
        let balance = match self.api.balance(username).await {
            Ok(points) => {
                self.balances
                    .lock()
                    .await
                    .insert(username.to_string(), points);
                Some(points)
            }
            Err(e) => {
                log::warn!(target: "downloads", "balance refresh failed after commit: {}", e);
                None
            }
        };

        Ok(DownloadOutcome::Completed { file, balance })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::sync::Notify;

    struct FakeApi {
        points: Mutex<i64>,
        cost: i64,
        check_calls: AtomicUsize,
        commit_calls: AtomicUsize,
        check_gate: Option<Arc<Notify>>,
        fail_commit: bool,
    }

    impl FakeApi {
        fn new(points: i64, cost: i64) -> Self {
            Self {
                points: Mutex::new(points),
                cost,
                check_calls: AtomicUsize::new(0),
                commit_calls: AtomicUsize::new(0),
                check_gate: None,
                fail_commit: false,
            }
        }
    }

    impl DownloadApi for Arc<FakeApi> {
        async fn check_download(
            &self,
            _username: &str,
            _article_id: i64,
        ) -> Result<DownloadCheck, ExchangeError> {
            self.check_calls.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.check_gate {
                gate.notified().await;
            }
            let points = *self.points.lock().await;
            if points < self.cost {
                return Err(ExchangeError::request(402, "insufficient points"));
            }
            Ok(DownloadCheck {
                can_download: true,
                required_points: self.cost,
                current_points: points,
            })
        }

        async fn fetch_file(
            &self,
            _username: &str,
            _article_id: i64,
            suggested_name: &str,
        ) -> Result<FilePayload, ExchangeError> {
            self.commit_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_commit {
                return Err(ExchangeError::request(500, "ipfs read failed"));
            }
            let mut points = self.points.lock().await;
            *points -= self.cost;
            Ok(FilePayload {
                filename: suggested_name.to_string(),
                bytes: vec![0xCA, 0xFE],
            })
        }

        async fn balance(&self, _username: &str) -> Result<i64, ExchangeError> {
            Ok(*self.points.lock().await)
        }
    }

    #[tokio::test]
    async fn check_confirm_commit_refreshes_balance() {
        let api = Arc::new(FakeApi::new(20, 15));
        let dl = DownloadCoordinator::new(api.clone());
        let outcome = dl
            .press("alice", 9, "report.pdf", |quote| async move {
                assert_eq!(quote.cost, 15);
                assert_eq!(quote.balance, 20);
                assert_eq!(quote.remaining_after(), 5);
                true
            })
            .await
            .unwrap();
        match outcome {
            DownloadOutcome::Completed { file, balance } => {
                assert_eq!(file.filename, "report.pdf");
                assert_eq!(balance, Some(5));
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(dl.cached_balance("alice").await, Some(5));
        assert_eq!(dl.phase("alice", 9).await, DownloadPhase::Idle);
    }

    #[tokio::test]
    async fn double_press_fires_exactly_one_check() {
        let gate = Arc::new(Notify::new());
        let mut api = FakeApi::new(20, 15);
        api.check_gate = Some(gate.clone());
        let api = Arc::new(api);
        let dl = Arc::new(DownloadCoordinator::new(api.clone()));

        let first = {
            let dl = dl.clone();
            tokio::spawn(async move {
                dl.press("alice", 9, "f", |_| async { true }).await
            })
        };
        // Wait until the first press is inside Checking.
        while api.check_calls.load(Ordering::SeqCst) == 0 {
            tokio::task::yield_now().await;
        }

        let second = dl.press("alice", 9, "f", |_| async { true }).await.unwrap();
        assert!(matches!(second, DownloadOutcome::InFlight));

        gate.notify_one();
        let first = first.await.unwrap().unwrap();
        assert!(matches!(first, DownloadOutcome::Completed { .. }));
        assert_eq!(api.check_calls.load(Ordering::SeqCst), 1);
        assert_eq!(api.commit_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancel_resets_to_idle_without_commit() {
        let api = Arc::new(FakeApi::new(20, 15));
        let dl = DownloadCoordinator::new(api.clone());
        let outcome = dl
            .press("alice", 9, "f", |_| async { false })
            .await
            .unwrap();
        assert!(matches!(outcome, DownloadOutcome::Cancelled));
        assert_eq!(api.commit_calls.load(Ordering::SeqCst), 0);
        assert_eq!(dl.phase("alice", 9).await, DownloadPhase::Idle);
        // A fresh press goes through.
        let retry = dl.press("alice", 9, "f", |_| async { true }).await.unwrap();
        assert!(matches!(retry, DownloadOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn check_failure_surfaces_server_message() {
        let api = Arc::new(FakeApi::new(3, 15));
        let dl = DownloadCoordinator::new(api.clone());
        let err = dl
            .press("alice", 9, "f", |_| async { true })
            .await
            .unwrap_err();
        assert_eq!(err.server_message(), Some("insufficient points"));
        assert_eq!(api.commit_calls.load(Ordering::SeqCst), 0);
        assert_eq!(dl.phase("alice", 9).await, DownloadPhase::Idle);
    }

    #[tokio::test]
    async fn commit_failure_spends_nothing_locally() {
        let mut api = FakeApi::new(20, 15);
        api.fail_commit = true;
        let api = Arc::new(api);
        let dl = DownloadCoordinator::new(api.clone());
        let err = dl
            .press("alice", 9, "f", |_| async { true })
            .await
            .unwrap_err();
        assert_eq!(err.server_message(), Some("ipfs read failed"));
        // Balance cache still holds the check-time value; no local debit.
        assert_eq!(dl.cached_balance("alice").await, Some(20));
        assert_eq!(dl.phase("alice", 9).await, DownloadPhase::Idle);
    }
}
