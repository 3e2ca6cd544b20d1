//! Subscription coordinator
//!
//! One handle per process. Debounces repeated resolutions, lets at most one
//! resolution run at a time, short-circuits right after a purchase, and tries
//! a device restore before asking the server when the last known status was
//! `expired`.
//!
//! Concurrent callers never wait on each other: while a resolution is in
//! flight they get the cached status, or `loading` if there is none. Every
//! error and panic inside a resolution becomes `loading`.

use futures::FutureExt;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::error::ClientError;
use super::local_store::{LocalStateStore, StoreKey};
use super::resolver::{SsotResolver, SsotStatus};
use super::restore::{has_active_purchase, RestoreAdapter};

/// Status vocabulary exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UiStatus {
    Loading,
    Active,
    Trial,
    Expired,
}

impl UiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Loading => "loading",
            Self::Active => "active",
            Self::Trial => "trial",
            Self::Expired => "expired",
        }
    }

    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "loading" => Some(Self::Loading),
            "active" => Some(Self::Active),
            "trial" => Some(Self::Trial),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

impl fmt::Display for UiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<SsotStatus> for UiStatus {
    fn from(status: SsotStatus) -> Self {
        match status {
            SsotStatus::Subscribed => Self::Active,
            SsotStatus::Blocked => Self::Expired,
            SsotStatus::Trial => Self::Trial,
            SsotStatus::Loading => Self::Loading,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub debounce_window: Duration,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            debounce_window: Duration::from_secs(3),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ResolveOptions {
    /// Ignore the debounce window
    pub force_refresh: bool,
    /// Do not query the device billing layer this time
    pub skip_restore: bool,
}

impl ResolveOptions {
    pub fn force() -> Self {
        Self {
            force_refresh: true,
            skip_restore: false,
        }
    }
}

#[derive(Debug, Default)]
struct CoordinatorState {
    is_processing: bool,
    last_result: Option<UiStatus>,
    last_processed_at: Option<Instant>,
    purchase_just_completed: bool,
}

impl CoordinatorState {
    fn cache(&mut self, status: UiStatus) {
        self.last_result = Some(status);
        self.last_processed_at = Some(Instant::now());
    }
}

/// Clears the in-flight flag on every exit path, including unwinding
struct InFlightGuard<'a> {
    state: &'a Mutex<CoordinatorState>,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_processing = false;
    }
}

pub struct SubscriptionCoordinator {
    resolver: SsotResolver,
    restore: Arc<dyn RestoreAdapter>,
    store: Arc<dyn LocalStateStore>,
    config: CoordinatorConfig,
    state: Mutex<CoordinatorState>,
}

impl SubscriptionCoordinator {
    pub fn new(
        resolver: SsotResolver,
        restore: Arc<dyn RestoreAdapter>,
        store: Arc<dyn LocalStateStore>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            resolver,
            restore,
            store,
            config,
            state: Mutex::new(CoordinatorState::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve the current status for display
    pub async fn resolve_subscription_status(&self, options: ResolveOptions) -> UiStatus {
        {
            let mut state = self.lock();

            if !options.force_refresh {
                if let (Some(result), Some(at)) = (state.last_result, state.last_processed_at) {
                    if at.elapsed() < self.config.debounce_window {
                        debug!(path = "cache", status = %result, "Subscription resolved");
                        return result;
                    }
                }
            }

            if state.is_processing {
                let status = state.last_result.unwrap_or(UiStatus::Loading);
                debug!(path = "in_flight", status = %status, "Subscription resolved");
                return status;
            }

            if state.purchase_just_completed {
                state.purchase_just_completed = false;
                state.cache(UiStatus::Active);
                debug!(path = "purchase", status = "active", "Subscription resolved");
                return UiStatus::Active;
            }

            state.is_processing = true;
        }

        let guard = InFlightGuard { state: &self.state };

        let outcome = AssertUnwindSafe(self.resolve_uncached(options.skip_restore))
            .catch_unwind()
            .await;

        let (status, path) = match outcome {
            Ok(Ok(resolved)) => resolved,
            Ok(Err(e)) => {
                warn!(error = %e, "Subscription resolution failed");
                (UiStatus::Loading, "error")
            }
            Err(_) => {
                error!("Subscription resolution panicked");
                (UiStatus::Loading, "error")
            }
        };

        self.lock().cache(status);
        drop(guard);

        debug!(path, status = %status, "Subscription resolved");
        status
    }

    async fn resolve_uncached(
        &self,
        skip_restore: bool,
    ) -> Result<(UiStatus, &'static str), ClientError> {
        let local = self.store.get(StoreKey::SubscriptionStatus).await?;

        if !skip_restore && local.as_deref().and_then(UiStatus::parse) == Some(UiStatus::Expired)
        {
            if self.try_restore().await? {
                self.persist_status(UiStatus::Active).await;
                return Ok((UiStatus::Active, "restore"));
            }
        }

        let status = UiStatus::from(self.resolver.resolve().await?);
        if status != UiStatus::Loading {
            self.persist_status(status).await;
        }
        Ok((status, "ssot"))
    }

    /// Query the device billing layer. Restore flags are written before the
    /// query so a crash mid-restore still reads as a failed attempt.
    async fn try_restore(&self) -> Result<bool, ClientError> {
        self.store.set_flag(StoreKey::RestoreAttempted, true).await?;
        self.store.set_flag(StoreKey::RestoreSucceeded, false).await?;

        match self.restore.restore_purchases().await {
            Ok(records) => {
                let restored = has_active_purchase(
                    &records,
                    chrono::Utc::now(),
                    self.resolver.catalog(),
                );
                if restored {
                    self.store.set_flag(StoreKey::RestoreSucceeded, true).await?;
                } else {
                    debug!(count = records.len(), "Restore found no active purchase");
                }
                Ok(restored)
            }
            Err(e) => {
                warn!(error = %e, "Restore failed; falling back to server verification");
                Ok(false)
            }
        }
    }

    async fn persist_status(&self, status: UiStatus) {
        if let Err(e) = self
            .store
            .set(StoreKey::SubscriptionStatus, status.as_str())
            .await
        {
            warn!(error = %e, "Failed to persist subscription status");
        }
    }

    /// Mark a purchase as just completed. The in-memory state is updated
    /// before any I/O, so the next resolution returns `active` even if it
    /// starts before this future finishes.
    pub async fn handle_purchase_complete(&self) {
        {
            let mut state = self.lock();
            state.purchase_just_completed = true;
            state.cache(UiStatus::Active);
        }

        for key in [StoreKey::RestoreAttempted, StoreKey::RestoreSucceeded] {
            if let Err(e) = self.store.remove(key).await {
                warn!(error = %e, key = key.as_str(), "Failed to clear restore flag");
            }
        }
        self.persist_status(UiStatus::Active).await;
    }

    /// Drop the cached result. Leaves other flags alone.
    pub fn invalidate_cache(&self) {
        let mut state = self.lock();
        state.last_result = None;
        state.last_processed_at = None;
    }

    /// Non-blocking read for render-time use
    pub fn get_cached_status(&self) -> Option<UiStatus> {
        self.lock().last_result
    }

    pub fn is_processing(&self) -> bool {
        self.lock().is_processing
    }

    /// Clear all coordinator state and the local restore markers
    pub async fn reset_for_testing(&self) {
        *self.lock() = CoordinatorState::default();

        for key in [StoreKey::RestoreAttempted, StoreKey::RestoreSucceeded] {
            if let Err(e) = self.store.remove(key).await {
                warn!(error = %e, key = key.as_str(), "Failed to clear restore flag");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::error::{RestoreError, VerifyCallError};
    use crate::client::local_store::InMemoryStateStore;
    use crate::client::resolver::ResolverConfig;
    use crate::client::restore::PurchaseRecord;
    use crate::client::verifier::VerificationClient;
    use crate::types::VerificationResult;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    // ------------------------------------------------------------------
    // Fakes
    // ------------------------------------------------------------------

    enum Reply {
        Result(VerificationResult),
        Error(VerifyCallError),
        Panic,
    }

    struct FakeClient {
        reply: Mutex<Reply>,
        calls: AtomicUsize,
        delay: Duration,
    }

    impl FakeClient {
        fn new(reply: Reply) -> Arc<Self> {
            Self::slow(reply, Duration::ZERO)
        }

        fn slow(reply: Reply, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                reply: Mutex::new(reply),
                calls: AtomicUsize::new(0),
                delay,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set(&self, reply: Reply) {
            *self.reply.lock().unwrap() = reply;
        }
    }

    #[async_trait]
    impl VerificationClient for FakeClient {
        async fn verify(&self, _: &str, _: &str) -> Result<VerificationResult, VerifyCallError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let reply = match &*self.reply.lock().unwrap() {
                Reply::Result(r) => Some(Ok(r.clone())),
                Reply::Error(e) => Some(Err(e.clone())),
                Reply::Panic => None,
            };
            // panic outside the lock so the fake stays usable
            match reply {
                Some(reply) => reply,
                None => panic!("verification client blew up"),
            }
        }
    }

    struct FakeRestore {
        reply: Result<Vec<PurchaseRecord>, RestoreError>,
        calls: AtomicUsize,
    }

    impl FakeRestore {
        fn new(reply: Result<Vec<PurchaseRecord>, RestoreError>) -> Arc<Self> {
            Arc::new(Self {
                reply,
                calls: AtomicUsize::new(0),
            })
        }

        fn nothing() -> Arc<Self> {
            Self::new(Ok(Vec::new()))
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RestoreAdapter for FakeRestore {
        async fn restore_purchases(&self) -> Result<Vec<PurchaseRecord>, RestoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.reply.clone()
        }
    }

    fn trial_result() -> VerificationResult {
        VerificationResult {
            trial_active: true,
            has_used_trial: true,
            days_remaining: 6,
            server_time: Some(Utc::now()),
            ..Default::default()
        }
    }

    fn lapsed_result() -> VerificationResult {
        VerificationResult {
            has_purchase_history: true,
            has_used_trial: true,
            server_time: Some(Utc::now()),
            ..Default::default()
        }
    }

    fn active_purchase() -> PurchaseRecord {
        PurchaseRecord {
            product_id: "premium_monthly".into(),
            purchase_token: "tok".into(),
            purchased_at: None,
            expires_at: Some(Utc::now() + chrono::Duration::days(30)),
            is_pending: false,
        }
    }

    async fn coordinator(
        client: Arc<FakeClient>,
        restore: Arc<FakeRestore>,
    ) -> (Arc<SubscriptionCoordinator>, Arc<InMemoryStateStore>) {
        let store = Arc::new(InMemoryStateStore::new());
        store.set(StoreKey::UserId, "alice").await.unwrap();
        store.set(StoreKey::AuthToken, "token").await.unwrap();
        let resolver = SsotResolver::new(client, store.clone(), ResolverConfig::default());
        let coordinator = SubscriptionCoordinator::new(
            resolver,
            restore,
            store.clone(),
            CoordinatorConfig::default(),
        );
        (Arc::new(coordinator), store)
    }

    // ------------------------------------------------------------------
    // Tests
    // ------------------------------------------------------------------

    #[tokio::test]
    async fn test_maps_ssot_and_caches() {
        let client = FakeClient::new(Reply::Result(trial_result()));
        let (coordinator, store) = coordinator(client.clone(), FakeRestore::nothing()).await;

        let status = coordinator
            .resolve_subscription_status(ResolveOptions::default())
            .await;
        assert_eq!(status, UiStatus::Trial);
        assert_eq!(coordinator.get_cached_status(), Some(UiStatus::Trial));
        assert_eq!(
            store.get(StoreKey::SubscriptionStatus).await.unwrap().as_deref(),
            Some("trial")
        );
        assert!(!coordinator.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_debounce_window() {
        let client = FakeClient::new(Reply::Result(trial_result()));
        let (coordinator, _) = coordinator(client.clone(), FakeRestore::nothing()).await;

        coordinator
            .resolve_subscription_status(ResolveOptions::default())
            .await;
        coordinator
            .resolve_subscription_status(ResolveOptions::default())
            .await;
        assert_eq!(client.calls(), 1);

        tokio::time::advance(Duration::from_secs(2)).await;
        coordinator
            .resolve_subscription_status(ResolveOptions::default())
            .await;
        assert_eq!(client.calls(), 1);

        tokio::time::advance(Duration::from_millis(1500)).await;
        coordinator
            .resolve_subscription_status(ResolveOptions::default())
            .await;
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_force_refresh_bypasses_debounce() {
        let client = FakeClient::new(Reply::Result(trial_result()));
        let (coordinator, _) = coordinator(client.clone(), FakeRestore::nothing()).await;

        coordinator
            .resolve_subscription_status(ResolveOptions::default())
            .await;
        coordinator
            .resolve_subscription_status(ResolveOptions::force())
            .await;
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_calls_share_one_resolution() {
        let client = FakeClient::slow(Reply::Result(trial_result()), Duration::from_millis(500));
        let (coordinator, _) = coordinator(client.clone(), FakeRestore::nothing()).await;

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .resolve_subscription_status(ResolveOptions::force())
                    .await
            })
        };
        // let the first call reach the verification sleep
        tokio::task::yield_now().await;
        while !coordinator.is_processing() {
            tokio::task::yield_now().await;
        }

        let mut others = Vec::new();
        for _ in 0..5 {
            others.push(
                coordinator
                    .resolve_subscription_status(ResolveOptions::force())
                    .await,
            );
        }
        assert!(others.iter().all(|s| *s == UiStatus::Loading));

        assert_eq!(first.await.unwrap(), UiStatus::Trial);
        assert_eq!(client.calls(), 1);
        assert!(!coordinator.is_processing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_returns_previous_cached_value() {
        let client = FakeClient::slow(Reply::Result(trial_result()), Duration::from_millis(500));
        let (coordinator, _) = coordinator(client.clone(), FakeRestore::nothing()).await;
        coordinator
            .resolve_subscription_status(ResolveOptions::default())
            .await;

        let first = {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                coordinator
                    .resolve_subscription_status(ResolveOptions::force())
                    .await
            })
        };
        while !coordinator.is_processing() {
            tokio::task::yield_now().await;
        }

        assert_eq!(
            coordinator
                .resolve_subscription_status(ResolveOptions::force())
                .await,
            UiStatus::Trial
        );
        first.await.unwrap();
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_purchase_complete_short_circuits() {
        let client = FakeClient::new(Reply::Result(lapsed_result()));
        let (coordinator, store) = coordinator(client.clone(), FakeRestore::nothing()).await;
        store.set_flag(StoreKey::RestoreAttempted, true).await.unwrap();

        coordinator.handle_purchase_complete().await;
        assert_eq!(coordinator.get_cached_status(), Some(UiStatus::Active));
        assert_eq!(store.get(StoreKey::RestoreAttempted).await.unwrap(), None);

        // within the debounce window
        assert_eq!(
            coordinator
                .resolve_subscription_status(ResolveOptions::default())
                .await,
            UiStatus::Active
        );
        // and even when forced, the flag answers once without I/O
        assert_eq!(
            coordinator
                .resolve_subscription_status(ResolveOptions::force())
                .await,
            UiStatus::Active
        );
        assert_eq!(client.calls(), 0);

        // flag consumed; the next forced call verifies
        coordinator
            .resolve_subscription_status(ResolveOptions::force())
            .await;
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_restore_success_skips_server() {
        let client = FakeClient::new(Reply::Result(lapsed_result()));
        let restore = FakeRestore::new(Ok(vec![active_purchase()]));
        let (coordinator, store) = coordinator(client.clone(), restore.clone()).await;
        store.set(StoreKey::SubscriptionStatus, "expired").await.unwrap();

        let status = coordinator
            .resolve_subscription_status(ResolveOptions::default())
            .await;
        assert_eq!(status, UiStatus::Active);
        assert_eq!(restore.calls(), 1);
        assert_eq!(client.calls(), 0);
        assert!(store.get_flag(StoreKey::RestoreAttempted).await.unwrap());
        assert!(store.get_flag(StoreKey::RestoreSucceeded).await.unwrap());
        assert_eq!(
            store.get(StoreKey::SubscriptionStatus).await.unwrap().as_deref(),
            Some("active")
        );
    }

    #[tokio::test]
    async fn test_failed_restore_falls_through_to_loading() {
        let client = FakeClient::new(Reply::Result(lapsed_result()));
        let restore = FakeRestore::new(Err(RestoreError::Unavailable("no store".into())));
        let (coordinator, store) = coordinator(client.clone(), restore.clone()).await;
        store.set(StoreKey::SubscriptionStatus, "expired").await.unwrap();

        // purchase history + failed restore => one more chance
        let status = coordinator
            .resolve_subscription_status(ResolveOptions::default())
            .await;
        assert_eq!(status, UiStatus::Loading);
        assert_eq!(restore.calls(), 1);
        assert_eq!(client.calls(), 1);
    }

    #[tokio::test]
    async fn test_skip_restore() {
        let client = FakeClient::new(Reply::Result(lapsed_result()));
        let restore = FakeRestore::new(Ok(vec![active_purchase()]));
        let (coordinator, store) = coordinator(client.clone(), restore.clone()).await;
        store.set(StoreKey::SubscriptionStatus, "expired").await.unwrap();

        let status = coordinator
            .resolve_subscription_status(ResolveOptions {
                force_refresh: false,
                skip_restore: true,
            })
            .await;
        assert_eq!(status, UiStatus::Expired);
        assert_eq!(restore.calls(), 0);
    }

    #[tokio::test]
    async fn test_errors_and_panics_become_loading() {
        let client = FakeClient::new(Reply::Error(VerifyCallError::Network("down".into())));
        let (coordinator, _) = coordinator(client.clone(), FakeRestore::nothing()).await;

        assert_eq!(
            coordinator
                .resolve_subscription_status(ResolveOptions::force())
                .await,
            UiStatus::Loading
        );

        client.set(Reply::Panic);
        assert_eq!(
            coordinator
                .resolve_subscription_status(ResolveOptions::force())
                .await,
            UiStatus::Loading
        );
        assert_eq!(coordinator.get_cached_status(), Some(UiStatus::Loading));
        assert!(!coordinator.is_processing());

        client.set(Reply::Result(trial_result()));
        assert_eq!(
            coordinator
                .resolve_subscription_status(ResolveOptions::force())
                .await,
            UiStatus::Trial
        );
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let client = FakeClient::new(Reply::Result(trial_result()));
        let (coordinator, _) = coordinator(client.clone(), FakeRestore::nothing()).await;
        coordinator
            .resolve_subscription_status(ResolveOptions::default())
            .await;

        coordinator.invalidate_cache();
        assert_eq!(coordinator.get_cached_status(), None);
        coordinator.invalidate_cache();
        assert_eq!(coordinator.get_cached_status(), None);

        coordinator
            .resolve_subscription_status(ResolveOptions::default())
            .await;
        assert_eq!(client.calls(), 2);
    }

    #[tokio::test]
    async fn test_reset_for_testing() {
        let client = FakeClient::new(Reply::Result(trial_result()));
        let (coordinator, store) = coordinator(client, FakeRestore::nothing()).await;
        coordinator.handle_purchase_complete().await;
        store.set_flag(StoreKey::RestoreAttempted, true).await.unwrap();

        coordinator.reset_for_testing().await;
        assert_eq!(coordinator.get_cached_status(), None);
        assert!(!coordinator.is_processing());
        assert_eq!(store.get(StoreKey::RestoreAttempted).await.unwrap(), None);

        // purchase flag gone too
        assert_eq!(
            coordinator
                .resolve_subscription_status(ResolveOptions::default())
                .await,
            UiStatus::Trial
        );
    }
}
