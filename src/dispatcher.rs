// Submission dispatcher
// Fans submissions out to every enabled binding, retrying transient failures per binding

use crate::bindings::BindingRegistry;
use crate::config::DispatchConfig;
use crate::error::{FailureClass, ServiceError};
use crate::identity::IdentityKey;
use crate::machine::Item;
use crate::scrobbler::ScrobbleService;
use backoff::backoff::Backoff;
use backoff::{ExponentialBackoff, ExponentialBackoffBuilder};
use futures::future::join_all;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Result of one request to one binding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionOutcome {
    Pending,
    Succeeded,
    FailedTransient,
    FailedPermanent,
    SkippedUnauthenticated,
}

/// Summary over all bindings, for observability only
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregateResult {
    AllSucceeded,
    PartialSuccess,
    AllFailed,
    /// No enabled binding was authenticated
    NoneBound,
}

impl AggregateResult {
    pub fn from_outcomes(outcomes: &BTreeMap<String, SubmissionOutcome>) -> Self {
        if outcomes
            .values()
            .all(|o| *o == SubmissionOutcome::SkippedUnauthenticated)
        {
            return Self::NoneBound;
        }

        let succeeded = outcomes
            .values()
            .filter(|o| **o == SubmissionOutcome::Succeeded)
            .count();

        if succeeded == outcomes.len() {
            Self::AllSucceeded
        } else if succeeded > 0 {
            Self::PartialSuccess
        } else {
            Self::AllFailed
        }
    }
}

/// Per-binding outcomes of one dispatcher request
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmissionReport {
    pub outcomes: BTreeMap<String, SubmissionOutcome>,
    pub aggregate: AggregateResult,
}

impl SubmissionReport {
    fn new(outcomes: BTreeMap<String, SubmissionOutcome>) -> Self {
        let aggregate = AggregateResult::from_outcomes(&outcomes);
        Self { outcomes, aggregate }
    }

    pub fn outcome(&self, service_id: &str) -> Option<SubmissionOutcome> {
        self.outcomes.get(service_id).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct LedgerKey {
    identity: IdentityKey,
    service_id: String,
    listened_at: i64,
}

pub struct SubmissionDispatcher {
    bindings: Arc<BindingRegistry>,
    config: DispatchConfig,
    /// Successful submissions, for deduplicating repeats inside the window
    ledger: Mutex<HashMap<LedgerKey, Instant>>,
    /// One lock per identity so a repeat waits for the earlier submission to finish
    in_flight: Mutex<HashMap<IdentityKey, Arc<AsyncMutex<()>>>>,
}

impl SubmissionDispatcher {
    pub fn new(bindings: Arc<BindingRegistry>, config: DispatchConfig) -> Self {
        Self {
            bindings,
            config,
            ledger: Mutex::new(HashMap::new()),
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    pub fn bindings(&self) -> &Arc<BindingRegistry> {
        &self.bindings
    }

    /// Submit `item` to every enabled binding
    ///
    /// Bindings are contacted concurrently and independently. Cancelling
    /// `cancel` stops pending retries but never interrupts a call in progress.
    pub async fn submit(&self, item: &Item, cancel: &CancellationToken) -> SubmissionReport {
        let key = item.identity().key();
        let lock = self.item_lock(&key);

        let report = {
            let _guard = lock.lock().await;
            let track = item.to_track();
            let listened_at = item.started_at.timestamp();

            let calls = self
                .bindings
                .enabled_services()
                .into_iter()
                .map(|(binding, service)| {
                    let ledger_key = LedgerKey {
                        identity: key.clone(),
                        service_id: binding.service_id.clone(),
                        listened_at,
                    };
                    let track = &track;
                    async move {
                        if !binding.authenticated {
                            log::info!("{}: not authenticated, skipping submission", binding.service_id);
                            return (binding.service_id, SubmissionOutcome::SkippedUnauthenticated);
                        }

                        if self.recently_submitted(&ledger_key) {
                            log::debug!(
                                "{}: {} - {} already submitted, not sending again",
                                binding.service_id,
                                track.artist,
                                track.title
                            );
                            return (binding.service_id, SubmissionOutcome::Succeeded);
                        }

                        let outcome = self
                            .call_with_retry(&binding.service_id, cancel, || {
                                service.scrobble(track, listened_at)
                            })
                            .await;

                        if outcome == SubmissionOutcome::Succeeded {
                            self.remember(ledger_key);
                        }
                        (binding.service_id, outcome)
                    }
                });

            SubmissionReport::new(join_all(calls).await.into_iter().collect())
        };

        self.release_item_lock(&key, lock);
        log::info!(
            "Submitted {} - {}: {:?}",
            item.identity().artist,
            item.identity().track,
            report.aggregate
        );
        report
    }

    /// Propagate a love/unlove to every enabled binding
    pub async fn update_love(&self, item: &Item, loved: bool, cancel: &CancellationToken) -> SubmissionReport {
        let track = item.to_track();
        let calls = self
            .bindings
            .enabled_services()
            .into_iter()
            .map(|(binding, service)| {
                let track = &track;
                async move {
                    if !binding.authenticated {
                        return (binding.service_id, SubmissionOutcome::SkippedUnauthenticated);
                    }
                    let outcome = self
                        .call_with_retry(&binding.service_id, cancel, || service.update_love(track, loved))
                        .await;
                    (binding.service_id, outcome)
                }
            });

        SubmissionReport::new(join_all(calls).await.into_iter().collect())
    }

    /// Best-effort "now playing" relay: one attempt per binding, no retries
    pub async fn now_playing(&self, item: &Item) -> SubmissionReport {
        let track = item.to_track();
        let calls = self
            .bindings
            .enabled_services()
            .into_iter()
            .map(|(binding, service)| {
                let track = &track;
                async move {
                    if !binding.authenticated {
                        return (binding.service_id, SubmissionOutcome::SkippedUnauthenticated);
                    }
                    let outcome = match service.now_playing(track).await {
                        Ok(()) => SubmissionOutcome::Succeeded,
                        Err(err) => {
                            log::warn!("{}: now playing update failed: {}", binding.service_id, err);
                            self.classify_failure(&binding.service_id, &err)
                        }
                    };
                    (binding.service_id, outcome)
                }
            });

        SubmissionReport::new(join_all(calls).await.into_iter().collect())
    }

    async fn call_with_retry<F, Fut>(
        &self,
        service_id: &str,
        cancel: &CancellationToken,
        mut call: F,
    ) -> SubmissionOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), ServiceError>>,
    {
        let mut backoff = self.backoff();
        let mut retries = 0;

        loop {
            let err = match call().await {
                Ok(()) => return SubmissionOutcome::Succeeded,
                Err(err) => err,
            };

            if !err.is_transient() {
                log::warn!("{}: submission failed permanently: {}", service_id, err);
                return self.classify_failure(service_id, &err);
            }

            if retries >= self.config.retry_budget {
                log::warn!(
                    "{}: giving up after {} retries: {}",
                    service_id,
                    retries,
                    err
                );
                return SubmissionOutcome::FailedPermanent;
            }
            retries += 1;

            let max = Duration::from_millis(self.config.max_backoff_ms);
            let delay = match err {
                ServiceError::RateLimited {
                    retry_after: Some(after),
                } => after.min(max),
                _ => backoff.next_backoff().unwrap_or(max),
            };
            log::info!(
                "{}: transient failure ({}), retry {}/{} in {:?}",
                service_id,
                err,
                retries,
                self.config.retry_budget,
                delay
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    log::debug!("{}: retry cancelled", service_id);
                    return SubmissionOutcome::FailedTransient;
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    fn classify_failure(&self, service_id: &str, err: &ServiceError) -> SubmissionOutcome {
        match err.class() {
            FailureClass::Transient => SubmissionOutcome::FailedTransient,
            FailureClass::Permanent => SubmissionOutcome::FailedPermanent,
            FailureClass::AuthRejected => {
                self.bindings.require_reauthentication(service_id);
                SubmissionOutcome::FailedPermanent
            }
        }
    }

    fn backoff(&self) -> ExponentialBackoff {
        ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.initial_backoff_ms))
            .with_max_interval(Duration::from_millis(self.config.max_backoff_ms))
            .with_multiplier(2.0)
            .with_max_elapsed_time(None)
            .build()
    }

    fn item_lock(&self, key: &IdentityKey) -> Arc<AsyncMutex<()>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        in_flight.entry(key.clone()).or_default().clone()
    }

    fn release_item_lock(&self, key: &IdentityKey, lock: Arc<AsyncMutex<()>>) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        drop(lock);
        // Only the map holds it: nobody is waiting
        if in_flight.get(key).is_some_and(|l| Arc::strong_count(l) == 1) {
            in_flight.remove(key);
        }
    }

    fn recently_submitted(&self, key: &LedgerKey) -> bool {
        let window = Duration::from_secs(self.config.dedup_window_secs);
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.retain(|_, at| at.elapsed() < window);
        ledger.contains_key(key)
    }

    fn remember(&self, key: LedgerKey) {
        let mut ledger = self.ledger.lock().unwrap_or_else(PoisonError::into_inner);
        ledger.insert(key, Instant::now());
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::identity::TrackIdentity;
    use crate::scrobbler::Track;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Service whose results are scripted; unscripted calls succeed
    pub(crate) struct ScriptedService {
        id: String,
        script: Mutex<VecDeque<Result<(), ServiceError>>>,
        pub(crate) scrobbles: AtomicUsize,
        pub(crate) now_playing: AtomicUsize,
        pub(crate) loves: AtomicUsize,
    }

    impl ScriptedService {
        pub(crate) fn new(id: &str) -> Arc<Self> {
            Self::scripted(id, Vec::new())
        }

        pub(crate) fn scripted(id: &str, script: Vec<Result<(), ServiceError>>) -> Arc<Self> {
            Arc::new(Self {
                id: id.to_string(),
                script: Mutex::new(script.into()),
                scrobbles: AtomicUsize::new(0),
                now_playing: AtomicUsize::new(0),
                loves: AtomicUsize::new(0),
            })
        }

        fn next(&self) -> Result<(), ServiceError> {
            self.script.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        pub(crate) fn scrobble_count(&self) -> usize {
            self.scrobbles.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl ScrobbleService for ScriptedService {
        fn id(&self) -> &str {
            &self.id
        }

        async fn now_playing(&self, _track: &Track) -> Result<(), ServiceError> {
            self.now_playing.fetch_add(1, Ordering::SeqCst);
            self.next()
        }

        async fn scrobble(&self, _track: &Track, _timestamp: i64) -> Result<(), ServiceError> {
            self.scrobbles.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            self.next()
        }

        async fn update_love(&self, _track: &Track, _loved: bool) -> Result<(), ServiceError> {
            self.loves.fetch_add(1, Ordering::SeqCst);
            self.next()
        }
    }

    fn item() -> Item {
        let identity = TrackIdentity {
            artist: "Artist".into(),
            track: "Track".into(),
            album: None,
            duration_secs: Some(200),
            correction: None,
        };
        Item::new(1, identity, 200)
    }

    fn dispatcher(services: &[(Arc<ScriptedService>, bool)]) -> SubmissionDispatcher {
        let bindings = Arc::new(BindingRegistry::new());
        for (service, authenticated) in services {
            bindings.bind(service.clone(), *authenticated);
        }
        SubmissionDispatcher::new(bindings, DispatchConfig::default())
    }

    #[tokio::test]
    async fn unauthenticated_binding_is_skipped() {
        let a = ScriptedService::new("a");
        let b = ScriptedService::new("b");
        let dispatcher = dispatcher(&[(a.clone(), true), (b.clone(), false)]);

        let report = dispatcher.submit(&item(), &CancellationToken::new()).await;

        assert_eq!(report.outcome("a"), Some(SubmissionOutcome::Succeeded));
        assert_eq!(report.outcome("b"), Some(SubmissionOutcome::SkippedUnauthenticated));
        assert_eq!(report.aggregate, AggregateResult::PartialSuccess);
        assert_eq!(b.scrobble_count(), 0);
    }

    #[tokio::test]
    async fn auth_rejection_is_isolated_and_requests_reauth() {
        let a = ScriptedService::new("a");
        let b = ScriptedService::scripted("b", vec![Err(ServiceError::AuthRejected("expired".into()))]);
        let c = ScriptedService::new("c");
        let dispatcher = dispatcher(&[(a.clone(), true), (b.clone(), true), (c.clone(), true)]);

        let report = dispatcher.submit(&item(), &CancellationToken::new()).await;

        assert_eq!(report.outcome("a"), Some(SubmissionOutcome::Succeeded));
        assert_eq!(report.outcome("b"), Some(SubmissionOutcome::FailedPermanent));
        assert_eq!(report.outcome("c"), Some(SubmissionOutcome::Succeeded));
        assert_eq!(report.aggregate, AggregateResult::PartialSuccess);
        assert_eq!(b.scrobble_count(), 1);
        assert!(!dispatcher.bindings().get("b").unwrap().authenticated);
        assert!(dispatcher.bindings().get("a").unwrap().authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried() {
        let a = ScriptedService::scripted(
            "a",
            vec![
                Err(ServiceError::Timeout),
                Err(ServiceError::RateLimited {
                    retry_after: Some(Duration::from_secs(2)),
                }),
            ],
        );
        let dispatcher = dispatcher(&[(a.clone(), true)]);

        let report = dispatcher.submit(&item(), &CancellationToken::new()).await;

        assert_eq!(report.aggregate, AggregateResult::AllSucceeded);
        assert_eq!(a.scrobble_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_become_permanent() {
        let failures = (0..10).map(|_| Err(ServiceError::Network("down".into()))).collect();
        let a = ScriptedService::scripted("a", failures);
        let dispatcher = dispatcher(&[(a.clone(), true)]);

        let report = dispatcher.submit(&item(), &CancellationToken::new()).await;

        assert_eq!(report.outcome("a"), Some(SubmissionOutcome::FailedPermanent));
        assert_eq!(report.aggregate, AggregateResult::AllFailed);
        assert_eq!(a.scrobble_count(), DispatchConfig::default().retry_budget as usize + 1);
        // Transient exhaustion does not touch authentication
        assert!(dispatcher.bindings().get("a").unwrap().authenticated);
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_stops_retry_schedule() {
        let a = ScriptedService::scripted("a", vec![Err(ServiceError::Timeout)]);
        let dispatcher = dispatcher(&[(a.clone(), true)]);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = dispatcher.submit(&item(), &cancel).await;

        assert_eq!(report.outcome("a"), Some(SubmissionOutcome::FailedTransient));
        assert_eq!(a.scrobble_count(), 1);
    }

    #[tokio::test]
    async fn repeat_submission_is_deduplicated() {
        let a = ScriptedService::new("a");
        let dispatcher = dispatcher(&[(a.clone(), true)]);
        let item = item();
        let cancel = CancellationToken::new();

        let (first, second) = tokio::join!(
            dispatcher.submit(&item, &cancel),
            dispatcher.submit(&item, &cancel)
        );
        let third = dispatcher.submit(&item, &cancel).await;

        assert_eq!(first.aggregate, AggregateResult::AllSucceeded);
        assert_eq!(second.aggregate, AggregateResult::AllSucceeded);
        assert_eq!(third.aggregate, AggregateResult::AllSucceeded);
        assert_eq!(a.scrobble_count(), 1);
        assert!(dispatcher.in_flight.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replay_with_new_start_is_submitted_again() {
        let a = ScriptedService::new("a");
        let dispatcher = dispatcher(&[(a.clone(), true)]);
        let first = item();
        let mut replay = first.clone();
        replay.started_at = first.started_at + chrono::Duration::seconds(300);

        dispatcher.submit(&first, &CancellationToken::new()).await;
        dispatcher.submit(&replay, &CancellationToken::new()).await;

        assert_eq!(a.scrobble_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn dedup_expires_after_window() {
        let a = ScriptedService::new("a");
        let dispatcher = dispatcher(&[(a.clone(), true)]);
        let item = item();

        dispatcher.submit(&item, &CancellationToken::new()).await;
        tokio::time::advance(Duration::from_secs(DispatchConfig::default().dedup_window_secs + 1)).await;
        dispatcher.submit(&item, &CancellationToken::new()).await;

        assert_eq!(a.scrobble_count(), 2);
    }

    #[tokio::test]
    async fn no_bindings_reports_none_bound() {
        let dispatcher = dispatcher(&[]);
        let report = dispatcher.submit(&item(), &CancellationToken::new()).await;
        assert_eq!(report.aggregate, AggregateResult::NoneBound);
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn disabled_binding_is_not_contacted() {
        let a = ScriptedService::new("a");
        let b = ScriptedService::new("b");
        let dispatcher = dispatcher(&[(a.clone(), true), (b.clone(), true)]);
        dispatcher.bindings().set_enabled("b", false);

        let report = dispatcher.submit(&item(), &CancellationToken::new()).await;

        assert_eq!(report.aggregate, AggregateResult::AllSucceeded);
        assert_eq!(report.outcome("b"), None);
        assert_eq!(b.scrobble_count(), 0);
    }

    #[tokio::test]
    async fn love_update_reaches_authenticated_bindings() {
        let a = ScriptedService::new("a");
        let b = ScriptedService::scripted("b", vec![Err(ServiceError::Unsupported("love".into()))]);
        let dispatcher = dispatcher(&[(a.clone(), true), (b.clone(), true)]);

        let report = dispatcher.update_love(&item(), true, &CancellationToken::new()).await;

        assert_eq!(report.outcome("a"), Some(SubmissionOutcome::Succeeded));
        assert_eq!(report.outcome("b"), Some(SubmissionOutcome::FailedPermanent));
        assert_eq!(a.loves.load(Ordering::SeqCst), 1);
        // Unsupported is not an auth problem
        assert!(dispatcher.bindings().get("b").unwrap().authenticated);
    }

    #[tokio::test]
    async fn now_playing_is_not_retried() {
        let a = ScriptedService::scripted("a", vec![Err(ServiceError::Timeout)]);
        let dispatcher = dispatcher(&[(a.clone(), true)]);

        let report = dispatcher.now_playing(&item()).await;

        assert_eq!(report.outcome("a"), Some(SubmissionOutcome::FailedTransient));
        assert_eq!(a.now_playing.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn aggregate_rules() {
        let mut outcomes = BTreeMap::new();
        assert_eq!(AggregateResult::from_outcomes(&outcomes), AggregateResult::NoneBound);
        outcomes.insert("a".to_string(), SubmissionOutcome::FailedPermanent);
        assert_eq!(AggregateResult::from_outcomes(&outcomes), AggregateResult::AllFailed);
        outcomes.insert("b".to_string(), SubmissionOutcome::Succeeded);
        assert_eq!(AggregateResult::from_outcomes(&outcomes), AggregateResult::PartialSuccess);
        outcomes.insert("a".to_string(), SubmissionOutcome::Succeeded);
        assert_eq!(AggregateResult::from_outcomes(&outcomes), AggregateResult::AllSucceeded);
    }
}
