//! Query workers - one long-lived scan loop per saved search
//!
//! A worker owns one session slot in the token pool for its whole life. Each
//! cycle it re-reads the live knobs from the store, rotates its pair when the
//! scan budget is spent, calls the catalog client, and routes the outcome to
//! the ingestion channel, the token pool, and the restart governor. Priority
//! queries get three staggered workers so their fixed 20 s cadence interleaves.
//!
//! Every wait is cancellable: shutdown is observed at sleep boundaries and
//! between auth retries.

use crate::catalog::{CatalogApi, Outcome};
use crate::config::Tunables;
use crate::events::ItemBatch;
use crate::governor::{RestartGovernor, UpstreamError};
use crate::store::{Query, Store};
use crate::token_pool::SessionSource;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Scan outcomes kept per worker (last three) for the status surface
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScanOutcome {
    Success { items: usize },
    AuthRejected { status: u16 },
    RateLimited,
    Transport,
    OtherStatus { status: u16 },
    NoSession,
}

/// Per-worker counters for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub worker_index: usize,
    pub query_id: i64,
    pub query_label: String,
    pub priority: bool,
    pub scans: u64,
    pub successes: u64,
    pub errors: u64,
    pub last_outcomes: VecDeque<ScanOutcome>,
}

/// Shared stat buckets, one per worker index
#[derive(Clone, Default)]
pub struct FleetStats {
    buckets: Arc<Mutex<Vec<WorkerStats>>>,
}

impl FleetStats {
    pub fn register(&self, worker_index: usize, query: &Query) {
        let mut buckets = self.buckets.lock().unwrap();
        debug_assert_eq!(buckets.len(), worker_index);
        buckets.push(WorkerStats {
            worker_index,
            query_id: query.id,
            query_label: query.label(),
            priority: query.priority,
            scans: 0,
            successes: 0,
            errors: 0,
            last_outcomes: VecDeque::with_capacity(3),
        });
    }

    fn record(&self, worker_index: usize, outcome: ScanOutcome) {
        let mut buckets = self.buckets.lock().unwrap();
        let Some(bucket) = buckets.get_mut(worker_index) else {
            return;
        };
        bucket.scans += 1;
        match outcome {
            ScanOutcome::Success { .. } => bucket.successes += 1,
            ScanOutcome::NoSession => {}
            _ => bucket.errors += 1,
        }
        if bucket.last_outcomes.len() == 3 {
            bucket.last_outcomes.pop_front();
        }
        bucket.last_outcomes.push_back(outcome);
    }

    pub fn snapshot(&self) -> Vec<WorkerStats> {
        self.buckets.lock().unwrap().clone()
    }
}

/// Everything a worker needs, shared across the fleet
#[derive(Clone)]
pub struct WorkerContext {
    pub store: Store,
    pub sessions: Arc<dyn SessionSource>,
    pub catalog: Arc<dyn CatalogApi>,
    pub governor: Arc<RestartGovernor>,
    pub items_tx: mpsc::Sender<ItemBatch>,
    pub tunables: Tunables,
    pub stats: FleetStats,
}

pub struct QueryWorker {
    index: usize,
    query: Query,
    start_delay: Duration,
    ctx: WorkerContext,
    shutdown: watch::Receiver<bool>,
}

impl QueryWorker {
    pub fn new(
        index: usize,
        query: Query,
        start_delay: Duration,
        ctx: WorkerContext,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            index,
            query,
            start_delay,
            ctx,
            shutdown,
        }
    }

    /// Scan loop; returns on shutdown
    pub async fn run(mut self) {
        if !self.start_delay.is_zero() && !self.sleep_or_shutdown(self.start_delay).await {
            return;
        }
        tracing::info!(
            "Worker #{} started for query {} ({})",
            self.index,
            self.query.id,
            self.query.label()
        );

        loop {
            if *self.shutdown.borrow() {
                break;
            }

            let refresh_delay = self.refresh_delay();
            self.scan_once().await;

            if !self.sleep_or_shutdown(refresh_delay).await {
                break;
            }
        }
        tracing::info!("Worker #{} stopped", self.index);
    }

    /// Live cadence: priority queries are pinned, others follow the store
    fn refresh_delay(&self) -> Duration {
        let secs = if self.query.priority {
            self.ctx.tunables.priority_refresh_secs
        } else {
            self.ctx
                .store
                .get_int_parameter("query_refresh_delay", 60)
                .unwrap_or(60)
                .max(1) as u64
        };
        Duration::from_secs(secs)
    }

    /// One full cycle: session upkeep, catalog call, outcome routing
    pub(crate) async fn scan_once(&mut self) {
        let per_page = self
            .ctx
            .store
            .get_int_parameter("items_per_query", 20)
            .unwrap_or(20)
            .clamp(1, 96) as u32;

        // Proactive rotation after K successful scans; a failed replacement
        // keeps the old pair and postpones the next attempt
        if self.ctx.sessions.needs_rotation(self.index) {
            if self.ctx.sessions.create_fresh_pair(self.index).await.is_none() {
                self.ctx.sessions.reset_scan_count(self.index);
            }
        } else if self.ctx.sessions.session_for_worker(self.index).is_none() {
            let _ = self.ctx.sessions.create_fresh_pair(self.index).await;
        }

        let Some(session) = self.ctx.sessions.session_for_worker(self.index) else {
            tracing::warn!("Worker #{}: no session available this cycle", self.index);
            self.ctx.stats.record(self.index, ScanOutcome::NoSession);
            return;
        };

        let outcome = self
            .ctx
            .catalog
            .search(&session, &self.query.url, per_page)
            .await;
        self.handle_outcome(outcome, per_page).await;
    }

    async fn handle_outcome(&mut self, outcome: Outcome, per_page: u32) {
        match outcome {
            Outcome::Items(items) => self.on_success(items).await,

            Outcome::HttpError { status: status @ (401 | 403), .. } => {
                tracing::warn!(
                    "Worker #{}: auth rejected (HTTP {}), rotating pair",
                    self.index,
                    status
                );
                self.ctx.sessions.report_error(self.index);
                self.ctx.governor.report_error(auth_error_kind(status));
                self.ctx
                    .stats
                    .record(self.index, ScanOutcome::AuthRejected { status });
                self.retry_with_fresh_pairs(per_page).await;
            }

            Outcome::HttpError { status: 429, .. } => {
                // Back off for this cycle; the normal sleep is the backoff
                tracing::warn!("Worker #{}: rate limited", self.index);
                self.ctx.governor.report_error(UpstreamError::RateLimited429);
                self.ctx.stats.record(self.index, ScanOutcome::RateLimited);
            }

            Outcome::HttpError { status, .. } => {
                tracing::warn!("Worker #{}: unexpected HTTP {}", self.index, status);
                self.ctx
                    .stats
                    .record(self.index, ScanOutcome::OtherStatus { status });
            }

            Outcome::Transport(cause) => {
                tracing::warn!("Worker #{}: transport error: {}", self.index, cause);
                self.ctx.sessions.report_error(self.index);
                self.ctx.governor.report_generic_error();
                self.ctx.stats.record(self.index, ScanOutcome::Transport);
            }
        }
    }

    async fn on_success(&mut self, items: Vec<crate::item::Item>) {
        let count = items.len();
        if count > 0 {
            let batch = ItemBatch {
                items,
                query_id: self.query.id,
            };
            if self.ctx.items_tx.send(batch).await.is_err() {
                tracing::warn!("Worker #{}: items channel closed", self.index);
            }
        }
        self.ctx.sessions.report_success(self.index);
        self.ctx.governor.report_success();
        self.ctx
            .stats
            .record(self.index, ScanOutcome::Success { items: count });
    }

    /// Up to three immediate retries after a 401/403, each over a brand-new
    /// (proxy, token) pair. Any success ends the cycle as a success.
    async fn retry_with_fresh_pairs(&mut self, per_page: u32) {
        for attempt in 1..=self.ctx.tunables.auth_retry_attempts {
            if *self.shutdown.borrow() {
                return;
            }

            let Some(session) = self.ctx.sessions.create_fresh_pair(self.index).await else {
                tracing::warn!(
                    "Worker #{}: retry {} could not build a fresh pair",
                    self.index,
                    attempt
                );
                continue;
            };

            match self
                .ctx
                .catalog
                .search(&session, &self.query.url, per_page)
                .await
            {
                Outcome::Items(items) => {
                    tracing::info!(
                        "Worker #{}: recovered on retry {} with session #{}",
                        self.index,
                        attempt,
                        session.session_id
                    );
                    self.on_success(items).await;
                    return;
                }
                Outcome::HttpError { status: status @ (401 | 403), .. } => {
                    self.ctx.sessions.report_error(self.index);
                    self.ctx.governor.report_error(auth_error_kind(status));
                    self.ctx
                        .stats
                        .record(self.index, ScanOutcome::AuthRejected { status });
                }
                Outcome::HttpError { status: 429, .. } => {
                    self.ctx.governor.report_error(UpstreamError::RateLimited429);
                    self.ctx.stats.record(self.index, ScanOutcome::RateLimited);
                    return;
                }
                Outcome::HttpError { status, .. } => {
                    self.ctx
                        .stats
                        .record(self.index, ScanOutcome::OtherStatus { status });
                    return;
                }
                Outcome::Transport(cause) => {
                    tracing::warn!("Worker #{}: transport error on retry: {}", self.index, cause);
                    self.ctx.sessions.report_error(self.index);
                    self.ctx.governor.report_generic_error();
                    self.ctx.stats.record(self.index, ScanOutcome::Transport);
                    return;
                }
            }
        }
        tracing::warn!(
            "Worker #{}: all {} auth retries failed this cycle",
            self.index,
            self.ctx.tunables.auth_retry_attempts
        );
    }

    /// Sleep that wakes early on shutdown; false means stop the loop
    async fn sleep_or_shutdown(&mut self, duration: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            _ = self.shutdown.changed() => false,
        }
    }
}

fn auth_error_kind(status: u16) -> UpstreamError {
    if status == 401 {
        UpstreamError::Auth401
    } else {
        UpstreamError::Forbidden403
    }
}

/// Fleet size for a query list: one worker per normal query, three per
/// priority query
pub fn worker_count(queries: &[Query]) -> usize {
    queries
        .iter()
        .map(|q| if q.priority { 3 } else { 1 })
        .sum()
}

/// Spawn the whole fleet. Worker indexes are dense and double as session
/// slot indexes; priority queries get three staggered workers.
pub fn spawn_workers(
    ctx: &WorkerContext,
    queries: &[Query],
    shutdown: &watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();
    let mut index = 0;
    for query in queries {
        let starts: &[u64] = if query.priority {
            &ctx.tunables.priority_stagger_secs
        } else {
            &[0]
        };
        for &offset in starts {
            ctx.stats.register(index, query);
            let worker = QueryWorker::new(
                index,
                query.clone(),
                Duration::from_secs(offset),
                ctx.clone(),
                shutdown.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
            index += 1;
        }
    }
    handles
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Outcome;
    use crate::governor::RestartGovernor;
    use crate::item::{Item, Price};
    use crate::token_pool::SessionHandle;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Catalog stub that replays a scripted list of outcomes
    struct ScriptedCatalog {
        outcomes: Mutex<VecDeque<Outcome>>,
        calls: AtomicU32,
    }

    impl ScriptedCatalog {
        fn new(outcomes: Vec<Outcome>) -> Arc<Self> {
            Arc::new(Self {
                outcomes: Mutex::new(outcomes.into()),
                calls: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl CatalogApi for ScriptedCatalog {
        async fn search(&self, _: &SessionHandle, _: &str, _: u32) -> Outcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Outcome::Items(Vec::new()))
        }
    }

    /// Session source that never touches the network
    struct FakeSessions {
        fresh_pairs: AtomicU32,
        next_id: AtomicU32,
    }

    impl FakeSessions {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fresh_pairs: AtomicU32::new(0),
                next_id: AtomicU32::new(1),
            })
        }

        fn handle(&self) -> SessionHandle {
            SessionHandle {
                session_id: self.next_id.fetch_add(1, Ordering::SeqCst) as u64,
                client: reqwest::Client::new(),
                bearer_token: "token".to_string(),
                user_agent: crate::token_pool::USER_AGENTS[0],
                proxy: None,
            }
        }
    }

    #[async_trait]
    impl SessionSource for FakeSessions {
        fn session_for_worker(&self, _: usize) -> Option<SessionHandle> {
            Some(self.handle())
        }
        fn needs_rotation(&self, _: usize) -> bool {
            false
        }
        fn reset_scan_count(&self, _: usize) {}
        fn report_success(&self, _: usize) {}
        fn report_error(&self, _: usize) {}
        async fn create_fresh_pair(&self, _: usize) -> Option<SessionHandle> {
            self.fresh_pairs.fetch_add(1, Ordering::SeqCst);
            Some(self.handle())
        }
    }

    fn sample_item(id: &str) -> Item {
        Item {
            id: id.to_string(),
            title: "Boot".to_string(),
            price: Price::from_cents(1250),
            currency: "EUR".to_string(),
            published_ts: Some(1_700_000_000),
            photo_url: None,
            brand_title: "Acme".to_string(),
            size_title: None,
            url: format!("https://www.vinted.de/items/{}", id),
        }
    }

    fn test_query(priority: bool) -> Query {
        Query {
            id: 1,
            url: "https://www.vinted.de/catalog?search_text=shoes&order=newest_first".to_string(),
            name: None,
            last_item_ts: None,
            thread_id: None,
            priority,
        }
    }

    struct Harness {
        worker: QueryWorker,
        items_rx: mpsc::Receiver<ItemBatch>,
        governor: Arc<RestartGovernor>,
        sessions: Arc<FakeSessions>,
        catalog: Arc<ScriptedCatalog>,
    }

    fn harness(outcomes: Vec<Outcome>, priority: bool) -> Harness {
        let store = Store::in_memory().unwrap();
        let (governor, _restart_rx) = RestartGovernor::new(store.clone(), Tunables::default());
        let sessions = FakeSessions::new();
        let catalog = ScriptedCatalog::new(outcomes);
        let (items_tx, items_rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let stats = FleetStats::default();
        let query = test_query(priority);
        stats.register(0, &query);

        let ctx = WorkerContext {
            store,
            sessions: sessions.clone(),
            catalog: catalog.clone(),
            governor: governor.clone(),
            items_tx,
            tunables: Tunables::default(),
            stats,
        };
        let worker = QueryWorker::new(0, query, Duration::ZERO, ctx, shutdown_rx);
        Harness {
            worker,
            items_rx,
            governor,
            sessions,
            catalog,
        }
    }

    #[tokio::test]
    async fn test_success_publishes_batch_and_reports() {
        let mut h = harness(vec![Outcome::Items(vec![sample_item("A")])], false);
        h.worker.scan_once().await;

        let batch = h.items_rx.try_recv().expect("batch expected");
        assert_eq!(batch.query_id, 1);
        assert_eq!(batch.items[0].id, "A");
        assert_eq!(h.governor.status().success_streak, 1);
    }

    #[tokio::test]
    async fn test_empty_result_reports_success_without_batch() {
        let mut h = harness(vec![Outcome::Items(Vec::new())], false);
        h.worker.scan_once().await;

        assert!(h.items_rx.try_recv().is_err());
        assert_eq!(h.governor.status().success_streak, 1);
    }

    #[tokio::test]
    async fn test_403_retries_with_fresh_pair_and_recovers() {
        let mut h = harness(
            vec![
                Outcome::HttpError { status: 403, body: String::new() },
                Outcome::Items(vec![sample_item("B")]),
            ],
            false,
        );
        h.worker.scan_once().await;

        // One fresh pair, one recovered batch
        assert_eq!(h.sessions.fresh_pairs.load(Ordering::SeqCst), 1);
        let batch = h.items_rx.try_recv().expect("recovered batch");
        assert_eq!(batch.items[0].id, "B");

        // Governor saw the 403 and then the success; counters only reset
        // after a full streak
        let status = h.governor.status();
        assert_eq!(status.error_403_count, 1);
        assert_eq!(status.success_streak, 1);
    }

    #[tokio::test]
    async fn test_auth_rejection_exhausts_three_retries() {
        let mut h = harness(
            vec![
                Outcome::HttpError { status: 401, body: String::new() },
                Outcome::HttpError { status: 401, body: String::new() },
                Outcome::HttpError { status: 403, body: String::new() },
                Outcome::HttpError { status: 403, body: String::new() },
            ],
            false,
        );
        h.worker.scan_once().await;

        // Initial call plus three retries
        assert_eq!(h.catalog.calls.load(Ordering::SeqCst), 4);
        assert_eq!(h.sessions.fresh_pairs.load(Ordering::SeqCst), 3);
        let status = h.governor.status();
        assert_eq!(status.error_401_count, 2);
        assert_eq!(status.error_403_count, 2);
    }

    #[tokio::test]
    async fn test_429_backs_off_without_retry() {
        let mut h = harness(
            vec![Outcome::HttpError { status: 429, body: String::new() }],
            false,
        );
        h.worker.scan_once().await;

        assert_eq!(h.catalog.calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.sessions.fresh_pairs.load(Ordering::SeqCst), 0);
        assert_eq!(h.governor.status().error_429_count, 1);
    }

    #[tokio::test]
    async fn test_transport_error_is_generic_failure() {
        let mut h = harness(vec![Outcome::Transport("timeout".to_string())], false);
        h.worker.scan_once().await;

        assert_eq!(h.sessions.fresh_pairs.load(Ordering::SeqCst), 0);
        let status = h.governor.status();
        assert_eq!(status.total_errors, 0);
        assert_eq!(status.success_streak, 0);
    }

    #[tokio::test]
    async fn test_priority_cadence_is_pinned() {
        let h = harness(Vec::new(), true);
        assert_eq!(h.worker.refresh_delay(), Duration::from_secs(20));

        // Normal queries follow the live store value
        let h = harness(Vec::new(), false);
        h.worker.ctx.store.set_parameter("query_refresh_delay", "15").unwrap();
        assert_eq!(h.worker.refresh_delay(), Duration::from_secs(15));
    }

    #[test]
    fn test_worker_count_three_per_priority_query() {
        let queries = vec![test_query(false), test_query(true), test_query(false)];
        assert_eq!(worker_count(&queries), 5);
    }

    #[test]
    fn test_stats_keep_last_three_outcomes() {
        let stats = FleetStats::default();
        stats.register(0, &test_query(false));
        stats.record(0, ScanOutcome::Success { items: 2 });
        stats.record(0, ScanOutcome::RateLimited);
        stats.record(0, ScanOutcome::Transport);
        stats.record(0, ScanOutcome::Success { items: 0 });

        let snapshot = stats.snapshot();
        assert_eq!(snapshot[0].scans, 4);
        assert_eq!(snapshot[0].successes, 2);
        assert_eq!(snapshot[0].errors, 2);
        assert_eq!(snapshot[0].last_outcomes.len(), 3);
        assert!(matches!(snapshot[0].last_outcomes[0], ScanOutcome::RateLimited));
    }
}
