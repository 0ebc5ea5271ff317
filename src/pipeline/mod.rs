//! Refresh run: stale subset of the universe → batched fetch → store → cache.
//!
//! ## Gates, in order
//!   1. kill-switch off → skip
//!   2. market closed → skip (unless forced)
//!   3. run lock held → skip; a tick never queues behind a slow run
//!
//! Batches run one at a time with a pause between them, so at most one
//! batch of outbound requests is in flight.

use crate::cache::PriceCache;
use crate::config::PipelineConfig;
use crate::freshness::{Clock, FreshnessPolicy};
use crate::models::{PriceRecord, PriceSource};
use crate::scraper::SourceFetcher;
use crate::storage::{PriceStore, RunSummary};
use crate::utils::Timer;
use crate::worker::WorkerState;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PipelineStats {
    pub tickers_total: usize,
    pub tickers_stale: usize,
    pub batches: usize,
    pub refreshed: usize,
    pub from_fallback: usize,
    pub placeholders: usize,
    pub store_errors: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Disabled,
    MarketClosed,
    AlreadyRunning,
    Completed(PipelineStats),
    /// The store could not be read; nothing was fetched.
    Aborted(String),
}

/// Something the scheduler can fire.
#[async_trait]
pub trait RefreshTask: Send + Sync {
    async fn run(&self) -> RunOutcome;

    fn close(&self) {}
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Skip the market-hours gate. The kill-switch and lock still apply.
    pub ignore_market_hours: bool,
}

pub struct BatchProcessor {
    universe: Vec<String>,
    store: Arc<dyn PriceStore>,
    fetcher: SourceFetcher,
    cache: Arc<PriceCache>,
    policy: FreshnessPolicy,
    state: Arc<WorkerState>,
    clock: Arc<dyn Clock>,
    batch_size: usize,
    batch_delay: Duration,
    batch_jitter_ms: u64,
}

impl BatchProcessor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        universe: Vec<String>,
        store: Arc<dyn PriceStore>,
        fetcher: SourceFetcher,
        cache: Arc<PriceCache>,
        policy: FreshnessPolicy,
        state: Arc<WorkerState>,
        clock: Arc<dyn Clock>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            universe,
            store,
            fetcher,
            cache,
            policy,
            state,
            clock,
            batch_size: config.batch_size.max(1),
            batch_delay: config.batch_delay(),
            batch_jitter_ms: config.batch_jitter_ms,
        }
    }

    pub fn universe(&self) -> &[String] {
        &self.universe
    }

    pub async fn run_with(&self, options: RunOptions) -> RunOutcome {
        if !self.state.is_enabled() {
            info!("Price worker disabled; skipping refresh");
            return RunOutcome::Disabled;
        }
        if !options.ignore_market_hours && !self.policy.is_market_open(self.clock.now()) {
            info!("Market closed; skipping refresh");
            return RunOutcome::MarketClosed;
        }
        let Some(_guard) = self.state.try_lock() else {
            info!("Previous refresh still running; skipping this tick");
            return RunOutcome::AlreadyRunning;
        };

        let _t = Timer::start("Price refresh");
        let started_at = self.clock.now();
        let run_id = self
            .store
            .begin_refresh_run(started_at)
            .await
            .unwrap_or_else(|e| {
                warn!("Could not record refresh run start: {:#}", e);
                0
            });

        let (outcome, summary) = match self.refresh(started_at).await {
            Ok(stats) => {
                let summary = RunSummary {
                    finished_at: Some(self.clock.now()),
                    tickers_refreshed: stats.refreshed,
                    placeholders: stats.placeholders,
                    error: (stats.store_errors > 0)
                        .then(|| format!("{} batch upsert(s) failed", stats.store_errors)),
                };
                (RunOutcome::Completed(stats), summary)
            }
            Err(e) => {
                error!("Refresh aborted: {:#}", e);
                let summary = RunSummary {
                    finished_at: Some(self.clock.now()),
                    error: Some(format!("{:#}", e)),
                    ..Default::default()
                };
                (RunOutcome::Aborted(format!("{:#}", e)), summary)
            }
        };

        if let Err(e) = self.store.finish_refresh_run(run_id, &summary).await {
            warn!("Could not record refresh run end: {:#}", e);
        }
        outcome
    }

    async fn refresh(&self, now: chrono::DateTime<chrono::Utc>) -> anyhow::Result<PipelineStats> {
        let mut stats = PipelineStats {
            tickers_total: self.universe.len(),
            ..Default::default()
        };

        // ── 1. Partition the universe ─────────────────────────────────────────
        let last = self.store.last_updated(&self.universe).await?;
        let (stale, valid): (Vec<String>, Vec<String>) = self
            .universe
            .iter()
            .cloned()
            .partition(|t| self.policy.is_stale(t, last.get(t).copied(), now));

        for t in &valid {
            debug!("{}: fresh, skipping", t);
        }
        info!(
            "{} of {} tickers stale ({} still fresh)",
            stale.len(),
            self.universe.len(),
            valid.len()
        );
        stats.tickers_stale = stale.len();

        // ── 2. Batches, one at a time ─────────────────────────────────────────
        let total_batches = stale.len().div_ceil(self.batch_size);
        for (i, batch) in stale.chunks(self.batch_size).enumerate() {
            if i > 0 {
                sleep(self.inter_batch_delay()).await;
            }
            stats.batches += 1;

            let mut records: Vec<PriceRecord> = self.fetcher.fetch(batch).await.into_values().collect();
            records.sort_by(|a, b| a.ticker.cmp(&b.ticker));

            if let Err(e) = self.store.upsert_prices(&records).await {
                // Left stale; the next tick picks these up again
                error!("Batch {}/{} upsert failed: {:#}", i + 1, total_batches, e);
                stats.store_errors += 1;
                continue;
            }
            self.cache.upsert_records(&records).await;

            let placeholders = records.iter().filter(|r| r.source == PriceSource::Placeholder).count();
            let fallback = records.iter().filter(|r| r.source == PriceSource::Fallback).count();
            stats.refreshed += records.len();
            stats.placeholders += placeholders;
            stats.from_fallback += fallback;

            info!(
                "Batch {}/{}: {} stored ({} fallback, {} placeholder)",
                i + 1,
                total_batches,
                records.len(),
                fallback,
                placeholders
            );
        }

        info!(
            "=== Done: {} refreshed | {} fallback | {} placeholder | {} store errors ===",
            stats.refreshed, stats.from_fallback, stats.placeholders, stats.store_errors
        );
        Ok(stats)
    }

    fn inter_batch_delay(&self) -> Duration {
        if self.batch_jitter_ms == 0 {
            return self.batch_delay;
        }
        let jitter = rand::random_range(0..=self.batch_jitter_ms);
        self.batch_delay + Duration::from_millis(jitter)
    }
}

#[async_trait]
impl RefreshTask for BatchProcessor {
    async fn run(&self) -> RunOutcome {
        self.run_with(RunOptions::default()).await
    }

    fn close(&self) {
        self.fetcher.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::error::FetchError;
    use crate::freshness::{FixedClock, MarketSession};
    use crate::models::{PostEntry, Quote};
    use crate::scraper::fetcher::RetryPolicy;
    use crate::scraper::{FetchAttempt, QuoteSource};
    use crate::storage::Repository;
    use chrono::{DateTime, TimeZone, Utc};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Notify;

    /// Prices every symbol at 100; optionally parks until released.
    struct PricedSource {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        entered: Arc<Notify>,
    }

    impl PricedSource {
        fn open() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), gate: None, entered: Arc::new(Notify::new()) })
        }

        fn gated(gate: Arc<Notify>) -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), gate: Some(gate), entered: Arc::new(Notify::new()) })
        }
    }

    #[async_trait]
    impl QuoteSource for PricedSource {
        fn name(&self) -> &'static str {
            "primary"
        }

        async fn fetch_quotes(
            &self,
            tickers: &[String],
            _attempt: FetchAttempt,
        ) -> Result<HashMap<String, Quote>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.entered.notify_one();
            if let Some(gate) = &self.gate {
                gate.notified().await;
            }
            Ok(tickers
                .iter()
                .map(|t| (t.clone(), Quote { price: 100.0, change: Some(0.5), change_percent: Some(0.5) }))
                .collect())
        }
    }

    struct DownSource;

    #[async_trait]
    impl QuoteSource for DownSource {
        fn name(&self) -> &'static str {
            "fallback"
        }

        async fn fetch_quotes(&self, _: &[String], _: FetchAttempt) -> Result<HashMap<String, Quote>, FetchError> {
            Err(FetchError::Empty { source_name: "fallback" })
        }
    }

    /// Repository wrapper that counts upserts and can refuse them.
    struct RecordingStore {
        inner: Repository,
        upserts: Mutex<Vec<Vec<String>>>,
        fail_upserts: bool,
        fail_reads: bool,
    }

    impl RecordingStore {
        fn new() -> Arc<Self> {
            Self::with(false, false)
        }

        fn with(fail_upserts: bool, fail_reads: bool) -> Arc<Self> {
            let inner = Repository::open_in_memory().unwrap();
            inner.run_migrations().unwrap();
            Arc::new(Self { inner, upserts: Mutex::new(Vec::new()), fail_upserts, fail_reads })
        }

        fn upsert_batches(&self) -> Vec<Vec<String>> {
            self.upserts.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl PriceStore for RecordingStore {
        async fn last_updated(&self, t: &[String]) -> anyhow::Result<HashMap<String, DateTime<Utc>>> {
            if self.fail_reads {
                anyhow::bail!("store offline");
            }
            self.inner.last_updated(t).await
        }
        async fn upsert_prices(&self, r: &[PriceRecord]) -> anyhow::Result<usize> {
            self.upserts.lock().unwrap().push(r.iter().map(|x| x.ticker.clone()).collect());
            if self.fail_upserts {
                anyhow::bail!("write refused");
            }
            self.inner.upsert_prices(r).await
        }
        async fn prices_for(&self, t: &[String]) -> anyhow::Result<Vec<PriceRecord>> {
            self.inner.prices_for(t).await
        }
        async fn prices_page(&self, o: usize, l: usize) -> anyhow::Result<Vec<PriceRecord>> {
            self.inner.prices_page(o, l).await
        }
        async fn recent_posts(&self, l: usize) -> anyhow::Result<Vec<PostEntry>> {
            self.inner.recent_posts(l).await
        }
        async fn begin_refresh_run(&self, at: DateTime<Utc>) -> anyhow::Result<i64> {
            self.inner.begin_refresh_run(at).await
        }
        async fn finish_refresh_run(&self, id: i64, s: &RunSummary) -> anyhow::Result<()> {
            self.inner.finish_refresh_run(id, s).await
        }
    }

    // Wednesday, mid-session
    fn open_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 6, 15, 0, 0).unwrap()
    }

    struct Harness {
        processor: Arc<BatchProcessor>,
        store: Arc<RecordingStore>,
        state: Arc<WorkerState>,
        cache: Arc<PriceCache>,
        clock: Arc<FixedClock>,
    }

    fn harness(universe: &[&str], primary: Arc<PricedSource>, store: Arc<RecordingStore>) -> Harness {
        let config = PipelineConfig { batch_size: 2, batch_delay_ms: 0, ..Default::default() };
        harness_with(universe, primary, store, &config)
    }

    fn harness_with(
        universe: &[&str],
        primary: Arc<PricedSource>,
        store: Arc<RecordingStore>,
        config: &PipelineConfig,
    ) -> Harness {
        let clock = Arc::new(FixedClock::new(open_time()));
        let state = Arc::new(WorkerState::new(true));
        let cache = Arc::new(PriceCache::new(store.clone(), CacheConfig::default()));
        let fetcher = SourceFetcher::new(
            primary,
            Arc::new(DownSource),
            RetryPolicy { max_retries: 3, retry_delay: Duration::ZERO },
            clock.clone(),
        );
        let policy = FreshnessPolicy::new(chrono::Duration::minutes(15), MarketSession::us_equities());
        let processor = Arc::new(BatchProcessor::new(
            universe.iter().map(|s| s.to_string()).collect(),
            store.clone(),
            fetcher,
            cache.clone(),
            policy,
            state.clone(),
            clock.clone(),
            config,
        ));
        Harness { processor, store, state, cache, clock }
    }

    #[tokio::test]
    async fn stale_tickers_are_batched_and_stored() {
        let h = harness(&["AAPL", "MSFT", "TSLA"], PricedSource::open(), RecordingStore::new());

        let RunOutcome::Completed(stats) = h.processor.run().await else {
            panic!("run did not complete");
        };
        assert_eq!(stats.tickers_stale, 3);
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.refreshed, 3);
        assert_eq!(h.store.upsert_batches(), vec![vec!["AAPL", "MSFT"], vec!["TSLA"]]);
        assert!(!h.state.is_running());

        // Write-through: cache already has the new rows
        assert_eq!(h.cache.get_by_ticker("TSLA").await.unwrap().unwrap().price, 100.0);

        let run = h.store.inner.latest_run().unwrap().unwrap();
        assert_eq!(run.status, "success");
        assert_eq!(run.tickers_refreshed, 3);
    }

    #[tokio::test]
    async fn fresh_tickers_are_skipped() {
        let h = harness(&["AAPL", "MSFT"], PricedSource::open(), RecordingStore::new());
        h.processor.run().await;

        h.clock.advance(chrono::Duration::minutes(5));
        let RunOutcome::Completed(stats) = h.processor.run().await else {
            panic!("run did not complete");
        };
        assert_eq!(stats.tickers_stale, 0);
        assert_eq!(h.store.upsert_batches().len(), 1);

        h.clock.advance(chrono::Duration::minutes(10));
        let RunOutcome::Completed(stats) = h.processor.run().await else {
            panic!("run did not complete");
        };
        assert_eq!(stats.tickers_stale, 2);
    }

    #[tokio::test]
    async fn disabled_flag_means_no_activity() {
        let primary = PricedSource::open();
        let h = harness(&["AAPL"], primary.clone(), RecordingStore::new());
        h.state.set_enabled(false);

        assert_eq!(h.processor.run().await, RunOutcome::Disabled);
        assert_eq!(primary.calls.load(Ordering::SeqCst), 0);
        assert!(h.store.upsert_batches().is_empty());
        assert!(h.store.inner.latest_run().unwrap().is_none());
    }

    #[tokio::test]
    async fn closed_market_skips_unless_forced() {
        let h = harness(&["AAPL"], PricedSource::open(), RecordingStore::new());
        // Saturday
        h.clock.set(Utc.with_ymd_and_hms(2024, 3, 9, 15, 0, 0).unwrap());

        assert_eq!(h.processor.run().await, RunOutcome::MarketClosed);
        assert!(h.store.upsert_batches().is_empty());

        let forced = h.processor.run_with(RunOptions { ignore_market_hours: true }).await;
        assert!(matches!(forced, RunOutcome::Completed(_)));
    }

    #[tokio::test]
    async fn overlapping_run_is_a_noop() {
        let gate = Arc::new(Notify::new());
        let primary = PricedSource::gated(gate.clone());
        let h = harness(&["AAPL", "TSLA"], primary.clone(), RecordingStore::new());

        let first = {
            let p = Arc::clone(&h.processor);
            tokio::spawn(async move { p.run().await })
        };
        primary.entered.notified().await;
        assert!(h.state.is_running());

        assert_eq!(h.processor.run().await, RunOutcome::AlreadyRunning);

        gate.notify_one();
        assert!(matches!(first.await.unwrap(), RunOutcome::Completed(_)));
        assert_eq!(h.store.upsert_batches().len(), 1);
        assert!(!h.state.is_running());
    }

    #[tokio::test]
    async fn upsert_failure_abandons_batch_and_releases_lock() {
        let h = harness(&["AAPL", "MSFT", "TSLA"], PricedSource::open(), RecordingStore::with(true, false));

        let RunOutcome::Completed(stats) = h.processor.run().await else {
            panic!("run did not complete");
        };
        assert_eq!(stats.store_errors, 2);
        assert_eq!(stats.refreshed, 0);
        assert!(!h.state.is_running());
        assert!(h.cache.get_by_ticker("AAPL").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unreadable_store_aborts_run() {
        let primary = PricedSource::open();
        let h = harness(&["AAPL"], primary.clone(), RecordingStore::with(false, true));

        assert!(matches!(h.processor.run().await, RunOutcome::Aborted(_)));
        assert_eq!(primary.calls.load(Ordering::SeqCst), 0);
        assert!(!h.state.is_running());
        assert_eq!(h.store.inner.latest_run().unwrap().unwrap().status, "error");
    }

    #[tokio::test(start_paused = true)]
    async fn batches_are_spaced_by_the_configured_delay() {
        let universe: Vec<String> = (0..25).map(|i| format!("T{:02}", i)).collect();
        let universe: Vec<&str> = universe.iter().map(String::as_str).collect();
        // Default pipeline settings: batches of 10, one second apart
        let h = harness_with(&universe, PricedSource::open(), RecordingStore::new(), &PipelineConfig::default());

        let started = tokio::time::Instant::now();
        let RunOutcome::Completed(stats) = h.processor.run().await else {
            panic!("run did not complete");
        };

        assert_eq!(stats.batches, 3);
        assert_eq!(started.elapsed(), Duration::from_secs(2));
        let sizes: Vec<usize> = h.store.upsert_batches().iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
    }
}
