//! Wiring: builds every long-lived service once from `AppConfig` and hands
//! out shared handles.

use crate::api::ApiState;
use crate::cache::PriceCache;
use crate::config::AppConfig;
use crate::freshness::{Clock, FreshnessPolicy, SystemClock};
use crate::pipeline::BatchProcessor;
use crate::scraper::fetcher::RetryPolicy;
use crate::scraper::{ListingPageSource, QuoteApiSource, QuoteSource, SourceFetcher};
use crate::storage::Repository;
use crate::universe::load_universe;
use crate::worker::{Scheduler, WorkerState};
use anyhow::Result;
use std::sync::Arc;
use tracing::info;

pub struct Services {
    pub config: AppConfig,
    pub repo: Arc<Repository>,
    pub universe: Arc<Vec<String>>,
    pub clock: Arc<dyn Clock>,
    pub policy: Arc<FreshnessPolicy>,
    pub cache: Arc<PriceCache>,
    pub worker: Arc<WorkerState>,
    pub processor: Arc<BatchProcessor>,
}

impl Services {
    pub fn build(config: AppConfig) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        Self::build_with(config, clock)
    }

    pub fn build_with(config: AppConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let repo = Arc::new(Repository::open(&config.storage.db_path)?);
        if config.storage.run_migrations {
            repo.run_migrations()?;
        }

        let universe = load_universe(config.pipeline.universe_file.as_deref())?;
        info!("Ticker universe: {} symbols", universe.len());

        let policy = FreshnessPolicy::from_config(&config.pipeline, &config.market)?;
        let cache = Arc::new(PriceCache::new(repo.clone(), config.cache.clone()));
        let worker = Arc::new(WorkerState::new(config.pipeline.enabled));

        let primary: Arc<dyn QuoteSource> = Arc::new(ListingPageSource::new(&config.scraper));
        let fallback: Arc<dyn QuoteSource> =
            Arc::new(QuoteApiSource::new(&config.fallback, &config.scraper.user_agent)?);
        let retry = RetryPolicy {
            max_retries: config.pipeline.max_retries,
            retry_delay: config.pipeline.retry_delay(),
        };
        let fetcher = SourceFetcher::new(primary, fallback, retry, clock.clone());

        let processor = Arc::new(BatchProcessor::new(
            universe.clone(),
            repo.clone(),
            fetcher,
            cache.clone(),
            policy.clone(),
            worker.clone(),
            clock.clone(),
            &config.pipeline,
        ));

        Ok(Self {
            config,
            repo,
            universe: Arc::new(universe),
            clock,
            policy: Arc::new(policy),
            cache,
            worker,
            processor,
        })
    }

    pub fn scheduler(&self) -> Scheduler {
        Scheduler::new(
            self.processor.clone(),
            self.worker.clone(),
            self.policy.session().clone(),
            self.config.market.refresh_interval(),
            self.clock.clone(),
        )
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            worker: self.worker.clone(),
            cache: self.cache.clone(),
            policy: self.policy.clone(),
            clock: self.clock.clone(),
            universe: self.universe.clone(),
        }
    }
}
