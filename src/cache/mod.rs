//! Process-wide read-through mirror of the price table and recent posts.
//!
//! Reads never touch the network. The first read triggers a bounded, paged
//! bulk load from the store; concurrent first readers wait on that single
//! load. A failed load leaves the cache uninitialised so the next read retries.

use crate::config::CacheConfig;
use crate::freshness::FreshnessPolicy;
use crate::models::{CacheEntry, PostEntry, PriceRecord};
use crate::storage::PriceStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

#[derive(Debug, Default)]
struct PriceEntries {
    entries: Vec<CacheEntry>,
    index: HashMap<String, usize>,
}

impl PriceEntries {
    fn get(&self, ticker: &str) -> Option<&CacheEntry> {
        self.index.get(ticker).map(|&i| &self.entries[i])
    }

    fn upsert(&mut self, entry: CacheEntry) {
        match self.index.get(&entry.ticker) {
            Some(&i) => self.entries[i] = entry,
            None => {
                self.index.insert(entry.ticker.clone(), self.entries.len());
                self.entries.push(entry);
            }
        }
    }

    /// Bulk-load merge: a write-through that landed first is not overwritten by older data.
    fn merge_loaded(&mut self, entry: CacheEntry) {
        let newer = self
            .get(&entry.ticker)
            .is_none_or(|existing| existing.updated_at < entry.updated_at);
        if newer {
            self.upsert(entry);
        }
    }
}

pub struct PriceCache {
    store: Arc<dyn PriceStore>,
    config: CacheConfig,
    prices: RwLock<PriceEntries>,
    posts: RwLock<Vec<PostEntry>>,
    init: OnceCell<()>,
    bulk_loads: AtomicU64,
}

impl PriceCache {
    pub fn new(store: Arc<dyn PriceStore>, config: CacheConfig) -> Self {
        Self {
            store,
            config,
            prices: RwLock::new(PriceEntries::default()),
            posts: RwLock::new(Vec::new()),
            init: OnceCell::new(),
            bulk_loads: AtomicU64::new(0),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.init.initialized()
    }

    /// Number of bulk loads that ran to completion or failure.
    pub fn bulk_load_count(&self) -> u64 {
        self.bulk_loads.load(Ordering::Relaxed)
    }

    pub async fn ensure_initialized(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| self.bulk_load())
            .await
            .map(|_| ())
    }

    async fn bulk_load(&self) -> Result<()> {
        self.bulk_loads.fetch_add(1, Ordering::Relaxed);
        let page_size = self.config.page_size.max(1);

        let mut loaded = Vec::new();
        let mut pages = 0;
        while pages < self.config.max_pages {
            let page = self
                .store
                .prices_page(pages * page_size, page_size)
                .await
                .with_context(|| format!("Price cache bulk load failed on page {}", pages))?;
            pages += 1;
            let last = page.len() < page_size;
            loaded.extend(page);
            if last {
                break;
            }
        }

        let posts = self
            .store
            .recent_posts(self.config.post_limit)
            .await
            .context("Post cache bulk load failed")?;

        let count = loaded.len();
        {
            let mut prices = self.prices.write().await;
            for record in loaded {
                prices.merge_loaded(CacheEntry::from(record));
            }
        }
        let post_count = posts.len();
        {
            let mut mirror = self.posts.write().await;
            let written = std::mem::take(&mut *mirror);
            *mirror = merge_loaded_posts(posts, written);
        }

        info!(
            "Cache loaded: {} prices over {} page(s), {} posts",
            count, pages, post_count
        );
        Ok(())
    }

    // ── Prices ────────────────────────────────────────────────────────────────

    pub async fn get_all(&self) -> Result<Vec<CacheEntry>> {
        self.ensure_initialized().await?;
        Ok(self.prices.read().await.entries.clone())
    }

    pub async fn get_by_ticker(&self, ticker: &str) -> Result<Option<CacheEntry>> {
        self.ensure_initialized().await?;
        Ok(self.prices.read().await.get(ticker).cloned())
    }

    pub async fn get_many(&self, tickers: &[String]) -> Result<HashMap<String, CacheEntry>> {
        self.ensure_initialized().await?;
        let prices = self.prices.read().await;
        Ok(tickers
            .iter()
            .filter_map(|t| prices.get(t).map(|e| (t.clone(), e.clone())))
            .collect())
    }

    /// Replace the entry for its ticker, or append it.
    pub async fn upsert(&self, entry: CacheEntry) {
        self.prices.write().await.upsert(entry);
    }

    pub async fn upsert_records(&self, records: &[PriceRecord]) {
        let mut prices = self.prices.write().await;
        for r in records {
            prices.upsert(CacheEntry::from(r));
        }
    }

    /// Re-read `tickers` from the store, bypassing the cache, and upsert what comes back.
    pub async fn refresh(&self, tickers: &[String]) -> Result<Vec<CacheEntry>> {
        let records = self
            .store
            .prices_for(tickers)
            .await
            .context("Cache refresh read failed")?;
        let entries: Vec<CacheEntry> = records.iter().map(CacheEntry::from).collect();
        {
            let mut prices = self.prices.write().await;
            for e in &entries {
                prices.upsert(e.clone());
            }
        }
        debug!("Refreshed {} of {} tickers from store", entries.len(), tickers.len());
        Ok(entries)
    }

    /// Cached entry for `ticker`, re-read from the store first when missing or stale.
    pub async fn get_fresh(
        &self,
        ticker: &str,
        policy: &FreshnessPolicy,
        now: DateTime<Utc>,
    ) -> Result<Option<CacheEntry>> {
        let cached = self.get_by_ticker(ticker).await?;
        let stale = policy.is_stale(ticker, cached.as_ref().map(|e| e.updated_at), now);
        if !stale {
            return Ok(cached);
        }
        let refreshed = self.refresh(&[ticker.to_string()]).await?;
        Ok(refreshed.into_iter().next().or(cached))
    }

    // ── Posts ─────────────────────────────────────────────────────────────────

    pub async fn all_posts(&self) -> Result<Vec<PostEntry>> {
        self.ensure_initialized().await?;
        Ok(self.posts.read().await.clone())
    }

    pub async fn upsert_post(&self, post: PostEntry) {
        let mut posts = self.posts.write().await;
        match posts.iter_mut().find(|p| p.id == post.id) {
            Some(existing) => *existing = post,
            None => posts.push(post),
        }
    }

    pub async fn remove_post(&self, id: i64) -> bool {
        let mut posts = self.posts.write().await;
        let before = posts.len();
        posts.retain(|p| p.id != id);
        posts.len() != before
    }
}

/// Store rows in store order; posts written in memory before the load take
/// precedence by id, and ones the store does not know yet are appended.
fn merge_loaded_posts(loaded: Vec<PostEntry>, written: Vec<PostEntry>) -> Vec<PostEntry> {
    let mut by_id: HashMap<i64, PostEntry> = written.into_iter().map(|p| (p.id, p)).collect();
    let mut merged: Vec<PostEntry> = loaded
        .into_iter()
        .map(|p| by_id.remove(&p.id).unwrap_or(p))
        .collect();
    let mut extra: Vec<PostEntry> = by_id.into_values().collect();
    extra.sort_by_key(|p| p.id);
    merged.extend(extra);
    merged
}
