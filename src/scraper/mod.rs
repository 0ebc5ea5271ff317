pub mod browser;
pub mod cleaner;
pub mod fallback;
pub mod fetcher;
pub mod parsers;

use crate::config::ScraperConfig;
use crate::error::FetchError;
use crate::models::Quote;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use self::browser::{BrowserPool, load_page};
use self::cleaner::raw_row_to_quote;
use self::parsers::{QuoteMarkers, parse_listing_page};

pub use self::fallback::QuoteApiSource;
pub use self::fetcher::SourceFetcher;

// ── Source trait ──────────────────────────────────────────────────────────────

/// Which try of the current batch this is, starting at 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchAttempt {
    pub number: u32,
}

impl FetchAttempt {
    pub fn first() -> Self {
        Self { number: 1 }
    }

    pub fn is_retry(&self) -> bool {
        self.number > 1
    }
}

/// Swappable quote source. Returns only symbols it could price.
#[async_trait]
pub trait QuoteSource: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch_quotes(
        &self,
        tickers: &[String],
        attempt: FetchAttempt,
    ) -> Result<HashMap<String, Quote>, FetchError>;

    /// Release long-lived handles. Called on shutdown.
    fn close(&self) {}
}

// ── Quote listing page scraper ────────────────────────────────────────────────

pub struct ListingPageSource {
    pool: Arc<BrowserPool>,
    base_url: String,
    markers: QuoteMarkers,
}

impl ListingPageSource {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            pool: Arc::new(BrowserPool::new(config)),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            markers: QuoteMarkers::from(config),
        }
    }

    pub fn pool(&self) -> &BrowserPool {
        &self.pool
    }

    /// Whole batch on one page.  e.g. [AAPL, TSLA] → /quotes/AAPL,TSLA/
    fn listing_url(&self, tickers: &[String]) -> String {
        format!("{}/{}/", self.base_url, tickers.join(","))
    }

    async fn load(&self, url: &str, attempt: FetchAttempt) -> Result<String, FetchError> {
        if attempt.is_retry() {
            // Private session, closed when it drops at the end of this block
            let session = self.pool.open_session()?;
            load_page(session.client(), url).await
        } else {
            let client = self.pool.shared()?;
            load_page(&client, url).await.inspect_err(|e| self.pool.observe(e))
        }
    }
}

#[async_trait]
impl QuoteSource for ListingPageSource {
    fn name(&self) -> &'static str {
        "primary"
    }

    async fn fetch_quotes(
        &self,
        tickers: &[String],
        attempt: FetchAttempt,
    ) -> Result<HashMap<String, Quote>, FetchError> {
        let url = self.listing_url(tickers);
        debug!("GET {} (attempt {})", url, attempt.number);

        let html = self.load(&url, attempt).await?;

        let rows = parse_listing_page(&html, tickers, &self.markers).map_err(|e| FetchError::Parse {
            source_name: "primary",
            reason: format!("{:#}", e),
        })?;

        let quotes: HashMap<String, Quote> = rows
            .iter()
            .filter_map(|(symbol, row)| raw_row_to_quote(row).map(|q| (symbol.clone(), q)))
            .collect();

        debug!("{} of {} symbols priced from listing page", quotes.len(), tickers.len());
        Ok(quotes)
    }

    fn close(&self) {
        self.pool.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_url_joins_batch() {
        let src = ListingPageSource::new(&ScraperConfig::default());
        assert_eq!(
            src.listing_url(&["AAPL".to_string(), "TSLA".to_string()]),
            "https://finance.yahoo.com/quotes/AAPL,TSLA/"
        );
    }

    #[test]
    fn close_releases_shared_handle() {
        let src = ListingPageSource::new(&ScraperConfig::default());
        src.pool().shared().unwrap();
        assert!(src.pool().is_open());
        src.close();
        assert!(!src.pool().is_open());
    }
}
