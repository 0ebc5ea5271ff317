//! Secondary source: a bulk quote JSON endpoint queried with all symbols at once.

use crate::config::FallbackConfig;
use crate::error::FetchError;
use crate::models::Quote;
use crate::scraper::cleaner::normalise_symbol;
use crate::scraper::{FetchAttempt, QuoteSource};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::iter::Take;
use std::time::Duration;
use tokio_retry::RetryIf;
use tokio_retry::strategy::{ExponentialBackoff, jitter};
use tracing::{debug, warn};
use url::Url;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteEnvelope {
    quote_response: QuoteResponse,
}

#[derive(Debug, Deserialize)]
struct QuoteResponse {
    #[serde(default)]
    result: Vec<QuoteItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QuoteItem {
    symbol: String,
    regular_market_price: Option<f64>,
    regular_market_change: Option<f64>,
    regular_market_change_percent: Option<f64>,
}

const MAX_BACKOFF: Duration = Duration::from_secs(5);

pub struct QuoteApiSource {
    client: reqwest::Client,
    endpoint: Url,
    http_retries: usize,
    http_backoff_ms: u64,
}

impl QuoteApiSource {
    pub fn new(config: &FallbackConfig, user_agent: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .gzip(true)
            .build()
            .context("Failed to build fallback HTTP client")?;
        let endpoint = Url::parse(&config.base_url)
            .with_context(|| format!("Invalid fallback base_url {:?}", config.base_url))?;

        Ok(Self {
            client,
            endpoint,
            http_retries: config.http_retries,
            http_backoff_ms: config.http_backoff_ms.max(1),
        })
    }

    /// Waits between HTTP attempts: `backoff`, `2 * backoff`, `4 * backoff`, ... capped at 5s.
    fn backoff_schedule(&self) -> Take<ExponentialBackoff> {
        ExponentialBackoff::from_millis(2)
            .factor((self.http_backoff_ms / 2).max(1))
            .max_delay(MAX_BACKOFF)
            .take(self.http_retries)
    }

    fn quote_url(&self, tickers: &[String]) -> Url {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().append_pair("symbols", &tickers.join(","));
        url
    }

    async fn request(&self, url: &Url) -> Result<String, FetchError> {
        let resp = self.client.get(url.clone()).send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::Status {
                source_name: "fallback",
                status: status.as_u16(),
            });
        }
        Ok(resp.text().await?)
    }
}

/// Decode the bulk quote body, keeping only requested symbols with a usable price.
pub fn parse_quote_response(body: &str, tickers: &[String]) -> Result<HashMap<String, Quote>, FetchError> {
    let envelope: QuoteEnvelope = serde_json::from_str(body).map_err(|e| FetchError::Parse {
        source_name: "fallback",
        reason: e.to_string(),
    })?;

    let mut quotes = HashMap::new();
    for item in envelope.quote_response.result {
        let symbol = normalise_symbol(&item.symbol);
        if !tickers.iter().any(|t| t == &symbol) {
            continue;
        }
        let Some(price) = item.regular_market_price else {
            continue;
        };
        let quote = Quote {
            price,
            change: item.regular_market_change,
            change_percent: item.regular_market_change_percent,
        };
        if quote.is_valid() {
            quotes.insert(symbol, quote);
        }
    }
    Ok(quotes)
}

#[async_trait]
impl QuoteSource for QuoteApiSource {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn fetch_quotes(
        &self,
        tickers: &[String],
        _attempt: FetchAttempt,
    ) -> Result<HashMap<String, Quote>, FetchError> {
        let url = self.quote_url(tickers);
        debug!("Fallback quote request for {} symbols", tickers.len());

        let strategy = self.backoff_schedule().map(jitter);

        // Only throttling and server errors are worth another HTTP round-trip
        let body = RetryIf::spawn(
            strategy,
            || self.request(&url),
            |e: &FetchError| {
                let retry = e.is_retryable_status();
                if retry {
                    warn!("Fallback source transient failure: {}", e);
                }
                retry
            },
        )
        .await?;

        parse_quote_response(&body, tickers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_requested_symbols_with_prices() {
        let body = r#"{"quoteResponse":{"result":[
            {"symbol":"AAPL","regularMarketPrice":189.84,"regularMarketChange":1.05,"regularMarketChangePercent":0.56},
            {"symbol":"TSLA","regularMarketPrice":null},
            {"symbol":"msft","regularMarketPrice":415.5},
            {"symbol":"NVDA","regularMarketPrice":880.0},
            {"symbol":"AMD","regularMarketPrice":0.0}
        ],"error":null}}"#;
        let tickers: Vec<String> = ["AAPL", "TSLA", "MSFT", "AMD"].iter().map(|s| s.to_string()).collect();

        let quotes = parse_quote_response(body, &tickers).unwrap();
        assert_eq!(quotes.len(), 2);
        assert_eq!(quotes["AAPL"].change_percent, Some(0.56));
        assert_eq!(quotes["MSFT"].price, 415.5);
    }

    #[test]
    fn malformed_body_is_a_parse_error() {
        let err = parse_quote_response("<html>blocked</html>", &["AAPL".to_string()]).unwrap_err();
        assert!(matches!(err, FetchError::Parse { .. }));
    }

    #[test]
    fn backoff_doubles_from_configured_base_and_stays_bounded() {
        let src = QuoteApiSource::new(&FallbackConfig::default(), "test").unwrap();
        let waits: Vec<Duration> = src.backoff_schedule().collect();
        assert_eq!(waits, vec![Duration::from_millis(250), Duration::from_millis(500)]);

        let cfg = FallbackConfig {
            http_retries: 8,
            http_backoff_ms: 1000,
            ..Default::default()
        };
        let src = QuoteApiSource::new(&cfg, "test").unwrap();
        let waits: Vec<Duration> = src.backoff_schedule().collect();
        assert_eq!(waits.len(), 8);
        assert_eq!(waits[0], Duration::from_secs(1));
        assert!(waits.iter().all(|w| *w <= MAX_BACKOFF));
    }

    #[test]
    fn url_carries_symbol_list() {
        let src = QuoteApiSource::new(&FallbackConfig::default(), "test").unwrap();
        let url = src.quote_url(&["AAPL".to_string(), "BRK.B".to_string()]);
        assert!(url.as_str().ends_with("symbols=AAPL%2CBRK.B"));
    }
}
