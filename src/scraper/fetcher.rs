//! Batch quote resolution: primary with retries, then fallback, then placeholders.
//!
//! The control flow is a bounded loop over [`FetchStage`]. Every requested
//! ticker comes back with a record; source errors stop here.

use crate::freshness::Clock;
use crate::models::{PriceRecord, PriceSource, Quote};
use crate::scraper::{FetchAttempt, QuoteSource};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchStage {
    Primary(u32),
    Fallback,
    Placeholder,
    Done,
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first primary attempt.
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    /// Next stage after primary attempt `n`.
    ///
    /// An attempt that priced nothing is a failure and is retried until the
    /// ceiling; any success moves on, to the fallback if symbols remain.
    pub fn after_primary(&self, n: u32, priced: usize, missing: usize) -> FetchStage {
        if missing == 0 {
            FetchStage::Done
        } else if priced == 0 && n <= self.max_retries {
            FetchStage::Primary(n + 1)
        } else {
            FetchStage::Fallback
        }
    }
}

pub struct SourceFetcher {
    primary: Arc<dyn QuoteSource>,
    fallback: Arc<dyn QuoteSource>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl SourceFetcher {
    pub fn new(
        primary: Arc<dyn QuoteSource>,
        fallback: Arc<dyn QuoteSource>,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            primary,
            fallback,
            policy,
            clock,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Resolve every ticker in `tickers` to a record. Never fails.
    pub async fn fetch(&self, tickers: &[String]) -> HashMap<String, PriceRecord> {
        let mut resolved: HashMap<String, PriceRecord> = HashMap::with_capacity(tickers.len());
        if tickers.is_empty() {
            return resolved;
        }

        let mut primary_error: Option<String> = None;
        let mut fallback_error: Option<String> = None;
        let mut stage = FetchStage::Primary(1);

        while stage != FetchStage::Done {
            stage = match stage {
                FetchStage::Primary(n) => {
                    let attempt = FetchAttempt { number: n };
                    let priced = match self.primary.fetch_quotes(tickers, attempt).await {
                        Ok(quotes) => self.accept(&mut resolved, tickers, quotes, PriceSource::Primary),
                        Err(e) => {
                            warn!("Primary attempt {} failed: {}", n, e);
                            primary_error = Some(e.to_string());
                            0
                        }
                    };
                    if priced == 0 && primary_error.is_none() {
                        primary_error = Some("primary source returned no usable quotes".into());
                    }

                    let missing = tickers.len() - resolved.len();
                    let next = self.policy.after_primary(n, priced, missing);
                    if let FetchStage::Primary(retry) = next {
                        info!(
                            "Retrying batch of {} on primary ({}/{}) in {:?}",
                            tickers.len(),
                            retry - 1,
                            self.policy.max_retries,
                            self.policy.retry_delay
                        );
                        sleep(self.policy.retry_delay).await;
                    }
                    next
                }

                FetchStage::Fallback => {
                    let missing = missing_tickers(tickers, &resolved);
                    info!("Falling back for {} of {} symbols", missing.len(), tickers.len());
                    match self.fallback.fetch_quotes(&missing, FetchAttempt::first()).await {
                        Ok(quotes) => {
                            let n = self.accept(&mut resolved, &missing, quotes, PriceSource::Fallback);
                            if n == 0 {
                                fallback_error = Some("fallback source returned no usable quotes".into());
                            }
                        }
                        Err(e) => {
                            warn!("Fallback source failed: {}", e);
                            fallback_error = Some(e.to_string());
                        }
                    }
                    if resolved.len() == tickers.len() {
                        FetchStage::Done
                    } else {
                        FetchStage::Placeholder
                    }
                }

                FetchStage::Placeholder => {
                    let now = self.clock.now();
                    let reason = placeholder_reason(primary_error.as_deref(), fallback_error.as_deref());
                    for ticker in missing_tickers(tickers, &resolved) {
                        warn!("{}: no quote from any source, writing placeholder", ticker);
                        resolved.insert(ticker.clone(), PriceRecord::placeholder(&ticker, reason.clone(), now));
                    }
                    FetchStage::Done
                }

                FetchStage::Done => FetchStage::Done,
            };
        }

        debug!("Batch of {} resolved", resolved.len());
        resolved
    }

    /// Record valid quotes for requested, still-unresolved tickers. Returns how many were taken.
    fn accept(
        &self,
        resolved: &mut HashMap<String, PriceRecord>,
        requested: &[String],
        quotes: HashMap<String, Quote>,
        source: PriceSource,
    ) -> usize {
        let now = self.clock.now();
        let mut taken = 0;
        for ticker in requested {
            if resolved.contains_key(ticker) {
                continue;
            }
            if let Some(quote) = quotes.get(ticker).filter(|q| q.is_valid()) {
                resolved.insert(ticker.clone(), PriceRecord::from_quote(ticker, *quote, source, now));
                taken += 1;
            }
        }
        taken
    }

    pub fn close(&self) {
        self.primary.close();
        self.fallback.close();
    }
}

fn missing_tickers(tickers: &[String], resolved: &HashMap<String, PriceRecord>) -> Vec<String> {
    tickers
        .iter()
        .filter(|t| !resolved.contains_key(*t))
        .cloned()
        .collect()
}

fn placeholder_reason(primary: Option<&str>, fallback: Option<&str>) -> String {
    format!(
        "no quote available (primary: {}; fallback: {})",
        primary.unwrap_or("symbol not on page"),
        fallback.unwrap_or("symbol not in response")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FetchError;
    use crate::freshness::FixedClock;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Scripted source: one response per call, the last one repeating.
    struct Scripted {
        name: &'static str,
        script: Vec<Result<Vec<&'static str>, &'static str>>,
        calls: Mutex<Vec<(u32, Vec<String>)>>,
    }

    impl Scripted {
        fn new(name: &'static str, script: Vec<Result<Vec<&'static str>, &'static str>>) -> Arc<Self> {
            Arc::new(Self { name, script, calls: Mutex::new(Vec::new()) })
        }

        fn calls(&self) -> Vec<(u32, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl QuoteSource for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn fetch_quotes(
            &self,
            tickers: &[String],
            attempt: FetchAttempt,
        ) -> Result<HashMap<String, Quote>, FetchError> {
            let idx = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((attempt.number, tickers.to_vec()));
                (calls.len() - 1).min(self.script.len() - 1)
            };
            match &self.script[idx] {
                Ok(symbols) => Ok(symbols
                    .iter()
                    .filter(|s| tickers.iter().any(|t| t == *s))
                    .map(|s| {
                        (s.to_string(), Quote { price: 100.0, change: Some(1.0), change_percent: Some(1.0) })
                    })
                    .collect()),
                Err(_) => Err(FetchError::Empty { source_name: self.name }),
            }
        }
    }

    fn batch(symbols: &[&str]) -> Vec<String> {
        symbols.iter().map(|s| s.to_string()).collect()
    }

    fn fetcher(primary: Arc<Scripted>, fallback: Arc<Scripted>) -> SourceFetcher {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 6, 15, 0, 0).unwrap()));
        SourceFetcher::new(
            primary,
            fallback,
            RetryPolicy { max_retries: 3, retry_delay: Duration::ZERO },
            clock,
        )
    }

    #[test]
    fn transitions() {
        let p = RetryPolicy { max_retries: 3, retry_delay: Duration::ZERO };
        assert_eq!(p.after_primary(1, 0, 10), FetchStage::Primary(2));
        assert_eq!(p.after_primary(3, 0, 10), FetchStage::Primary(4));
        assert_eq!(p.after_primary(4, 0, 10), FetchStage::Fallback);
        assert_eq!(p.after_primary(1, 7, 3), FetchStage::Fallback);
        assert_eq!(p.after_primary(1, 10, 0), FetchStage::Done);
    }

    #[tokio::test]
    async fn partial_primary_success_covers_whole_batch() {
        let tickers = batch(&["A", "B", "C", "D", "E", "F", "G", "H", "I", "J"]);
        let primary = Scripted::new("primary", vec![Ok(vec!["A", "B", "C", "D", "E", "F", "G"])]);
        let fallback = Scripted::new("fallback", vec![Ok(vec!["H"])]);
        let f = fetcher(primary.clone(), fallback.clone());

        let out = f.fetch(&tickers).await;

        assert_eq!(out.len(), 10);
        let keys: HashSet<_> = out.keys().cloned().collect();
        assert_eq!(keys, tickers.iter().cloned().collect());
        assert_eq!(out["A"].source, PriceSource::Primary);
        assert_eq!(out["H"].source, PriceSource::Fallback);
        assert_eq!(out["J"].source, PriceSource::Placeholder);
        assert!(out["J"].error.is_some());
        assert_eq!(out["J"].price, 0.0);

        // Partial success is not retried; only the misses go to the fallback
        assert_eq!(primary.calls().len(), 1);
        assert_eq!(fallback.calls(), vec![(1, batch(&["H", "I", "J"]))]);
    }

    #[tokio::test]
    async fn empty_primary_is_retried_up_to_ceiling_then_falls_back() {
        let tickers = batch(&["AAPL", "TSLA"]);
        let primary = Scripted::new("primary", vec![Err("boom")]);
        let fallback = Scripted::new("fallback", vec![Ok(vec!["AAPL", "TSLA"])]);
        let f = fetcher(primary.clone(), fallback.clone());

        let out = f.fetch(&tickers).await;

        let attempts: Vec<u32> = primary.calls().iter().map(|(n, _)| *n).collect();
        assert_eq!(attempts, vec![1, 2, 3, 4]);
        assert!(out.values().all(|r| r.source == PriceSource::Fallback));
    }

    #[tokio::test]
    async fn retry_success_stops_retrying() {
        let tickers = batch(&["AAPL", "TSLA"]);
        let primary = Scripted::new("primary", vec![Ok(vec![]), Ok(vec!["AAPL", "TSLA"])]);
        let fallback = Scripted::new("fallback", vec![Err("unused")]);
        let f = fetcher(primary.clone(), fallback.clone());

        let out = f.fetch(&tickers).await;

        assert_eq!(primary.calls().len(), 2);
        assert!(fallback.calls().is_empty());
        assert!(out.values().all(|r| r.source == PriceSource::Primary));
    }

    #[tokio::test]
    async fn both_sources_down_yields_placeholders_with_reason() {
        let tickers = batch(&["AAPL"]);
        let f = fetcher(
            Scripted::new("primary", vec![Err("down")]),
            Scripted::new("fallback", vec![Err("down")]),
        );

        let out = f.fetch(&tickers).await;
        let rec = &out["AAPL"];
        assert!(rec.is_placeholder());
        assert_eq!(rec.source, PriceSource::Placeholder);
        let reason = rec.error.as_deref().unwrap();
        assert!(reason.contains("primary"), "{reason}");
        assert!(reason.contains("fallback"), "{reason}");
    }

    #[tokio::test]
    async fn empty_batch_makes_no_calls() {
        let primary = Scripted::new("primary", vec![Ok(vec![])]);
        let f = fetcher(primary.clone(), Scripted::new("fallback", vec![Ok(vec![])]));
        assert!(f.fetch(&[]).await.is_empty());
        assert!(primary.calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn each_primary_retry_waits_the_configured_delay() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 6, 15, 0, 0).unwrap()));
        let primary = Scripted::new("primary", vec![Err("down")]);
        let fallback = Scripted::new("fallback", vec![Err("down")]);
        let f = SourceFetcher::new(primary.clone(), fallback, RetryPolicy::default(), clock);

        let started = tokio::time::Instant::now();
        let out = f.fetch(&batch(&["AAPL"])).await;

        assert_eq!(primary.calls().len(), 4);
        assert_eq!(started.elapsed(), Duration::from_secs(3 * 5));
        assert_eq!(out["AAPL"].source, PriceSource::Placeholder);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_first_attempt_does_not_wait() {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 3, 6, 15, 0, 0).unwrap()));
        let primary = Scripted::new("primary", vec![Ok(vec!["AAPL"])]);
        let fallback = Scripted::new("fallback", vec![Ok(vec![])]);
        let f = SourceFetcher::new(primary, fallback, RetryPolicy::default(), clock);

        let started = tokio::time::Instant::now();
        f.fetch(&batch(&["AAPL"])).await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
