//! Staleness and market-hours rules.
//!
//! Everything here takes `now` as a parameter; only [`SystemClock`] reads the
//! wall clock.

use crate::config::{MarketConfig, PipelineConfig};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Datelike, Duration, NaiveTime, Utc, Weekday};
use std::sync::Mutex;
use tracing::trace;

// ── Clock ─────────────────────────────────────────────────────────────────────

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replay.
pub struct FixedClock(Mutex<DateTime<Utc>>);

impl FixedClock {
    pub fn new(at: DateTime<Utc>) -> Self {
        Self(Mutex::new(at))
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.0.lock().unwrap_or_else(|p| p.into_inner()) = at;
    }

    pub fn advance(&self, by: Duration) {
        let mut guard = self.0.lock().unwrap_or_else(|p| p.into_inner());
        *guard += by;
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ── Market session ────────────────────────────────────────────────────────────

/// Weekday time-of-day window, UTC, open inclusive and close exclusive.
/// Exchange holidays are not modelled.
#[derive(Debug, Clone, PartialEq)]
pub struct MarketSession {
    pub open: NaiveTime,
    pub close: NaiveTime,
    pub weekdays: Vec<Weekday>,
}

impl MarketSession {
    pub fn from_config(cfg: &MarketConfig) -> Result<Self> {
        let open = parse_hhmm(&cfg.open).context("market.open")?;
        let close = parse_hhmm(&cfg.close).context("market.close")?;
        if close <= open {
            bail!("market.close ({}) must be after market.open ({})", close, open);
        }

        let weekdays = cfg
            .weekdays
            .iter()
            .map(|d| {
                d.trim()
                    .parse::<Weekday>()
                    .map_err(|_| anyhow::anyhow!("market.weekdays: unknown day {:?}", d))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self { open, close, weekdays })
    }

    /// US equities regular session expressed in UTC.
    pub fn us_equities() -> Self {
        Self {
            open: NaiveTime::from_hms_opt(14, 30, 0).unwrap_or(NaiveTime::MIN),
            close: NaiveTime::from_hms_opt(21, 0, 0).unwrap_or(NaiveTime::MIN),
            weekdays: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
        }
    }

    fn is_trading_day(&self, day: Weekday) -> bool {
        self.weekdays.contains(&day)
    }

    pub fn is_open(&self, now: DateTime<Utc>) -> bool {
        if !self.is_trading_day(now.weekday()) {
            return false;
        }
        let t = now.time();
        t >= self.open && t < self.close
    }

    /// First session open strictly after `now`.
    pub fn next_open(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        (0..=7).find_map(|days_ahead| {
            let date = now.date_naive() + Duration::days(days_ahead);
            if !self.is_trading_day(date.weekday()) {
                return None;
            }
            let at = date.and_time(self.open).and_utc();
            (at > now).then_some(at)
        })
    }
}

fn parse_hhmm(s: &str) -> Result<NaiveTime> {
    let s = s.trim();
    NaiveTime::parse_from_str(s, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M:%S"))
        .with_context(|| format!("expected HH:MM, got {:?}", s))
}

// ── Freshness policy ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FreshnessPolicy {
    stale_after: Duration,
    session: MarketSession,
}

impl FreshnessPolicy {
    pub fn new(stale_after: Duration, session: MarketSession) -> Self {
        Self { stale_after, session }
    }

    pub fn from_config(pipeline: &PipelineConfig, market: &MarketConfig) -> Result<Self> {
        Ok(Self::new(pipeline.stale_after(), MarketSession::from_config(market)?))
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    pub fn session(&self) -> &MarketSession {
        &self.session
    }

    /// Never-seen tickers are stale; the threshold itself counts as stale.
    pub fn is_stale(&self, ticker: &str, last_updated_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let stale = match last_updated_at {
            None => true,
            Some(at) => now - at >= self.stale_after,
        };
        trace!(ticker, ?last_updated_at, stale, "freshness check");
        stale
    }

    pub fn is_market_open(&self, now: DateTime<Utc>) -> bool {
        self.session.is_open(now)
    }
}
