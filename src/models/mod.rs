use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Uppercase stock/ETF symbol.
pub type Ticker = String;

// ── Quote as read off a source ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Quote {
    pub price: f64,
    pub change: Option<f64>,
    pub change_percent: Option<f64>,
}

impl Quote {
    /// A quote counts only when it carries a real, positive price.
    pub fn is_valid(&self) -> bool {
        self.price.is_finite() && self.price > 0.0
    }
}

// ── Price record (store row) ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceSource {
    Primary,
    Fallback,
    Placeholder,
}

impl PriceSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriceSource::Primary => "primary",
            PriceSource::Fallback => "fallback",
            PriceSource::Placeholder => "placeholder",
        }
    }
}

impl fmt::Display for PriceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriceSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "primary" => Ok(PriceSource::Primary),
            "fallback" => Ok(PriceSource::Fallback),
            "placeholder" => Ok(PriceSource::Placeholder),
            other => Err(anyhow::anyhow!("unknown price source {:?}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceRecord {
    pub ticker: Ticker,
    pub price: f64,
    pub price_change: Option<f64>,
    pub price_change_percent: Option<f64>,
    pub updated_at: DateTime<Utc>,
    pub source: PriceSource,
    pub error: Option<String>,
}

impl PriceRecord {
    pub fn from_quote(
        ticker: &str,
        quote: Quote,
        source: PriceSource,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            ticker: ticker.to_string(),
            price: quote.price,
            price_change: quote.change,
            price_change_percent: quote.change_percent,
            updated_at,
            source,
            error: None,
        }
    }

    /// Zero-price marker for "fetch attempted, no data obtained".
    pub fn placeholder(ticker: &str, reason: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            ticker: ticker.to_string(),
            price: 0.0,
            price_change: Some(0.0),
            price_change_percent: Some(0.0),
            updated_at,
            source: PriceSource::Placeholder,
            error: Some(reason.into()),
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.price == 0.0
    }
}

// ── Cache entries ─────────────────────────────────────────────────────────────

/// In-memory projection of a [`PriceRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEntry {
    pub ticker: Ticker,
    pub price: f64,
    pub price_change: Option<f64>,
    pub price_change_percent: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl From<&PriceRecord> for CacheEntry {
    fn from(r: &PriceRecord) -> Self {
        Self {
            ticker: r.ticker.clone(),
            price: r.price,
            price_change: r.price_change,
            price_change_percent: r.price_change_percent,
            updated_at: r.updated_at,
        }
    }
}

impl From<PriceRecord> for CacheEntry {
    fn from(r: PriceRecord) -> Self {
        CacheEntry::from(&r)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostEntry {
    pub id: i64,
    pub ticker: Option<Ticker>,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

// ── Raw scraped cells ─────────────────────────────────────────────────────────

/// Marker text extracted for one symbol on the listing page, before cleaning.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawQuoteRow {
    pub symbol: Option<String>,
    pub price: Option<String>,
    pub change: Option<String>,
    pub change_pct: Option<String>,
}
