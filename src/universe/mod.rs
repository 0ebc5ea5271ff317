//! The fixed set of symbols the refresh worker tracks.

use crate::models::Ticker;
use crate::scraper::cleaner::normalise_symbol;
use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::Path;
use tracing::{info, warn};

/// Large-cap US equities and the ETFs the feed discusses most.
const DEFAULT_TICKERS: &[&str] = &[
    // Mega-cap tech
    "AAPL", "MSFT", "GOOGL", "GOOG", "AMZN", "META", "NVDA", "TSLA", "AVGO", "ORCL",
    "ADBE", "CRM", "CSCO", "INTC", "AMD", "QCOM", "TXN", "IBM", "NOW", "INTU",
    "AMAT", "MU", "LRCX", "KLAC", "ADI", "MRVL", "SNPS", "CDNS", "PANW", "CRWD",
    "FTNT", "ZS", "NET", "DDOG", "SNOW", "MDB", "PLTR", "SHOP", "UBER", "ABNB",
    "NFLX", "SPOT", "PYPL", "SQ", "COIN", "HOOD", "ROKU", "RBLX", "U", "TWLO",
    // Financials
    "JPM", "BAC", "WFC", "C", "GS", "MS", "SCHW", "BLK", "AXP", "V",
    "MA", "COF", "USB", "PNC", "TFC", "BK", "SPGI", "MCO", "ICE", "CME",
    // Healthcare
    "UNH", "JNJ", "LLY", "PFE", "MRK", "ABBV", "TMO", "ABT", "DHR", "BMY",
    "AMGN", "GILD", "CVS", "CI", "HUM", "ISRG", "VRTX", "REGN", "MRNA", "BIIB",
    // Consumer
    "WMT", "COST", "HD", "LOW", "TGT", "MCD", "SBUX", "NKE", "KO", "PEP",
    "PG", "CL", "KMB", "MDLZ", "PM", "MO", "EL", "LULU", "CMG", "YUM",
    "DIS", "CMCSA", "CHTR", "T", "VZ", "TMUS", "BKNG", "MAR", "HLT", "F",
    "GM", "RIVN", "LCID", "NIO", "TM", "HMC",
    // Industrials & energy
    "BA", "CAT", "DE", "GE", "HON", "LMT", "RTX", "NOC", "GD", "UPS",
    "FDX", "UNP", "CSX", "NSC", "MMM", "EMR", "ETN", "XOM", "CVX", "COP",
    "SLB", "EOG", "OXY", "PSX", "MPC", "VLO", "KMI", "WMB", "NEE", "DUK",
    "SO", "D", "AEP", "EXC",
    // Materials & real estate
    "LIN", "APD", "SHW", "ECL", "FCX", "NEM", "DOW", "DD", "PLD", "AMT",
    "CCI", "EQIX", "SPG", "O", "PSA",
    // ETFs
    "SPY", "QQQ", "DIA", "IWM", "VTI", "VOO", "VEA", "VWO", "EFA", "EEM",
    "XLK", "XLF", "XLE", "XLV", "XLY", "XLP", "XLI", "XLU", "XLB", "XLRE",
    "ARKK", "SOXX", "SMH", "TLT", "HYG", "LQD", "GLD", "SLV", "USO", "UNG",
];

/// The deduplicated default universe, in first-seen order.
pub fn ticker_universe() -> Vec<Ticker> {
    dedup_symbols(DEFAULT_TICKERS.iter().copied())
}

/// Default universe extended with symbols from an optional CSV file.
pub fn load_universe(extra: Option<&Path>) -> Result<Vec<Ticker>> {
    let mut symbols = ticker_universe();
    if let Some(path) = extra {
        let added = read_symbols_csv(path)?;
        info!("Universe file {:?}: {} symbols", path, added.len());
        symbols.extend(added);
        symbols = dedup_symbols(symbols.iter().map(String::as_str));
    }
    Ok(symbols)
}

/// Read a CSV with a `symbol` column (or a bare first column) into symbols.
pub fn read_symbols_csv(path: &Path) -> Result<Vec<Ticker>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("Failed to open universe file {:?}", path))?;

    let column = reader
        .headers()
        .with_context(|| format!("Universe file {:?} has no header row", path))?
        .iter()
        .position(|h| h.trim().eq_ignore_ascii_case("symbol"))
        .unwrap_or(0);

    let mut symbols = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let record = match result {
            Ok(r) => r,
            Err(e) => {
                warn!("Row {} in {:?}: {}", i + 1, path, e);
                continue;
            }
        };
        if let Some(cell) = record.get(column) {
            let symbol = normalise_symbol(cell);
            if !symbol.is_empty() {
                symbols.push(symbol);
            }
        }
    }
    Ok(symbols)
}

fn dedup_symbols<'a>(symbols: impl IntoIterator<Item = &'a str>) -> Vec<Ticker> {
    let mut seen = HashSet::new();
    symbols
        .into_iter()
        .map(normalise_symbol)
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect()
}
