use crate::models::{Quote, RawQuoteRow};
use tracing::warn;

// ── Parsers ───────────────────────────────────────────────────────────────────

fn is_blank_marker(s: &str) -> bool {
    s.is_empty() || s == "N/A" || s == "-" || s == "—" || s == "--"
}

/// Parse a price or signed change: strip everything except digits, dot, sign.
/// "$1,234.56" → 1234.56 | "+2.10" → 2.1 | "−0.45" → -0.45
pub fn parse_price(s: &str) -> Option<f64> {
    let s = s.trim();
    if is_blank_marker(s) {
        return None;
    }
    let cleaned: String = s
        .replace('\u{2212}', "-")
        .chars()
        .filter(|c| c.is_ascii_digit() || *c == '.' || *c == '-' || *c == '+')
        .collect();
    cleaned.parse().ok().filter(|v: &f64| v.is_finite())
}

/// "(+1.25%)" → 1.25 | "-0.40%" → -0.4
pub fn parse_pct(s: &str) -> Option<f64> {
    let s = s
        .trim()
        .trim_start_matches('(')
        .trim_end_matches(')')
        .replace(['%', ','], "");
    parse_price(&s)
}

pub fn normalise_symbol(s: &str) -> String {
    s.trim().to_uppercase()
}

// ── Raw marker row → Quote ────────────────────────────────────────────────────

pub fn raw_row_to_quote(row: &RawQuoteRow) -> Option<Quote> {
    let symbol = row.symbol.as_deref().map(normalise_symbol).unwrap_or_default();
    let price = row.price.as_deref().and_then(parse_price)?;

    let quote = Quote {
        price,
        change: row.change.as_deref().and_then(parse_price),
        change_percent: row.change_pct.as_deref().and_then(parse_pct),
    };

    if !quote.is_valid() {
        warn!("Invalid price {} for {}", price, symbol);
        return None;
    }
    Some(quote)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
