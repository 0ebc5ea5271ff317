use crate::config::ScraperConfig;
use crate::models::RawQuoteRow;
use crate::scraper::cleaner::normalise_symbol;
use anyhow::Result;
use scraper::{ElementRef, Html, Selector};
use std::collections::{HashMap, HashSet};

/// Attribute names that locate quote fields on the listing page.
#[derive(Debug, Clone)]
pub struct QuoteMarkers {
    pub symbol_attr: String,
    pub field_attr: String,
    pub price_field: String,
    pub change_field: String,
    pub change_percent_field: String,
}

impl From<&ScraperConfig> for QuoteMarkers {
    fn from(cfg: &ScraperConfig) -> Self {
        Self {
            symbol_attr: cfg.symbol_attr.clone(),
            field_attr: cfg.field_attr.clone(),
            price_field: cfg.price_field.clone(),
            change_field: cfg.change_field.clone(),
            change_percent_field: cfg.change_percent_field.clone(),
        }
    }
}

// ── Listing page ──────────────────────────────────────────────────────────────

/// Collect raw marker text for every requested symbol present on the page.
/// Symbols absent from the page are absent from the result.
pub fn parse_listing_page(
    html: &str,
    tickers: &[String],
    markers: &QuoteMarkers,
) -> Result<HashMap<String, RawQuoteRow>> {
    let doc = Html::parse_document(html);

    let marker_sel = Selector::parse(&format!("[{}][{}]", markers.symbol_attr, markers.field_attr))
        .map_err(|e| anyhow::anyhow!("marker selector: {:?}", e))?;

    let wanted: HashSet<String> = tickers.iter().map(|t| normalise_symbol(t)).collect();
    let mut rows: HashMap<String, RawQuoteRow> = HashMap::new();

    for el in doc.select(&marker_sel) {
        let attrs = el.value();
        let Some(symbol) = attrs.attr(&markers.symbol_attr).map(normalise_symbol) else {
            continue;
        };
        if !wanted.contains(&symbol) {
            continue;
        }
        let Some(field) = attrs.attr(&markers.field_attr) else {
            continue;
        };

        let value = marker_value(&el);
        if value.is_empty() {
            continue;
        }

        let row = rows.entry(symbol.clone()).or_insert_with(|| RawQuoteRow {
            symbol: Some(symbol),
            ..Default::default()
        });

        // First marker wins; quote pages repeat the headline price in sidebars.
        let slot = if field == markers.price_field {
            &mut row.price
        } else if field == markers.change_field {
            &mut row.change
        } else if field == markers.change_percent_field {
            &mut row.change_pct
        } else {
            continue;
        };
        if slot.is_none() {
            *slot = Some(value);
        }
    }

    rows.retain(|_, r| r.price.is_some());
    Ok(rows)
}

/// Streaming widgets keep the raw number in `value`; fall back to text.
fn marker_value(el: &ElementRef<'_>) -> String {
    el.value()
        .attr("value")
        .or_else(|| el.value().attr("data-value"))
        .map(|v| v.trim().to_string())
        .unwrap_or_else(|| el.text().collect::<String>().trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn markers() -> QuoteMarkers {
        QuoteMarkers::from(&ScraperConfig::default())
    }

    const PAGE: &str = r#"
        <html><body><table><tbody>
          <tr>
            <td><a href="/quote/AAPL">AAPL</a></td>
            <td><fin-streamer data-symbol="AAPL" data-field="regularMarketPrice" value="189.84">189.84</fin-streamer></td>
            <td><fin-streamer data-symbol="AAPL" data-field="regularMarketChange">+1.05</fin-streamer></td>
            <td><fin-streamer data-symbol="AAPL" data-field="regularMarketChangePercent">(+0.56%)</fin-streamer></td>
          </tr>
          <tr>
            <td><fin-streamer data-symbol="tsla" data-field="regularMarketPrice">171.05</fin-streamer></td>
            <td><fin-streamer data-symbol="tsla" data-field="regularMarketChange">-3.20</fin-streamer></td>
          </tr>
          <tr>
            <td><fin-streamer data-symbol="MSFT" data-field="regularMarketChange">+2.00</fin-streamer></td>
          </tr>
          <tr>
            <td><fin-streamer data-symbol="NVDA" data-field="regularMarketPrice">880.00</fin-streamer></td>
          </tr>
        </tbody></table>
        <aside><fin-streamer data-symbol="AAPL" data-field="regularMarketPrice">1.00</fin-streamer></aside>
        </body></html>
    "#;

    #[test]
    fn extracts_requested_symbols_only() {
        let tickers = vec!["AAPL".to_string(), "TSLA".to_string(), "MSFT".to_string()];
        let rows = parse_listing_page(PAGE, &tickers, &markers()).unwrap();

        assert_eq!(rows.len(), 2);
        let aapl = &rows["AAPL"];
        assert_eq!(aapl.price.as_deref(), Some("189.84"));
        assert_eq!(aapl.change.as_deref(), Some("+1.05"));
        assert_eq!(aapl.change_pct.as_deref(), Some("(+0.56%)"));

        let tsla = &rows["TSLA"];
        assert_eq!(tsla.price.as_deref(), Some("171.05"));
        assert_eq!(tsla.change_pct, None);

        // MSFT has no price marker, NVDA was not requested
        assert!(!rows.contains_key("MSFT"));
        assert!(!rows.contains_key("NVDA"));
    }

    #[test]
    fn empty_page_yields_nothing() {
        let rows = parse_listing_page("<html></html>", &["AAPL".to_string()], &markers()).unwrap();
        assert!(rows.is_empty());
    }
}
