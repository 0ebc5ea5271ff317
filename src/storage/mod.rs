use crate::models::{PostEntry, PriceRecord};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, Utc};
use duckdb::{Connection, params, params_from_iter};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::info;

// ── Store trait ───────────────────────────────────────────────────────────────

/// Relational price table keyed by ticker, plus the feed's post table.
#[async_trait]
pub trait PriceStore: Send + Sync {
    /// `updated_at` per ticker; tickers without a row are absent.
    async fn last_updated(&self, tickers: &[String]) -> Result<HashMap<String, DateTime<Utc>>>;

    /// Insert-or-update every record in one transaction, conflict target `ticker`.
    async fn upsert_prices(&self, records: &[PriceRecord]) -> Result<usize>;

    async fn prices_for(&self, tickers: &[String]) -> Result<Vec<PriceRecord>>;

    /// Stable ticker-ordered page of the price table.
    async fn prices_page(&self, offset: usize, limit: usize) -> Result<Vec<PriceRecord>>;

    async fn recent_posts(&self, limit: usize) -> Result<Vec<PostEntry>>;

    async fn begin_refresh_run(&self, _started_at: DateTime<Utc>) -> Result<i64> {
        Ok(0)
    }

    async fn finish_refresh_run(&self, _run_id: i64, _summary: &RunSummary) -> Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub finished_at: Option<DateTime<Utc>>,
    pub tickers_refreshed: usize,
    pub placeholders: usize,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RefreshRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: String,
    pub tickers_refreshed: i64,
    pub placeholders: i64,
    pub error_msg: Option<String>,
}

// ── Schema ────────────────────────────────────────────────────────────────────

const DDL: &str = r#"
CREATE TABLE IF NOT EXISTS prices (
    ticker                   VARCHAR PRIMARY KEY,
    price                    DOUBLE    NOT NULL,
    price_change             DOUBLE,
    price_change_percentage  DOUBLE,
    updated_at               TIMESTAMP NOT NULL,
    source                   VARCHAR   NOT NULL DEFAULT 'primary',
    -- Set only on placeholder rows
    fetch_error              VARCHAR
);

CREATE TABLE IF NOT EXISTS posts (
    id          BIGINT PRIMARY KEY,
    ticker      VARCHAR,
    author      VARCHAR   NOT NULL,
    body        VARCHAR   NOT NULL,
    created_at  TIMESTAMP NOT NULL
);

CREATE SEQUENCE IF NOT EXISTS refresh_run_seq START 1;

CREATE TABLE IF NOT EXISTS refresh_runs (
    id                  BIGINT PRIMARY KEY DEFAULT nextval('refresh_run_seq'),
    started_at          TIMESTAMP NOT NULL,
    finished_at         TIMESTAMP,
    status              VARCHAR NOT NULL DEFAULT 'running',
    tickers_refreshed   INTEGER DEFAULT 0,
    placeholders        INTEGER DEFAULT 0,
    error_msg           VARCHAR
);

CREATE TABLE IF NOT EXISTS schema_version (
    version     INTEGER PRIMARY KEY,
    applied_at  TIMESTAMP NOT NULL
);
"#;

const PRICE_COLUMNS: &str =
    "ticker, price, price_change, price_change_percentage, updated_at, source, fetch_error";

// ── Repository ────────────────────────────────────────────────────────────────

/// Cloning shares the connection.
#[derive(Clone)]
pub struct Repository {
    conn: Arc<Mutex<Connection>>,
}

impl Repository {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Could not create dir {:?}", parent))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open DuckDB at {:?}", path))?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Arc::new(Mutex::new(Connection::open_in_memory()?)),
        })
    }

    /// Run synchronous DuckDB work on the blocking pool so request handlers keep moving.
    async fn blocking<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Repository) -> Result<T> + Send + 'static,
    {
        let repo = self.clone();
        tokio::task::spawn_blocking(move || f(&repo))
            .await
            .context("Storage task panicked")?
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn run_migrations(&self) -> Result<()> {
        info!("Running migrations…");
        let conn = self.conn();
        conn.execute_batch(DDL).context("DDL failed")?;
        conn.execute(
            "INSERT OR IGNORE INTO schema_version (version, applied_at) VALUES (1, ?)",
            params![Utc::now().naive_utc()],
        )?;
        info!("Migrations done.");
        Ok(())
    }

    // ── Prices ────────────────────────────────────────────────────────────────

    pub fn upsert_price_rows(&self, records: &[PriceRecord]) -> Result<usize> {
        if records.is_empty() {
            return Ok(0);
        }

        let conn = self.conn();
        let tx = conn.unchecked_transaction()?;
        let sql = r#"
            INSERT INTO prices
                (ticker, price, price_change, price_change_percentage, updated_at, source, fetch_error)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (ticker) DO UPDATE SET
                price                   = excluded.price,
                price_change            = excluded.price_change,
                price_change_percentage = excluded.price_change_percentage,
                updated_at              = excluded.updated_at,
                source                  = excluded.source,
                fetch_error             = excluded.fetch_error
        "#;

        for r in records {
            tx.execute(sql, params![
                r.ticker,
                r.price,
                r.price_change,
                r.price_change_percent,
                r.updated_at.naive_utc(),
                r.source.as_str(),
                r.error,
            ])
            .with_context(|| format!("upsert price {}", r.ticker))?;
        }

        tx.commit()?;
        Ok(records.len())
    }

    fn select_prices(&self, sql: &str, args: Vec<duckdb::types::Value>) -> Result<Vec<PriceRecord>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params_from_iter(args), |r| {
                Ok(PriceRow {
                    ticker: r.get(0)?,
                    price: r.get(1)?,
                    price_change: r.get(2)?,
                    price_change_percent: r.get(3)?,
                    updated_at: r.get(4)?,
                    source: r.get(5)?,
                    error: r.get(6)?,
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;

        rows.into_iter().map(PriceRow::into_record).collect()
    }

    pub fn price_rows_for(&self, tickers: &[String]) -> Result<Vec<PriceRecord>> {
        if tickers.is_empty() {
            return Ok(vec![]);
        }
        let sql = format!(
            "SELECT {} FROM prices WHERE ticker IN ({}) ORDER BY ticker",
            PRICE_COLUMNS,
            placeholders(tickers.len())
        );
        self.select_prices(&sql, text_values(tickers))
    }

    pub fn price_rows_page(&self, offset: usize, limit: usize) -> Result<Vec<PriceRecord>> {
        let sql = format!(
            "SELECT {} FROM prices ORDER BY ticker LIMIT ? OFFSET ?",
            PRICE_COLUMNS
        );
        self.select_prices(
            &sql,
            vec![
                duckdb::types::Value::BigInt(limit as i64),
                duckdb::types::Value::BigInt(offset as i64),
            ],
        )
    }

    pub fn last_updated_rows(&self, tickers: &[String]) -> Result<HashMap<String, DateTime<Utc>>> {
        if tickers.is_empty() {
            return Ok(HashMap::new());
        }
        let sql = format!(
            "SELECT ticker, updated_at FROM prices WHERE ticker IN ({})",
            placeholders(tickers.len())
        );
        let conn = self.conn();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(text_values(tickers)), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, NaiveDateTime>(1)?))
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;

        Ok(rows.into_iter().map(|(t, at)| (t, at.and_utc())).collect())
    }

    pub fn price_count(&self) -> Result<i64> {
        let conn = self.conn();
        let mut s = conn.prepare("SELECT COUNT(*) FROM prices")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    pub fn placeholder_count(&self) -> Result<i64> {
        let conn = self.conn();
        let mut s = conn.prepare("SELECT COUNT(*) FROM prices WHERE source = 'placeholder'")?;
        Ok(s.query_row([], |r| r.get(0))?)
    }

    // ── Posts ─────────────────────────────────────────────────────────────────

    pub fn insert_post(&self, post: &PostEntry) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO posts (id, ticker, author, body, created_at) VALUES (?, ?, ?, ?, ?)",
                params![post.id, post.ticker, post.author, post.body, post.created_at.naive_utc()],
            )
            .with_context(|| format!("insert post {}", post.id))?;
        Ok(())
    }

    pub fn post_rows(&self, limit: usize) -> Result<Vec<PostEntry>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT id, ticker, author, body, created_at FROM posts ORDER BY created_at DESC, id DESC LIMIT ?",
        )?;
        let posts = stmt
            .query_map(params![limit as i64], |r| {
                Ok(PostEntry {
                    id: r.get(0)?,
                    ticker: r.get(1)?,
                    author: r.get(2)?,
                    body: r.get(3)?,
                    created_at: r.get::<_, NaiveDateTime>(4)?.and_utc(),
                })
            })?
            .collect::<duckdb::Result<Vec<_>>>()?;
        Ok(posts)
    }

    // ── Refresh run log ───────────────────────────────────────────────────────

    pub fn begin_run_row(&self, started_at: DateTime<Utc>) -> Result<i64> {
        let id = self.conn().query_row(
            "INSERT INTO refresh_runs (started_at, status) VALUES (?, 'running') RETURNING id",
            params![started_at.naive_utc()],
            |r| r.get(0),
        )?;
        Ok(id)
    }

    pub fn finish_run_row(&self, run_id: i64, summary: &RunSummary) -> Result<()> {
        let finished_at = summary.finished_at.unwrap_or_else(Utc::now);
        self.conn().execute(
            r#"UPDATE refresh_runs SET
               finished_at = ?, status = ?,
               tickers_refreshed = ?, placeholders = ?, error_msg = ?
               WHERE id = ?"#,
            params![
                finished_at.naive_utc(),
                if summary.error.is_none() { "success" } else { "error" },
                summary.tickers_refreshed as i64,
                summary.placeholders as i64,
                summary.error,
                run_id,
            ],
        )?;
        Ok(())
    }

    pub fn latest_run(&self) -> Result<Option<RefreshRun>> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            r#"SELECT id, started_at, finished_at, status, tickers_refreshed, placeholders, error_msg
               FROM refresh_runs ORDER BY id DESC LIMIT 1"#,
        )?;
        let mut rows = stmt.query_map([], |r| {
            Ok(RefreshRun {
                id: r.get(0)?,
                started_at: r.get::<_, NaiveDateTime>(1)?.and_utc(),
                finished_at: r.get::<_, Option<NaiveDateTime>>(2)?.map(|t| t.and_utc()),
                status: r.get(3)?,
                tickers_refreshed: r.get(4)?,
                placeholders: r.get(5)?,
                error_msg: r.get(6)?,
            })
        })?;
        Ok(rows.next().transpose()?)
    }
}

#[async_trait]
impl PriceStore for Repository {
    async fn last_updated(&self, tickers: &[String]) -> Result<HashMap<String, DateTime<Utc>>> {
        let tickers = tickers.to_vec();
        self.blocking(move |repo| repo.last_updated_rows(&tickers)).await
    }

    async fn upsert_prices(&self, records: &[PriceRecord]) -> Result<usize> {
        let records = records.to_vec();
        self.blocking(move |repo| repo.upsert_price_rows(&records)).await
    }

    async fn prices_for(&self, tickers: &[String]) -> Result<Vec<PriceRecord>> {
        let tickers = tickers.to_vec();
        self.blocking(move |repo| repo.price_rows_for(&tickers)).await
    }

    async fn prices_page(&self, offset: usize, limit: usize) -> Result<Vec<PriceRecord>> {
        self.blocking(move |repo| repo.price_rows_page(offset, limit)).await
    }

    async fn recent_posts(&self, limit: usize) -> Result<Vec<PostEntry>> {
        self.blocking(move |repo| repo.post_rows(limit)).await
    }

    async fn begin_refresh_run(&self, started_at: DateTime<Utc>) -> Result<i64> {
        self.blocking(move |repo| repo.begin_run_row(started_at)).await
    }

    async fn finish_refresh_run(&self, run_id: i64, summary: &RunSummary) -> Result<()> {
        let summary = summary.clone();
        self.blocking(move |repo| repo.finish_run_row(run_id, &summary)).await
    }
}

// ── Row helpers ───────────────────────────────────────────────────────────────

struct PriceRow {
    ticker: String,
    price: f64,
    price_change: Option<f64>,
    price_change_percent: Option<f64>,
    updated_at: NaiveDateTime,
    source: String,
    error: Option<String>,
}

impl PriceRow {
    fn into_record(self) -> Result<PriceRecord> {
        let source = self
            .source
            .parse()
            .with_context(|| format!("prices.source for {}", self.ticker))?;
        Ok(PriceRecord {
            ticker: self.ticker,
            price: self.price,
            price_change: self.price_change,
            price_change_percent: self.price_change_percent,
            updated_at: self.updated_at.and_utc(),
            source,
            error: self.error,
        })
    }
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

fn text_values(tickers: &[String]) -> Vec<duckdb::types::Value> {
    tickers
        .iter()
        .map(|t| duckdb::types::Value::Text(t.clone()))
        .collect()
}
