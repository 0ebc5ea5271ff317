//! Page-loading handles for the primary source.
//!
//! One long-lived handle is shared by first attempts and created lazily.
//! Retries open a private [`PageSession`] with its own connection pool and
//! cookie jar, which is torn down when the session drops.

use crate::config::ScraperConfig;
use crate::error::FetchError;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

pub struct BrowserPool {
    config: ScraperConfig,
    shared: Mutex<Option<reqwest::Client>>,
    sessions_opened: AtomicU64,
}

impl BrowserPool {
    pub fn new(config: &ScraperConfig) -> Self {
        Self {
            config: config.clone(),
            shared: Mutex::new(None),
            sessions_opened: AtomicU64::new(0),
        }
    }

    fn build_client(&self) -> Result<reqwest::Client, FetchError> {
        reqwest::Client::builder()
            .user_agent(&self.config.user_agent)
            .timeout(Duration::from_secs(self.config.timeout_secs))
            .gzip(true)
            // Quote pages set consent cookies on first load
            .cookie_store(true)
            .build()
            .map_err(FetchError::from)
    }

    /// The shared handle, created on first use or after a disconnect.
    pub fn shared(&self) -> Result<reqwest::Client, FetchError> {
        let mut slot = self.shared.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }
        let client = self.build_client()?;
        info!("Primary page handle opened");
        *slot = Some(client.clone());
        Ok(client)
    }

    /// A private session for one retry attempt.
    pub fn open_session(&self) -> Result<PageSession, FetchError> {
        let id = self.sessions_opened.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(session = id, "Opening private page session");
        Ok(PageSession {
            id,
            client: self.build_client()?,
        })
    }

    /// Drop the shared handle when its connection was lost.
    pub fn observe(&self, err: &FetchError) {
        if err.is_disconnect() {
            let mut slot = self.shared.lock().unwrap_or_else(|p| p.into_inner());
            if slot.take().is_some() {
                info!("Primary page handle disconnected; will reopen on next use");
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.shared.lock().unwrap_or_else(|p| p.into_inner()).is_some()
    }

    pub fn close(&self) {
        if self.shared.lock().unwrap_or_else(|p| p.into_inner()).take().is_some() {
            info!("Primary page handle closed");
        }
    }
}

pub struct PageSession {
    id: u64,
    client: reqwest::Client,
}

impl PageSession {
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl Drop for PageSession {
    fn drop(&mut self) {
        debug!(session = self.id, "Private page session closed");
    }
}

/// Load a page as text, mapping non-success statuses to [`FetchError`].
pub async fn load_page(client: &reqwest::Client, url: &str) -> Result<String, FetchError> {
    let resp = client.get(url).send().await?;
    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            source_name: "primary",
            status: status.as_u16(),
        });
    }
    Ok(resp.text().await?)
}
