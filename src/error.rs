use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Transient failure talking to a quote source. Never leaves the fetcher.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{source_name} answered HTTP {status}")]
    Status { source_name: &'static str, status: u16 },

    #[error("{source_name} returned no usable quotes")]
    Empty { source_name: &'static str },

    #[error("could not parse {source_name} response: {reason}")]
    Parse {
        source_name: &'static str,
        reason: String,
    },
}

impl FetchError {
    /// Transport-level loss of the connection, as opposed to a bad answer.
    pub fn is_disconnect(&self) -> bool {
        match self {
            FetchError::Http(e) => e.is_connect(),
            _ => false,
        }
    }

    pub fn is_retryable_status(&self) -> bool {
        matches!(self, FetchError::Status { status, .. } if *status == 429 || *status >= 500)
    }
}

/// Errors surfaced by the HTTP control and read surface.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("price worker is still starting up")]
    NotReady,

    #[error("{0}")]
    BadRequest(String),

    #[error("store unavailable: {0:#}")]
    Store(#[from] anyhow::Error),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::NotReady => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
