//! Error types for depoy
//!
//! A single error enum covers configuration, upstream, scrape, and store
//! failures. Handler-facing errors implement `IntoResponse` for Axum.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use uuid::Uuid;

/// Main error type for the gateway
#[derive(Error, Debug)]
pub enum Error {
    /// Invalid configuration: unknown operator, duplicate route/backend,
    /// impossible switchover preconditions. Reported to the caller, never
    /// retried.
    #[error("configuration error: {0}")]
    Config(String),

    /// The upstream request never produced an HTTP response. Recorded as
    /// synthetic status 600 and surfaced to the client as 503.
    #[error("upstream transport failure: {reason}")]
    UpstreamTransport { reason: String, timeout: bool },

    /// The route's target distribution is empty (no active backend).
    #[error("no upstream host available")]
    NoActiveBackend,

    /// A metric scrape failed; retried with linear backoff.
    #[error("scrape failed: {0}")]
    Scrape(String),

    /// The requested window in the metric store holds no buckets.
    #[error("no metrics recorded in the requested window")]
    StoreWindowEmpty,

    #[error("backend {0} not found")]
    BackendNotFound(Uuid),

    #[error("route {0} not found")]
    RouteNotFound(String),
}

impl Error {
    /// Wrap a reqwest transport error, preserving whether it was a timeout.
    pub fn upstream(err: &reqwest::Error) -> Self {
        Error::UpstreamTransport {
            reason: err.to_string(),
            timeout: err.is_timeout(),
        }
    }

    /// Status code shown to the downstream client for this error.
    pub fn client_status(&self) -> StatusCode {
        match self {
            Error::UpstreamTransport { .. } | Error::NoActiveBackend => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Error::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Error::BackendNotFound(_) | Error::RouteNotFound(_) | Error::StoreWindowEmpty => {
                StatusCode::NOT_FOUND
            }
            Error::Scrape(_) => StatusCode::BAD_GATEWAY,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = self.client_status();
        let body = match &self {
            Error::UpstreamTransport { .. } | Error::NoActiveBackend => {
                "No Upstream Host Available".to_string()
            }
            other => other.to_string(),
        };
        (status, body).into_response()
    }
}

/// Convenience type alias for Results
pub type Result<T> = std::result::Result<T, Error>;
