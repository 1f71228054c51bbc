//! HTTP request handling: validation, normalization and response mapping

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{RawQuery, State};
use axum::http::{header, Method, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use log::{debug, error, info, warn};
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::{Error, RenderRequest, Screenshotter, Viewport, PNG_MIME};

pub const DEFAULT_WIDTH: u32 = 640;
pub const DEFAULT_HEIGHT: u32 = 480;
/// Longest post-load delay a client may ask for, in milliseconds
pub const MAX_DELAY_MS: u64 = 10_000;

const LANDING_PAGE: &str = include_str!("../templates/index.html");
const REDACTED_MESSAGE: &str = "screenshot failed";

/// Shared state injected into every request
#[derive(Clone)]
pub struct AppState {
    screenshotter: Arc<dyn Screenshotter>,
    renders: CancellationToken,
    request_timeout: Duration,
    redact_errors: bool,
}

impl AppState {
    /// State with a 40 second request deadline and unredacted errors.
    pub fn new(screenshotter: Arc<dyn Screenshotter>) -> Self {
        Self {
            screenshotter,
            renders: CancellationToken::new(),
            request_timeout: Duration::from_secs(40),
            redact_errors: false,
        }
    }

    /// Parent token of every in-flight render; cancelling it aborts them all.
    pub fn with_renders(mut self, renders: CancellationToken) -> Self {
        self.renders = renders;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_redacted_errors(mut self, redact: bool) -> Self {
        self.redact_errors = redact;
        self
    }
}

/// Build the single-endpoint router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", any(screenshot))
        .fallback(not_found)
        .with_state(state)
}

async fn not_found() -> Response {
    plain(StatusCode::NOT_FOUND, "404 page not found")
}

async fn screenshot(State(state): State<AppState>, method: Method, RawQuery(query): RawQuery) -> Response {
    if method != Method::GET {
        return plain(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    let params = QueryParams::parse(query.as_deref().unwrap_or_default());
    let raw_url = match params.url.as_deref() {
        Some(raw) if !raw.is_empty() => raw,
        _ => return Html(LANDING_PAGE).into_response(),
    };

    let url = match normalize_url(raw_url) {
        Ok(url) => url,
        Err(e) => {
            debug!("rejecting {}: {}", raw_url, e);
            return plain(StatusCode::BAD_REQUEST, "only http and https URLs are allowed");
        }
    };

    let request = RenderRequest {
        url,
        viewport: Viewport {
            width: dimension(params.width.as_deref(), DEFAULT_WIDTH),
            height: dimension(params.height.as_deref(), DEFAULT_HEIGHT),
        },
        delay: Duration::from_millis(params.delay_ms()),
    };

    info!(
        "screenshot url={} width={} height={} delay={}",
        request.url,
        request.viewport.width,
        request.viewport.height,
        request.delay.as_millis()
    );

    // Cancelled when this future is dropped, i.e. when the client goes away.
    let cancel = state.renders.child_token();
    let _guard = cancel.clone().drop_guard();

    let outcome = tokio::select! {
        res = state.screenshotter.capture(&request, &cancel) => res,
        _ = tokio::time::sleep(state.request_timeout) => {
            cancel.cancel();
            Err(Error::Timeout(state.request_timeout.as_millis() as u64))
        }
    };

    match outcome {
        Ok(png) => (
            [
                (header::CONTENT_TYPE, PNG_MIME.to_string()),
                (header::CONTENT_LENGTH, png.len().to_string()),
            ],
            png,
        )
            .into_response(),
        Err(e) => {
            if e.is_cancelled() {
                warn!("screenshot of {} abandoned: {}", request.url, e);
            } else {
                error!("screenshot of {} failed: {}", request.url, e);
            }
            let body = if state.redact_errors {
                REDACTED_MESSAGE.to_string()
            } else {
                e.to_string()
            };
            plain(StatusCode::BAD_GATEWAY, body)
        }
    }
}

fn plain(status: StatusCode, body: impl Into<String>) -> Response {
    let mut body = body.into();
    body.push('\n');
    (
        status,
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        body,
    )
        .into_response()
}

/// Query parameters the endpoint understands; the first occurrence of a key wins
#[derive(Debug, Default)]
struct QueryParams {
    url: Option<String>,
    width: Option<String>,
    height: Option<String>,
    delay: Option<String>,
}

impl QueryParams {
    fn parse(query: &str) -> Self {
        let mut params = Self::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let slot = match key.as_ref() {
                "url" => &mut params.url,
                "width" => &mut params.width,
                "height" => &mut params.height,
                "delay" => &mut params.delay,
                _ => continue,
            };
            if slot.is_none() {
                *slot = Some(value.into_owned());
            }
        }
        params
    }

    /// Delay in milliseconds: fallback 0, clamped to `MAX_DELAY_MS`.
    fn delay_ms(&self) -> u64 {
        parse_positive(self.delay.as_deref())
            .map(|v| v.min(MAX_DELAY_MS))
            .unwrap_or(0)
    }
}

/// Pixel size, or `fallback` when the value is unusable.
fn dimension(raw: Option<&str>, fallback: u32) -> u32 {
    parse_positive(raw)
        .and_then(|v| u32::try_from(v).ok())
        .unwrap_or(fallback)
}

/// A strictly positive integer, or `None` for empty, malformed, zero or negative input.
fn parse_positive(raw: Option<&str>) -> Option<u64> {
    raw.and_then(|s| s.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .map(|v| v as u64)
}

/// Prefix `https://` when no scheme is given and accept only http(s).
///
/// The returned string is the input (plus prefix) verbatim, not the
/// re-serialized `Url`.
fn normalize_url(raw: &str) -> Result<String, Error> {
    let candidate = if raw.contains("://") {
        raw.to_string()
    } else {
        format!("https://{}", raw)
    };

    let parsed = Url::parse(&candidate).map_err(|e| Error::InvalidUrl(format!("{}: {}", candidate, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(candidate),
        other => Err(Error::InvalidUrl(format!("scheme {} is not allowed", other))),
    }
}
