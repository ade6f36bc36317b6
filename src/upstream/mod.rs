//! Typed client for the upstream browser-automation backend.
//!
//! The upstream drives the target site from a long-lived browser session and
//! exposes a small JSON-over-HTTP surface. Everything the engine does flows
//! through [`UpstreamApi`]; the pipeline and session manager are written
//! against the trait so tests can substitute a scripted fake.
//!
//! Error classification is the load-bearing part: every response maps into
//! one of the [`UpstreamError`] classes, and those classes drive all retry
//! and session-recovery decisions downstream.

pub mod types;

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use url::Url;

use crate::credentials::UpstreamCredentials;

pub use types::{
    AcquiredSession, BulkExportInfo, BulkImportInfo, BulkInfoResponse, Download, ListingResponse,
    MoveType, ProbeRequest, ProbeResponse, TimelineEntry, TradeKind,
};

/// TCP keep-alive interval for the upstream connection pool.
const TCP_KEEPALIVE: Duration = Duration::from_secs(60);

/// How many body bytes to keep when folding an error response into a message.
const ERROR_SNIPPET_LEN: usize = 200;

/// Classified upstream failure.
///
/// The class decides what the caller does next: `Transient` is retried once
/// at the stage level, `SessionInvalid` triggers explicit session recovery,
/// `AuthInvalid` enters the acquisition backoff loop, `Permanent` fails the
/// job with the upstream's message.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Network timeout, 5xx, or connection reset. Safe to retry.
    #[error("transient upstream failure: {0}")]
    Transient(String),
    /// The upstream no longer accepts the session token.
    #[error("upstream session rejected: {0}")]
    SessionInvalid(String),
    /// Credentials rejected during session acquisition (401).
    #[error("upstream authentication failed: {0}")]
    AuthInvalid(String),
    /// Any other 4xx or a malformed payload. Not retried.
    #[error("upstream rejected the request: {0}")]
    Permanent(String),
}

impl UpstreamError {
    /// True when the stage-level single retry applies.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// True when session recovery applies.
    pub fn is_session_invalid(&self) -> bool {
        matches!(self, Self::SessionInvalid(_))
    }
}

impl From<reqwest::Error> for UpstreamError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            // Missing required fields in an otherwise-OK response.
            Self::Permanent(format!("malformed upstream payload: {e}"))
        } else {
            // Timeouts, connect failures, and mid-body resets.
            Self::Transient(e.to_string())
        }
    }
}

/// Which upstream operation produced a response, for status classification.
///
/// Listing, probe, and spreadsheet downloads are session-authenticated data
/// calls: the upstream surfaces a silently-invalidated session as a plain 400
/// on these, so any 400 there classifies as `SessionInvalid`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Call {
    Acquire,
    Sessions,
    Listing,
    Bulk,
    Probe,
    Download,
}

/// Map a non-success status + body into an [`UpstreamError`].
fn classify_status(call: Call, status: StatusCode, body: &str) -> UpstreamError {
    let snippet: String = body.chars().take(ERROR_SNIPPET_LEN).collect();

    if status.is_server_error() {
        return UpstreamError::Transient(format!("upstream returned {status}: {snippet}"));
    }

    match status.as_u16() {
        401 if call == Call::Acquire => {
            UpstreamError::AuthInvalid(format!("credentials rejected: {snippet}"))
        }
        400 => {
            let session_call = matches!(call, Call::Listing | Call::Probe | Call::Download);
            if session_call || body_suggests_expired_session(body) {
                UpstreamError::SessionInvalid(format!("{status}: {snippet}"))
            } else {
                UpstreamError::Permanent(format!("{status}: {snippet}"))
            }
        }
        _ => UpstreamError::Permanent(format!("{status}: {snippet}")),
    }
}

/// Heuristic for 400 bodies that describe an expired or unknown session.
fn body_suggests_expired_session(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("session")
        && (lower.contains("expire") || lower.contains("invalid") || lower.contains("not found"))
}

/// The upstream operations the engine depends on.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Export the tenant's container list; returns a spreadsheet URL.
    async fn list_containers(&self, session: &str) -> Result<ListingResponse, UpstreamError>;

    /// Export the tenant's appointment list; returns a spreadsheet URL.
    async fn list_appointments(&self, session: &str) -> Result<ListingResponse, UpstreamError>;

    /// One-shot enrichment for a batch of container ids, split by trade kind.
    async fn get_bulk_info(
        &self,
        session: &str,
        import_ids: &[String],
        export_ids: &[String],
    ) -> Result<BulkInfoResponse, UpstreamError>;

    /// Walk the appointment form for one container and report what it offers.
    async fn probe_appointments(
        &self,
        session: &str,
        request: &ProbeRequest,
    ) -> Result<ProbeResponse, UpstreamError>;

    /// Log in (solving captcha upstream-side) or reuse a live session.
    async fn acquire_session(
        &self,
        creds: &UpstreamCredentials,
    ) -> Result<AcquiredSession, UpstreamError>;

    /// Sessions the upstream currently knows for a username.
    async fn list_active_sessions(&self, username: &str) -> Result<Vec<String>, UpstreamError>;

    /// Fetch a URL returned by the upstream with the same session context.
    async fn download(&self, session: &str, url: &str) -> Result<Download, UpstreamError>;
}

/// Production [`UpstreamApi`] over reqwest.
#[derive(Debug, Clone)]
pub struct HttpUpstreamClient {
    http: reqwest::Client,
    base_url: Url,
}

impl HttpUpstreamClient {
    /// Build a client with the uniform upstream timeout and keep-alive.
    ///
    /// The single timeout bounds every call, including multi-minute browser
    /// flows like bulk info, so it is long by default.
    ///
    /// # Errors
    ///
    /// Returns an error when the underlying client cannot be constructed.
    pub fn new(base_url: Url, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(TCP_KEEPALIVE)
            .build()?;
        Ok(Self { http, base_url })
    }

    fn endpoint(&self, path: &str) -> Result<Url, UpstreamError> {
        self.base_url
            .join(path)
            .map_err(|e| UpstreamError::Permanent(format!("bad upstream url {path}: {e}")))
    }

    /// POST a JSON body and decode a JSON response, classifying failures.
    async fn post_json<T: serde::de::DeserializeOwned>(
        &self,
        call: Call,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, UpstreamError> {
        let url = self.endpoint(path)?;
        let resp = self.http.post(url).json(&body).send().await?;
        let resp = Self::check_status(call, resp).await?;
        Ok(resp.json::<T>().await?)
    }

    async fn check_status(
        call: Call,
        resp: reqwest::Response,
    ) -> Result<reqwest::Response, UpstreamError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(classify_status(call, status, &body))
    }
}

/// Envelope for the active-sessions listing.
#[derive(Debug, serde::Deserialize)]
struct SessionsEnvelope {
    #[serde(default)]
    sessions: Vec<String>,
}

#[async_trait]
impl UpstreamApi for HttpUpstreamClient {
    async fn list_containers(&self, session: &str) -> Result<ListingResponse, UpstreamError> {
        self.post_json(
            Call::Listing,
            "get_containers",
            serde_json::json!({ "session_id": session }),
        )
        .await
    }

    async fn list_appointments(&self, session: &str) -> Result<ListingResponse, UpstreamError> {
        self.post_json(
            Call::Listing,
            "get_appointments",
            serde_json::json!({ "session_id": session }),
        )
        .await
    }

    async fn get_bulk_info(
        &self,
        session: &str,
        import_ids: &[String],
        export_ids: &[String],
    ) -> Result<BulkInfoResponse, UpstreamError> {
        self.post_json(
            Call::Bulk,
            "get_info_bulk",
            serde_json::json!({
                "session_id": session,
                "import_container_ids": import_ids,
                "export_booking_ids": export_ids,
            }),
        )
        .await
    }

    async fn probe_appointments(
        &self,
        session: &str,
        request: &ProbeRequest,
    ) -> Result<ProbeResponse, UpstreamError> {
        self.post_json(
            Call::Probe,
            "check_appointments",
            serde_json::json!({
                "session_id": session,
                "trade_type": request.kind.as_str(),
                "terminal": request.terminal,
                "move_type": request.move_type.as_str(),
                "trucking_company": request.trucking_company,
                "identifier": request.identifier,
                "container_id": request.item_id,
                "truck_plate": request.plate,
                "own_chassis": request.own_chassis,
            }),
        )
        .await
    }

    async fn acquire_session(
        &self,
        creds: &UpstreamCredentials,
    ) -> Result<AcquiredSession, UpstreamError> {
        self.post_json(
            Call::Acquire,
            "get_session",
            serde_json::json!({
                "username": creds.username,
                "password": creds.password,
                "captcha_api_key": creds.captcha_api_key,
            }),
        )
        .await
    }

    async fn list_active_sessions(&self, username: &str) -> Result<Vec<String>, UpstreamError> {
        let url = self.endpoint("get_active_sessions")?;
        let resp = self
            .http
            .get(url)
            .query(&[("username", username)])
            .send()
            .await?;
        let resp = Self::check_status(Call::Sessions, resp).await?;
        let envelope: SessionsEnvelope = resp.json().await?;
        Ok(envelope.sessions)
    }

    async fn download(&self, session: &str, url: &str) -> Result<Download, UpstreamError> {
        let parsed = Url::parse(url)
            .map_err(|e| UpstreamError::Permanent(format!("bad download url {url}: {e}")))?;
        let resp = self
            .http
            .get(parsed)
            .header("x-session-id", session)
            .send()
            .await?;
        let resp = Self::check_status(Call::Download, resp).await?;
        let content_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let bytes = resp.bytes().await?;
        Ok(Download {
            bytes: bytes.to_vec(),
            content_type,
        })
    }
}
