//! Request dispatch and retry orchestration.
//!
//! Every outbound call to the backend goes through [`send`], which owns the
//! two recovery paths the legacy server forces on its clients: "you must log
//! in" and "you must select a branch". Callers never write retry logic at
//! the call site — they describe the request once and the orchestrator
//! rebuilds and re-dispatches it as needed, within fixed budgets.

use std::error::Error as StdError;
use std::time::Duration;

use log::{debug, warn};
use rand::Rng;
use reqwest::StatusCode;
use serde_json::Value;
use tokio::time::sleep;

use crate::error::{Result, SyncError};

use super::classify::{self, ResponseClass};
use super::session::SessionManager;

/// Backoff schedule for transport-level connection resets. These retries are
/// not counted against the auth-recovery budget.
const RESET_RETRY_DELAYS: [Duration; 4] = [
    Duration::from_millis(500),
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
];
/// Total dispatches allowed per orchestrated call for auth/branch recovery.
const AUTH_ATTEMPTS: u32 = 3;
/// Pre-request jitter for the throttled sub-path.
const THROTTLE_MIN_MS: u64 = 350;
const THROTTLE_MAX_MS: u64 = 1000;

/// Request body in one of the encodings the backend accepts.
#[derive(Debug, Clone)]
pub enum Payload {
    Json(Value),
    Form(Vec<(String, String)>),
}

/// A rebuildable description of one outbound request. Retries construct a
/// fresh HTTP request from this description each time.
#[derive(Debug, Clone)]
pub struct KozaRequest {
    pub endpoint: &'static str,
    pub payload: Payload,
    /// Ask the backend for the full result set in one page.
    pub no_paging: bool,
}

impl KozaRequest {
    pub fn json(endpoint: &'static str, body: Value) -> Self {
        Self { endpoint, payload: Payload::Json(body), no_paging: false }
    }

    pub fn with_no_paging(mut self) -> Self {
        self.no_paging = true;
        self
    }
}

/// Recovery behaviour for one orchestrated call.
#[derive(Debug, Clone, Copy)]
pub struct SendOptions {
    /// Re-authenticate when the body carries a login marker.
    pub reauth: bool,
    /// Re-select the branch when the body carries a branch marker.
    pub reselect_branch: bool,
    /// Allow one forced session refresh when the body is HTML.
    pub refresh_on_html: bool,
    /// Serialize and jitter-delay the request (customer sub-path). Throttled
    /// calls never recover in place: the throttle lock must not be held
    /// while the login or branch lock is taken.
    pub throttle: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            reauth: true,
            reselect_branch: true,
            refresh_on_html: true,
            throttle: false,
        }
    }
}

impl SendOptions {
    /// Reset retries only. Used by the session manager's own calls (login,
    /// branch listing, warm-up) to avoid recovery re-entering its locks.
    pub fn recovery_disabled() -> Self {
        Self {
            reauth: false,
            reselect_branch: false,
            refresh_on_html: false,
            throttle: false,
        }
    }

    pub fn throttled() -> Self {
        Self { throttle: true, ..Self::recovery_disabled() }
    }
}

/// Final classified response of one orchestrated call.
#[derive(Debug, Clone)]
pub struct KozaResponse {
    pub status: StatusCode,
    pub body: String,
    pub class: ResponseClass,
    /// Total dispatches performed, including reset and recovery retries.
    pub attempts: u32,
}

impl KozaResponse {
    pub fn is_success(&self) -> bool {
        self.class == ResponseClass::Success
    }

    pub fn json(&self) -> Result<Value> {
        serde_json::from_str(&self.body).map_err(Into::into)
    }

    /// Short body excerpt for error messages.
    pub fn snippet(&self) -> String {
        self.body.chars().take(200).collect()
    }
}

/// Build and dispatch the request once, returning status and body text.
/// Used directly by the session manager and by the retry loops below.
pub(crate) async fn dispatch(
    session: &SessionManager,
    endpoint: &str,
    payload: &Payload,
    no_paging: bool,
) -> std::result::Result<(StatusCode, String), reqwest::Error> {
    let url = session.endpoint_url(endpoint);
    let mut builder = session.http().post(url);
    if let Some(token) = session.bearer_token() {
        builder = builder.bearer_auth(token);
    }
    if no_paging {
        builder = builder.header("No-Paging", "true");
    }
    builder = match payload {
        Payload::Json(v) => builder.json(v),
        Payload::Form(pairs) => builder.form(pairs),
    };
    let resp = builder.send().await?;
    let status = resp.status();
    let body = resp.text().await?;
    Ok((status, body))
}

/// Execute one request with automatic recovery.
///
/// 1. Optional throttle (lock + jitter) for the customer sub-path.
/// 2. Dispatch with connection-reset/timeout retries over the fixed schedule.
/// 3. Classify the body. Login/branch markers mark the session
///    unauthenticated and drive `ensure_authenticated` +
///    `ensure_branch_selected`, then retry within the attempt budget.
///    An HTML body triggers at most one full session refresh.
/// 4. Return the last response, classified, once recovery is exhausted.
pub async fn send(
    session: &SessionManager,
    req: &KozaRequest,
    opts: SendOptions,
) -> Result<KozaResponse> {
    // Held for the whole throttled call so concurrent customer requests are
    // strictly paced. Recovery is disabled on this path (see SendOptions).
    let _throttle_guard = if opts.throttle {
        let guard = session.throttle_lock.lock().await;
        let jitter = rand::thread_rng().gen_range(THROTTLE_MIN_MS..=THROTTLE_MAX_MS);
        sleep(Duration::from_millis(jitter)).await;
        Some(guard)
    } else {
        None
    };

    let trail = session.trail();
    let mut attempts: u32 = 0;
    let mut auth_retries: u32 = 0;
    let mut refreshed = false;

    loop {
        let (status, body) = dispatch_with_reset_retries(session, req, &mut attempts).await?;
        let class = classify::classify(status, &body);
        trail
            .record(
                &format!("{}#{attempts}", req.endpoint),
                req.endpoint,
                &payload_preview(&req.payload),
                status.as_u16(),
                &body,
            )
            .await;

        match class {
            ResponseClass::Success | ResponseClass::HttpError => {
                return Ok(KozaResponse { status, body, class, attempts });
            }
            ResponseClass::NeedsLogin | ResponseClass::NeedsBranch
                if (opts.reauth || opts.reselect_branch) && auth_retries + 1 < AUTH_ATTEMPTS =>
            {
                auth_retries += 1;
                warn!(
                    "{}: {:?} marker on attempt {attempts}; recovering session and retrying",
                    req.endpoint, class
                );
                session.mark_unauthenticated();
                if opts.reauth {
                    Box::pin(session.ensure_authenticated()).await?;
                }
                if opts.reselect_branch {
                    Box::pin(session.ensure_branch_selected(false)).await;
                }
            }
            ResponseClass::Html if opts.refresh_on_html && !refreshed => {
                refreshed = true;
                warn!("{}: HTML body; forcing full session refresh", req.endpoint);
                session.force_session_refresh().await?;
            }
            _ => {
                debug!("{}: returning {:?} after {attempts} attempt(s)", req.endpoint, class);
                return Ok(KozaResponse { status, body, class, attempts });
            }
        }
    }
}

/// Dispatch with retries on connection resets and timeouts, following the
/// fixed backoff schedule.
async fn dispatch_with_reset_retries(
    session: &SessionManager,
    req: &KozaRequest,
    attempts: &mut u32,
) -> Result<(StatusCode, String)> {
    for (i, delay) in RESET_RETRY_DELAYS
        .iter()
        .map(Some)
        .chain(std::iter::once(None))
        .enumerate()
    {
        *attempts += 1;
        match dispatch(session, req.endpoint, &req.payload, req.no_paging).await {
            Ok(result) => return Ok(result),
            Err(e) if is_transient(&e) => match delay {
                Some(delay) => {
                    warn!(
                        "{}: transient transport failure (attempt {}/{}), retrying in {:?}: {e}",
                        req.endpoint,
                        i + 1,
                        RESET_RETRY_DELAYS.len() + 1,
                        delay
                    );
                    sleep(*delay).await;
                }
                None => return Err(SyncError::Transient(e.to_string())),
            },
            Err(e) => return Err(e.into()),
        }
    }
    unreachable!("reset retry loop always returns")
}

/// Connection resets and timeouts are recoverable; anything else is not.
/// Resets hide at varying depths of the error source chain depending on the
/// TLS/IO stack, so the whole chain is walked.
fn is_transient(err: &reqwest::Error) -> bool {
    if err.is_timeout() || err.is_connect() {
        return true;
    }
    let mut source: Option<&(dyn StdError + 'static)> = err.source();
    while let Some(inner) = source {
        if let Some(io) = inner.downcast_ref::<std::io::Error>() {
            if io.kind() == std::io::ErrorKind::ConnectionReset {
                return true;
            }
        }
        let text = inner.to_string().to_lowercase();
        if text.contains("connection reset") || text.contains("reset by peer") {
            return true;
        }
        source = inner.source();
    }
    false
}

fn payload_preview(payload: &Payload) -> String {
    match payload {
        Payload::Json(v) => v.to_string(),
        Payload::Form(pairs) => pairs
            .iter()
            .map(|(k, v)| format!("{k}={v}"))
            .collect::<Vec<_>>()
            .join("&"),
    }
}
