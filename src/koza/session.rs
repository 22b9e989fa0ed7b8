//! Session lifecycle management for the Koza backend.
//!
//! One `SessionManager` owns the authentication state for one backend
//! connection. Many transient callers share it concurrently; the manager
//! guarantees that `ensure_authenticated` returns only once a usable session
//! exists and that at most one login flow runs system-wide at any time.
//!
//! State machine: Unauthenticated → Authenticating → Authenticated(no branch)
//! → Ready. Any response classified as session-expired degrades the state
//! back to Unauthenticated; the transport layer then drives recovery.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::Mutex as AsyncMutex;
use url::Url;

use crate::config::Config;
use crate::error::{Result, SyncError};

use super::classify::{self, ResponseClass};
use super::endpoints;
use super::jar::{jar_key, CookieJarStore};
use super::trail::Trail;
use super::transport::{dispatch, send, KozaRequest, Payload, SendOptions};
use super::types::{listing_items, warmup_filter, Branch};

/// Assumed lifetime of a freshly observed session cookie.
const SESSION_TTL_MINUTES: i64 = 20;
/// Window after a successful login during which concurrent callers skip
/// their own attempt. Suppresses authentication storms from transient callers.
const AUTH_COOLDOWN_SECS: i64 = 10;
const BROWSER_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 \
                          (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

// ── Session state ─────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct SessionState {
    authenticated: bool,
    branch_selected: bool,
    /// JSESSIONID value in cookie mode, bearer token in token mode.
    session_token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    last_auth_at: Option<DateTime<Utc>>,
}

impl SessionState {
    fn usable(&self) -> bool {
        self.authenticated
            && self
                .expires_at
                .map(|exp| Utc::now() < exp)
                .unwrap_or(true)
    }
}

/// Transport binding: the cookie-aware HTTP client and the jar it is bound to.
/// Rebuilt from scratch by [`SessionManager::force_session_refresh`].
struct Bound {
    http: Client,
    jar: Arc<Jar>,
}

// ── Headless login fallback ───────────────────────────────────────────────────

/// External helper that mints an initial session token via full browser
/// automation when scripted login fails. The helper command must print the
/// raw token (JSESSIONID value) as its first stdout line.
#[derive(Debug, Clone)]
pub struct HeadlessLogin {
    command: String,
}

impl HeadlessLogin {
    pub fn new(command: impl Into<String>) -> Self {
        Self { command: command.into() }
    }

    pub async fn fresh_session_token(&self) -> Result<String> {
        info!("headless login: invoking {}", self.command);
        let mut parts = self.command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| SyncError::Authentication("empty headless_helper command".into()))?;
        let output = tokio::process::Command::new(program)
            .args(parts)
            .output()
            .await?;
        if !output.status.success() {
            return Err(SyncError::Authentication(format!(
                "headless helper exited with {}",
                output.status
            )));
        }
        let token = String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or("")
            .trim()
            .to_string();
        if token.is_empty() {
            return Err(SyncError::Authentication(
                "headless helper produced no session token".into(),
            ));
        }
        Ok(token)
    }
}

// ── Session manager ───────────────────────────────────────────────────────────

pub struct SessionManager {
    cfg: Arc<Config>,
    base_url: Url,
    store_key: String,
    store: Arc<CookieJarStore>,
    bound: Mutex<Bound>,
    state: Mutex<SessionState>,
    /// At most one login attempt system-wide.
    login_lock: AsyncMutex<()>,
    /// Serializes branch changes, independent of the login lock.
    branch_lock: AsyncMutex<()>,
    /// Paces the high-traffic customer sub-path. Owned here so every lock
    /// of this backend connection lives in one place.
    pub(crate) throttle_lock: AsyncMutex<()>,
    headless: Option<HeadlessLogin>,
    trail: Arc<Trail>,
}

impl SessionManager {
    pub fn new(cfg: Arc<Config>, store: Arc<CookieJarStore>) -> Result<Self> {
        let base_url = Url::parse(&format!("{}/", cfg.koza_base_url.trim_end_matches('/')))?;
        let store_key = jar_key(&cfg.koza_base_url);
        let jar = store.get_or_create(&store_key);
        let http = build_client(&cfg, Arc::clone(&jar))?;
        let trail_path = if cfg.trail_file.is_empty() {
            None
        } else {
            Some(cfg.trail_file.clone().into())
        };
        let headless = if cfg.use_headless_auth {
            Some(HeadlessLogin::new(cfg.headless_helper.clone()))
        } else {
            None
        };
        Ok(Self {
            cfg,
            base_url,
            store_key,
            store,
            bound: Mutex::new(Bound { http, jar }),
            state: Mutex::new(SessionState::default()),
            login_lock: AsyncMutex::new(()),
            branch_lock: AsyncMutex::new(()),
            throttle_lock: AsyncMutex::new(()),
            headless,
            trail: Arc::new(Trail::new(trail_path)),
        })
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn trail(&self) -> Arc<Trail> {
        Arc::clone(&self.trail)
    }

    /// Current cookie-aware client. Fetched per request because a hard
    /// session refresh swaps the binding underneath running callers.
    pub fn http(&self) -> Client {
        self.bound.lock().unwrap().http.clone()
    }

    pub fn endpoint_url(&self, endpoint: &str) -> Url {
        // Endpoints are fixed relative paths; join cannot fail on them.
        self.base_url.join(endpoint).unwrap_or_else(|_| self.base_url.clone())
    }

    /// Bearer token for token-auth mode, if one is held.
    pub fn bearer_token(&self) -> Option<String> {
        if !self.cfg.use_token_auth {
            return None;
        }
        self.state.lock().unwrap().session_token.clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.state.lock().unwrap().usable()
    }

    pub fn is_branch_selected(&self) -> bool {
        self.state.lock().unwrap().branch_selected
    }

    /// Degrade to Unauthenticated. Called by the transport layer whenever a
    /// response carries a session-expiry marker.
    pub fn mark_unauthenticated(&self) {
        let mut st = self.state.lock().unwrap();
        st.authenticated = false;
        st.branch_selected = false;
    }

    // ── Authentication ────────────────────────────────────────────────────────

    /// Return once a valid, usable session exists. Idempotent and re-entrant:
    /// concurrent callers either take a fast path or wait on the single
    /// system-wide login lock.
    pub async fn ensure_authenticated(&self) -> Result<()> {
        if self.cfg.use_token_auth {
            return self.ensure_token().await;
        }

        // Fast path: local state still valid.
        if self.state.lock().unwrap().usable() {
            return Ok(());
        }
        // Fast path: another instance already deposited a live cookie in the
        // shared jar — adopt it instead of logging in again.
        if self.adopt_jar_session() {
            return Ok(());
        }
        // Cooldown: a login completed moments ago; assume it is valid.
        if self.recently_authenticated() {
            debug!("recent Koza authentication succeeded; skipping redundant login");
            return Ok(());
        }

        let login_ran = {
            let _guard = self.login_lock.lock().await;
            // Re-check after acquiring the lock: another caller may have
            // finished the login while we waited.
            if self.state.lock().unwrap().usable() || self.adopt_jar_session() {
                false
            } else {
                info!("=== starting Koza authentication (guarded) ===");
                self.run_login_strategies().await?;
                true
            }
        };

        if login_ran {
            // Wake the backend's request routing before the first functional
            // call. Non-fatal: a failed warm-up only costs one extra retry.
            self.warm_up().await;
        }
        Ok(())
    }

    /// Token-auth mode: obtain/refresh a bearer token.
    async fn ensure_token(&self) -> Result<()> {
        if self.state.lock().unwrap().usable() {
            return Ok(());
        }
        let _guard = self.login_lock.lock().await;
        if self.state.lock().unwrap().usable() {
            return Ok(());
        }
        let payload = Payload::Json(json!({
            "orgCode": self.cfg.koza_member_number,
            "userName": self.cfg.koza_username,
            "userPassword": self.cfg.koza_password,
        }));
        let (status, body) = dispatch(self, endpoints::TOKEN_AUTH, &payload, false)
            .await
            .map_err(|e| SyncError::Authentication(format!("token request failed: {e}")))?;
        self.trail
            .record("AUTH_TOKEN", endpoints::TOKEN_AUTH, "(credentials)", status.as_u16(), &body)
            .await;
        if !status.is_success() {
            return Err(SyncError::Authentication(format!(
                "token endpoint returned HTTP {status}"
            )));
        }
        let parsed: Value = serde_json::from_str(&body)
            .map_err(|e| SyncError::Authentication(format!("unparseable token response: {e}")))?;
        let token = parsed
            .get("token")
            .or_else(|| parsed.get("accessToken"))
            .and_then(Value::as_str)
            .ok_or_else(|| SyncError::Authentication("token response without token".into()))?;
        let ttl_secs = parsed
            .get("expiresIn")
            .or_else(|| parsed.get("expires_in"))
            .and_then(Value::as_i64)
            .unwrap_or(3600);

        let mut st = self.state.lock().unwrap();
        st.authenticated = true;
        st.session_token = Some(token.to_string());
        st.expires_at = Some(Utc::now() + chrono::Duration::seconds(ttl_secs.max(60) - 30));
        st.last_auth_at = Some(Utc::now());
        info!("=== Koza authentication complete (token) ===");
        Ok(())
    }

    /// Try the configured strategies in order: manual cookie, headless
    /// helper, scripted login variants. Exhausting all of them is fatal.
    async fn run_login_strategies(&self) -> Result<()> {
        if let Some(manual) = self.cfg.manual_cookie() {
            let value = manual.strip_prefix("JSESSIONID=").unwrap_or(manual);
            self.install_session_cookie(value);
            info!("=== Koza authentication complete (manual cookie) ===");
            return Ok(());
        }

        if let Some(headless) = &self.headless {
            match headless.fresh_session_token().await {
                Ok(token) => {
                    self.install_session_cookie(&token);
                    info!("=== Koza authentication complete (headless) ===");
                    return Ok(());
                }
                Err(e) => {
                    warn!("headless login failed; falling back to scripted login: {e}");
                }
            }
        }

        self.scripted_login().await
    }

    /// Scripted login: prime the login page, then try each payload variant
    /// until one yields a session cookie or a success-marker body.
    async fn scripted_login(&self) -> Result<()> {
        let login_url = self.endpoint_url(endpoints::LOGIN);
        // Initial GET primes the container session; failures are non-fatal.
        if let Err(e) = self.http().get(login_url.clone()).send().await {
            debug!("initial GET to login page failed (non-fatal): {e}");
        }

        let mut last_body = String::new();
        for (desc, payload) in self.login_variants() {
            match dispatch(self, endpoints::LOGIN, &payload, false).await {
                Ok((status, body)) => {
                    debug!("login attempt {desc}: HTTP {status}");
                    self.trail
                        .record(&format!("AUTH_LOGIN:{desc}"), endpoints::LOGIN, "(credentials)", status.as_u16(), &body)
                        .await;

                    if let Some(cookie) = self.jsession_from_jar() {
                        self.mark_authenticated(Some(cookie));
                        info!("=== Koza authentication complete ({desc}) ===");
                        return Ok(());
                    }
                    if status.is_success() && classify::is_login_success(&body) {
                        self.mark_authenticated(self.jsession_from_jar());
                        info!("=== Koza authentication complete (body marker, {desc}) ===");
                        return Ok(());
                    }
                    last_body = body;
                }
                Err(e) => {
                    warn!("login attempt {desc} failed: {e}");
                }
            }
        }

        self.mark_unauthenticated();
        Err(SyncError::Authentication(format!(
            "all login variants exhausted; last response: {}",
            &last_body.chars().take(200).collect::<String>()
        )))
    }

    fn login_variants(&self) -> Vec<(&'static str, Payload)> {
        let member = self.cfg.koza_member_number.clone();
        let user = self.cfg.koza_username.clone();
        let pass = self.cfg.koza_password.clone();
        vec![
            (
                "JSON:orgCode_userName_userPassword",
                Payload::Json(json!({
                    "orgCode": member.clone(),
                    "userName": user.clone(),
                    "userPassword": pass.clone(),
                })),
            ),
            (
                "FORM:orgCode_user_girisForm.userPassword",
                Payload::Form(vec![
                    ("orgCode".into(), member.clone()),
                    ("user".into(), user.clone()),
                    ("girisForm.userPassword".into(), pass.clone()),
                    ("girisForm.captchaInput".into(), String::new()),
                ]),
            ),
            (
                "FORM:orgCode_userName_userPassword",
                Payload::Form(vec![
                    ("orgCode".into(), member),
                    ("userName".into(), user),
                    ("userPassword".into(), pass),
                ]),
            ),
        ]
    }

    /// Idle listing call after login. Without it the backend's routing layer
    /// rejects the next functional call with an internal instantiation error.
    async fn warm_up(&self) {
        let req = KozaRequest::json(endpoints::LIST_STOCK_CARDS, warmup_filter());
        match send(self, &req, SendOptions::recovery_disabled()).await {
            Ok(resp) => {
                let trimmed = resp.body.trim_start();
                if trimmed.starts_with('{') || trimmed.starts_with('[') {
                    debug!("session warm-up OK (HTTP {})", resp.status);
                } else {
                    warn!("session warm-up returned non-JSON (HTTP {}); continuing", resp.status);
                }
            }
            Err(e) => warn!("session warm-up failed; continuing: {e}"),
        }
    }

    // ── Branch selection ──────────────────────────────────────────────────────

    /// Ensure a branch is active for the current session. Non-fatal on
    /// failure: the caller proceeds and operation-level retries repair the
    /// session later. Returns whether a branch is believed selected.
    pub async fn ensure_branch_selected(&self, force: bool) -> bool {
        if self.cfg.use_token_auth {
            // The token API carries branch scope in the token itself.
            return true;
        }
        {
            let st = self.state.lock().unwrap();
            if !force && st.branch_selected && st.authenticated {
                return true;
            }
        }

        // Two rounds: a login-marker seen during selection bubbles out here
        // so re-authentication never runs while the branch lock is held.
        for round in 0..2 {
            match self.branch_selection_round(force).await {
                SelectionOutcome::Selected => return true,
                SelectionOutcome::Failed => {
                    warn!("branch selection failed; proceeding with current session");
                    return false;
                }
                SelectionOutcome::NeedsReauth => {
                    self.mark_unauthenticated();
                    if round == 1 {
                        return false;
                    }
                    if let Err(e) = self.ensure_authenticated().await {
                        warn!("re-auth during branch selection failed: {e}");
                        return false;
                    }
                }
            }
        }
        false
    }

    async fn branch_selection_round(&self, force: bool) -> SelectionOutcome {
        let _guard = self.branch_lock.lock().await;
        {
            let st = self.state.lock().unwrap();
            if !force && st.branch_selected && st.authenticated {
                return SelectionOutcome::Selected;
            }
        }

        let branches = self.list_branches().await;
        let preferred = self.cfg.forced_branch_id.or(self.cfg.default_branch_id);

        if branches.is_empty() {
            warn!("branch list is empty; attempting manual-cookie fallback");
            if self.manual_cookie_branch_fallback().await {
                return self.branch_selection_completed();
            }
            if let Some(id) = preferred {
                warn!("branch list empty; attempting direct change to configured branch {id}");
                return match self.change_branch(id).await {
                    ChangeOutcome::Changed => self.branch_selection_completed(),
                    ChangeOutcome::NeedsReauth => SelectionOutcome::NeedsReauth,
                    ChangeOutcome::Failed => SelectionOutcome::Failed,
                };
            }
            return SelectionOutcome::Failed;
        }

        let ids: Vec<i64> = branches.iter().filter_map(|b| b.id).collect();
        info!("available branches: {} -> {:?}", ids.len(), ids);

        let target = match preferred {
            Some(id) if ids.contains(&id) => Some(id),
            Some(id) => {
                warn!("preferred branch {id} not in branch list; attempting it anyway");
                match self.change_branch(id).await {
                    ChangeOutcome::Changed => return self.branch_selection_completed(),
                    ChangeOutcome::NeedsReauth => return SelectionOutcome::NeedsReauth,
                    ChangeOutcome::Failed => ids.first().copied(),
                }
            }
            None => ids.first().copied(),
        };

        match target {
            Some(id) => match self.change_branch(id).await {
                ChangeOutcome::Changed => self.branch_selection_completed(),
                ChangeOutcome::NeedsReauth => SelectionOutcome::NeedsReauth,
                ChangeOutcome::Failed => SelectionOutcome::Failed,
            },
            None => SelectionOutcome::Failed,
        }
    }

    fn branch_selection_completed(&self) -> SelectionOutcome {
        self.state.lock().unwrap().branch_selected = true;
        SelectionOutcome::Selected
    }

    async fn list_branches(&self) -> Vec<Branch> {
        // Through the orchestrator for reset retries, but with recovery
        // disabled: the branch lock is held here and must never be re-entered.
        let req = KozaRequest::json(endpoints::BRANCHES, json!({}));
        let resp = match send(self, &req, SendOptions::recovery_disabled()).await {
            Ok(r) => r,
            Err(e) => {
                warn!("failed to read branch list: {e}");
                return Vec::new();
            }
        };
        let parsed: Value = match serde_json::from_str(&resp.body) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };
        listing_items(&parsed)
            .into_iter()
            .filter_map(|item| serde_json::from_value(item.clone()).ok())
            .collect()
    }

    /// Manual-cookie fallback for an empty branch list: install the operator
    /// cookie and push the configured branch directly.
    async fn manual_cookie_branch_fallback(&self) -> bool {
        let manual = match self.cfg.manual_cookie() {
            Some(m) => m.to_string(),
            None => return false,
        };
        let value = manual.strip_prefix("JSESSIONID=").unwrap_or(&manual);
        self.install_session_cookie(value);
        match self.cfg.forced_branch_id.or(self.cfg.default_branch_id) {
            Some(id) => matches!(self.change_branch(id).await, ChangeOutcome::Changed),
            None => false,
        }
    }

    /// Apply one branch change, trying the ordered payload encodings until
    /// one is accepted. Encodings differ across backend deployments.
    async fn change_branch(&self, branch_id: i64) -> ChangeOutcome {
        let attempts: Vec<(&'static str, Payload)> = vec![
            ("JSON:orgSirketSubeId", Payload::Json(json!({ "orgSirketSubeId": branch_id }))),
            (
                "FORM:orgSirketSubeId",
                Payload::Form(vec![("orgSirketSubeId".into(), branch_id.to_string())]),
            ),
            ("JSON:orgSirketSubeID", Payload::Json(json!({ "orgSirketSubeID": branch_id }))),
            (
                "FORM:orgSirketSubeID",
                Payload::Form(vec![("orgSirketSubeID".into(), branch_id.to_string())]),
            ),
            ("JSON:id", Payload::Json(json!({ "id": branch_id }))),
        ];

        for (desc, payload) in attempts {
            let req = KozaRequest { endpoint: endpoints::CHANGE_BRANCH, payload, no_paging: false };
            let resp = match send(self, &req, SendOptions::recovery_disabled()).await {
                Ok(r) => r,
                Err(e) => {
                    warn!("branch change attempt {desc} failed: {e}");
                    continue;
                }
            };
            let (status, body) = (resp.status, resp.body);

            match classify::classify(status, &body) {
                ResponseClass::NeedsLogin => {
                    warn!("branch change {desc} reports invalid session");
                    return ChangeOutcome::NeedsReauth;
                }
                ResponseClass::Success => {
                    // code==0 or a body without a code field both count.
                    let accepted = serde_json::from_str::<Value>(&body)
                        .ok()
                        .and_then(|v| v.get("code").and_then(Value::as_i64))
                        .map(|code| code == 0)
                        .unwrap_or(true);
                    if accepted {
                        info!("branch change to {branch_id} succeeded using {desc}");
                        return ChangeOutcome::Changed;
                    }
                    warn!("branch change {desc} returned a non-zero code");
                }
                other => {
                    warn!("branch change {desc} returned {other:?} (HTTP {status})");
                }
            }
        }
        warn!("all branch change encodings finished without success for {branch_id}");
        ChangeOutcome::Failed
    }

    // ── Hard refresh ──────────────────────────────────────────────────────────

    /// Tear down all local and shared cookie state, rebuild the transport
    /// binding, and re-run the full authentication + branch selection flow.
    /// Used only when a response is unambiguously HTML after normal retries.
    pub async fn force_session_refresh(&self) -> Result<()> {
        warn!("forcing full Koza session refresh (state + cookies + client)");
        *self.state.lock().unwrap() = SessionState::default();

        let jar = self.store.reset(&self.store_key);
        let http = build_client(&self.cfg, Arc::clone(&jar))?;
        *self.bound.lock().unwrap() = Bound { http, jar };

        Box::pin(self.ensure_authenticated()).await?;
        Box::pin(self.ensure_branch_selected(true)).await;
        Ok(())
    }

    // ── Cookie helpers ────────────────────────────────────────────────────────

    /// Read the JSESSIONID deposited in the shared jar, if any.
    fn jsession_from_jar(&self) -> Option<String> {
        let bound = self.bound.lock().unwrap();
        let header = bound.jar.cookies(&self.base_url)?;
        let text = header.to_str().ok()?;
        text.split(';').map(str::trim).find_map(|kv| {
            kv.strip_prefix("JSESSIONID=").map(str::to_string)
        })
    }

    /// Adopt a session another instance left in the shared jar.
    fn adopt_jar_session(&self) -> bool {
        let cookie = match self.jsession_from_jar() {
            Some(c) => c,
            None => return false,
        };
        debug!("reusing JSESSIONID from shared cookie jar; skipping login flow");
        let mut st = self.state.lock().unwrap();
        st.authenticated = true;
        st.session_token = Some(cookie);
        if st.expires_at.is_none() {
            st.expires_at = Some(Utc::now() + chrono::Duration::minutes(SESSION_TTL_MINUTES));
        }
        if st.last_auth_at.is_none() {
            st.last_auth_at = Some(Utc::now());
        }
        true
    }

    fn recently_authenticated(&self) -> bool {
        self.state
            .lock()
            .unwrap()
            .last_auth_at
            .map(|t| Utc::now() - t < chrono::Duration::seconds(AUTH_COOLDOWN_SECS))
            .unwrap_or(false)
    }

    fn install_session_cookie(&self, value: &str) {
        let bound = self.bound.lock().unwrap();
        bound
            .jar
            .add_cookie_str(&format!("JSESSIONID={value}; Path=/"), &self.base_url);
        drop(bound);
        self.mark_authenticated(Some(value.to_string()));
    }

    fn mark_authenticated(&self, token: Option<String>) {
        let mut st = self.state.lock().unwrap();
        st.authenticated = true;
        st.session_token = token;
        st.expires_at = Some(Utc::now() + chrono::Duration::minutes(SESSION_TTL_MINUTES));
        st.last_auth_at = Some(Utc::now());
    }
}

enum SelectionOutcome {
    Selected,
    NeedsReauth,
    Failed,
}

enum ChangeOutcome {
    Changed,
    NeedsReauth,
    Failed,
}

/// Build the cookie-aware HTTP client bound to `jar`.
///
/// HTTP/1.1 only — the backend behaves unreliably under HTTP/2 negotiation.
/// Certificate validation is disabled to match the legacy deployments that
/// serve self-signed certificates.
fn build_client(cfg: &Config, jar: Arc<Jar>) -> Result<Client> {
    Client::builder()
        .http1_only()
        .cookie_provider(jar)
        .danger_accept_invalid_certs(true)
        .timeout(Duration::from_secs(cfg.timeout_secs))
        .user_agent(BROWSER_UA)
        .build()
        .map_err(SyncError::Http)
}
