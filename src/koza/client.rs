//! Endpoint wrappers for the Koza backend.
//!
//! Thin facade over the session manager and the retry orchestrator: each
//! function describes one backend action and interprets its response shape.
//! No retry logic lives here.

use std::sync::Arc;

use log::{debug, info, warn};
use serde_json::{json, Value};

use crate::error::{Result, SyncError};

use super::classify::{self, Operation, ResponseClass};
use super::endpoints;
use super::session::SessionManager;
use super::transport::{send, KozaRequest, KozaResponse, SendOptions};
use super::types::{
    customer_id, listing_items, parse_stock_item, stock_card_filter, CustomerCreate, Depot,
    StockItem,
};

pub struct KozaClient {
    session: Arc<SessionManager>,
}

impl KozaClient {
    pub fn new(session: Arc<SessionManager>) -> Self {
        Self { session }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    // ── Stock cards ───────────────────────────────────────────────────────────

    /// Full stock-card listing (no pagination). Used to warm the sync cache.
    pub async fn list_stock_cards(&self) -> Result<Vec<StockItem>> {
        self.session.ensure_authenticated().await?;
        let req = KozaRequest::json(endpoints::LIST_STOCK_CARDS, json!({})).with_no_paging();
        let resp = send(&self.session, &req, SendOptions::default()).await?;
        let items = self.parse_listing(&resp, endpoints::LIST_STOCK_CARDS)?;
        let cards: Vec<StockItem> = items.iter().map(parse_stock_item).collect();
        info!("listed {} stock cards from Koza", cards.len());
        Ok(cards)
    }

    /// Exact-code lookup. Returns the remote id when the code exists.
    pub async fn find_stock_card(&self, code: &str) -> Result<Option<i64>> {
        if code.trim().is_empty() {
            return Ok(None);
        }
        self.session.ensure_authenticated().await?;
        self.session.ensure_branch_selected(false).await;

        let req = KozaRequest::json(endpoints::LIST_STOCK_CARDS, stock_card_filter(code));
        let resp = send(&self.session, &req, SendOptions::default()).await?;
        if !resp.is_success() {
            debug!("stock-card lookup for {code} returned {:?}", resp.class);
            return Ok(None);
        }
        let body = resp.json()?;
        for item in listing_items(&body) {
            let parsed = parse_stock_item(item);
            let matches = parsed
                .code
                .as_deref()
                .map(|c| c.trim().eq_ignore_ascii_case(code.trim()))
                .unwrap_or(false);
            if matches {
                if let Some(id) = parsed.skart_id {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    /// Current remote detail for a code, for field-by-field comparison.
    pub async fn stock_card_details(&self, code: &str) -> Result<Option<StockItem>> {
        self.session.ensure_authenticated().await?;
        let req = KozaRequest::json(endpoints::LIST_STOCK_CARDS, stock_card_filter(code));
        let resp = send(&self.session, &req, SendOptions::default()).await?;
        if !resp.is_success() {
            return Ok(None);
        }
        let body = resp.json()?;
        for item in listing_items(&body) {
            let parsed = parse_stock_item(item);
            let matches = parsed
                .code
                .as_deref()
                .map(|c| c.trim().eq_ignore_ascii_case(code.trim()))
                .unwrap_or(false);
            if matches {
                return Ok(Some(parsed));
            }
        }
        Ok(None)
    }

    /// Issue one stock-card create and return the classified response.
    /// Interpretation (duplicate vs failure vs new id) is the caller's job
    /// via [`classify::operation_outcome`].
    pub async fn create_stock_card(&self, payload: Value) -> Result<KozaResponse> {
        self.session.ensure_authenticated().await?;
        self.session.ensure_branch_selected(false).await;
        let req = KozaRequest::json(endpoints::CREATE_STOCK_CARD, payload);
        send(&self.session, &req, SendOptions::default()).await
    }

    // ── Customers ─────────────────────────────────────────────────────────────

    /// Exact-code customer lookup. This is the backend's highest-traffic
    /// path, so it runs throttled (serialized + jittered).
    pub async fn find_customer_by_code(&self, code: &str) -> Result<Option<i64>> {
        if code.trim().is_empty() {
            return Ok(None);
        }
        self.session.ensure_authenticated().await?;
        self.session.ensure_branch_selected(false).await;

        let filter = json!({
            "finMusteri": {
                "gnlFinansalNesne": { "kodBas": code, "kodBit": code, "kodOp": "between" }
            }
        });
        let req = KozaRequest::json(endpoints::LIST_CUSTOMERS, filter);
        let resp = send(&self.session, &req, SendOptions::throttled()).await?;
        if !resp.is_success() {
            debug!("customer lookup for {code} returned {:?}", resp.class);
            return Ok(None);
        }
        let body = resp.json()?;
        for item in listing_items(&body) {
            let matches = item
                .get("kod")
                .and_then(Value::as_str)
                .map(|k| k.trim().eq_ignore_ascii_case(code.trim()))
                .unwrap_or(false);
            if matches {
                if let Some(id) = customer_id(item) {
                    return Ok(Some(id));
                }
            }
        }
        Ok(None)
    }

    /// Create a customer card. Duplicates are classified, not failed.
    pub async fn create_customer(&self, customer: &CustomerCreate) -> Result<Operation> {
        self.session.ensure_authenticated().await?;
        self.session.ensure_branch_selected(false).await;
        let req = KozaRequest::json(endpoints::CREATE_CUSTOMER, serde_json::to_value(customer)?);
        let resp = send(&self.session, &req, SendOptions::throttled()).await?;
        if resp.class != ResponseClass::Success {
            return Err(SyncError::Rejected(format!(
                "customer create returned {:?}: {}",
                resp.class,
                resp.snippet()
            )));
        }
        Ok(classify::operation_outcome(&resp.body))
    }

    // ── Depots ────────────────────────────────────────────────────────────────

    /// Depot listing. Simple single-call wrapper — depots do not participate
    /// in the sync decision machinery.
    pub async fn list_depots(&self) -> Result<Vec<Depot>> {
        self.session.ensure_authenticated().await?;
        let req = KozaRequest::json(endpoints::LIST_DEPOTS, json!({})).with_no_paging();
        let resp = send(&self.session, &req, SendOptions::default()).await?;
        let items = self.parse_listing(&resp, endpoints::LIST_DEPOTS)?;
        Ok(items
            .into_iter()
            .filter_map(|item| serde_json::from_value(item).ok())
            .collect())
    }

    pub async fn create_depot(&self, code: &str, name: &str) -> Result<Operation> {
        self.session.ensure_authenticated().await?;
        self.session.ensure_branch_selected(false).await;
        let req = KozaRequest::json(
            endpoints::CREATE_DEPOT,
            json!({ "stkDepo": { "kod": code, "tanim": name } }),
        );
        let resp = send(&self.session, &req, SendOptions::default()).await?;
        if resp.class != ResponseClass::Success {
            return Err(SyncError::Rejected(format!(
                "depot create returned {:?}: {}",
                resp.class,
                resp.snippet()
            )));
        }
        Ok(classify::operation_outcome(&resp.body))
    }

    // ── Shared ────────────────────────────────────────────────────────────────

    fn parse_listing(&self, resp: &KozaResponse, endpoint: &str) -> Result<Vec<Value>> {
        match resp.class {
            ResponseClass::Success => {}
            ResponseClass::Html => {
                warn!("{endpoint} answered HTML instead of JSON");
                return Err(SyncError::Rejected(format!(
                    "{endpoint}: HTML response (session/branch issue): {}",
                    resp.snippet()
                )));
            }
            other => {
                return Err(SyncError::Rejected(format!(
                    "{endpoint}: {other:?} (HTTP {}): {}",
                    resp.status,
                    resp.snippet()
                )));
            }
        }
        let parsed: Value = serde_json::from_str(&resp.body).map_err(|_| {
            SyncError::Rejected(format!("{endpoint}: unparseable body: {}", resp.snippet()))
        })?;
        if parsed.get("error").and_then(Value::as_bool) == Some(true) {
            let msg = parsed
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("listing error");
            return Err(SyncError::Rejected(format!("{endpoint}: {msg}")));
        }
        Ok(listing_items(&parsed).into_iter().cloned().collect())
    }
}
