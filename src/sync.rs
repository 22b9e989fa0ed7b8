//! Stock-record synchronization coordinator.
//!
//! Given a batch of candidate records keyed by business code, create exactly
//! the ones that do not already exist unchanged on the backend — never a
//! true duplicate — even though the backend offers no update operation and
//! no existence check beyond a full listing.
//!
//! The code→id cache is a snapshot, not authoritative: it is rebuilt from a
//! full listing before each run and every cache miss is re-checked live
//! before a create is allowed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::error::{Result, SyncError};
use crate::koza::classify::{operation_outcome, Operation, ResponseClass};
use crate::koza::client::KozaClient;
use crate::koza::types::{create_stock_card_payload, StockCardCandidate, StockItem};

/// Versioned codes probe up to this suffix before falling back to a
/// timestamp suffix.
const MAX_VERSION: u32 = 10;

// ── Report ────────────────────────────────────────────────────────────────────

/// Aggregate outcome of one sync run. Skips and duplicates are healthy
/// outcomes; only hard failures count against success.
#[derive(Debug, Default, Clone)]
pub struct SyncReport {
    pub processed: usize,
    pub created: usize,
    pub skipped: usize,
    pub duplicates: usize,
    pub failed: usize,
    /// Create dispatches actually sent, including orchestrated retries.
    pub sent_attempts: u32,
    pub errors: Vec<String>,
    pub duration: Duration,
    pub message: String,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

// ── Coordinator ───────────────────────────────────────────────────────────────

pub struct SyncCoordinator {
    koza: Arc<KozaClient>,
    cache: Mutex<HashMap<String, i64>>,
    shutdown: Arc<AtomicBool>,
}

enum CardOutcome {
    Created { attempts: u32 },
    SkippedUnchanged,
    Duplicate { attempts: u32 },
    Failed { message: String, attempts: u32 },
}

impl SyncCoordinator {
    pub fn new(koza: Arc<KozaClient>, shutdown: Arc<AtomicBool>) -> Self {
        Self {
            koza,
            cache: Mutex::new(HashMap::new()),
            shutdown,
        }
    }

    fn cancelled(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    /// Synchronize a batch of candidate stock cards.
    ///
    /// Fatal errors (authentication exhausted, cache integrity) abort the
    /// whole run; per-record failures are recorded and the run continues.
    pub async fn sync_stock_cards(&self, cards: &[StockCardCandidate]) -> Result<SyncReport> {
        let start = Instant::now();
        let mut report = SyncReport {
            processed: cards.len(),
            ..SyncReport::default()
        };
        if self.cancelled() {
            info!("sync cancelled before start");
            return Ok(finish(report, start));
        }

        let session = self.koza.session();
        session.ensure_authenticated().await?;
        session.ensure_branch_selected(false).await;

        let warmed = match self.warm_cache().await {
            Ok(n) => n,
            // A listing torn down by cancellation is not a cache-integrity
            // problem; finish with an empty result so the caller keeps the
            // choice to continue or abort.
            Err(_) if self.cancelled() => {
                info!("sync cancelled during cache warm-up");
                return Ok(finish(report, start));
            }
            Err(e) => return Err(e),
        };
        info!("stock-card cache warmed: {warmed} entries");

        let cfg = session.config();
        let batch_size = cfg.batch_size.max(1);
        let create_delay = Duration::from_millis(cfg.create_delay_ms);
        let batch_delay = Duration::from_millis(cfg.batch_delay_ms);
        let batches = cards.chunks(batch_size).collect::<Vec<_>>();
        let total_batches = batches.len();

        for (batch_no, batch) in batches.into_iter().enumerate() {
            info!(
                "processing batch {}/{} ({} cards)",
                batch_no + 1,
                total_batches,
                batch.len()
            );
            for card in batch {
                if self.cancelled() {
                    info!("sync cancelled; stopping after {} records", report.created + report.skipped + report.duplicates + report.failed);
                    return Ok(finish(report, start));
                }
                match self.process_card(card).await {
                    Ok(CardOutcome::Created { attempts }) => {
                        report.created += 1;
                        report.sent_attempts += attempts;
                    }
                    Ok(CardOutcome::SkippedUnchanged) => {
                        report.skipped += 1;
                    }
                    Ok(CardOutcome::Duplicate { attempts }) => {
                        report.duplicates += 1;
                        report.sent_attempts += attempts;
                    }
                    Ok(CardOutcome::Failed { message, attempts }) => {
                        report.failed += 1;
                        report.sent_attempts += attempts;
                        error!("stock card {} failed: {message}", card.code);
                        report.errors.push(format!("{}: {message}", card.code));
                    }
                    // Exhausted authentication cannot self-heal; abort the run.
                    Err(e @ SyncError::Authentication(_)) => return Err(e),
                    Err(e) => {
                        report.failed += 1;
                        error!("stock card {} errored: {e}", card.code);
                        report.errors.push(format!("{}: {e}", card.code));
                    }
                }
                tokio::time::sleep(create_delay).await;
            }
            if batch_no + 1 < total_batches {
                debug!("batch {}/{} done; pausing before next", batch_no + 1, total_batches);
                tokio::time::sleep(batch_delay).await;
            }
        }

        Ok(finish(report, start))
    }

    // ── Cache ─────────────────────────────────────────────────────────────────

    /// Rebuild the code→id cache from a full listing. Clear-then-repopulate,
    /// never an incremental merge. A listing without a single usable
    /// (code, id) pair aborts the sync: creating against an empty cache
    /// would mass-produce duplicates.
    async fn warm_cache(&self) -> Result<usize> {
        let listed = match self.koza.list_stock_cards().await {
            Ok(listed) => listed,
            Err(e @ SyncError::Authentication(_)) => return Err(e),
            Err(e) => {
                return Err(SyncError::CacheIntegrity(format!("warm-up listing failed: {e}")))
            }
        };

        let mut valid = 0usize;
        let mut invalid = 0usize;
        {
            let mut cache = self.cache.lock().unwrap();
            cache.clear();
            for item in &listed {
                match (&item.code, item.skart_id) {
                    (Some(code), Some(id)) if !code.trim().is_empty() => {
                        cache.insert(code.trim().to_string(), id);
                        valid += 1;
                    }
                    _ => invalid += 1,
                }
            }
        }
        if invalid > 0 {
            warn!("cache warm-up: {invalid} listing entries lacked a code or id");
        }
        if valid == 0 {
            return Err(SyncError::CacheIntegrity(format!(
                "warm-up listing of {} entries produced no usable code→id pairs",
                listed.len()
            )));
        }
        Ok(valid)
    }

    fn cache_get(&self, code: &str) -> Option<i64> {
        self.cache.lock().unwrap().get(code.trim()).copied()
    }

    fn cache_put(&self, code: &str, id: i64) {
        self.cache.lock().unwrap().insert(code.trim().to_string(), id);
    }

    // ── Per-record decision ───────────────────────────────────────────────────

    async fn process_card(&self, original: &StockCardCandidate) -> Result<CardOutcome> {
        let mut card = original.clone();

        match self.resolve_existing(&card.code).await {
            Some(id) => {
                debug!("stock card {} exists remotely (id {id})", card.code);
                let details = match self.koza.stock_card_details(&card.code).await {
                    Ok(d) => d,
                    Err(e) => {
                        warn!("detail fetch for {} failed: {e}", card.code);
                        None
                    }
                };
                let changes = has_changes(&card, details.as_ref());
                if changes.is_empty() {
                    info!("stock card {} unchanged; skipping", card.code);
                    return Ok(CardOutcome::SkippedUnchanged);
                }

                // The backend cannot update in place: open a new card under a
                // versioned code instead of silently overwriting anything.
                let new_code = self.next_version_code(&card.code).await;
                warn!(
                    "version split for {}: creating {} ({}); original record untouched",
                    card.code,
                    new_code,
                    changes.join(", ")
                );
                card.code = new_code;
                // The original card still owns the barcode; a second card with
                // the same barcode would trip the backend's uniqueness check.
                card.barcode = None;
            }
            None => {
                debug!("stock card {} not present; creating as new", card.code);
            }
        }

        self.create_card(&card).await
    }

    /// Cache lookup with a live safety re-check on miss. A miss does not
    /// prove absence: the warm-up listing may have been served by a
    /// partially degraded backend.
    async fn resolve_existing(&self, code: &str) -> Option<i64> {
        if let Some(id) = self.cache_get(code) {
            debug!("cache hit: {code} → {id}");
            return Some(id);
        }
        match self.koza.find_stock_card(code).await {
            Ok(Some(id)) => {
                error!(
                    "cache integrity: {code} missing from warmed cache but present live (id {id}); \
                     duplicate create prevented"
                );
                self.cache_put(code, id);
                Some(id)
            }
            Ok(None) => None,
            Err(e) => {
                error!("live safety check for {code} failed; proceeding to create: {e}");
                None
            }
        }
    }

    /// First free versioned code derived from `base` (`-V2`, `-V3`, …),
    /// probing the cache and then the live backend. Falls back to a
    /// timestamp suffix past [`MAX_VERSION`].
    async fn next_version_code(&self, base: &str) -> String {
        for version in 2..=MAX_VERSION {
            let candidate = format!("{base}-V{version}");
            if self.cache_get(&candidate).is_some() {
                continue;
            }
            match self.koza.find_stock_card(&candidate).await {
                Ok(Some(_)) => continue,
                Ok(None) => return candidate,
                Err(e) => {
                    warn!("version probe for {candidate} failed; using it: {e}");
                    return candidate;
                }
            }
        }
        let fallback = format!("{base}-{}", Utc::now().format("%Y%m%d%H%M"));
        warn!("no free version suffix below V{MAX_VERSION} for {base}; using {fallback}");
        fallback
    }

    async fn create_card(&self, card: &StockCardCandidate) -> Result<CardOutcome> {
        let start_date = Utc::now().format("%d/%m/%Y").to_string();
        let payload = create_stock_card_payload(card, &start_date);
        let resp = self.koza.create_stock_card(payload).await?;
        let attempts = resp.attempts;

        match resp.class {
            ResponseClass::Html => Ok(CardOutcome::Failed {
                message: format!("HTML response after retries: {}", resp.snippet()),
                attempts,
            }),
            ResponseClass::NeedsLogin | ResponseClass::NeedsBranch => Ok(CardOutcome::Failed {
                message: format!("session could not be recovered: {}", resp.snippet()),
                attempts,
            }),
            ResponseClass::HttpError => Ok(CardOutcome::Failed {
                message: format!("HTTP {}: {}", resp.status, resp.snippet()),
                attempts,
            }),
            ResponseClass::Success => match operation_outcome(&resp.body) {
                Operation::Duplicate(msg) => {
                    warn!(
                        "stock card {} already exists on the backend ({msg}); counted as duplicate",
                        card.code
                    );
                    Ok(CardOutcome::Duplicate { attempts })
                }
                Operation::Rejected(msg) => Ok(CardOutcome::Failed { message: msg, attempts }),
                Operation::Success { id } => {
                    if let Some(id) = id {
                        // Later records in the same batch must see this code.
                        self.cache_put(&card.code, id);
                        info!("stock card created: {} (id {id})", card.code);
                    } else {
                        info!("stock card created: {} (no id in response)", card.code);
                    }
                    Ok(CardOutcome::Created { attempts })
                }
            },
        }
    }
}

fn finish(mut report: SyncReport, start: Instant) -> SyncReport {
    report.duration = start.elapsed();
    report.message = format!(
        "{} created, {} skipped, {} duplicate, {} failed",
        report.created, report.skipped, report.duplicates, report.failed
    );
    report
}

// ── Field comparison ──────────────────────────────────────────────────────────

/// Compare an incoming candidate against the backend's current detail.
/// Returns the list of material differences; empty means "skip, unchanged".
///
/// Only fields the backend reports reliably participate. A detail row that
/// looks like a degraded parse (no id, no price, no category) is treated as
/// unchanged — skipping is the safe side against HTML-mangled listings.
pub fn has_changes(candidate: &StockCardCandidate, existing: Option<&StockItem>) -> Vec<String> {
    let existing = match existing {
        // Existence was established but the detail fetch came back empty:
        // the card cannot be proven unchanged, so a new version is opened.
        None => return vec!["remote detail unavailable".to_string()],
        Some(e) => e,
    };

    if existing.code.as_deref().map(str::trim).unwrap_or("").is_empty() {
        error!("backend returned detail without a code for {}; skipping", candidate.code);
        return Vec::new();
    }
    if existing.skart_id.is_none()
        && existing.sales_price.is_none()
        && existing.category_code.as_deref().unwrap_or("").trim().is_empty()
    {
        error!(
            "backend detail for {} looks like a degraded parse; treating as unchanged",
            candidate.code
        );
        return Vec::new();
    }

    let mut reasons = Vec::new();

    if let Some(remote_name) = existing.name.as_deref() {
        if !candidate.name.trim().is_empty()
            && !remote_name.trim().is_empty()
            && !names_equal_lossy(&candidate.name, remote_name)
        {
            reasons.push(format!("name: '{}' -> '{}'", remote_name, candidate.name));
        }
    }

    // The backend often reports 0/absent prices for cards whose pricing
    // lives elsewhere; only a real remote price participates.
    let remote_price = existing.sales_price.unwrap_or(0.0);
    if remote_price > 0.01 && (candidate.sales_price - remote_price).abs() > 0.01 {
        reasons.push(format!("price: {remote_price:.2} -> {:.2}", candidate.sales_price));
    }

    if let Some(cat) = candidate.category_code.as_deref() {
        if !cat.trim().is_empty() {
            let remote_cat = existing.category_code.as_deref().unwrap_or("").trim();
            if !cat.trim().eq_ignore_ascii_case(remote_cat) {
                reasons.push(format!("category: '{remote_cat}' -> '{}'", cat.trim()));
            }
        }
    }

    if let (Some(remote_qty), Some(qty)) = (existing.quantity, candidate.quantity) {
        if (remote_qty - qty).abs() > 0.001 {
            reasons.push(format!("quantity: {remote_qty:.2} -> {qty:.2}"));
        }
    }

    reasons
}

/// Name equality tolerant of the backend's encoding corruption: Turkish
/// characters are folded to ASCII and a `?` (the mojibake the backend
/// substitutes for non-ASCII bytes) matches any character in that position.
pub fn names_equal_lossy(a: &str, b: &str) -> bool {
    fn fold(c: char) -> char {
        match c {
            'ş' | 'Ş' => 's',
            'ı' | 'İ' => 'i',
            'ğ' | 'Ğ' => 'g',
            'ö' | 'Ö' => 'o',
            'ü' | 'Ü' => 'u',
            'ç' | 'Ç' => 'c',
            _ => c.to_ascii_lowercase(),
        }
    }
    let fa: Vec<char> = a.trim().chars().map(fold).collect();
    let fb: Vec<char> = b.trim().chars().map(fold).collect();
    if fa.len() != fb.len() {
        return false;
    }
    fa.iter()
        .zip(fb.iter())
        .all(|(x, y)| x == y || *x == '?' || *y == '?')
}
