//! Read-only client for the Katana inventory API.
//!
//! Plain paged GETs with bearer authentication. Katana is the well-behaved
//! side of the integration: no session gymnastics, no retry orchestration.
//! Failures preserve the status code and body for the caller.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, info};
use reqwest::Client;
use serde::Deserialize;
use url::Url;

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::koza::types::StockCardCandidate;

const PAGE_LIMIT: usize = 250;

#[derive(Debug, Clone, Deserialize)]
pub struct KatanaVariant {
    pub id: i64,
    pub sku: Option<String>,
    pub sales_price: Option<f64>,
    #[serde(default)]
    pub barcode: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct KatanaProduct {
    pub id: i64,
    pub name: String,
    #[serde(default)]
    pub category_name: Option<String>,
    #[serde(default)]
    pub variants: Vec<KatanaVariant>,
}

#[derive(Debug, Deserialize)]
struct ProductPage {
    data: Vec<KatanaProduct>,
}

pub struct KatanaClient {
    http: Client,
    base_url: Url,
    api_key: String,
}

impl KatanaClient {
    pub fn new(cfg: &Arc<Config>) -> Result<Self> {
        let base_url = Url::parse(&format!("{}/", cfg.katana_base_url.trim_end_matches('/')))?;
        let http = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url,
            api_key: cfg.katana_api_key.clone(),
        })
    }

    /// Fetch all products, walking pages until a short page is returned.
    pub async fn list_products(&self) -> Result<Vec<KatanaProduct>> {
        let mut products = Vec::new();
        let mut page = 1usize;
        loop {
            let url = self.base_url.join("products")?;
            let resp = self
                .http
                .get(url)
                .bearer_auth(&self.api_key)
                .query(&[("page", page.to_string()), ("limit", PAGE_LIMIT.to_string())])
                .send()
                .await?;
            let status = resp.status();
            let body = resp.text().await?;
            if !status.is_success() {
                return Err(SyncError::Inventory { status: status.as_u16(), body });
            }
            let parsed: ProductPage = serde_json::from_str(&body)?;
            let count = parsed.data.len();
            debug!("katana products page {page}: {count} items");
            products.extend(parsed.data);
            if count < PAGE_LIMIT {
                break;
            }
            page += 1;
        }
        info!("fetched {} products from Katana", products.len());
        Ok(products)
    }
}

/// Flatten products into per-variant stock-card candidates. Variants
/// without a SKU cannot be keyed on the Koza side and are dropped.
pub fn to_candidates(products: &[KatanaProduct]) -> Vec<StockCardCandidate> {
    let mut candidates = Vec::new();
    for product in products {
        for variant in &product.variants {
            let sku = match variant.sku.as_deref().map(str::trim) {
                Some(s) if !s.is_empty() => s.to_string(),
                _ => continue,
            };
            let mut candidate = StockCardCandidate::new(sku, product.name.clone());
            candidate.sales_price = variant.sales_price.unwrap_or(0.0);
            candidate.barcode = variant.barcode.clone();
            candidate.category_code = product.category_name.clone();
            candidates.push(candidate);
        }
    }
    candidates
}
