//! Wire types for the Koza backend.
//!
//! Field names on the wire are the backend's Turkish identifiers; Rust-side
//! names stay English via serde renames. Listing responses are probed as raw
//! JSON because the same endpoint answers with `list`, `stokKartlari` or
//! `stkKartListesi` depending on deployment.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

// ── Branches ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Branch {
    #[serde(rename = "orgSirketSubeId", alias = "id")]
    pub id: Option<i64>,
    #[serde(rename = "subeAdi", alias = "ad", default)]
    pub name: Option<String>,
}

// ── Stock cards ───────────────────────────────────────────────────────────────

/// One entry from a stock-card listing.
#[derive(Debug, Clone, Default)]
pub struct StockItem {
    pub skart_id: Option<i64>,
    pub code: Option<String>,
    pub name: Option<String>,
    pub category_code: Option<String>,
    pub barcode: Option<String>,
    pub sales_price: Option<f64>,
    pub quantity: Option<f64>,
}

/// A candidate record coming from the inventory side, keyed by its unique
/// business code.
#[derive(Debug, Clone)]
pub struct StockCardCandidate {
    pub code: String,
    pub name: String,
    pub barcode: Option<String>,
    pub category_code: Option<String>,
    pub sales_price: f64,
    pub quantity: Option<f64>,
    /// Measurement unit id on the Koza side (1 = piece).
    pub unit_id: i64,
    /// Purchase VAT band id.
    pub vat_band: i64,
}

impl StockCardCandidate {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            name: name.into(),
            barcode: None,
            category_code: None,
            sales_price: 0.0,
            quantity: None,
            unit_id: 1,
            vat_band: 1,
        }
    }
}

/// Build the documented create payload for a stock card.
///
/// The field set is exactly what the backend's working example accepts —
/// extra fields make the create fail with an empty `{"error":true}` body.
/// `maliyetHesaplanacakFlag` is a boolean while the other flags are 0/1
/// integers; that asymmetry is the backend's, not ours.
pub fn create_stock_card_payload(card: &StockCardCandidate, start_date: &str) -> Value {
    let name = if card.name.trim().is_empty() {
        format!("NONAME-{}", card.code)
    } else {
        card.name.trim().to_string()
    };
    json!({
        "kartAdi": name,
        "kartKodu": card.code,
        "baslangicTarihi": start_date,
        "kartTipi": 1,
        "kartTuru": 1,
        "kategoriAgacKod": card.category_code,
        "kartAlisKdvOran": card.vat_band,
        "olcumBirimiId": card.unit_id,
        "barkod": card.barcode.as_deref().unwrap_or(""),
        "alisTevkifatOran": null,
        "satisTevkifatOran": null,
        "alisTevkifatTipId": null,
        "satisTevkifatTipId": null,
        "satilabilirFlag": 1,
        "satinAlinabilirFlag": 1,
        "lotNoFlag": 1,
        "minStokKontrol": 0,
        "maliyetHesaplanacakFlag": true
    })
}

/// Filter body for an exact-code stock-card lookup.
pub fn stock_card_filter(code: &str) -> Value {
    json!({
        "stkSkart": {
            "kodBas": code,
            "kodBit": code,
            "kodOp": "between"
        }
    })
}

/// Narrow date-window filter used by the post-login warm-up call.
pub fn warmup_filter() -> Value {
    json!({
        "stkSkart": {
            "eklemeTarihiBas": "06/04/2022",
            "eklemeTarihiBit": "06/04/2022",
            "eklemeTarihiOp": "between"
        }
    })
}

/// Locate the item array in a listing response, whatever the deployment
/// decided to call it.
pub fn listing_items(body: &Value) -> Vec<&Value> {
    for key in ["list", "stokKartlari", "stkKartListesi", "depolar", "stkDepoListesi"] {
        if let Some(items) = body.get(key).and_then(Value::as_array) {
            return items.iter().collect();
        }
    }
    if let Some(items) = body.as_array() {
        return items.iter().collect();
    }
    Vec::new()
}

fn str_field<'a>(item: &'a Value, keys: &[&str]) -> Option<&'a str> {
    keys.iter().find_map(|k| item.get(*k).and_then(Value::as_str))
}

fn num_field(item: &Value, keys: &[&str]) -> Option<f64> {
    keys.iter().find_map(|k| item.get(*k).and_then(Value::as_f64))
}

fn id_field(item: &Value, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|k| {
        let v = item.get(*k)?;
        v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok()))
    })
}

/// Parse one listing entry into a [`StockItem`]. Field names vary across
/// deployments (`kod` vs `kartKodu`, string vs numeric ids), so every field
/// is probed through an alias list.
pub fn parse_stock_item(item: &Value) -> StockItem {
    StockItem {
        skart_id: id_field(item, &["skartId", "stokKartId"]),
        code: str_field(item, &["kartKodu", "kod"]).map(str::to_string),
        name: str_field(item, &["kartAdi", "ad"]).map(str::to_string),
        category_code: str_field(item, &["kategoriAgacKod"]).map(str::to_string),
        barcode: str_field(item, &["barkod"]).map(str::to_string),
        sales_price: num_field(
            item,
            &["perakendeSatisBirimFiyat", "satisFiyat", "salesPrice", "fiyat"],
        ),
        quantity: num_field(item, &["miktar"]),
    }
}

// ── Customers ─────────────────────────────────────────────────────────────────

/// Minimal customer-card create request (cookie-session endpoint).
#[derive(Debug, Clone, Serialize)]
pub struct CustomerCreate {
    #[serde(rename = "kod")]
    pub code: String,
    #[serde(rename = "tanim")]
    pub name: String,
    #[serde(rename = "cariTur")]
    pub kind: i64,
}

/// Pull a customer's financial-object id out of a listing entry.
pub fn customer_id(item: &Value) -> Option<i64> {
    id_field(item, &["finansalNesneId"])
}

// ── Depots ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
pub struct Depot {
    #[serde(rename = "depoId", alias = "id")]
    pub id: Option<i64>,
    #[serde(rename = "kod", default)]
    pub code: Option<String>,
    #[serde(rename = "tanim", alias = "ad", default)]
    pub name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn listing_items_probes_known_keys() {
        let a: Value = serde_json::from_str(r#"{"list":[{"kod":"A"}]}"#).unwrap();
        assert_eq!(listing_items(&a).len(), 1);
        let b: Value = serde_json::from_str(r#"{"stokKartlari":[{},{}]}"#).unwrap();
        assert_eq!(listing_items(&b).len(), 2);
        let c: Value = serde_json::from_str(r#"{"unrelated":1}"#).unwrap();
        assert!(listing_items(&c).is_empty());
        let d: Value = serde_json::from_str(r#"[{"kod":"X"}]"#).unwrap();
        assert_eq!(listing_items(&d).len(), 1);
    }

    #[test]
    fn stock_item_field_aliases() {
        let item: Value = serde_json::from_str(
            r#"{"kod":"SKU1","ad":"Ürün","skartId":"77","satisFiyat":12.5}"#,
        )
        .unwrap();
        let parsed = parse_stock_item(&item);
        assert_eq!(parsed.code.as_deref(), Some("SKU1"));
        assert_eq!(parsed.skart_id, Some(77));
        assert_eq!(parsed.sales_price, Some(12.5));

        let item2: Value = serde_json::from_str(
            r#"{"kartKodu":"SKU2","kartAdi":"Adı","stokKartId":9}"#,
        )
        .unwrap();
        let parsed2 = parse_stock_item(&item2);
        assert_eq!(parsed2.code.as_deref(), Some("SKU2"));
        assert_eq!(parsed2.skart_id, Some(9));
    }

    #[test]
    fn create_payload_has_exact_field_set() {
        let mut card = StockCardCandidate::new("SKU1", "Test Ürünü");
        card.barcode = Some("8888888".into());
        let payload = create_stock_card_payload(&card, "06/04/2022");
        let obj = payload.as_object().unwrap();
        assert_eq!(obj.len(), 18);
        assert_eq!(payload["kartKodu"], "SKU1");
        assert_eq!(payload["barkod"], "8888888");
        assert_eq!(payload["maliyetHesaplanacakFlag"], true);
        assert_eq!(payload["satilabilirFlag"], 1);
    }

    #[test]
    fn blank_name_gets_noname_fallback() {
        let card = StockCardCandidate::new("SKU9", "   ");
        let payload = create_stock_card_payload(&card, "01/01/2024");
        assert_eq!(payload["kartAdi"], "NONAME-SKU9");
    }
}
