//! Response classification for the Koza backend.
//!
//! Koza reports failures in several shapes: an HTML login page served with
//! HTTP 200, `{"code":1001..1003,"message":...}` objects, `{"error":true}`
//! objects, and localized phrases whose non-ASCII characters are frequently
//! mangled by the server's legacy encoding. Everything here is pure string
//! inspection so the tables can be unit-tested without a transport.

use reqwest::StatusCode;
use serde_json::Value;

/// Classification of one backend response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// HTTP success and no failure marker in the body.
    Success,
    /// Session invalid; the caller must re-authenticate.
    NeedsLogin,
    /// An operation was attempted without a selected branch.
    NeedsBranch,
    /// Body is HTML — near-certain session expiry or routing failure,
    /// regardless of HTTP status.
    Html,
    /// Non-success HTTP status without a recognizable session marker.
    HttpError,
}

/// Phrases that mark a "must log in" response. The second spelling covers
/// the backend's habit of flattening Turkish characters to ASCII.
const LOGIN_MARKERS: &[&str] = &[
    "login olunmal\u{131}", // "login olunmalı"
    "login olunmali",
    "\"code\":1001",
    "\"code\":1002",
    "\"code\": 1001",
    "\"code\": 1002",
    // Struts fails to route the very first call of a fresh session.
    "unable to instantiate action",
];

/// Phrases that mark a "select a branch first" response.
const BRANCH_MARKERS: &[&str] = &[
    "\u{15f}irket \u{15f}ube se\u{e7}imi", // "şirket şube seçimi"
    "sirket sube secimi",
    "sube secimi yapilmali",
    "\"code\":1003",
    "\"code\": 1003",
];

/// Substrings identifying a create rejection caused by an already-used code.
/// Includes partial matches that survive the backend's encoding corruption
/// ("daha önce kullanılmış" often arrives with `?` in place of Turkish chars).
const DUPLICATE_MARKERS: &[&str] = &[
    "daha \u{f6}nce kullan\u{131}lm\u{131}\u{15f}", // "daha önce kullanılmış"
    "daha once kullanilmis",
    "nce kullan",
    "kart kodu daha",
    "already exists",
    "duplicate",
    "zaten mevcut",
];

/// Classify a response body against the marker tables.
pub fn classify(status: StatusCode, body: &str) -> ResponseClass {
    if body.trim_start().starts_with('<') {
        return ResponseClass::Html;
    }
    let lower = body.to_lowercase();
    if LOGIN_MARKERS.iter().any(|m| lower.contains(m)) {
        return ResponseClass::NeedsLogin;
    }
    if BRANCH_MARKERS.iter().any(|m| lower.contains(m)) {
        return ResponseClass::NeedsBranch;
    }
    if status == StatusCode::UNAUTHORIZED {
        return ResponseClass::NeedsLogin;
    }
    if !status.is_success() {
        return ResponseClass::HttpError;
    }
    ResponseClass::Success
}

/// Whether an error message text identifies a duplicate-code rejection.
pub fn is_duplicate_message(msg: &str) -> bool {
    let lower = msg.to_lowercase();
    DUPLICATE_MARKERS.iter().any(|m| lower.contains(m))
}

/// Outcome of a create-style operation response.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Backend accepted the record; `id` is present when extractable.
    Success { id: Option<i64> },
    /// The code is already in use. Healthy outcome, not a failure.
    Duplicate(String),
    /// Any other non-zero code / error=true response.
    Rejected(String),
}

/// Interpret an operation response body.
///
/// Known shapes: `{"code":0,...}`, `{"code":N,"message":...}`,
/// `{"error":true,"message":...}`, `{"skartId":N,"error":false,...}` and
/// `{"stkSkart":{"skartId":N}}`. An unparseable body on an HTTP success is
/// treated as success with no id, matching observed backend behaviour.
pub fn operation_outcome(body: &str) -> Operation {
    let parsed: Value = match serde_json::from_str(body) {
        Ok(v) => v,
        Err(_) => return Operation::Success { id: None },
    };
    let obj = match parsed.as_object() {
        Some(o) => o,
        None => return Operation::Success { id: None },
    };

    let message = obj
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();

    if obj.get("error").and_then(Value::as_bool) == Some(true) {
        if is_duplicate_message(&message) {
            return Operation::Duplicate(message);
        }
        let msg = if message.is_empty() { "unknown error".into() } else { message };
        return Operation::Rejected(msg);
    }

    if let Some(code) = obj.get("code").and_then(Value::as_i64) {
        if code != 0 {
            if is_duplicate_message(&message) {
                return Operation::Duplicate(message);
            }
            return Operation::Rejected(format!("code={code} message={message}"));
        }
    }

    Operation::Success { id: created_id(&parsed) }
}

/// Pull a freshly created record id out of a success response.
pub fn created_id(body: &Value) -> Option<i64> {
    if let Some(id) = body.get("skartId").and_then(Value::as_i64) {
        return Some(id);
    }
    if let Some(id) = body
        .get("stkSkart")
        .and_then(|s| s.get("skartId"))
        .and_then(Value::as_i64)
    {
        return Some(id);
    }
    // A handful of endpoints return the id as a string.
    body.get("skartId")
        .and_then(Value::as_str)
        .and_then(|s| s.parse().ok())
}

/// Whether a login response body indicates success.
///
/// JSON `{"code":0}` / `{"success":true}` are definitive. For non-JSON
/// bodies, the absence of every known failure token is the best signal the
/// backend gives us.
pub fn is_login_success(body: &str) -> bool {
    if body.trim().is_empty() {
        return false;
    }
    if let Ok(v) = serde_json::from_str::<Value>(body) {
        if let Some(obj) = v.as_object() {
            if let Some(code) = obj.get("code").and_then(Value::as_i64) {
                return code == 0;
            }
            if obj.get("success").and_then(Value::as_bool) == Some(true) {
                return true;
            }
        }
    }
    let lower = body.to_lowercase();
    const FAIL_TOKENS: &[&str] = &[
        "hatal", "yanl", "gecersiz", "captcha", "deneme hakk", "beklenmedik", "error", "exception",
    ];
    FAIL_TOKENS.iter().all(|t| !lower.contains(t))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn html_wins_regardless_of_status() {
        let body = "<!DOCTYPE html><html><body>Giris</body></html>";
        assert_eq!(classify(StatusCode::OK, body), ResponseClass::Html);
        assert_eq!(classify(StatusCode::INTERNAL_SERVER_ERROR, body), ResponseClass::Html);
        // leading whitespace before the tag
        assert_eq!(classify(StatusCode::OK, "  \n<html>"), ResponseClass::Html);
    }

    #[test]
    fn login_markers() {
        assert_eq!(
            classify(StatusCode::OK, r#"{"code":1001,"message":"Login olunmalı"}"#),
            ResponseClass::NeedsLogin
        );
        assert_eq!(
            classify(StatusCode::OK, "Login olunmali"),
            ResponseClass::NeedsLogin
        );
        assert_eq!(
            classify(StatusCode::OK, "Unable to instantiate Action"),
            ResponseClass::NeedsLogin
        );
        assert_eq!(classify(StatusCode::UNAUTHORIZED, "{}"), ResponseClass::NeedsLogin);
    }

    #[test]
    fn branch_markers() {
        assert_eq!(
            classify(StatusCode::OK, r#"{"code":1003,"message":"Şirket şube seçimi yapılmalı"}"#),
            ResponseClass::NeedsBranch
        );
        assert_eq!(
            classify(StatusCode::OK, "sirket sube secimi gerekli"),
            ResponseClass::NeedsBranch
        );
    }

    #[test]
    fn plain_success_and_http_error() {
        assert_eq!(classify(StatusCode::OK, r#"{"code":0}"#), ResponseClass::Success);
        assert_eq!(classify(StatusCode::BAD_GATEWAY, "gateway"), ResponseClass::HttpError);
    }

    #[test]
    fn duplicate_messages_survive_mojibake() {
        assert!(is_duplicate_message("Kart kodu daha önce kullanılmış"));
        assert!(is_duplicate_message("Kart kodu daha ?nce kullan?lm??"));
        assert!(is_duplicate_message("code ALREADY EXISTS in system"));
        assert!(!is_duplicate_message("kart kodu gecersiz"));
    }

    #[test]
    fn operation_outcomes() {
        assert_eq!(
            operation_outcome(r#"{"skartId":79409,"error":false,"message":"Başarılı"}"#),
            Operation::Success { id: Some(79409) }
        );
        assert_eq!(
            operation_outcome(r#"{"stkSkart":{"skartId":12}}"#),
            Operation::Success { id: Some(12) }
        );
        assert!(matches!(
            operation_outcome(r#"{"error":true,"message":"Kart kodu daha önce kullanılmış"}"#),
            Operation::Duplicate(_)
        ));
        assert!(matches!(
            operation_outcome(r#"{"code":7,"message":"olcum birimi bulunamadi"}"#),
            Operation::Rejected(_)
        ));
        // unparseable body on HTTP success counts as success without id
        assert_eq!(operation_outcome("OK"), Operation::Success { id: None });
    }

    #[test]
    fn login_success_marker() {
        assert!(is_login_success(r#"{"code":0}"#));
        assert!(is_login_success(r#"{"success":true}"#));
        assert!(!is_login_success(r#"{"code":5}"#));
        assert!(!is_login_success("Kullanici adi hatali"));
        assert!(!is_login_success("captcha required"));
        assert!(!is_login_success(""));
    }
}
