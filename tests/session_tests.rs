//! Session lifecycle integration tests against a mock Koza backend.

mod common;

use std::sync::Arc;

use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use common::*;

/// N concurrent callers with no prior session produce exactly one login
/// sequence; afterwards every caller observes a valid session.
#[tokio::test]
async fn concurrent_callers_share_a_single_login() {
    let server = MockServer::start().await;
    mount_session_scaffolding(&server).await;
    mount_login_ok(&server, 1).await;

    let h = harness(test_config(&server));

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let session = Arc::clone(&h.session);
        tasks.push(tokio::spawn(async move { session.ensure_authenticated().await }));
    }
    for task in tasks {
        task.await.unwrap().expect("ensure_authenticated");
    }
    assert!(h.session.is_authenticated());
    // expect(1) on the login mock is verified when the server drops
}

/// A second instance sharing the cookie jar adopts the existing session
/// instead of logging in again.
#[tokio::test]
async fn jar_session_is_adopted_without_login() {
    let server = MockServer::start().await;
    mount_session_scaffolding(&server).await;
    // No login mock mounted: a login POST would 404 and fail the flow.
    let h = harness(test_config(&server));
    seed_session_cookie(&h, &server.uri());

    h.session.ensure_authenticated().await.expect("adopt seeded session");
    assert!(h.session.is_authenticated());
}

/// The scripted login walks the payload variants in order until one yields
/// a session cookie.
#[tokio::test]
async fn login_falls_back_through_payload_variants() {
    let server = MockServer::start().await;
    mount_session_scaffolding(&server).await;

    // JSON variant: rejected, no cookie.
    Mock::given(method("POST"))
        .and(path("/Giris.do"))
        .and(header("content-type", "application/json"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Kullanici adi hatali"))
        .expect(1)
        .mount(&server)
        .await;
    // Form variant: accepted with a session cookie.
    Mock::given(method("POST"))
        .and(path("/Giris.do"))
        .and(header("content-type", "application/x-www-form-urlencoded"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "JSESSIONID=form-login; Path=/")
                .set_body_string(r#"{"code":0}"#),
        )
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(test_config(&server));
    h.session.ensure_authenticated().await.expect("form variant login");
    assert!(h.session.is_authenticated());
}

/// Exhausting every login variant is a fatal authentication error.
#[tokio::test]
async fn exhausted_login_variants_fail_authentication() {
    let server = MockServer::start().await;
    mount_login_page(&server).await;
    Mock::given(method("POST"))
        .and(path("/Giris.do"))
        .respond_with(ResponseTemplate::new(200).set_body_string("Kullanici adi hatali"))
        .expect(3)
        .mount(&server)
        .await;

    let h = harness(test_config(&server));
    let err = h.session.ensure_authenticated().await.unwrap_err();
    assert!(matches!(err, koza_sync::error::SyncError::Authentication(_)), "got {err}");
    assert!(!h.session.is_authenticated());
}

/// Re-authentication retries never exceed the attempt budget: a listing
/// that keeps answering "must log in" is dispatched exactly three times.
#[tokio::test]
async fn reauth_retries_are_bounded() {
    let server = MockServer::start().await;
    mount_branches(&server).await;
    mount_change_branch(&server).await;

    Mock::given(method("POST"))
        .and(path("/ListeleStkSkart.do"))
        .and(header("No-Paging", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"code":1001,"message":"Login olunmalı"}"#,
        ))
        .expect(3)
        .mount(&server)
        .await;

    let h = harness(test_config(&server));
    seed_session_cookie(&h, &server.uri());

    let err = h.koza.list_stock_cards().await.unwrap_err();
    assert!(matches!(err, koza_sync::error::SyncError::Rejected(_)), "got {err}");
}

/// Branch selection applies the first available branch when none is
/// configured, and is skipped once selected.
#[tokio::test]
async fn branch_selection_uses_first_available_and_is_idempotent() {
    let server = MockServer::start().await;
    mount_branches(&server).await;

    Mock::given(method("POST"))
        .and(path("/GuncelleYtkSirketSubeDegistir.do"))
        .and(body_string_contains("\"orgSirketSubeId\":3"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"code":0}"#))
        .expect(1)
        .mount(&server)
        .await;

    let h = harness(test_config(&server));
    seed_session_cookie(&h, &server.uri());
    h.session.ensure_authenticated().await.unwrap();

    assert!(h.session.ensure_branch_selected(false).await);
    assert!(h.session.is_branch_selected());
    // Second call takes the fast path; the expect(1) above verifies no
    // further change request is sent.
    assert!(h.session.ensure_branch_selected(false).await);
}

/// A configured forced branch wins over the listing order.
#[tokio::test]
async fn forced_branch_id_overrides_listing() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/YdlUserResponsibilityOrgSs.do"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"list":[{"orgSirketSubeId":3,"subeAdi":"Merkez"},{"orgSirketSubeId":9,"subeAdi":"Depo"}]}"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/GuncelleYtkSirketSubeDegistir.do"))
        .and(body_string_contains("\"orgSirketSubeId\":9"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"code":0}"#))
        .expect(1)
        .mount(&server)
        .await;

    let mut cfg = test_config(&server);
    cfg.forced_branch_id = Some(9);
    let h = harness(cfg);
    seed_session_cookie(&h, &server.uri());
    h.session.ensure_authenticated().await.unwrap();

    assert!(h.session.ensure_branch_selected(false).await);
}

/// Token mode: the session manager fetches a bearer token and every
/// subsequent call carries it; no cookie flow runs at all.
#[tokio::test]
async fn token_mode_sends_bearer_header() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/auth/token"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"token":"tok-1","expiresIn":3600}"#,
        ))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/ListeleStkSkart.do"))
        .and(header("Authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"list":[{"kartKodu":"SKU1","kartAdi":"Widget","skartId":10}]}"#,
        ))
        .mount(&server)
        .await;

    let mut cfg = test_config(&server);
    cfg.use_token_auth = true;
    let h = harness(cfg);

    let cards = h.koza.list_stock_cards().await.expect("token-mode listing");
    assert_eq!(cards.len(), 1);
    assert!(h.session.is_authenticated());
}

/// Depot wrappers: the listing parses deployment-specific key names and a
/// create answered with an already-used code classifies as a duplicate.
#[tokio::test]
async fn depot_list_and_duplicate_create() {
    let server = MockServer::start().await;
    mount_branches(&server).await;
    mount_change_branch(&server).await;

    Mock::given(method("POST"))
        .and(path("/ListeleStkDepo.do"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"depolar":[{"depoId":5,"kod":"D1","tanim":"Merkez Depo"}]}"#,
        ))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/EkleStkWsDepo.do"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"error":true,"message":"Kod daha ?nce kullan?lm??"}"#,
        ))
        .mount(&server)
        .await;

    let h = harness(test_config(&server));
    seed_session_cookie(&h, &server.uri());

    let depots = h.koza.list_depots().await.expect("depot listing");
    assert_eq!(depots.len(), 1);
    assert_eq!(depots[0].id, Some(5));
    assert_eq!(depots[0].code.as_deref(), Some("D1"));

    let outcome = h.koza.create_depot("D1", "Merkez Depo").await.expect("depot create");
    assert!(matches!(outcome, koza_sync::koza::classify::Operation::Duplicate(_)));
}

/// The throttled customer lookup resolves a code to its remote id.
#[tokio::test]
async fn customer_lookup_resolves_code() {
    let server = MockServer::start().await;
    mount_branches(&server).await;
    mount_change_branch(&server).await;

    Mock::given(method("POST"))
        .and(path("/ListeleFinMusteri.do"))
        .and(body_string_contains("\"kodBas\":\"C1\""))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"list":[{"kod":"C1","tanim":"Cari Bir","finansalNesneId":44}]}"#,
        ))
        .mount(&server)
        .await;

    let h = harness(test_config(&server));
    seed_session_cookie(&h, &server.uri());

    let id = h.koza.find_customer_by_code("C1").await.expect("lookup");
    assert_eq!(id, Some(44));
}
