//! Shared wiremock harness for integration tests.
#![allow(dead_code)]

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use wiremock::matchers::{body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use koza_sync::config::Config;
use koza_sync::koza::client::KozaClient;
use koza_sync::koza::jar::{jar_key, CookieJarStore};
use koza_sync::koza::session::SessionManager;
use koza_sync::sync::SyncCoordinator;

pub fn test_config(server: &MockServer) -> Config {
    Config {
        koza_base_url: server.uri(),
        koza_member_number: "123456".into(),
        koza_username: "ws-user".into(),
        koza_password: "ws-pass".into(),
        timeout_secs: 5,
        create_delay_ms: 0,
        batch_delay_ms: 0,
        log_syslog: false,
        ..Config::default()
    }
}

pub struct Harness {
    pub store: Arc<CookieJarStore>,
    pub session: Arc<SessionManager>,
    pub koza: Arc<KozaClient>,
    pub shutdown: Arc<AtomicBool>,
    pub coordinator: SyncCoordinator,
}

pub fn harness(cfg: Config) -> Harness {
    let store = Arc::new(CookieJarStore::new());
    let session =
        Arc::new(SessionManager::new(Arc::new(cfg), Arc::clone(&store)).expect("session manager"));
    let koza = Arc::new(KozaClient::new(Arc::clone(&session)));
    let shutdown = Arc::new(AtomicBool::new(false));
    let coordinator = SyncCoordinator::new(Arc::clone(&koza), Arc::clone(&shutdown));
    Harness { store, session, koza, shutdown, coordinator }
}

/// Deposit a live-looking session cookie in the shared jar, as another
/// client instance would have.
pub fn seed_session_cookie(harness: &Harness, base_url: &str) {
    let jar = harness.store.get_or_create(&jar_key(base_url));
    let url = url::Url::parse(&format!("{}/", base_url.trim_end_matches('/'))).unwrap();
    jar.add_cookie_str("JSESSIONID=seeded-session; Path=/", &url);
}

// ── Standard endpoint mounts ──────────────────────────────────────────────────

pub async fn mount_login_page(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/Giris.do"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>giris</html>"))
        .mount(server)
        .await;
}

pub async fn mount_login_ok(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/Giris.do"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("set-cookie", "JSESSIONID=fresh-login; Path=/")
                .set_body_string(r#"{"code":0}"#),
        )
        .expect(expected_calls)
        .mount(server)
        .await;
}

pub async fn mount_branches(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/YdlUserResponsibilityOrgSs.do"))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"list":[{"orgSirketSubeId":3,"subeAdi":"Merkez"}]}"#,
        ))
        .mount(server)
        .await;
}

pub async fn mount_change_branch(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/GuncelleYtkSirketSubeDegistir.do"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"code":0}"#))
        .mount(server)
        .await;
}

/// Warm-up probe: the narrow date-window listing fired after login.
pub async fn mount_warmup(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/ListeleStkSkart.do"))
        .and(body_string_contains("eklemeTarihi"))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"list":[]}"#))
        .mount(server)
        .await;
}

/// Full listing used by the cache warm (distinguished by the No-Paging header).
pub async fn mount_full_listing(server: &MockServer, body: &str) {
    Mock::given(method("POST"))
        .and(path("/ListeleStkSkart.do"))
        .and(header("No-Paging", "true"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

/// Exact-code lookup (filtered listing).
pub async fn mount_lookup(server: &MockServer, code: &str, body: &str) {
    Mock::given(method("POST"))
        .and(path("/ListeleStkSkart.do"))
        .and(body_string_contains(format!("\"kodBas\":\"{code}\"")))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(server)
        .await;
}

/// Mount the standard happy-path session scaffolding: login page, login,
/// branches, branch change and warm-up probe.
pub async fn mount_session_scaffolding(server: &MockServer) {
    mount_login_page(server).await;
    mount_branches(server).await;
    mount_change_branch(server).await;
    mount_warmup(server).await;
}
