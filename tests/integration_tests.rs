//! End-to-end tests against a real server bound to an ephemeral port.
//!
//! Each fixture owns its own static root (a temp directory), its own
//! `AppState` and a manual clock, so rate-limit windows are deterministic
//! and tests never share counters.
//!
//! Run with: `cargo test --test integration_tests`
#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, Response, StatusCode};
use tempfile::TempDir;
use tokio::net::TcpListener;

use static_shield::config::Config;
use static_shield::models::HealthResponse;
use static_shield::security::ManualClock;
use static_shield::{AppState, build_router};

/// Fixed start time, 40s into a minute window.
const START: u64 = 1_700_000_020;

const INDEX_HTML: &str = r#"<!doctype html>
<html>
<head><meta name="csrf-token" content="{{ csrf_token }}"></head>
<body><script nonce="{{ csp_nonce }}">console.log("hi")</script></body>
</html>"#;

/// Test fixture that owns the static root and the running server.
struct TestFixture {
    _static_root: TempDir,
    base_url: String,
    client: Client,
    clock: Arc<ManualClock>,
}

impl TestFixture {
    async fn new() -> Self {
        Self::with_config(|_| {}).await
    }

    async fn with_config(configure: impl FnOnce(&mut Config)) -> Self {
        let static_root = tempfile::tempdir().expect("Failed to create static root");
        write_site(&static_root);

        let mut config = Config {
            static_root: static_root.path().to_path_buf(),
            service_name: "portfolio-webapp".to_string(),
            sweep_interval: Duration::ZERO,
            ..Config::default()
        };
        configure(&mut config);

        let clock = Arc::new(ManualClock::new(START));
        let state = AppState::with_clock(config, clock.clone()).expect("Failed to build state");
        let app = build_router(state);

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind to ephemeral port");
        let addr = listener.local_addr().expect("Failed to get local address");

        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .expect("Server error");
        });

        Self {
            _static_root: static_root,
            base_url: format!("http://{addr}"),
            client: Client::builder()
                .redirect(reqwest::redirect::Policy::none())
                .build()
                .expect("Failed to build client"),
            clock,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get(&self, path: &str) -> Response {
        self.client.get(self.url(path)).send().await.unwrap()
    }
}

fn write_site(dir: &TempDir) {
    let root = dir.path();
    std::fs::write(root.join("index.html"), INDEX_HTML).unwrap();
    std::fs::create_dir(root.join("css")).unwrap();
    std::fs::write(root.join("css/site.css"), "body { margin: 0 }").unwrap();
    std::fs::write(root.join("script.exe"), "MZ").unwrap();
}

fn assert_security_headers(response: &Response) {
    let headers = response.headers();
    assert_eq!(headers.get("x-content-type-options").unwrap(), "nosniff");
    assert_eq!(headers.get("x-frame-options").unwrap(), "DENY");
    assert!(headers.get("content-security-policy").is_some());
    assert!(headers.get("server").is_none());
}

fn csp_nonce(response: &Response) -> String {
    let csp = response
        .headers()
        .get("content-security-policy")
        .unwrap()
        .to_str()
        .unwrap();
    let start = csp.find("'nonce-").unwrap() + "'nonce-".len();
    let end = csp[start..].find('\'').unwrap() + start;
    csp[start..end].to_string()
}

fn session_cookie(response: &Response) -> String {
    let set_cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap();
    set_cookie.split(';').next().unwrap().to_string()
}

fn csrf_token_from(body: &str) -> String {
    let marker = r#"name="csrf-token" content=""#;
    let start = body.find(marker).unwrap() + marker.len();
    let end = body[start..].find('"').unwrap() + start;
    body[start..end].to_string()
}

// =============================================================================
// Static Assets & Path Guard
// =============================================================================

#[tokio::test]
async fn test_index_served_with_security_headers() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_security_headers(&response);
    assert!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/html")
    );
}

#[tokio::test]
async fn test_static_asset_served() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/css/site.css").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "body { margin: 0 }");
}

#[tokio::test]
async fn test_encoded_traversal_forbidden() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/..%2F..%2Fetc%2Fpasswd").await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_security_headers(&response);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "forbidden");
}

#[tokio::test]
async fn test_disallowed_extension_forbidden_even_if_present() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/script.exe").await;

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_security_headers(&response);
}

#[tokio::test]
async fn test_missing_file_not_found_with_headers() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/css/missing.css").await;

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_security_headers(&response);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "not_found");
}

// =============================================================================
// Health
// =============================================================================

#[tokio::test]
async fn test_health_body() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/health").await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_security_headers(&response);
    let body: HealthResponse = response.json().await.unwrap();
    assert_eq!(body, HealthResponse::healthy("portfolio-webapp"));
}

// =============================================================================
// Rate Limiting
// =============================================================================

#[tokio::test]
async fn test_health_eleventh_request_limited() {
    let fixture = TestFixture::new().await;

    for i in 0..10 {
        let response = fixture.get("/health").await;
        assert_eq!(response.status(), StatusCode::OK, "request {i}");
    }

    let response = fixture.get("/health").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_security_headers(&response);

    let retry_after: u64 = response
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after), "retry-after {retry_after}");
}

#[tokio::test]
async fn test_index_thirty_first_request_limited_then_window_resets() {
    let fixture = TestFixture::new().await;

    for i in 0..30 {
        let response = fixture.get("/").await;
        assert_eq!(response.status(), StatusCode::OK, "request {i}");
    }

    let response = fixture.get("/").await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    // 40s into the minute window, so it resets in 20s.
    assert_eq!(response.headers().get("retry-after").unwrap(), "20");

    fixture.clock.advance(20);
    assert_eq!(fixture.get("/").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_clients_limited_independently() {
    let fixture = TestFixture::new().await;

    for _ in 0..10 {
        let response = fixture
            .client
            .get(fixture.url("/health"))
            .header("x-forwarded-for", "203.0.113.7")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let limited = fixture
        .client
        .get(fixture.url("/health"))
        .header("x-forwarded-for", "203.0.113.7")
        .send()
        .await
        .unwrap();
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

    let other = fixture
        .client
        .get(fixture.url("/health"))
        .header("x-forwarded-for", "198.51.100.9")
        .send()
        .await
        .unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_separate_servers_keep_separate_counters() {
    let first = TestFixture::new().await;
    let second = TestFixture::new().await;

    for _ in 0..10 {
        assert_eq!(first.get("/health").await.status(), StatusCode::OK);
    }
    assert_eq!(
        first.get("/health").await.status(),
        StatusCode::TOO_MANY_REQUESTS
    );

    // Same client, same clock reading, different AppState.
    assert_eq!(second.get("/health").await.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_untrusted_peer_cannot_rotate_forwarded_for() {
    // The test client connects from 127.0.0.1, outside the trusted range.
    let fixture = TestFixture::with_config(|config| {
        config.trusted_proxies = vec!["10.0.0.0/8".to_string()];
    })
    .await;

    let mut statuses = Vec::new();
    for i in 0..11 {
        let response = fixture
            .client
            .get(fixture.url("/health"))
            .header("x-forwarded-for", format!("203.0.113.{i}"))
            .send()
            .await
            .unwrap();
        statuses.push(response.status());
    }

    assert!(statuses[..10].iter().all(|s| *s == StatusCode::OK));
    assert_eq!(statuses[10], StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_health_polling_bounded_by_global_hourly_limit() {
    let fixture = TestFixture::new().await;

    // Ten checks a minute for six minutes stays under the health scope but
    // crosses the global 50/hour allowance.
    let mut admitted = 0;
    for _ in 0..6 {
        for _ in 0..10 {
            if fixture.get("/health").await.status() == StatusCode::OK {
                admitted += 1;
            }
        }
        fixture.clock.advance(60);
    }

    assert_eq!(admitted, 50);
}

#[tokio::test]
async fn test_rate_limit_disabled() {
    let fixture = TestFixture::with_config(|config| config.rate_limit_enabled = false).await;

    for _ in 0..15 {
        assert_eq!(fixture.get("/health").await.status(), StatusCode::OK);
    }
}

// =============================================================================
// Security Headers
// =============================================================================

#[tokio::test]
async fn test_hsts_only_over_https() {
    let fixture = TestFixture::new().await;

    let plain = fixture.get("/css/site.css").await;
    assert!(plain.headers().get("strict-transport-security").is_none());

    let forwarded = fixture
        .client
        .get(fixture.url("/css/site.css"))
        .header("x-forwarded-proto", "https")
        .send()
        .await
        .unwrap();
    assert_eq!(
        forwarded.headers().get("strict-transport-security").unwrap(),
        "max-age=31536000; includeSubDomains"
    );
}

#[tokio::test]
async fn test_nonces_distinct_and_rendered_into_index() {
    let fixture = TestFixture::new().await;

    let first = fixture.get("/").await;
    let second = fixture.get("/").await;

    let first_nonce = csp_nonce(&first);
    let second_nonce = csp_nonce(&second);
    assert_ne!(first_nonce, second_nonce);

    let body = first.text().await.unwrap();
    assert!(body.contains(&format!(r#"<script nonce="{first_nonce}">"#)));
}

#[tokio::test]
async fn test_request_id_echoed() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .get(fixture.url("/health"))
        .header("x-request-id", "trace-abc-123")
        .send()
        .await
        .unwrap();

    assert_eq!(response.headers().get("x-request-id").unwrap(), "trace-abc-123");
}

#[tokio::test]
async fn test_force_https_redirects() {
    let fixture = TestFixture::with_config(|config| config.force_https = true).await;

    let response = fixture.get("/css/site.css?v=1").await;

    assert_eq!(response.status(), StatusCode::FOUND);
    let location = response.headers().get("location").unwrap().to_str().unwrap();
    assert!(location.starts_with("https://127.0.0.1:"));
    assert!(location.ends_with("/css/site.css?v=1"));
    assert!(response.headers().get("strict-transport-security").is_some());
}

// =============================================================================
// CSRF
// =============================================================================

#[tokio::test]
async fn test_post_without_token_forbidden() {
    let fixture = TestFixture::new().await;

    let response = fixture
        .client
        .post(fixture.url("/contact"))
        .form(&[("name", "Ada")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_security_headers(&response);
    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["error"], "csrf_failed");
}

#[tokio::test]
async fn test_index_issues_session_cookie() {
    let fixture = TestFixture::new().await;

    let response = fixture.get("/").await;

    let set_cookie = response
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap();
    assert!(set_cookie.starts_with("session_id="));
    assert!(set_cookie.contains("HttpOnly"));
    assert!(set_cookie.contains("SameSite=Lax"));
    assert!(set_cookie.contains("Max-Age=86400"));
}

#[tokio::test]
async fn test_valid_token_passes_once() {
    let fixture = TestFixture::new().await;

    let index = fixture.get("/").await;
    let cookie = session_cookie(&index);
    let token = csrf_token_from(&index.text().await.unwrap());
    assert!(!token.is_empty());

    // No POST route exists, so getting past CSRF yields 405.
    let accepted = fixture
        .client
        .post(fixture.url("/contact"))
        .header("cookie", &cookie)
        .header("x-csrftoken", &token)
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), StatusCode::METHOD_NOT_ALLOWED);

    let replayed = fixture
        .client
        .post(fixture.url("/contact"))
        .header("cookie", &cookie)
        .header("x-csrftoken", &token)
        .send()
        .await
        .unwrap();
    assert_eq!(replayed.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_form_field_token_accepted() {
    let fixture = TestFixture::new().await;

    let index = fixture.get("/").await;
    let cookie = session_cookie(&index);
    let token = csrf_token_from(&index.text().await.unwrap());

    let response = fixture
        .client
        .post(fixture.url("/contact"))
        .header("cookie", &cookie)
        .form(&[("csrf_token", token.as_str()), ("message", "hello")])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn test_token_from_other_session_rejected() {
    let fixture = TestFixture::new().await;

    let first = fixture.get("/").await;
    let token = csrf_token_from(&first.text().await.unwrap());

    let second = fixture.get("/").await;
    let other_cookie = session_cookie(&second);

    let response = fixture
        .client
        .post(fixture.url("/contact"))
        .header("cookie", &other_cookie)
        .header("x-csrftoken", &token)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_csrf_disabled_lets_post_through() {
    let fixture = TestFixture::with_config(|config| config.csrf_enabled = false).await;

    let response = fixture.client.post(fixture.url("/contact")).send().await.unwrap();

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
}
