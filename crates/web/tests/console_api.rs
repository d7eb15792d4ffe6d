//! End-to-end checks of the console router against a mocked cloud API.

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;
use wiremock::matchers::{body_partial_json, header as header_is, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nexis_web::{ConsoleConfig, WebServer};

const CSRF: &str = "csrf-test-token";

struct Harness {
    router: Router,
    _data: TempDir,
}

fn harness(cloud: &MockServer, tweak: impl FnOnce(&mut ConsoleConfig)) -> Harness {
    let data = TempDir::new().unwrap();
    let mut config = ConsoleConfig {
        cloud_api_url: cloud.uri(),
        data_dir: data.path().to_path_buf(),
        templates_dir: data.path().join("templates"),
        ..ConsoleConfig::default()
    };
    tweak(&mut config);
    Harness {
        router: WebServer::new(config).router(),
        _data: data,
    }
}

fn request(method: &str, uri: &str, cookie: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(cookie) = cookie {
        builder = builder.header(header::COOKIE, cookie);
    }
    if method != "GET" {
        builder = builder.header("x-csrf-token", CSRF);
    }
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

fn session_cookie(api_key: &str) -> String {
    format!("nexis_csrf={CSRF}; nexis_api_key={api_key}")
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn set_cookies(response: &axum::response::Response) -> Vec<String> {
    response
        .headers()
        .get_all(header::SET_COOKIE)
        .iter()
        .map(|v| v.to_str().unwrap().to_string())
        .collect()
}

#[tokio::test]
async fn test_csrf_endpoint_issues_readable_cookie() {
    let cloud = MockServer::start().await;
    let h = harness(&cloud, |_| {});

    let response = h.router.oneshot(request("GET", "/api/auth/csrf", None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CACHE_CONTROL], "no-store");
    let cookies = set_cookies(&response);
    assert_eq!(cookies.len(), 1);
    assert!(cookies[0].starts_with("nexis_csrf="));
    assert!(cookies[0].contains("Max-Age=14400"));
    assert!(!cookies[0].contains("HttpOnly"));

    let body = json_body(response).await;
    assert_eq!(body["token"].as_str().unwrap().len(), 36);
}

#[tokio::test]
async fn test_csrf_cookie_is_reused() {
    let cloud = MockServer::start().await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .oneshot(request("GET", "/api/auth/csrf", Some("nexis_csrf=existing"), None))
        .await
        .unwrap();
    assert_eq!(json_body(response).await["token"], "existing");
}

#[tokio::test]
async fn test_mutation_without_csrf_is_forbidden() {
    let cloud = MockServer::start().await;
    let h = harness(&cloud, |_| {});

    let req = Request::builder()
        .method("POST")
        .uri("/api/auth/logout")
        .header(header::COOKIE, "nexis_csrf=a")
        .header("x-csrf-token", "b")
        .body(Body::empty())
        .unwrap();
    let response = h.router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(json_body(response).await["error"], "Invalid CSRF token");
}

#[tokio::test]
async fn test_api_key_login_sets_session_cookie() {
    let cloud = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/me"))
        .and(header_is("X-API-Key", "phak_good"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"username": "ada"})))
        .mount(&cloud)
        .await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .clone()
        .oneshot(request(
            "POST",
            "/api/auth/api-key",
            Some(&format!("nexis_csrf={CSRF}")),
            Some(json!({"apiKey": "  phak_good "})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookies = set_cookies(&response);
    assert!(cookies[0].starts_with("nexis_api_key=phak_good;"));
    assert!(cookies[0].contains("HttpOnly"));
    assert!(cookies[0].contains("Max-Age=604800"));
    assert_eq!(json_body(response).await["user"]["username"], "ada");

    let response = h
        .router
        .oneshot(request("GET", "/api/auth/session", Some(&session_cookie("phak_good")), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["authMethod"], "api-key");
    assert_eq!(body["hasApiKey"], true);
}

#[tokio::test]
async fn test_rejected_key_is_cleared() {
    let cloud = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/auth/me"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({"detail": "bad key"})))
        .mount(&cloud)
        .await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .oneshot(request(
            "POST",
            "/api/auth/api-key",
            Some(&format!("nexis_csrf={CSRF}")),
            Some(json!({"apiKey": "phak_bad"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(set_cookies(&response)[0].contains("Max-Age=0"));
    assert_eq!(json_body(response).await["error"], "Invalid API key");
}

#[tokio::test]
async fn test_commit_guard_rejects_incomplete_body() {
    let cloud = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/cvms"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&cloud)
        .await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .oneshot(request(
            "POST",
            "/api/cvms",
            Some(&session_cookie("phak_good")),
            Some(json!({"app_id": "app_1", "compose_hash": "  "})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_state_stream_passes_through() {
    let cloud = MockServer::start().await;
    let events = "event: state\ndata: {\"status\":\"starting\"}\n\nevent: complete\ndata: {\"status\":\"running\"}\n\n";
    Mock::given(method("GET"))
        .and(path("/cvms/app_1/state"))
        .and(query_param("target", "running"))
        .and(header_is("X-API-Key", "phak_good"))
        .and(header_is("X-Phala-Version", "2025-10-28"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(events, "text/event-stream"),
        )
        .mount(&cloud)
        .await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .oneshot(request(
            "GET",
            "/api/cvms/app_1/state?target=running",
            Some(&session_cookie("phak_good")),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()[header::CONTENT_TYPE], "text/event-stream");
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(std::str::from_utf8(&bytes).unwrap(), events);
}

#[tokio::test]
async fn test_unconfigured_service_is_501() {
    let cloud = MockServer::start().await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .oneshot(request("GET", "/api/billing/summary", Some(&session_cookie("phak_good")), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
    assert_eq!(json_body(response).await["error"], "Billing service is not configured");
}

#[tokio::test]
async fn test_metrics_report_unconfigured_inline() {
    let cloud = MockServer::start().await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .oneshot(request("GET", "/api/metrics/billing", Some(&session_cookie("phak_good")), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert!(body["summary"].is_null());
    assert_eq!(body["error"], "Billing service is not configured.");
}

#[tokio::test]
async fn test_local_team_is_created_for_caller() {
    let cloud = MockServer::start().await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .clone()
        .oneshot(request("GET", "/api/team", Some(&session_cookie("phak_owner")), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let team = json_body(response).await["team"].clone();
    assert_eq!(team["members"].as_array().unwrap().len(), 1);
    assert_eq!(team["members"][0]["role"], "admin");

    let response = h
        .router
        .oneshot(request(
            "POST",
            "/api/team/invite",
            Some(&session_cookie("phak_owner")),
            Some(json!({"email": "new@example.com", "role": "owner"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "Invalid role.");
}

#[tokio::test]
async fn test_team_requires_session() {
    let cloud = MockServer::start().await;
    let h = harness(&cloud, |_| {});

    let response = h.router.oneshot(request("GET", "/api/team", None, None)).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_templates_from_directory() {
    let cloud = MockServer::start().await;
    let h = harness(&cloud, |config| {
        let dir = config.data_dir.join("templates/eliza");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("docker-compose.yml"), "services: {}\n").unwrap();
    });

    let response = h
        .router
        .clone()
        .oneshot(request("GET", "/api/templates", None, None))
        .await
        .unwrap();
    let body = json_body(response).await;
    assert_eq!(body["templates"][0]["slug"], "eliza");
    assert_eq!(body["templates"][0]["name"], "Eliza");

    let response = h
        .router
        .oneshot(request("GET", "/api/templates/missing", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_dashboard_redirects_without_session() {
    let cloud = MockServer::start().await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .clone()
        .oneshot(request("GET", "/dashboard/billing", None, None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
    assert_eq!(response.headers()[header::LOCATION], "/login?redirect=%2Fdashboard%2Fbilling");

    let response = h.router.oneshot(request("GET", "/dashboard", None, None)).await.unwrap();
    assert_eq!(response.headers()[header::LOCATION], "/login");
}

#[tokio::test]
async fn test_privy_mode_ignores_api_key_cookie_on_dashboard() {
    let cloud = MockServer::start().await;
    let h = harness(&cloud, |config| config.privy_app_id = Some("app".into()));

    let response = h
        .router
        .oneshot(request("GET", "/dashboard/instances", Some(&session_cookie("phak_good")), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
}

#[tokio::test]
async fn test_instances_page_renders_escaped_rows() {
    let cloud = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cvms/paginated"))
        .and(query_param("page", "2"))
        .and(query_param("page_size", "5"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "items": [{"id": "app_1", "name": "<script>x</script>", "status": "running"}],
            "total": 6, "page": 2, "page_size": 5, "pages": 2
        })))
        .mount(&cloud)
        .await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .oneshot(request(
            "GET",
            "/dashboard/instances?page=2&page_size=5",
            Some(&session_cookie("phak_good")),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let html = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(html.contains("&lt;script&gt;x&lt;/script&gt;"));
    assert!(html.contains("Previous"));
    assert!(!html.contains("Next</a>"));
}

async fn text_body(response: axum::response::Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    String::from_utf8(bytes.to_vec()).unwrap()
}

async fn mount_nodes(cloud: &MockServer, nodes: Value) {
    Mock::given(method("GET"))
        .and(path("/teepods/available"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "nodes": nodes })))
        .mount(cloud)
        .await;
}

#[tokio::test]
async fn test_deploy_provision_rejects_onchain_kms_node() {
    let cloud = MockServer::start().await;
    mount_nodes(&cloud, json!([{"teepod_id": 7, "name": "kms", "support_onchain_kms": true}])).await;
    Mock::given(method("POST"))
        .and(path("/cvms/provision"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&cloud)
        .await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .oneshot(request(
            "POST",
            "/api/deploy/provision",
            Some(&session_cookie("phak_good")),
            Some(json!({"name": "web", "node_id": "7"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["error"].as_str().unwrap().contains("on-chain KMS"));
}

#[tokio::test]
async fn test_deploy_provision_forwards_draft() {
    let cloud = MockServer::start().await;
    mount_nodes(&cloud, json!([{"teepod_id": 2, "name": "us-1", "support_onchain_kms": false}])).await;
    Mock::given(method("POST"))
        .and(path("/cvms/provision"))
        .and(header_is("X-API-Key", "phak_good"))
        .and(body_partial_json(json!({
            "name": "web",
            "teepod_id": 2,
            "env_keys": ["API_TOKEN"],
            "compose_file": {"name": "web", "allowed_envs": ["API_TOKEN"]}
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "app_id": "app_9", "compose_hash": "h1", "app_env_encrypt_pubkey": "ab".repeat(32)
        })))
        .expect(1)
        .mount(&cloud)
        .await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .oneshot(request(
            "POST",
            "/api/deploy/provision",
            Some(&session_cookie("phak_good")),
            Some(json!({"name": " web ", "node_id": "2", "env_keys": "API_TOKEN"})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    assert_eq!(body["app_id"], "app_9");
    assert_eq!(body["compose_hash"], "h1");
}

#[tokio::test]
async fn test_deploy_page_reports_missing_template_and_options() {
    let cloud = MockServer::start().await;
    mount_nodes(&cloud, json!([{"teepod_id": 2, "name": "us-1", "support_onchain_kms": false}])).await;
    Mock::given(method("GET"))
        .and(path("/instance-types"))
        .respond_with(ResponseTemplate::new(503).set_body_json(json!({"error": "Catalog offline"})))
        .mount(&cloud)
        .await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .oneshot(request(
            "GET",
            "/dashboard/deploy?template=missing",
            Some(&session_cookie("phak_good")),
            None,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let html = text_body(response).await;
    assert!(html.contains("Template missing not found."));
    assert!(html.contains("You can still deploy with manual inputs."));
    assert!(html.contains("us-1 (ID 2)"));
    assert!(html.contains(r#"<input name="instance_type""#));
    assert!(html.contains("nexis_deploy_draft_v2"));
}

#[tokio::test]
async fn test_instance_logs_fragment_renders_text() {
    let cloud = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cvms/app_1/logs"))
        .respond_with(ResponseTemplate::new(200).set_body_raw("boot\n<ready>", "text/plain"))
        .mount(&cloud)
        .await;
    Mock::given(method("GET"))
        .and(path("/cvms/app_1/stats"))
        .respond_with(ResponseTemplate::new(403).set_body_json(json!({"error": "Stats are private"})))
        .mount(&cloud)
        .await;
    let h = harness(&cloud, |_| {});
    let cookie = session_cookie("phak_good");

    let response = h
        .router
        .clone()
        .oneshot(request("GET", "/dashboard/instances/app_1/logs", Some(&cookie), None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(text_body(response).await, "<pre class=\"logs\">boot\n&lt;ready&gt;</pre>");

    let response = h
        .router
        .oneshot(request("GET", "/dashboard/instances/app_1/metrics", Some(&cookie), None))
        .await
        .unwrap();
    assert_eq!(text_body(response).await, r#"<p class="error">Stats are private</p>"#);
}

#[tokio::test]
async fn test_instance_page_renders_actions_and_private_panels() {
    let cloud = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/cvms/app_1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "app_id": "app_1", "name": "web", "status": "stopped",
            "public_logs": false, "public_sysinfo": true
        })))
        .mount(&cloud)
        .await;
    let h = harness(&cloud, |_| {});

    let response = h
        .router
        .oneshot(request("GET", "/dashboard/instances/app_1", Some(&session_cookie("phak_good")), None))
        .await
        .unwrap();
    let html = text_body(response).await;
    assert!(html.contains(r#"data-action="start">Start"#));
    assert!(html.contains(r#"data-action="stop" disabled>Stop"#));
    assert!(html.contains("Logs are private for this CVM."));
    assert!(html.contains(r#"data-src="/dashboard/instances/app_1/metrics""#));
}

#[tokio::test]
async fn test_account_pages_render_for_api_key_session() {
    let cloud = MockServer::start().await;
    let h = harness(&cloud, |_| {});
    let cookie = session_cookie("phak_good");

    for (uri, marker) in [
        ("/dashboard/teams", "invite-form"),
        ("/dashboard/settings", "Profile editing requires a Privy sign-in."),
        ("/dashboard/agents", "No templates available."),
    ] {
        let response = h.router.clone().oneshot(request("GET", uri, Some(&cookie), None)).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK, "{uri}");
        assert!(text_body(response).await.contains(marker), "{uri}");
    }
}

#[tokio::test]
async fn test_root_redirects_to_dashboard() {
    let cloud = MockServer::start().await;
    let h = harness(&cloud, |_| {});

    let response = h.router.oneshot(request("GET", "/", None, None)).await.unwrap();
    assert_eq!(response.headers()[header::LOCATION], "/dashboard");
}
