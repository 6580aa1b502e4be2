//! Backend reverse-proxy behavior: authentication gate, authorization,
//! prefix stripping, forwarded headers, and error mapping.

mod common;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use http_body_util::BodyExt;
use serde_json::json;
use tower::ServiceExt;
use wiremock::matchers::{header as h, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn registry_for(backend: &str) -> String {
    format!(
        r#"{{
            "codex": {{ "url": "{backend}", "visible": true }},
            "helm": {{ "url": "{backend}", "visible": true, "admin_only": true }}
        }}"#
    )
}

#[tokio::test]
async fn unauthenticated_requests_redirect_to_login() {
    let gw = common::gateway(&registry_for("http://127.0.0.1:1")).await;

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/codex/companies")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(
        resp.headers().get(header::LOCATION).unwrap(),
        "/login?next=%2Fcodex%2Fcompanies"
    );
}

#[tokio::test]
async fn login_redirect_preserves_query() {
    let gw = common::gateway(&registry_for("http://127.0.0.1:1")).await;

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/codex/companies?page=2")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(
        resp.headers().get(header::LOCATION).unwrap(),
        "/login?next=%2Fcodex%2Fcompanies%3Fpage%3D2"
    );
}

#[tokio::test]
async fn unknown_services_are_404() {
    let gw = common::gateway(&registry_for("http://127.0.0.1:1")).await;

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/nonexistent/thing")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn forwards_with_injected_headers_and_stripped_prefix() {
    let backend = MockServer::start().await;
    let gw = common::gateway(&registry_for(&backend.uri())).await;
    let token = gw.token("alice@example.com", "admin");

    Mock::given(method("GET"))
        .and(path("/companies"))
        .and(query_param("page", "2"))
        .and(h("authorization", format!("Bearer {}", token).as_str()))
        .and(h("x-forwarded-prefix", "/codex"))
        .and(h("x-forwarded-proto", "http"))
        .and(h("x-forwarded-host", "hive.example.com"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(1)
        .mount(&backend)
        .await;

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/codex/companies?page=2")
                .header(header::HOST, "hive.example.com")
                .header(header::COOKIE, gw.session_cookie(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body.as_ref(), br#"{"ok":true}"#);
    backend.verify().await;
}

#[tokio::test]
async fn bare_service_path_forwards_to_root() {
    let backend = MockServer::start().await;
    let gw = common::gateway(&registry_for(&backend.uri())).await;
    let token = gw.token("alice@example.com", "user");

    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("root"))
        .expect(1)
        .mount(&backend)
        .await;

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/codex")
                .header(header::COOKIE, gw.session_cookie(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    backend.verify().await;
}

#[tokio::test]
async fn request_bodies_and_methods_pass_through() {
    let backend = MockServer::start().await;
    let gw = common::gateway(&registry_for(&backend.uri())).await;
    let token = gw.token("alice@example.com", "user");

    Mock::given(method("PUT"))
        .and(path("/companies/7"))
        .and(wiremock::matchers::body_string("name=Initech"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&backend)
        .await;

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .method(Method::PUT)
                .uri("/codex/companies/7")
                .header(header::COOKIE, gw.session_cookie(&token))
                .body(Body::from("name=Initech"))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    backend.verify().await;
}

#[tokio::test]
async fn insufficient_permission_is_403() {
    let backend = MockServer::start().await;
    let gw = common::gateway(&registry_for(&backend.uri())).await;
    let token = gw.token("bob@example.com", "user");

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/helm/dashboard")
                .header(header::COOKIE, gw.session_cookie(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn revoked_tokens_clear_the_session_and_redirect() {
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::keys().jwks.clone()))
        .mount(&auth)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/token/validate"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "valid": true, "revoked": true })),
        )
        .mount(&auth)
        .await;

    let gw =
        common::gateway_around(auth, "http://idp.internal", &registry_for("http://127.0.0.1:1"))
            .await;
    let token = gw.token("alice@example.com", "admin");

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/codex/")
                .header(header::COOKIE, gw.session_cookie(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(
        resp.headers().get(header::LOCATION).unwrap(),
        "/login?next=%2Fcodex%2F"
    );
    let set_cookie = resp
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(set_cookie.contains("Max-Age=0"), "cookie not cleared: {set_cookie}");
}

#[tokio::test]
async fn expired_tokens_redirect_to_login() {
    let gw = common::gateway(&registry_for("http://127.0.0.1:1")).await;
    let token = common::sign_token(&gw.issuer, "alice@example.com", "admin", -7200);

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/codex/")
                .header(header::COOKIE, gw.session_cookie(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::FOUND);
    let set_cookie = resp
        .headers()
        .get(header::SET_COOKIE)
        .unwrap()
        .to_str()
        .unwrap();
    assert!(set_cookie.contains("Max-Age=0"));
}

#[tokio::test]
async fn unreachable_backend_is_502_with_chrome() {
    // Port 1 refuses connections immediately.
    let gw = common::gateway(&registry_for("http://127.0.0.1:1")).await;
    let token = gw.token("alice@example.com", "admin");

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/codex/")
                .header(header::COOKIE, gw.session_cookie(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::BAD_GATEWAY);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let html = std::str::from_utf8(&body).unwrap();
    // The error page is routed through the composer: theme default plus nav.
    assert!(html.contains(r#"data-theme="light""#), "no theme: {html}");
    assert!(html.contains("nexus-shell"), "no shell: {html}");
}

#[tokio::test]
async fn backend_5xx_html_passes_through_uncomposed() {
    let backend = MockServer::start().await;
    let gw = common::gateway(&registry_for(&backend.uri())).await;
    let token = gw.token("alice@example.com", "admin");

    Mock::given(method("GET"))
        .and(path("/boom"))
        .respond_with(
            ResponseTemplate::new(500)
                .set_body_raw("<html><body>backend exploded</body></html>", "text/html"),
        )
        .mount(&backend)
        .await;

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/codex/boom")
                .header(header::COOKIE, gw.session_cookie(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let html = std::str::from_utf8(&body).unwrap();
    assert!(!html.contains("nexus-shell"));
    assert_eq!(html, "<html><body>backend exploded</body></html>");
}

#[tokio::test]
async fn root_redirects_to_first_visible_service() {
    let gw = common::gateway(&registry_for("http://127.0.0.1:1")).await;
    let token = gw.token("alice@example.com", "admin");

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/")
                .header(header::COOKIE, gw.session_cookie(&token))
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "/codex/");
}

#[tokio::test]
async fn health_needs_no_session() {
    let gw = common::gateway(&registry_for("http://127.0.0.1:1")).await;

    let resp = gw
        .app
        .clone()
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    let parsed: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed, json!({ "status": "healthy" }));
}

#[tokio::test]
async fn builtin_stylesheets_are_served() {
    let gw = common::gateway(&registry_for("http://127.0.0.1:1")).await;

    for asset in ["/static/css/global.css", "/static/css/side-panel.css"] {
        let resp = gw
            .app
            .clone()
            .oneshot(Request::builder().uri(asset).body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "{asset}");
        assert!(
            resp.headers()
                .get(header::CONTENT_TYPE)
                .unwrap()
                .to_str()
                .unwrap()
                .starts_with("text/css")
        );
    }

    let resp = gw
        .app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/static/js/missing.js")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
}
