//! Token validator: JWKS caching with coalesced refresh, claim checks,
//! and the fail-closed revocation call.

mod common;

use std::time::Duration;

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde_json::json;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nexus::server::auth::{AuthError, TokenValidator};

async fn auth_mock(valid: bool, revoked: bool) -> MockServer {
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::keys().jwks.clone()))
        .mount(&auth)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/token/validate"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "valid": valid, "revoked": revoked })),
        )
        .mount(&auth)
        .await;
    auth
}

fn validator_for(auth: &MockServer) -> (TokenValidator, String) {
    let url = Url::parse(&auth.uri()).unwrap();
    let issuer = url.origin().ascii_serialization();
    (
        TokenValidator::new(reqwest::Client::new(), &url, issuer.clone()),
        issuer,
    )
}

#[tokio::test]
async fn valid_tokens_yield_claims() {
    let auth = auth_mock(true, false).await;
    let (validator, issuer) = validator_for(&auth);
    let token = common::sign_token(&issuer, "alice@example.com", "billing", 3600);

    let claims = validator.validate(&token).await.unwrap();
    assert_eq!(claims.email, "alice@example.com");
    assert_eq!(
        claims.permission_level,
        nexus::registry::PermissionLevel::Billing
    );
    assert_eq!(claims.token_id, "tok-test");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_kid_misses_share_one_refresh() {
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/jwks.json"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(common::keys().jwks.clone())
                .set_delay(Duration::from_millis(100)),
        )
        .expect(1)
        .mount(&auth)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/token/validate"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "valid": true, "revoked": false })),
        )
        .mount(&auth)
        .await;

    let (validator, issuer) = validator_for(&auth);
    let validator = std::sync::Arc::new(validator);
    let token = common::sign_token(&issuer, "alice@example.com", "user", 3600);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let validator = validator.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move { validator.validate(&token).await }));
    }
    for task in tasks {
        task.await.unwrap().expect("all waiters see the refreshed key");
    }

    // expect(1) on the JWKS mock: a second fetch would fail verification.
    auth.verify().await;
}

#[tokio::test]
async fn unknown_kid_is_rejected_after_refresh() {
    let auth = auth_mock(true, false).await;
    let (validator, issuer) = validator_for(&auth);

    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let claims = json!({
        "iss": issuer,
        "sub": "u",
        "email": "u@example.com",
        "permission_level": "user",
        "exp": now + 600,
    });
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some("not-a-known-kid".to_string());
    let key = EncodingKey::from_rsa_pem(common::keys().private_pem.as_bytes()).unwrap();
    let token = jsonwebtoken::encode(&header, &claims, &key).unwrap();

    let err = validator.validate(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::UnknownKid(_)), "got {err:?}");
}

#[tokio::test]
async fn wrong_issuer_is_rejected() {
    let auth = auth_mock(true, false).await;
    let (validator, _) = validator_for(&auth);
    let token = common::sign_token("http://some-other-issuer", "a@example.com", "user", 3600);

    let err = validator.validate(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::IssuerMismatch), "got {err:?}");
}

#[tokio::test]
async fn revoked_tokens_are_rejected() {
    let auth = auth_mock(true, true).await;
    let (validator, issuer) = validator_for(&auth);
    let token = common::sign_token(&issuer, "a@example.com", "user", 3600);

    let err = validator.validate(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::Revoked), "got {err:?}");
}

#[tokio::test]
async fn validate_401_means_revoked() {
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::keys().jwks.clone()))
        .mount(&auth)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/token/validate"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&auth)
        .await;

    let (validator, issuer) = validator_for(&auth);
    let token = common::sign_token(&issuer, "a@example.com", "user", 3600);
    let err = validator.validate(&token).await.unwrap_err();
    assert!(matches!(err, AuthError::Revoked), "got {err:?}");
}

#[tokio::test]
async fn unreachable_validate_endpoint_fails_closed() {
    // JWKS resolves but the validate endpoint has no mock: a 404 is not a
    // verdict, so validation must fail rather than soft-pass.
    let auth = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/.well-known/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(common::keys().jwks.clone()))
        .mount(&auth)
        .await;

    let (validator, issuer) = validator_for(&auth);
    let token = common::sign_token(&issuer, "a@example.com", "user", 3600);
    let err = validator.validate(&token).await.unwrap_err();
    assert!(
        matches!(err, AuthError::AuthServiceUnreachable(_)),
        "got {err:?}"
    );
}

#[tokio::test]
async fn garbage_tokens_are_malformed() {
    let auth = auth_mock(true, false).await;
    let (validator, _) = validator_for(&auth);

    let err = validator.validate("not-a-jwt").await.unwrap_err();
    assert!(matches!(err, AuthError::Malformed), "got {err:?}");
}
