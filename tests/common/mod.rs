//! Shared harness for gateway integration tests.
//!
//! Builds the real router around a wiremock auth service (JWKS, token
//! validation) and whatever backends a test registers. Tokens are signed
//! with a throwaway RS256 keypair generated once per test binary.

#![allow(dead_code)]

use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use axum::Router;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use clap::Parser as _;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use rsa::pkcs1::{EncodeRsaPrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::RsaPrivateKey;
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use nexus::config::{Args, GatewayConfig};
use nexus::registry::ServiceRegistry;
use nexus::server::service::build_router;
use nexus::session::{OauthFlow, SessionState};
use nexus::state::GatewayState;

pub const KID: &str = "gw-test-key";
pub const COOKIE_SECRET: &str = "integration-test-cookie-secret-0123456789";

/// Throwaway signing material shared by every test in a binary.
pub struct TestKeys {
    pub private_pem: String,
    pub jwks: serde_json::Value,
}

static KEYS: OnceLock<TestKeys> = OnceLock::new();

pub fn keys() -> &'static TestKeys {
    KEYS.get_or_init(|| {
        let mut rng = rand_core::OsRng;
        let key = RsaPrivateKey::new(&mut rng, 2048).expect("RSA keygen");
        let private_pem = key
            .to_pkcs1_pem(LineEnding::LF)
            .expect("PEM encoding")
            .to_string();
        let n = URL_SAFE_NO_PAD.encode(key.n().to_bytes_be());
        let e = URL_SAFE_NO_PAD.encode(key.e().to_bytes_be());
        let jwks = json!({
            "keys": [{
                "kty": "RSA",
                "use": "sig",
                "alg": "RS256",
                "kid": KID,
                "n": n,
                "e": e,
            }]
        });
        TestKeys { private_pem, jwks }
    })
}

/// Sign a gateway JWT for `issuer` with the shared test key.
pub fn sign_token(issuer: &str, email: &str, permission_level: &str, ttl_secs: i64) -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs() as i64;
    let claims = json!({
        "iss": issuer,
        "sub": format!("user-{}", email),
        "email": email,
        "permission_level": permission_level,
        "exp": now + ttl_secs,
        "iat": now,
        "jti": "tok-test",
    });
    let mut header = Header::new(Algorithm::RS256);
    header.kid = Some(KID.to_string());
    let key = EncodingKey::from_rsa_pem(keys().private_pem.as_bytes()).expect("encoding key");
    jsonwebtoken::encode(&header, &claims, &key).expect("token signing")
}

/// A gateway wired to a mock auth service, driven in-process.
pub struct TestGateway {
    pub state: Arc<GatewayState>,
    pub app: Router,
    pub auth: MockServer,
    /// `iss` value tokens must carry.
    pub issuer: String,
}

impl TestGateway {
    /// Sign a token this gateway will accept.
    pub fn token(&self, email: &str, permission_level: &str) -> String {
        sign_token(&self.issuer, email, permission_level, 3600)
    }

    /// `Cookie` header value holding an authenticated session.
    pub fn session_cookie(&self, token: &str) -> String {
        let session = SessionState {
            token: Some(token.to_string()),
            oauth: None,
        };
        set_cookie_to_pair(&self.state, &session)
    }

    /// `Cookie` header value holding an in-flight login.
    pub fn flow_cookie(&self, flow: OauthFlow) -> String {
        let session = SessionState {
            token: None,
            oauth: Some(flow),
        };
        set_cookie_to_pair(&self.state, &session)
    }
}

fn set_cookie_to_pair(state: &GatewayState, session: &SessionState) -> String {
    state
        .sessions
        .save(session)
        .expect("session fits in a cookie")
        .to_str()
        .unwrap()
        .split(';')
        .next()
        .unwrap()
        .to_string()
}

/// Gateway configuration pointing at the given auth service and IdP
/// origins.
pub fn make_config(auth_origin: &str, idp_origin: &str) -> GatewayConfig {
    let args = Args::parse_from([
        "nexus",
        "--listen-addr",
        "127.0.0.1:0",
        "--cookie-secret",
        COOKIE_SECRET,
        "--auth-service-url",
        auth_origin,
        "--idp-authorization-url",
        &format!("{}/realms/hive/auth", idp_origin),
        "--idp-token-url",
        &format!("{}/realms/hive/token", idp_origin),
        "--idp-end-session-url",
        &format!("{}/realms/hive/logout", idp_origin),
        "--idp-client-id",
        "nexus-gateway",
        "--idp-client-secret",
        "test-client-secret",
        "--public-origin",
        "https://hive.example.com",
    ]);
    GatewayConfig::from_args(args).expect("valid test config")
}

/// Start a mock auth service (JWKS + permissive token validation) and
/// assemble a gateway around `registry_doc`. The IdP origin defaults to an
/// unroutable host; tests exercising the broker or IdP proxy should use
/// [`gateway_with_idp`].
pub async fn gateway(registry_doc: &str) -> TestGateway {
    let auth = MockServer::start().await;
    mount_auth_defaults(&auth).await;
    gateway_around(auth, "http://idp.internal", registry_doc).await
}

/// Like [`gateway`], but with the IdP origin pointed at a caller-supplied
/// mock server.
pub async fn gateway_with_idp(idp_origin: &str, registry_doc: &str) -> TestGateway {
    let auth = MockServer::start().await;
    mount_auth_defaults(&auth).await;
    gateway_around(auth, idp_origin, registry_doc).await
}

/// Assemble a gateway around an auth mock the caller has already
/// configured (e.g. to report tokens as revoked).
pub async fn gateway_around(auth: MockServer, idp_origin: &str, registry_doc: &str) -> TestGateway {
    let config = make_config(&auth.uri(), idp_origin);
    let issuer = config.auth_issuer.clone();
    let registry = ServiceRegistry::parse(registry_doc).expect("valid test registry");
    let state = GatewayState::with_registry(config, registry).expect("gateway state");
    let app = build_router(state.clone());
    TestGateway {
        state,
        app,
        auth,
        issuer,
    }
}

/// Mount the JWKS document and an always-valid token validation endpoint.
pub async fn mount_auth_defaults(auth: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/.well-known/jwks.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(keys().jwks.clone()))
        .mount(auth)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/token/validate"))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "valid": true, "revoked": false })),
        )
        .mount(auth)
        .await;
}
