//! Bearer-token validation against the auth service.
//!
//! Tokens are RS256 JWTs minted by the Core auth service. Validation is
//! two-phase: an offline signature/claims check against a cached JWKS, then
//! an online non-revocation check. The JWKS cache refreshes on a `kid`
//! miss; concurrent misses coalesce onto a single in-flight refresh that
//! runs as a spawned task, so it completes and publishes its result even if
//! the request that triggered it goes away.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, decode_header};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use thiserror::Error;
use url::Url;

use crate::registry::PermissionLevel;
use crate::server::constants;

/// Identity derived from a validated token. Reconstructed per request,
/// never persisted.
#[derive(Debug, Clone)]
pub struct UserClaims {
    pub subject: String,
    pub email: String,
    pub permission_level: PermissionLevel,
    pub expires_at: DateTime<Utc>,
    pub token_id: String,
}

/// Wire claims of a gateway JWT.
#[derive(Debug, Deserialize)]
struct TokenClaims {
    sub: String,
    email: String,
    permission_level: PermissionLevel,
    exp: u64,
    #[serde(default)]
    jti: String,
}

/// Body of `POST /api/token/validate` responses.
#[derive(Debug, Deserialize)]
struct ValidateResponse {
    #[serde(default)]
    valid: bool,
    #[serde(default)]
    revoked: bool,
}

#[derive(Debug, Clone, Error)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,

    #[error("token expired")]
    Expired,

    #[error("bad token signature")]
    BadSignature,

    #[error("no JWKS key for kid {0:?}")]
    UnknownKid(String),

    #[error("token revoked")]
    Revoked,

    #[error("token issuer mismatch")]
    IssuerMismatch,

    #[error("auth service unreachable: {0}")]
    AuthServiceUnreachable(String),

    #[error("JWKS refresh failed: {0}")]
    JwksUnavailable(String),
}

type RefreshFuture = Shared<BoxFuture<'static, Result<(), String>>>;

/// JWKS key cache shared by all requests.
struct JwksCache {
    http: reqwest::Client,
    jwks_url: Url,
    keys: RwLock<HashMap<String, DecodingKey>>,
    inflight: tokio::sync::Mutex<Option<RefreshFuture>>,
}

impl JwksCache {
    fn key_for(&self, kid: &str) -> Option<DecodingKey> {
        self.keys
            .read()
            .expect("jwks lock poisoned")
            .get(kid)
            .cloned()
    }

    /// Fetch the JWKS document and replace the key map.
    async fn fetch(self: &Arc<Self>) -> Result<(), String> {
        let resp = self
            .http
            .get(self.jwks_url.clone())
            .timeout(constants::JWKS_FETCH_TIMEOUT)
            .send()
            .await
            .map_err(|e| e.to_string())?
            .error_for_status()
            .map_err(|e| e.to_string())?;
        let jwks: JwkSet = resp.json().await.map_err(|e| e.to_string())?;

        let mut map = HashMap::new();
        for jwk in &jwks.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                continue;
            };
            if !matches!(jwk.algorithm, AlgorithmParameters::RSA(_)) {
                tracing::debug!("Ignoring non-RSA JWKS key {}", kid);
                continue;
            }
            match DecodingKey::from_jwk(jwk) {
                Ok(key) => {
                    map.insert(kid, key);
                }
                Err(e) => tracing::warn!("Skipping undecodable JWKS key {}: {}", kid, e),
            }
        }
        if map.is_empty() {
            return Err("JWKS document contained no usable RSA keys".to_string());
        }

        let count = map.len();
        *self.keys.write().expect("jwks lock poisoned") = map;
        tracing::debug!("JWKS refreshed, {} key(s)", count);
        Ok(())
    }

    /// Refresh the cache, coalescing with any refresh already in flight.
    ///
    /// The actual fetch runs in a spawned task: waiters share its outcome,
    /// and a waiter being dropped does not cancel the fetch.
    async fn refresh(self: &Arc<Self>) -> Result<(), String> {
        let fut = {
            let mut inflight = self.inflight.lock().await;
            if let Some(f) = inflight.as_ref() {
                f.clone()
            } else {
                let cache = Arc::clone(self);
                let task = tokio::spawn(async move {
                    let res = cache.fetch().await;
                    *cache.inflight.lock().await = None;
                    res
                });
                let f: RefreshFuture = async move {
                    match task.await {
                        Ok(res) => res,
                        Err(e) => Err(format!("JWKS refresh task failed: {}", e)),
                    }
                }
                .boxed()
                .shared();
                *inflight = Some(f.clone());
                f
            }
        };
        fut.await
    }
}

/// Validates bearer tokens: offline JWT verification plus the online
/// revocation check.
pub struct TokenValidator {
    http: reqwest::Client,
    validate_url: Url,
    issuer: String,
    jwks: Arc<JwksCache>,
}

impl TokenValidator {
    pub fn new(http: reqwest::Client, auth_service_url: &Url, issuer: String) -> Self {
        let jwks_url = auth_service_url
            .join("/.well-known/jwks.json")
            .expect("auth service URL is absolute");
        let validate_url = auth_service_url
            .join("/api/token/validate")
            .expect("auth service URL is absolute");
        Self {
            http: http.clone(),
            validate_url,
            issuer,
            jwks: Arc::new(JwksCache {
                http,
                jwks_url,
                keys: RwLock::new(HashMap::new()),
                inflight: tokio::sync::Mutex::new(None),
            }),
        }
    }

    /// Validate `token` and derive the caller's identity.
    ///
    /// A transport failure while checking revocation is a hard failure for
    /// this request; the gateway fails closed.
    pub async fn validate(&self, token: &str) -> Result<UserClaims, AuthError> {
        let header = decode_header(token).map_err(|_| AuthError::Malformed)?;
        if header.alg != Algorithm::RS256 {
            return Err(AuthError::BadSignature);
        }
        let kid = header.kid.ok_or(AuthError::Malformed)?;

        let key = match self.jwks.key_for(&kid) {
            Some(key) => key,
            None => {
                self.jwks
                    .refresh()
                    .await
                    .map_err(AuthError::JwksUnavailable)?;
                self.jwks
                    .key_for(&kid)
                    .ok_or_else(|| AuthError::UnknownKid(kid.clone()))?
            }
        };

        let mut validation = Validation::new(Algorithm::RS256);
        validation.leeway = 60;
        validation.validate_aud = false;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        let data = decode::<TokenClaims>(token, &key, &validation).map_err(|e| {
            use jsonwebtoken::errors::ErrorKind;
            match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidIssuer => AuthError::IssuerMismatch,
                ErrorKind::InvalidSignature => AuthError::BadSignature,
                ErrorKind::InvalidAlgorithm => AuthError::BadSignature,
                _ => AuthError::Malformed,
            }
        })?;

        self.check_revocation(token).await?;

        let claims = data.claims;
        Ok(UserClaims {
            subject: claims.sub,
            email: claims.email,
            permission_level: claims.permission_level,
            expires_at: DateTime::from_timestamp(claims.exp as i64, 0).unwrap_or_default(),
            token_id: claims.jti,
        })
    }

    async fn check_revocation(&self, token: &str) -> Result<(), AuthError> {
        let resp = self
            .http
            .post(self.validate_url.clone())
            .json(&serde_json::json!({ "token": token }))
            .timeout(constants::TOKEN_VALIDATE_TIMEOUT)
            .send()
            .await
            .map_err(|e| AuthError::AuthServiceUnreachable(e.to_string()))?;

        if resp.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(AuthError::Revoked);
        }
        if !resp.status().is_success() {
            return Err(AuthError::AuthServiceUnreachable(format!(
                "validate returned {}",
                resp.status()
            )));
        }

        let body: ValidateResponse = resp
            .json()
            .await
            .map_err(|e| AuthError::AuthServiceUnreachable(e.to_string()))?;
        if body.revoked || !body.valid {
            return Err(AuthError::Revoked);
        }
        Ok(())
    }
}
