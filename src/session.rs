//! Stateless browser sessions carried in an encrypted cookie.
//!
//! The server keeps no session table: everything lives in a single
//! AEAD-encrypted, authenticated cookie (`nexus_session`). The payload is
//! versioned JSON so the format can evolve without invalidating deployed
//! sessions out-of-band. A cookie that fails authentication is treated as
//! absent — never an error.

use axum::http::{HeaderMap, HeaderValue, header};
use cookie::{Cookie, CookieJar, Key, SameSite};
use serde::{Deserialize, Serialize};

use crate::config::defaults;

/// Current payload format version.
const PAYLOAD_VERSION: u8 = 1;

/// Browsers drop cookies past 4 KiB; refuse to emit one that large.
const MAX_COOKIE_BYTES: usize = 4096;

/// Ephemeral state for an authorization-code flow in flight.
///
/// Created by `/login`, consumed (and destroyed) by `/auth-callback`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OauthFlow {
    /// Anti-CSRF state mirrored through the IdP.
    pub state: String,
    /// PKCE code verifier for the token exchange.
    pub code_verifier: String,
    /// Local path+query to land on after login.
    pub target: String,
}

/// Decrypted per-browser session payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Bearer token issued by the auth service, if logged in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// In-flight OAuth2 flow, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<OauthFlow>,
}

impl SessionState {
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.oauth.is_none()
    }
}

/// Versioned on-the-wire envelope around `SessionState`.
#[derive(Serialize, Deserialize)]
struct Envelope {
    v: u8,
    session: SessionState,
}

/// Encrypts, decrypts, and serializes the session cookie.
#[derive(Clone)]
pub struct SessionStore {
    key: Key,
    secure: bool,
}

impl SessionStore {
    /// Derive the cookie key from the configured secret (>= 32 bytes,
    /// enforced at startup).
    pub fn new(secret: &str, secure: bool) -> Self {
        Self {
            key: Key::derive_from(secret.as_bytes()),
            secure,
        }
    }

    /// Decrypt the session from request headers.
    ///
    /// Missing cookie, failed MAC, unknown version, and malformed payload
    /// all yield an empty session.
    pub fn load(&self, headers: &HeaderMap) -> SessionState {
        let mut jar = CookieJar::new();
        for value in headers.get_all(header::COOKIE) {
            let Ok(raw) = value.to_str() else { continue };
            for piece in Cookie::split_parse(raw.to_string()).flatten() {
                jar.add_original(piece.into_owned());
            }
        }

        let Some(cookie) = jar.private(&self.key).get(defaults::default_session_cookie_name())
        else {
            return SessionState::default();
        };

        match serde_json::from_str::<Envelope>(cookie.value()) {
            Ok(env) if env.v == PAYLOAD_VERSION => env.session,
            Ok(env) => {
                tracing::debug!("Discarding session cookie with payload version {}", env.v);
                SessionState::default()
            }
            Err(e) => {
                tracing::debug!("Discarding undecodable session cookie: {}", e);
                SessionState::default()
            }
        }
    }

    /// Encrypt `state` into a `Set-Cookie` header value.
    ///
    /// Returns `None` (and logs) when the encrypted cookie would exceed the
    /// 4 KiB browser limit — emitting it would only get it dropped silently.
    pub fn save(&self, state: &SessionState) -> Option<HeaderValue> {
        let payload = serde_json::to_string(&Envelope {
            v: PAYLOAD_VERSION,
            session: state.clone(),
        })
        .ok()?;

        let cookie = self
            .base_cookie(payload)
            .max_age(cookie::time::Duration::seconds(
                defaults::default_session_ttl_secs(),
            ))
            .build();

        let mut jar = CookieJar::new();
        jar.private_mut(&self.key).add(cookie);
        let sealed = jar
            .get(defaults::default_session_cookie_name())
            .expect("cookie just added")
            .to_string();

        if sealed.len() > MAX_COOKIE_BYTES {
            tracing::warn!(
                "Session cookie would be {} bytes (limit {}); not setting it",
                sealed.len(),
                MAX_COOKIE_BYTES
            );
            return None;
        }

        sealed.parse().ok()
    }

    /// An expired `Set-Cookie` header value that removes the session.
    pub fn clear(&self) -> HeaderValue {
        let cookie = self
            .base_cookie(String::new())
            .max_age(cookie::time::Duration::ZERO)
            .build();
        cookie
            .to_string()
            .parse()
            .expect("removal cookie is always a valid header value")
    }

    fn base_cookie(&self, value: String) -> cookie::CookieBuilder<'static> {
        Cookie::build((defaults::default_session_cookie_name(), value))
            .path("/")
            .http_only(true)
            .same_site(SameSite::Lax)
            .secure(self.secure)
    }
}
