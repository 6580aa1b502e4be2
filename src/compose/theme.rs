//! Per-user theme resolution.
//!
//! The composer asks the preferences backend (the registry entry named by
//! `THEME_SERVICE`) for the caller's theme. The lookup is bounded by a
//! short timeout and every failure mode — service missing, transport error,
//! non-2xx, malformed JSON, nonsense theme value — falls back to the
//! default theme. The call authenticates with a service-to-service token
//! minted by the auth service, cached until shortly before it expires.

use anyhow::Context;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use serde::Deserialize;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use url::Url;

use crate::server::constants;

pub const DEFAULT_THEME: &str = "light";

/// Fallback lifetime for a service token whose `exp` cannot be read.
const FALLBACK_TOKEN_TTL: Duration = Duration::from_secs(300);

/// Re-mint this long before the cached token expires.
const TOKEN_RENEWAL_MARGIN: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ThemeResponse {
    theme: String,
}

#[derive(Debug, Deserialize)]
struct ServiceTokenResponse {
    token: String,
}

struct CachedToken {
    token: String,
    expires_at: Instant,
}

/// Resolves user themes, holding the cached service-to-service token.
pub struct ThemeResolver {
    http: reqwest::Client,
    service_token_url: Url,
    cache: tokio::sync::Mutex<Option<CachedToken>>,
}

impl ThemeResolver {
    pub fn new(http: reqwest::Client, auth_service_url: &Url) -> Self {
        let service_token_url = auth_service_url
            .join("/api/service/token")
            .expect("auth service URL is absolute");
        Self {
            http,
            service_token_url,
            cache: tokio::sync::Mutex::new(None),
        }
    }

    /// The theme for `email`, or the default on any failure.
    pub async fn resolve(&self, origin: Option<&Url>, email: &str) -> String {
        let Some(origin) = origin else {
            return DEFAULT_THEME.to_string();
        };
        match tokio::time::timeout(constants::THEME_TIMEOUT, self.fetch_theme(origin, email)).await
        {
            Ok(Ok(theme)) if is_valid_theme(&theme) => theme,
            Ok(Ok(theme)) => {
                tracing::debug!("Ignoring implausible theme value {:?}", theme);
                DEFAULT_THEME.to_string()
            }
            Ok(Err(e)) => {
                tracing::debug!("Theme lookup failed: {:#}", e);
                DEFAULT_THEME.to_string()
            }
            Err(_) => {
                tracing::debug!("Theme lookup timed out");
                DEFAULT_THEME.to_string()
            }
        }
    }

    async fn fetch_theme(&self, origin: &Url, email: &str) -> anyhow::Result<String> {
        let url = origin
            .join("/api/public/user/theme")
            .context("building theme URL")?;
        let mut req = self.http.get(url).query(&[("email", email)]);
        if let Some(token) = self.service_token().await {
            req = req.bearer_auth(token);
        }
        let resp = req
            .send()
            .await
            .context("requesting theme")?
            .error_for_status()
            .context("theme endpoint status")?;
        let body: ThemeResponse = resp.json().await.context("decoding theme body")?;
        Ok(body.theme)
    }

    /// A service-to-service token, minted on demand and reused until close
    /// to expiry. Returns `None` when minting fails; the theme call then
    /// goes out unauthenticated and the backend decides.
    ///
    /// The cache mutex is held across the whole check-mint-store section:
    /// a burst of lookups arriving on an empty or expired cache serializes
    /// onto a single mint, and everyone behind the first caller finds the
    /// fresh token on their own re-check.
    async fn service_token(&self) -> Option<String> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref()
            && cached.expires_at > Instant::now()
        {
            return Some(cached.token.clone());
        }

        let resp = self
            .http
            .post(self.service_token_url.clone())
            .json(&serde_json::json!({ "service": "nexus" }))
            .timeout(constants::TOKEN_EXCHANGE_TIMEOUT)
            .send()
            .await
            .ok()?
            .error_for_status()
            .ok()?;
        let body: ServiceTokenResponse = resp.json().await.ok()?;

        let ttl = token_ttl(&body.token).unwrap_or(FALLBACK_TOKEN_TTL);
        let lifetime = ttl
            .saturating_sub(TOKEN_RENEWAL_MARGIN)
            .max(TOKEN_RENEWAL_MARGIN);
        *cache = Some(CachedToken {
            token: body.token.clone(),
            expires_at: Instant::now() + lifetime,
        });
        Some(body.token)
    }
}

/// Remaining lifetime of a JWT, read (unverified) from its `exp` claim.
/// The token comes from our own auth service over the internal network.
fn token_ttl(jwt: &str) -> Option<Duration> {
    let payload = jwt.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let value: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    let exp = value.get("exp")?.as_u64()?;
    let now = SystemTime::now().duration_since(UNIX_EPOCH).ok()?.as_secs();
    Some(Duration::from_secs(exp.saturating_sub(now)))
}

fn is_valid_theme(theme: &str) -> bool {
    !theme.is_empty()
        && theme.len() <= 32
        && theme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-')
}
