use std::time::Duration;

// user agent used for outgoing HTTP(s) requests to backends and the IdP
pub const REQUEST_USER_AGENT: &str = "nexus/0.3";

// upstream connect timeout
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

// time allowed for an upstream to produce response headers
pub const FIRST_BYTE_TIMEOUT: Duration = Duration::from_secs(30);

// total budget for a non-streaming upstream response body
pub const UPSTREAM_TOTAL_TIMEOUT: Duration = Duration::from_secs(300);

// bound on the online token revocation check against the auth service
pub const TOKEN_VALIDATE_TIMEOUT: Duration = Duration::from_secs(2);

// bound on the authorization-code exchange with the IdP / auth service
pub const TOKEN_EXCHANGE_TIMEOUT: Duration = Duration::from_secs(5);

// bound on a JWKS document fetch
pub const JWKS_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

// bound on the per-user theme lookup; failures fall back to the default theme
pub const THEME_TIMEOUT: Duration = Duration::from_millis(500);

// idle connections kept per backend origin
pub const UPSTREAM_POOL_IDLE: usize = 64;

// concurrent in-flight requests allowed per backend origin
pub const UPSTREAM_MAX_INFLIGHT: usize = 256;
