/**
 * Nexus configuration root module.
 *
 * - Defines the CLI/environment argument surface (`Args`) and the validated
 *   runtime configuration (`GatewayConfig`).
 * - Every setting is environment-driven; missing required values fail fast
 *   at startup with a configuration error (exit code 2).
 * - Uses `defaults.rs` for default helpers shared with tests.
 */
use clap::Parser;
use std::path::PathBuf;
use url::Url;

use crate::errors::StartupError;

pub mod defaults;

/// CLI arguments definition for the Nexus gateway.
///
/// This struct defines all command-line arguments and environment variables
/// supported by the gateway. Field documentation is used by Clap to generate
/// help text, so keep them in rustdoc format.
#[derive(Parser, Debug, Clone)]
#[command(name = "nexus", version, about = "Nexus edge gateway", long_about = None)]
pub struct Args {
    /// Socket address to listen on, e.g. "0.0.0.0:443"
    #[arg(long = "listen-addr", value_name = "ADDR", env = "LISTEN_ADDR")]
    pub listen_addr: String,

    /// Path to the PEM-encoded TLS certificate chain
    #[arg(long = "tls-cert", value_name = "FILE", env = "TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// Path to the PEM-encoded TLS private key
    #[arg(long = "tls-key", value_name = "FILE", env = "TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Secret used to encrypt and authenticate session cookies (>= 32 bytes)
    #[arg(
        long = "cookie-secret",
        value_name = "SECRET",
        env = "COOKIE_SECRET",
        hide_env_values = true
    )]
    pub cookie_secret: String,

    /// Base URL of the Core auth service
    #[arg(long = "auth-service-url", value_name = "URL", env = "AUTH_SERVICE_URL")]
    pub auth_service_url: Url,

    /// IdP authorization endpoint
    #[arg(
        long = "idp-authorization-url",
        value_name = "URL",
        env = "IDP_AUTHORIZATION_URL"
    )]
    pub idp_authorization_url: Url,

    /// IdP token endpoint
    #[arg(long = "idp-token-url", value_name = "URL", env = "IDP_TOKEN_URL")]
    pub idp_token_url: Url,

    /// IdP end-session endpoint (optional)
    #[arg(
        long = "idp-end-session-url",
        value_name = "URL",
        env = "IDP_END_SESSION_URL"
    )]
    pub idp_end_session_url: Option<Url>,

    /// OAuth2 client id registered with the IdP
    #[arg(long = "idp-client-id", value_name = "ID", env = "IDP_CLIENT_ID")]
    pub idp_client_id: String,

    /// OAuth2 client secret registered with the IdP
    #[arg(
        long = "idp-client-secret",
        value_name = "SECRET",
        env = "IDP_CLIENT_SECRET",
        hide_env_values = true
    )]
    pub idp_client_secret: String,

    /// Externally visible origin of the gateway, e.g. "https://hive.example.com"
    #[arg(long = "public-origin", value_name = "URL", env = "PUBLIC_ORIGIN")]
    pub public_origin: Url,

    /// Path to the service registry document
    #[arg(
        long = "services-file",
        value_name = "FILE",
        env = "SERVICES_FILE",
        default_value = "services.json"
    )]
    pub services_file: PathBuf,

    /// Registry entry whose backend serves user theme preferences
    #[arg(
        long = "theme-service",
        value_name = "NAME",
        env = "THEME_SERVICE",
        default_value = "codex"
    )]
    pub theme_service: String,
}

/// TLS certificate and key file paths.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// Validated runtime configuration for the gateway.
///
/// Built from `Args` by `from_args`, which enforces the startup invariants
/// that Clap cannot express (secret length, URL shapes, cert/key pairing).
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Listener bind address.
    pub listen_addr: String,
    /// TLS materials; `None` means the listener is plain HTTP.
    pub tls: Option<TlsConfig>,
    /// Session cookie encryption secret.
    pub cookie_secret: String,
    /// Core auth service base URL.
    pub auth_service_url: Url,
    /// Expected `iss` on gateway-issued JWTs, derived from the auth service origin.
    pub auth_issuer: String,
    /// IdP authorization endpoint.
    pub idp_authorization_url: Url,
    /// IdP token endpoint.
    pub idp_token_url: Url,
    /// IdP end-session endpoint, if the deployment has one.
    pub idp_end_session_url: Option<Url>,
    /// Scheme+authority of the IdP, the upstream for `/idp/*`.
    pub idp_origin: String,
    pub idp_client_id: String,
    pub idp_client_secret: String,
    /// Externally visible origin, used for redirect URIs and rewrites.
    pub public_origin: Url,
    /// Service registry document path.
    pub services_file: PathBuf,
    /// Registry entry consulted for per-user themes.
    pub theme_service: String,
    /// Largest text/html body the composer will buffer.
    pub html_buffer_cap: usize,
}

impl GatewayConfig {
    /// Validate parsed arguments into a runtime configuration.
    ///
    /// # Errors
    /// Returns `StartupError::ConfigError` for any invariant violation; the
    /// caller maps this to exit code 2.
    pub fn from_args(args: Args) -> Result<Self, StartupError> {
        if args.cookie_secret.len() < 32 {
            return Err(StartupError::ConfigError(
                "COOKIE_SECRET must be at least 32 bytes".to_string(),
            ));
        }

        let tls = match (args.tls_cert, args.tls_key) {
            (Some(cert), Some(key)) => Some(TlsConfig { cert, key }),
            (None, None) => None,
            _ => {
                return Err(StartupError::ConfigError(
                    "TLS_CERT and TLS_KEY must be set together".to_string(),
                ));
            }
        };

        for (name, url) in [
            ("AUTH_SERVICE_URL", &args.auth_service_url),
            ("IDP_AUTHORIZATION_URL", &args.idp_authorization_url),
            ("IDP_TOKEN_URL", &args.idp_token_url),
            ("PUBLIC_ORIGIN", &args.public_origin),
        ] {
            if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
                return Err(StartupError::ConfigError(format!(
                    "{} must be an absolute http(s) URL, got {}",
                    name, url
                )));
            }
        }

        let auth_issuer = origin_of(&args.auth_service_url);
        let idp_origin = origin_of(&args.idp_authorization_url);

        Ok(Self {
            listen_addr: args.listen_addr,
            tls,
            cookie_secret: args.cookie_secret,
            auth_service_url: args.auth_service_url,
            auth_issuer,
            idp_authorization_url: args.idp_authorization_url,
            idp_token_url: args.idp_token_url,
            idp_end_session_url: args.idp_end_session_url,
            idp_origin,
            idp_client_id: args.idp_client_id,
            idp_client_secret: args.idp_client_secret,
            public_origin: args.public_origin,
            services_file: args.services_file,
            theme_service: args.theme_service,
            html_buffer_cap: defaults::default_html_buffer_cap(),
        })
    }

    /// Whether the listener terminates TLS (drives the cookie `Secure` flag).
    pub fn tls_enabled(&self) -> bool {
        self.tls.is_some()
    }

    /// The gateway's `/auth-callback` redirect URI as registered with the IdP.
    pub fn redirect_uri(&self) -> String {
        format!("{}/auth-callback", origin_of(&self.public_origin))
    }
}

/// Scheme+authority of a URL, without a trailing slash.
pub fn origin_of(url: &Url) -> String {
    url.origin().ascii_serialization()
}
