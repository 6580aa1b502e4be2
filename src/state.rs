//! Process-wide shared state.
//!
//! Everything here is read-mostly: the registry snapshot swaps atomically,
//! the JWKS cache refreshes behind a single-flight guard, and the upstream
//! pool grows lazily as origins are first seen. No lock is held across an
//! await point.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::Semaphore;
use url::Url;

use crate::compose::theme::ThemeResolver;
use crate::config::GatewayConfig;
use crate::errors::StartupError;
use crate::registry::{RegistryError, ServiceRegistry};
use crate::server::auth::TokenValidator;
use crate::server::constants;
use crate::session::SessionStore;

/// A per-origin upstream handle: a pooled HTTP client plus an in-flight cap.
#[derive(Clone)]
pub struct Upstream {
    pub client: reqwest::Client,
    pub permits: Arc<Semaphore>,
}

/// Lazily built per-origin upstream clients.
///
/// Proxy clients never follow redirects (the browser must see them) and
/// request identity encoding so HTML bodies arrive uncompressed for the
/// composer.
#[derive(Default)]
pub struct UpstreamPool {
    clients: RwLock<HashMap<String, Upstream>>,
}

impl UpstreamPool {
    pub fn for_origin(&self, origin: &Url) -> Result<Upstream, String> {
        let key = crate::config::origin_of(origin);
        if let Some(existing) = self
            .clients
            .read()
            .expect("upstream lock poisoned")
            .get(&key)
        {
            return Ok(existing.clone());
        }

        let client = reqwest::Client::builder()
            .user_agent(constants::REQUEST_USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(constants::CONNECT_TIMEOUT)
            .pool_max_idle_per_host(constants::UPSTREAM_POOL_IDLE)
            .build()
            .map_err(|e| format!("cannot build upstream client: {}", e))?;
        let upstream = Upstream {
            client,
            permits: Arc::new(Semaphore::new(constants::UPSTREAM_MAX_INFLIGHT)),
        };

        let mut clients = self.clients.write().expect("upstream lock poisoned");
        // Another request may have raced us here; keep the first one so the
        // semaphore stays shared.
        Ok(clients.entry(key).or_insert(upstream).clone())
    }
}

/// Shared application state for the gateway.
pub struct GatewayState {
    pub config: GatewayConfig,
    pub sessions: SessionStore,
    pub validator: TokenValidator,
    pub theme: ThemeResolver,
    /// Client for gateway-originated API calls (token exchange, revocation).
    pub http: reqwest::Client,
    pub upstreams: UpstreamPool,
    registry: RwLock<Arc<ServiceRegistry>>,
}

impl GatewayState {
    /// Build the shared state: load the registry, derive the cookie key,
    /// and construct the outbound HTTP clients.
    pub async fn new(config: GatewayConfig) -> Result<Arc<Self>, StartupError> {
        let registry = ServiceRegistry::load(&config.services_file)
            .map_err(|e| StartupError::RegistryError(e.to_string()))?;
        tracing::info!(
            "Loaded {} service(s) from {}",
            registry.len(),
            config.services_file.display()
        );

        Self::with_registry(config, registry)
    }

    /// Build state around an already-parsed registry snapshot. Used by
    /// tests and by `new`.
    pub fn with_registry(
        config: GatewayConfig,
        registry: ServiceRegistry,
    ) -> Result<Arc<Self>, StartupError> {
        let http = reqwest::Client::builder()
            .user_agent(constants::REQUEST_USER_AGENT)
            .build()
            .map_err(|e| StartupError::ConfigError(format!("cannot build HTTP client: {}", e)))?;

        let sessions = SessionStore::new(&config.cookie_secret, config.tls_enabled());
        let validator =
            TokenValidator::new(http.clone(), &config.auth_service_url, config.auth_issuer.clone());
        let theme = ThemeResolver::new(http.clone(), &config.auth_service_url);

        Ok(Arc::new(Self {
            config,
            sessions,
            validator,
            theme,
            http,
            upstreams: UpstreamPool::default(),
            registry: RwLock::new(Arc::new(registry)),
        }))
    }

    /// Current registry snapshot.
    pub fn registry(&self) -> Arc<ServiceRegistry> {
        self.registry.read().expect("registry lock poisoned").clone()
    }

    /// Re-read the registry document and swap the snapshot atomically.
    /// On failure the previous snapshot stays in place.
    pub fn reload_registry(&self) -> Result<usize, RegistryError> {
        let fresh = ServiceRegistry::load(&self.config.services_file)?;
        let count = fresh.len();
        *self.registry.write().expect("registry lock poisoned") = Arc::new(fresh);
        Ok(count)
    }
}
