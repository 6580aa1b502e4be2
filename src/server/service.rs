//! HTTP service implementation - assembles the router and runs the
//! (optionally TLS-terminating) listener.

use axum::{
    Extension, Router,
    routing::{any, get},
};
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use hyper_util::service::TowerToHyperService;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;
use x509_parser::parse_x509_certificate;

use crate::config::GatewayConfig;
use crate::errors::StartupError;
use crate::server::{PeerAddr, handlers};
use crate::state::GatewayState;

/// Assemble the gateway routing table.
///
/// Order matters and mirrors the dispatch contract: fixed endpoints first,
/// then the IdP proxy and static assets, with everything else falling
/// through to the backend proxy (which 404s unknown service names).
pub fn build_router(state: Arc<GatewayState>) -> Router {
    let router = Router::new()
        .route("/health", get(handlers::health::health))
        .route(
            "/login",
            get(handlers::login::begin).post(handlers::login::begin),
        )
        .route("/auth-callback", get(handlers::login::complete))
        .route("/logout", get(handlers::login::end))
        .route("/idp", any(handlers::idp::idp_proxy))
        .route("/idp/{*tail}", any(handlers::idp::idp_proxy))
        .route("/static/{*asset}", get(handlers::assets::static_asset))
        .route("/", get(handlers::proxy::root_redirect));

    #[cfg(feature = "prometheus")]
    let router = router.route("/metrics", get(crate::metrics::handler::metrics_handler));

    router
        .fallback(handlers::proxy::backend_proxy)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway: load TLS materials, bind, and serve until a
/// shutdown signal arrives.
pub async fn start(state: Arc<GatewayState>) -> Result<(), StartupError> {
    let acceptor = load_tls_acceptor(&state.config)?;

    let listener = TcpListener::bind(&state.config.listen_addr)
        .await
        .map_err(|e| StartupError::BindError(state.config.listen_addr.clone(), e.to_string()))?;

    spawn_registry_reload(state.clone());

    let app = build_router(state.clone());

    match &acceptor {
        Some(_) => info!("Listening on https://{}", state.config.listen_addr),
        None => info!("Listening on http://{}", state.config.listen_addr),
    }

    let shutdown = CancellationToken::new();
    let signals = shutdown_signal();
    tokio::pin!(signals);

    loop {
        tokio::select! {
            _ = &mut signals => {
                info!("Shutdown signal received");
                shutdown.cancel();
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, remote) = match accepted {
                    Ok(conn) => conn,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                let app = app.clone();
                let acceptor = acceptor.clone();
                let cancelled = shutdown.clone();
                tokio::spawn(async move {
                    tokio::select! {
                        _ = cancelled.cancelled() => {}
                        _ = serve_connection(stream, remote, app, acceptor) => {}
                    }
                });
            }
        }
    }
}

/// Serve one accepted connection, TLS-terminating when configured. The
/// peer address rides along as a request extension so the proxy can extend
/// `X-Forwarded-For`.
async fn serve_connection(
    stream: TcpStream,
    remote: SocketAddr,
    app: Router,
    acceptor: Option<Arc<TlsAcceptor>>,
) {
    let service = TowerToHyperService::new(app.layer(Extension(PeerAddr(remote))));

    match acceptor {
        Some(acceptor) => {
            let tls_stream = match acceptor.accept(stream).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!("TLS accept from {} failed: {}", remote, e);
                    return;
                }
            };
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(tls_stream), service)
                .await
            {
                tracing::debug!("Connection from {} ended: {}", remote, e);
            }
        }
        None => {
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
            {
                tracing::debug!("Connection from {} ended: {}", remote, e);
            }
        }
    }
}

/// Load and validate TLS materials. Any failure here maps to exit code 4.
fn load_tls_acceptor(config: &GatewayConfig) -> Result<Option<Arc<TlsAcceptor>>, StartupError> {
    let Some(tls) = &config.tls else {
        return Ok(None);
    };

    let cert_bytes = std::fs::read(&tls.cert)
        .map_err(|e| StartupError::TlsError(format!("reading {}: {}", tls.cert.display(), e)))?;
    let key_bytes = std::fs::read(&tls.key)
        .map_err(|e| StartupError::TlsError(format!("reading {}: {}", tls.key.display(), e)))?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut cert_bytes.as_slice())
        .collect::<Result<_, _>>()
        .map_err(|e| StartupError::TlsError(format!("parsing certificates: {}", e)))?;
    if certs.is_empty() {
        return Err(StartupError::TlsError(format!(
            "{} contains no certificates",
            tls.cert.display()
        )));
    }

    // Parse the leaf so a stale or mangled certificate is caught at startup
    // rather than at the first handshake.
    let (_, leaf) = parse_x509_certificate(certs[0].as_ref())
        .map_err(|e| StartupError::TlsError(format!("invalid X.509 certificate: {:?}", e)))?;
    if !leaf.validity().is_valid() {
        tracing::warn!(
            "TLS certificate for {} is outside its validity window",
            leaf.subject()
        );
    } else {
        tracing::debug!(
            "TLS certificate subject={} not_after={}",
            leaf.subject(),
            leaf.validity().not_after
        );
    }

    let key = rustls_pemfile::private_key(&mut key_bytes.as_slice())
        .map_err(|e| StartupError::TlsError(format!("parsing private key: {}", e)))?
        .ok_or_else(|| {
            StartupError::TlsError(format!("{} contains no private key", tls.key.display()))
        })?;

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| StartupError::TlsError(format!("building TLS config: {}", e)))?;

    Ok(Some(Arc::new(TlsAcceptor::from(Arc::new(server_config)))))
}

/// Reload the service registry snapshot on SIGHUP.
#[cfg(unix)]
fn spawn_registry_reload(state: Arc<GatewayState>) {
    use tokio::signal::unix::{SignalKind, signal};

    tokio::spawn(async move {
        let mut hangup = match signal(SignalKind::hangup()) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!("Cannot install SIGHUP handler: {}", e);
                return;
            }
        };
        while hangup.recv().await.is_some() {
            match state.reload_registry() {
                Ok(count) => info!("Service registry reloaded, {} service(s)", count),
                Err(e) => {
                    tracing::warn!("Registry reload failed, keeping previous snapshot: {}", e)
                }
            }
        }
    });
}

#[cfg(not(unix))]
fn spawn_registry_reload(_state: Arc<GatewayState>) {}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Cannot listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("Cannot install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
