//! Path-based reverse proxy to registered backend services.
//!
//! `/{name}/...` forwards to the registry entry `name` with the prefix
//! stripped, the caller's bearer token injected, and forwarded headers
//! describing the external request. Responses stream through unmodified
//! except for text/html, which is buffered (up to a cap) and handed to the
//! composer. Server-Sent Events are recognized and relayed chunk-by-chunk
//! with no total deadline.

use axum::body::{Body, Bytes};
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use futures::{Stream, StreamExt};
use std::sync::Arc;
use tokio::sync::OwnedSemaphorePermit;

use crate::compose;
use crate::config::defaults;
use crate::registry::ServiceEntry;
use crate::server::auth::{AuthError, UserClaims};
use crate::server::constants;
use crate::server::handlers::{copy_proxy_headers, found_with_cookie, is_hop_by_hop, login_redirect};
use crate::server::PeerAddr;
use crate::state::GatewayState;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Fallback handler: `ANY /{name}/*` for registry names; 404 otherwise.
pub async fn backend_proxy(State(state): State<Arc<GatewayState>>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    let original = match req.uri().query() {
        Some(q) => format!("{}?{}", path, q),
        None => path.clone(),
    };

    let Some((name, tail)) = split_service_path(&path) else {
        return not_found();
    };
    let Some(entry) = state.registry().lookup(name).cloned() else {
        return not_found();
    };

    let (claims, token) = match authenticate(&state, req.headers(), &original).await {
        Ok(auth) => auth,
        Err(resp) => return *resp,
    };

    if !entry.policy.allows(claims.permission_level) {
        tracing::debug!(
            "Denying {} ({}) access to {}",
            claims.subject,
            claims.permission_level,
            entry.name
        );
        return forbidden(&entry.name);
    }

    #[cfg(feature = "prometheus")]
    metrics::counter!("nexus_proxied_requests_total", "service" => entry.name.clone())
        .increment(1);

    forward(state, entry, claims, token, req, tail).await
}

/// `GET /` — land the caller on the first service they can see.
pub async fn root_redirect(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    let (claims, _) = match authenticate(&state, &headers, "/").await {
        Ok(auth) => auth,
        Err(resp) => return *resp,
    };

    let registry = state.registry();
    match registry.visible_for(claims.permission_level).first() {
        Some(entry) => super::found(&format!("/{}/", entry.name)),
        None => not_found(),
    }
}

/// Resolve the session to claims, or produce the response that turns the
/// caller away.
async fn authenticate(
    state: &GatewayState,
    headers: &HeaderMap,
    original: &str,
) -> Result<(UserClaims, String), Box<Response>> {
    let session = state.sessions.load(headers);
    let Some(token) = session.token else {
        return Err(Box::new(login_redirect(original)));
    };

    match state.validator.validate(&token).await {
        Ok(claims) => Ok((claims, token)),
        Err(e) => Err(Box::new(auth_failure(state, e, original))),
    }
}

/// Map a validation failure to its user-visible behavior.
fn auth_failure(state: &GatewayState, err: AuthError, original: &str) -> Response {
    #[cfg(feature = "prometheus")]
    metrics::counter!("nexus_auth_failures_total").increment(1);

    let login = format!("/login?next={}", urlencoding::encode(original));
    match err {
        AuthError::JwksUnavailable(msg) => {
            tracing::error!("JWKS refresh failed, serving 503: {}", msg);
            Response::builder()
                .status(StatusCode::SERVICE_UNAVAILABLE)
                .header(header::RETRY_AFTER, "5")
                .body(Body::from("signature keys unavailable"))
                .expect("static response parts are valid")
        }
        AuthError::AuthServiceUnreachable(msg) => {
            // Fail closed: an unverifiable token never passes.
            tracing::error!("Auth service unreachable during validation: {}", msg);
            super::found(&login)
        }
        other => {
            tracing::debug!("Rejecting session token: {}", other);
            found_with_cookie(&login, Some(state.sessions.clear()))
        }
    }
}

/// Forward the request to the backend and relay the response.
async fn forward(
    state: Arc<GatewayState>,
    entry: ServiceEntry,
    claims: UserClaims,
    token: String,
    req: Request,
    tail: String,
) -> Response {
    let upstream = match state.upstreams.for_origin(&entry.origin) {
        Ok(u) => u,
        Err(e) => {
            tracing::error!("No upstream client for {}: {}", entry.origin, e);
            return bad_gateway(&state, &claims, &entry.name).await;
        }
    };
    let permit = match upstream.permits.clone().acquire_owned().await {
        Ok(p) => p,
        Err(_) => {
            tracing::error!("Upstream semaphore closed for {}", entry.name);
            return bad_gateway(&state, &claims, &entry.name).await;
        }
    };

    let mut url = entry.origin.clone();
    url.set_path(&tail);
    url.set_query(req.uri().query());

    let (parts, body) = req.into_parts();

    let mut headers = copy_proxy_headers(&parts.headers);
    headers.remove(header::AUTHORIZATION);
    strip_session_cookie(&mut headers);

    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", token)) {
        headers.insert(header::AUTHORIZATION, value);
    }
    append_forwarded_for(&mut headers, parts.extensions.get::<PeerAddr>());
    headers.insert(
        "x-forwarded-proto",
        HeaderValue::from_static(if state.config.tls_enabled() { "https" } else { "http" }),
    );
    if let Some(host) = parts.headers.get(header::HOST) {
        headers.insert("x-forwarded-host", host.clone());
    }
    if let Ok(value) = HeaderValue::from_str(&format!("/{}", entry.name)) {
        headers.insert("x-forwarded-prefix", value);
    }
    // Rewritable bodies must arrive uncompressed.
    headers.insert(header::ACCEPT_ENCODING, HeaderValue::from_static("identity"));

    let outbound = upstream
        .client
        .request(parts.method, url)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let resp = match tokio::time::timeout(constants::FIRST_BYTE_TIMEOUT, outbound.send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            tracing::error!("Backend {} request failed: {}", entry.name, e);
            #[cfg(feature = "prometheus")]
            metrics::counter!("nexus_upstream_errors_total", "service" => entry.name.clone())
                .increment(1);
            return bad_gateway(&state, &claims, &entry.name).await;
        }
        Err(_) => {
            tracing::error!("Backend {} timed out before first byte", entry.name);
            #[cfg(feature = "prometheus")]
            metrics::counter!("nexus_upstream_errors_total", "service" => entry.name.clone())
                .increment(1);
            return bad_gateway(&state, &claims, &entry.name).await;
        }
    };

    relay(state, entry, claims, resp, permit).await
}

/// Relay a backend response: SSE and opaque bodies stream through,
/// text/html (non-5xx) is buffered and composed.
async fn relay(
    state: Arc<GatewayState>,
    entry: ServiceEntry,
    claims: UserClaims,
    resp: reqwest::Response,
    permit: OwnedSemaphorePermit,
) -> Response {
    let status = resp.status();

    let mut headers = HeaderMap::new();
    for (name, value) in resp.headers() {
        if is_hop_by_hop(name) {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if content_type.starts_with("text/event-stream") {
        return streamed(status, headers, sse_stream(resp.bytes_stream(), permit));
    }

    if content_type.starts_with("text/html") && status.as_u16() < 500 {
        return compose_html(state, entry, claims, status, headers, resp, permit).await;
    }

    // Bodies of unknown length may still be an event stream mislabeled by
    // the backend; sniff the first chunk for SSE framing.
    let has_length = headers.contains_key(header::CONTENT_LENGTH);
    let mut stream = resp.bytes_stream().boxed();
    let first = match tokio::time::timeout(constants::FIRST_BYTE_TIMEOUT, stream.next()).await {
        Ok(Some(Ok(chunk))) => Some(chunk),
        Ok(Some(Err(e))) => {
            tracing::error!("Backend {} body failed before first chunk: {}", entry.name, e);
            return bad_gateway(&state, &claims, &entry.name).await;
        }
        Ok(None) => None,
        Err(_) => {
            tracing::error!("Backend {} body timed out before first chunk", entry.name);
            return bad_gateway(&state, &claims, &entry.name).await;
        }
    };

    let Some(first) = first else {
        drop(permit);
        let mut response = Response::builder()
            .status(status)
            .body(Body::empty())
            .expect("static response parts are valid");
        *response.headers_mut() = headers;
        return response;
    };

    let looks_like_sse = !has_length && first.starts_with(b"data:");
    let prefixed = futures::stream::iter([Ok::<Bytes, reqwest::Error>(first)]).chain(stream);
    if looks_like_sse {
        streamed(status, headers, sse_stream(prefixed, permit))
    } else {
        let deadline = tokio::time::Instant::now() + constants::UPSTREAM_TOTAL_TIMEOUT;
        streamed(status, headers, deadline_stream(prefixed, deadline, permit))
    }
}

/// Buffer a text/html body (up to the cap) and run it through the
/// composer. Bodies over the cap stream through unmodified.
async fn compose_html(
    state: Arc<GatewayState>,
    entry: ServiceEntry,
    claims: UserClaims,
    status: StatusCode,
    mut headers: HeaderMap,
    resp: reqwest::Response,
    permit: OwnedSemaphorePermit,
) -> Response {
    let cap = state.config.html_buffer_cap;
    let deadline = tokio::time::Instant::now() + constants::UPSTREAM_TOTAL_TIMEOUT;
    let mut stream = resp.bytes_stream().boxed();
    let mut buffered: Vec<u8> = Vec::new();

    loop {
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(chunk))) => {
                if buffered.len() + chunk.len() > cap {
                    tracing::warn!(
                        "HTML body from {} exceeds {} byte cap; streaming unmodified",
                        entry.name,
                        cap
                    );
                    let prefix = futures::stream::iter([Ok::<Bytes, reqwest::Error>(
                        Bytes::from(buffered),
                    )]);
                    let rest = prefix.chain(futures::stream::iter([Ok(chunk)])).chain(stream);
                    return streamed(status, headers, deadline_stream(rest, deadline, permit));
                }
                buffered.extend_from_slice(&chunk);
            }
            Ok(Some(Err(e))) => {
                tracing::error!("Backend {} body read failed: {}", entry.name, e);
                return bad_gateway(&state, &claims, &entry.name).await;
            }
            Ok(None) => break,
            Err(_) => {
                tracing::error!("Backend {} body read exceeded total timeout", entry.name);
                return bad_gateway(&state, &claims, &entry.name).await;
            }
        }
    }
    drop(permit);

    let composed = compose::compose(&state, &claims, buffered).await;
    headers.remove(header::CONTENT_LENGTH);
    headers.insert(header::CONTENT_LENGTH, HeaderValue::from(composed.len()));

    let mut response = Response::builder()
        .status(status)
        .body(Body::from(composed))
        .expect("static response parts are valid");
    *response.headers_mut() = headers;
    response
}

/// Build a streaming response from upstream chunks.
fn streamed<S>(status: StatusCode, headers: HeaderMap, stream: S) -> Response
where
    S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
{
    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(stream))
        .expect("static response parts are valid");
    *response.headers_mut() = headers;
    response
}

/// Pass chunks through verbatim for the lifetime of the stream; events are
/// never reordered, coalesced, or held back. Dropping the stream (client
/// disconnect) drops the upstream read side with it.
fn sse_stream<S>(
    stream: S,
    permit: OwnedSemaphorePermit,
) -> impl Stream<Item = Result<Bytes, BoxError>> + Send
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + 'static,
{
    stream.map(move |item| {
        let _held = &permit;
        item.map_err(|e| -> BoxError { e.into() })
    })
}

/// Pass chunks through until `deadline`; afterwards the stream errors out
/// so long-poll bodies cannot pin a connection forever.
fn deadline_stream<S>(
    stream: S,
    deadline: tokio::time::Instant,
    permit: OwnedSemaphorePermit,
) -> impl Stream<Item = Result<Bytes, BoxError>> + Send
where
    S: Stream<Item = Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    futures::stream::unfold(Some((stream, permit)), move |held| async move {
        let (mut stream, permit) = held?;
        match tokio::time::timeout_at(deadline, stream.next()).await {
            Ok(Some(Ok(chunk))) => Some((Ok(chunk), Some((stream, permit)))),
            Ok(Some(Err(e))) => Some((Err(e.into()), None)),
            Ok(None) => None,
            Err(_) => Some((
                Err("upstream response exceeded total timeout".into()),
                None,
            )),
        }
    })
}

/// 502 page for backend transport failures, routed through the composer so
/// the error keeps the platform chrome.
async fn bad_gateway(state: &GatewayState, claims: &UserClaims, service: &str) -> Response {
    let page = format!(
        "<!doctype html><html><head><title>Service unavailable</title></head>\
         <body><h1>502</h1><p>The {} service is not responding.</p></body></html>",
        service
    );
    let body = compose::compose(state, claims, page.into_bytes()).await;
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(body))
        .expect("static response parts are valid")
}

fn not_found() -> Response {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::from("not found"))
        .expect("static response parts are valid")
}

fn forbidden(service: &str) -> Response {
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(format!(
            "<!doctype html><html><head><title>Forbidden</title></head>\
             <body><h1>403</h1><p>You do not have access to {}.</p></body></html>",
            service
        )))
        .expect("static response parts are valid")
}

/// `/codex/companies` → `("codex", "/companies")`; `/codex` → `("codex", "/")`.
fn split_service_path(path: &str) -> Option<(&str, String)> {
    let rest = path.strip_prefix('/')?;
    if rest.is_empty() {
        return None;
    }
    match rest.find('/') {
        Some(i) => Some((&rest[..i], rest[i..].to_string())),
        None => Some((rest, "/".to_string())),
    }
}

/// Append the connecting client to any existing `X-Forwarded-For` chain.
fn append_forwarded_for(headers: &mut HeaderMap, peer: Option<&PeerAddr>) {
    let existing = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let client_ip = peer.map(|p| p.0.ip().to_string());

    let chain = match (existing, client_ip) {
        (Some(chain), Some(ip)) => Some(format!("{}, {}", chain, ip)),
        (None, Some(ip)) => Some(ip),
        (Some(chain), None) => Some(chain),
        (None, None) => None,
    };
    if let Some(chain) = chain
        && let Ok(value) = HeaderValue::from_str(&chain)
    {
        headers.insert("x-forwarded-for", value);
    }
}

/// Drop the gateway's own session cookie from forwarded `Cookie` headers;
/// upstreams have no business seeing it.
pub(crate) fn strip_session_cookie(headers: &mut HeaderMap) {
    let prefix = format!("{}=", defaults::default_session_cookie_name());
    let kept: Vec<HeaderValue> = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| {
            let raw = value.to_str().ok()?;
            let remaining: Vec<&str> = raw
                .split(';')
                .map(str::trim)
                .filter(|pair| !pair.starts_with(&prefix))
                .collect();
            if remaining.is_empty() {
                None
            } else {
                HeaderValue::from_str(&remaining.join("; ")).ok()
            }
        })
        .collect();

    headers.remove(header::COOKIE);
    for value in kept {
        headers.append(header::COOKIE, value);
    }
}
