//! Transparent reverse proxy for the identity provider.
//!
//! The IdP is not Internet-exposed; browsers reach it through `/idp/*`.
//! Requests are forwarded with the prefix stripped, and responses are
//! rewritten so the IdP's own absolute URLs (redirects, cookies, markup)
//! point back through the gateway. No gateway session is required here —
//! this path is how sessions come to exist.

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::Response;
use cookie::Cookie;
use std::sync::Arc;

use crate::server::constants;
use crate::server::handlers::{copy_proxy_headers, is_hop_by_hop};
use crate::state::GatewayState;

/// `ANY /idp/*`
pub async fn idp_proxy(State(state): State<Arc<GatewayState>>, req: Request) -> Response {
    let origin = state.config.idp_origin.clone();

    let path = req.uri().path();
    let tail = path.strip_prefix("/idp").unwrap_or(path);
    let tail = if tail.is_empty() { "/" } else { tail };
    let mut target = format!("{}{}", origin, tail);
    if let Some(q) = req.uri().query() {
        target.push('?');
        target.push_str(q);
    }

    let upstream = match state.upstreams.for_origin(&state.config.idp_authorization_url) {
        Ok(u) => u,
        Err(e) => {
            tracing::error!("IdP upstream client unavailable: {}", e);
            return bad_gateway("identity provider unavailable");
        }
    };

    let (parts, body) = req.into_parts();
    let mut headers = copy_proxy_headers(&parts.headers);
    // Gateway credentials never cross this boundary; the IdP sees only its
    // own cookies.
    headers.remove(header::AUTHORIZATION);
    crate::server::handlers::proxy::strip_session_cookie(&mut headers);
    // The IdP must believe it is talking to its own origin.
    if headers.contains_key(header::ORIGIN)
        && let Ok(value) = HeaderValue::from_str(&origin)
    {
        headers.insert(header::ORIGIN, value);
    }

    let outbound = upstream
        .client
        .request(parts.method, &target)
        .headers(headers)
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    let resp = match tokio::time::timeout(constants::FIRST_BYTE_TIMEOUT, outbound.send()).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => {
            tracing::error!("IdP request to {} failed: {}", target, e);
            return bad_gateway("identity provider unavailable");
        }
        Err(_) => {
            tracing::error!("IdP request to {} timed out", target);
            return bad_gateway("identity provider timed out");
        }
    };

    relay_rewritten(&origin, resp).await
}

/// Relay an IdP response, rewriting `Location`, `Set-Cookie`, and (for
/// text/html and text/css) the body so IdP-absolute URLs route back
/// through `/idp/`.
async fn relay_rewritten(origin: &str, resp: reqwest::Response) -> Response {
    let status = resp.status();

    let mut headers = HeaderMap::new();
    for (name, value) in resp.headers() {
        if is_hop_by_hop(name) {
            continue;
        }
        if *name == header::LOCATION {
            headers.append(name.clone(), rewrite_location(origin, value));
            continue;
        }
        if *name == header::SET_COOKIE {
            if let Ok(raw) = value.to_str()
                && let Some(rewritten) = rewrite_set_cookie(raw)
                && let Ok(v) = HeaderValue::from_str(&rewritten)
            {
                headers.append(name.clone(), v);
            } else {
                headers.append(name.clone(), value.clone());
            }
            continue;
        }
        headers.append(name.clone(), value.clone());
    }

    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_ascii_lowercase();

    if content_type.starts_with("text/html") || content_type.starts_with("text/css") {
        let body = match tokio::time::timeout(constants::UPSTREAM_TOTAL_TIMEOUT, resp.bytes()).await
        {
            Ok(Ok(bytes)) => bytes,
            _ => {
                tracing::error!("Reading IdP response body failed");
                return bad_gateway("identity provider response unreadable");
            }
        };
        let rewritten: Vec<u8> = match std::str::from_utf8(&body) {
            Ok(text) => text.replace(origin, "/idp").into_bytes(),
            Err(_) => body.to_vec(),
        };
        headers.remove(header::CONTENT_LENGTH);
        headers.insert(header::CONTENT_LENGTH, HeaderValue::from(rewritten.len()));

        let mut response = Response::builder()
            .status(status)
            .body(Body::from(rewritten))
            .expect("static response parts are valid");
        *response.headers_mut() = headers;
        return response;
    }

    let mut response = Response::builder()
        .status(status)
        .body(Body::from_stream(resp.bytes_stream()))
        .expect("static response parts are valid");
    *response.headers_mut() = headers;
    response
}

/// `Location` headers pointing at the IdP's own authority come back
/// through the `/idp/` prefix; anything else passes through untouched.
fn rewrite_location(origin: &str, value: &HeaderValue) -> HeaderValue {
    let Ok(location) = value.to_str() else {
        return value.clone();
    };
    let Some(rest) = location.strip_prefix(origin) else {
        return value.clone();
    };
    let rewritten = if rest.is_empty() {
        "/idp/".to_string()
    } else {
        format!("/idp{}", rest)
    };
    HeaderValue::from_str(&rewritten).unwrap_or_else(|_| value.clone())
}

/// Re-root a `Set-Cookie` path under `/idp/` and drop any `Domain`
/// attribute so the cookie binds to the gateway host.
fn rewrite_set_cookie(raw: &str) -> Option<String> {
    let parsed = Cookie::parse(raw.to_string()).ok()?;

    let mut builder = Cookie::build((parsed.name().to_string(), parsed.value().to_string()));
    if let Some(path) = parsed.path() {
        let rerooted = if path == "/" {
            "/idp/".to_string()
        } else {
            format!("/idp{}", path)
        };
        builder = builder.path(rerooted);
    }
    if parsed.http_only().unwrap_or(false) {
        builder = builder.http_only(true);
    }
    if parsed.secure().unwrap_or(false) {
        builder = builder.secure(true);
    }
    if let Some(same_site) = parsed.same_site() {
        builder = builder.same_site(same_site);
    }
    if let Some(max_age) = parsed.max_age() {
        builder = builder.max_age(max_age);
    }
    if let Some(expires) = parsed.expires() {
        builder = builder.expires(expires);
    }

    Some(builder.build().to_string())
}

fn bad_gateway(message: &str) -> Response {
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(Body::from(format!(
            "<!doctype html><html><head><title>Bad gateway</title></head>\
             <body><h1>502</h1><p>{}</p></body></html>",
            message
        )))
        .expect("static response parts are valid")
}
