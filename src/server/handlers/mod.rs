//! HTTP handlers for the gateway's routing table.

pub mod assets;
pub mod health;
pub mod idp;
pub mod login;
pub mod proxy;

use axum::body::Body;
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::response::Response;

/// A 302 redirect. Built by hand: the login and IdP flows depend on the
/// exact Found status, not axum's 303/307 helpers.
pub fn found(location: &str) -> Response {
    found_with_cookie(location, None)
}

/// A 302 redirect that also sets (or clears) the session cookie.
pub fn found_with_cookie(location: &str, cookie: Option<HeaderValue>) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::FOUND)
        .header(header::LOCATION, location);
    if let Some(cookie) = cookie {
        builder = builder.header(header::SET_COOKIE, cookie);
    }
    builder
        .body(Body::empty())
        .expect("static response parts are valid")
}

/// Redirect an unauthenticated request to `/login`, preserving where the
/// caller was headed.
pub fn login_redirect(original: &str) -> Response {
    found(&format!("/login?next={}", urlencoding::encode(original)))
}

/// Headers scoped to a single transport hop; a proxy must not forward
/// them.
fn hop_by_hop() -> [HeaderName; 8] {
    [
        header::CONNECTION,
        HeaderName::from_static("keep-alive"),
        header::PROXY_AUTHENTICATE,
        header::PROXY_AUTHORIZATION,
        header::TE,
        header::TRAILER,
        header::TRANSFER_ENCODING,
        header::UPGRADE,
    ]
}

pub fn is_hop_by_hop(name: &HeaderName) -> bool {
    hop_by_hop().contains(name)
}

/// Copy forwardable headers from `src`, dropping hop-by-hop headers, any
/// headers named by a `Connection` header, and `Host` (the HTTP client
/// sets it from the target URL).
pub fn copy_proxy_headers(src: &HeaderMap) -> HeaderMap {
    let mut connection_named: Vec<String> = Vec::new();
    for value in src.get_all(header::CONNECTION) {
        if let Ok(s) = value.to_str() {
            connection_named.extend(s.split(',').map(|t| t.trim().to_ascii_lowercase()));
        }
    }

    let mut out = HeaderMap::new();
    for (name, value) in src {
        if is_hop_by_hop(name)
            || *name == header::HOST
            || connection_named.iter().any(|t| t == name.as_str())
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}
