//! OAuth2 broker: `/login`, `/auth-callback`, and `/logout`.
//!
//! Drives the authorization-code flow against the external IdP, then trades
//! the IdP access token for a gateway JWT at the auth service. Ephemeral
//! flow state (anti-CSRF `state`, PKCE verifier, post-login target) lives in
//! the encrypted session cookie and is destroyed when the callback fires,
//! success or failure.

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::Response;
use openidconnect::{AuthorizationCode, CsrfToken, PkceCodeChallenge};
use serde::Deserialize;
use std::sync::Arc;

use crate::server::constants;
use crate::server::handlers::found_with_cookie;
use crate::session::{OauthFlow, SessionState};
use crate::state::GatewayState;

#[derive(Debug, Deserialize)]
pub struct LoginParams {
    pub next: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    pub code: Option<String>,
    pub state: Option<String>,
    pub error: Option<String>,
}

/// Body of the IdP token endpoint response; only the access token is used.
#[derive(Debug, Deserialize)]
struct IdpTokenResponse {
    access_token: String,
}

/// Body of `POST /api/token/exchange` responses from the auth service.
#[derive(Debug, Deserialize)]
struct ExchangeResponse {
    token: String,
}

/// `GET|POST /login` — begin the authorization-code flow.
///
/// Stores fresh flow state in the session (overwriting any abandoned
/// flow) and redirects the browser to the IdP's authorization endpoint.
pub async fn begin(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<LoginParams>,
    headers: HeaderMap,
) -> Response {
    let target = sanitize_target(params.next.as_deref());

    let csrf = CsrfToken::new_random();
    let (challenge, verifier) = PkceCodeChallenge::new_random_sha256();

    let mut session = state.sessions.load(&headers);
    session.oauth = Some(OauthFlow {
        state: csrf.secret().clone(),
        code_verifier: verifier.secret().clone(),
        target,
    });

    let mut authorize = state.config.idp_authorization_url.clone();
    authorize
        .query_pairs_mut()
        .append_pair("response_type", "code")
        .append_pair("client_id", &state.config.idp_client_id)
        .append_pair("redirect_uri", &state.config.redirect_uri())
        .append_pair("scope", "openid profile email")
        .append_pair("state", csrf.secret())
        .append_pair("code_challenge", challenge.as_str())
        .append_pair("code_challenge_method", "S256");

    let cookie = state.sessions.save(&session);
    if cookie.is_none() {
        tracing::warn!("Could not persist login flow state in session cookie");
    }
    found_with_cookie(authorize.as_str(), cookie)
}

/// `GET /auth-callback` — complete the flow.
///
/// Verifies the mirrored `state`, exchanges the code with the IdP, then
/// exchanges the IdP access token for a gateway JWT at the auth service.
pub async fn complete(
    State(state): State<Arc<GatewayState>>,
    Query(params): Query<CallbackParams>,
    headers: HeaderMap,
) -> Response {
    let mut session = state.sessions.load(&headers);
    let flow = session.oauth.take();

    if let Some(err) = params.error {
        tracing::warn!("IdP returned an authorization error: {}", err);
        return error_page(&state, StatusCode::BAD_REQUEST, "Sign-in was not completed.");
    }

    let (Some(code), Some(cb_state)) = (params.code, params.state) else {
        return error_page(&state, StatusCode::BAD_REQUEST, "Malformed sign-in callback.");
    };
    let Some(flow) = flow else {
        return error_page(&state, StatusCode::BAD_REQUEST, "No sign-in in progress.");
    };
    if flow.state != cb_state {
        tracing::warn!("OAuth2 state mismatch on callback");
        return error_page(&state, StatusCode::BAD_REQUEST, "Sign-in state mismatch.");
    }

    let code = AuthorizationCode::new(code);
    let redirect_uri = state.config.redirect_uri();
    let form = [
        ("grant_type", "authorization_code"),
        ("code", code.secret()),
        ("redirect_uri", redirect_uri.as_str()),
        ("client_id", &state.config.idp_client_id),
        ("client_secret", &state.config.idp_client_secret),
        ("code_verifier", &flow.code_verifier),
    ];
    let idp_tokens: IdpTokenResponse = match post_form(&state, &form).await {
        Ok(tokens) => tokens,
        Err(e) => {
            tracing::error!("IdP code exchange failed: {}", e);
            return error_page(
                &state,
                StatusCode::BAD_GATEWAY,
                "Sign-in failed while contacting the identity provider.",
            );
        }
    };

    let exchange_url = state
        .config
        .auth_service_url
        .join("/api/token/exchange")
        .expect("auth service URL is absolute");
    let exchanged = state
        .http
        .post(exchange_url)
        .json(&serde_json::json!({ "access_token": idp_tokens.access_token }))
        .timeout(constants::TOKEN_EXCHANGE_TIMEOUT)
        .send()
        .await;
    let token = match exchanged {
        Ok(resp) if resp.status().is_success() => {
            match resp.json::<ExchangeResponse>().await {
                Ok(body) => body.token,
                Err(e) => {
                    tracing::error!("Auth service returned an unreadable exchange body: {}", e);
                    return error_page(
                        &state,
                        StatusCode::BAD_GATEWAY,
                        "Sign-in failed while contacting the auth service.",
                    );
                }
            }
        }
        Ok(resp) => {
            tracing::error!("Auth service token exchange returned {}", resp.status());
            return error_page(
                &state,
                StatusCode::BAD_GATEWAY,
                "Sign-in failed while contacting the auth service.",
            );
        }
        Err(e) => {
            tracing::error!("Auth service token exchange failed: {}", e);
            return error_page(
                &state,
                StatusCode::BAD_GATEWAY,
                "Sign-in failed while contacting the auth service.",
            );
        }
    };

    session.token = Some(token);
    let cookie = state.sessions.save(&session);
    found_with_cookie(&flow.target, cookie)
}

/// `GET /logout` — revoke the session token (best effort) and clear the
/// cookie, then hand the browser to the IdP's end-session endpoint if one
/// is configured.
pub async fn end(State(state): State<Arc<GatewayState>>, headers: HeaderMap) -> Response {
    let session = state.sessions.load(&headers);

    if let Some(token) = session.token {
        let revoke_url = state
            .config
            .auth_service_url
            .join("/api/token/revoke")
            .expect("auth service URL is absolute");
        // One retry on transport errors; revocation is best effort.
        for attempt in 0..2 {
            match state
                .http
                .post(revoke_url.clone())
                .json(&serde_json::json!({ "token": token }))
                .timeout(constants::TOKEN_VALIDATE_TIMEOUT)
                .send()
                .await
            {
                Ok(resp) => {
                    if !resp.status().is_success() {
                        tracing::warn!("Token revocation returned {}", resp.status());
                    }
                    break;
                }
                Err(e) if attempt == 0 => {
                    tracing::debug!("Token revocation attempt failed, retrying: {}", e);
                }
                Err(e) => {
                    tracing::warn!("Token revocation failed, continuing logout: {}", e);
                }
            }
        }
    }

    let location = state
        .config
        .idp_end_session_url
        .as_ref()
        .map(|u| u.to_string())
        .unwrap_or_else(|| "/login".to_string());
    found_with_cookie(&location, Some(state.sessions.clear()))
}

async fn post_form(
    state: &GatewayState,
    form: &[(&str, &str)],
) -> Result<IdpTokenResponse, String> {
    let resp = state
        .http
        .post(state.config.idp_token_url.clone())
        .form(form)
        .timeout(constants::TOKEN_EXCHANGE_TIMEOUT)
        .send()
        .await
        .map_err(|e| e.to_string())?;
    if !resp.status().is_success() {
        return Err(format!("token endpoint returned {}", resp.status()));
    }
    resp.json().await.map_err(|e| e.to_string())
}

/// A terminal broker failure: the flow state is gone, the session cookie
/// is cleared, and the browser gets a brief explanation.
fn error_page(state: &GatewayState, status: StatusCode, message: &str) -> Response {
    let body = format!(
        "<!doctype html><html><head><title>Sign-in error</title></head>\
         <body><h1>Sign-in error</h1><p>{}</p><p><a href=\"/login\">Try again</a></p></body></html>",
        message
    );
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "text/html; charset=utf-8")
        .header(header::SET_COOKIE, state.sessions.clear())
        .body(Body::from(body))
        .expect("static response parts are valid")
}

/// Restrict post-login targets to local absolute paths; everything else
/// lands on `/`.
fn sanitize_target(next: Option<&str>) -> String {
    match next {
        Some(n) if n.starts_with('/') && !n.starts_with("//") => n.to_string(),
        _ => "/".to_string(),
    }
}
