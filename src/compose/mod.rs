//! HTML response composition.
//!
//! Rewrites text/html responses from backends to carry the platform
//! chrome: the global stylesheets, the navigation panel, and the caller's
//! theme. Rewriting is tokenizer-level (no DOM is materialized) and
//! idempotent — composing already-composed output changes nothing. The
//! composer never fails a request: any rewrite error returns the upstream
//! body unchanged.

use std::panic::{AssertUnwindSafe, catch_unwind};

use lol_html::{RewriteStrSettings, element, rewrite_str};

use crate::server::auth::UserClaims;
use crate::state::GatewayState;

pub mod nav;
pub mod theme;

pub const GLOBAL_CSS_HREF: &str = "/static/css/global.css";
pub const SIDE_PANEL_CSS_HREF: &str = "/static/css/side-panel.css";

/// Marker id on the injected frame; its presence means the document has
/// already been composed.
const SHELL_ID: &str = "nexus-shell";

/// Compose a text/html body for `claims`.
///
/// Non-UTF-8 input and rewriter failures return the buffer unchanged.
pub async fn compose(state: &GatewayState, claims: &UserClaims, body: Vec<u8>) -> Vec<u8> {
    let Ok(input) = std::str::from_utf8(&body) else {
        tracing::debug!("Skipping composition of non-UTF-8 body");
        return body;
    };

    let registry = state.registry();
    let theme_origin = registry
        .lookup(&state.config.theme_service)
        .map(|e| e.origin.clone());
    let theme = state.theme.resolve(theme_origin.as_ref(), &claims.email).await;
    let entries = registry.visible_for(claims.permission_level);
    let panel = nav::panel_html(&entries);

    let rewritten = catch_unwind(AssertUnwindSafe(|| rewrite_document(input, &theme, &panel)));
    match rewritten {
        Ok(Ok(out)) => out.into_bytes(),
        Ok(Err(e)) => {
            tracing::warn!("HTML rewrite failed, passing body through: {}", e);
            body
        }
        Err(_) => {
            tracing::error!("HTML rewriter panicked, passing body through");
            body
        }
    }
}

/// One rewriting pass: set `data-theme`, inject missing stylesheet links,
/// and wrap the body in the navigation frame unless it already is.
fn rewrite_document(
    input: &str,
    theme: &str,
    panel: &str,
) -> Result<String, lol_html::errors::RewritingError> {
    let lower = input.to_ascii_lowercase();
    let has_html = has_tag(&lower, "html");
    let has_head = has_tag(&lower, "head");
    let has_body = has_tag(&lower, "body");

    let mut links = String::new();
    if !input.contains(GLOBAL_CSS_HREF) {
        links.push_str(&stylesheet_link(GLOBAL_CSS_HREF));
    }
    if !input.contains(SIDE_PANEL_CSS_HREF) {
        links.push_str(&stylesheet_link(SIDE_PANEL_CSS_HREF));
    }
    let wrap_body = has_body && !input.contains(&format!("id=\"{}\"", SHELL_ID));

    let mut handlers = Vec::new();

    if has_html {
        let theme = theme.to_string();
        handlers.push(element!("html", move |el| {
            el.set_attribute("data-theme", &theme)?;
            Ok(())
        }));
    }

    if !links.is_empty() {
        if has_head {
            let links = links.clone();
            handlers.push(element!("head", move |el| {
                el.prepend(&links, lol_html::html_content::ContentType::Html);
                Ok(())
            }));
        } else if has_html {
            // No <head> tag at all; synthesize one at the top of <html>.
            let head = format!("<head>{}</head>", links);
            handlers.push(element!("html", move |el| {
                el.prepend(&head, lol_html::html_content::ContentType::Html);
                Ok(())
            }));
        }
    }

    if wrap_body {
        let open = format!(
            r#"<div id="{}" class="nexus-shell">{}<main class="nexus-content">"#,
            SHELL_ID, panel
        );
        handlers.push(element!("body", move |el| {
            el.prepend(&open, lol_html::html_content::ContentType::Html);
            el.append("</main></div>", lol_html::html_content::ContentType::Html);
            Ok(())
        }));
    }

    rewrite_str(
        input,
        RewriteStrSettings {
            element_content_handlers: handlers,
            ..RewriteStrSettings::default()
        },
    )
}

fn stylesheet_link(href: &str) -> String {
    format!(r#"<link rel="stylesheet" href="{}">"#, href)
}

/// Whether an opening tag for `tag` occurs in the (lower-cased) document.
/// Matches `<head>`, `<head ...>`, `<head/>` but not `<header>`.
fn has_tag(lower: &str, tag: &str) -> bool {
    let needle = format!("<{}", tag);
    let mut start = 0;
    while let Some(found) = lower[start..].find(&needle) {
        let end = start + found + needle.len();
        match lower.as_bytes().get(end) {
            None => return true,
            Some(b) if b" \t\r\n/>".contains(b) => return true,
            _ => start = start + found + 1,
        }
    }
    false
}
