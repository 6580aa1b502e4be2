//! Built-in static assets.
//!
//! The platform chrome ships inside the binary so a gateway deployment has
//! no runtime file dependencies. Only the two stylesheets the composer
//! injects are served.

use axum::body::Body;
use axum::extract::Path;
use axum::http::{StatusCode, header};
use axum::response::Response;

const GLOBAL_CSS: &str = include_str!("../../../static/css/global.css");
const SIDE_PANEL_CSS: &str = include_str!("../../../static/css/side-panel.css");

/// `GET /static/{*asset}`
pub async fn static_asset(Path(asset): Path<String>) -> Response {
    let body = match asset.as_str() {
        "css/global.css" => GLOBAL_CSS,
        "css/side-panel.css" => SIDE_PANEL_CSS,
        _ => {
            return Response::builder()
                .status(StatusCode::NOT_FOUND)
                .body(Body::from("not found"))
                .expect("static response parts are valid");
        }
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/css; charset=utf-8")
        .header(header::CACHE_CONTROL, "public, max-age=86400")
        .body(Body::from(body))
        .expect("static response parts are valid")
}
