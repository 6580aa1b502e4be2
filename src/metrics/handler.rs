//! # Metrics HTTP Handler
//!
//! Owns the Prometheus recorder and serves its rendered output at
//! `/metrics` when the `prometheus` feature is enabled.
//!
//! ## HTTP Responses
//!
//! - `200 OK`: Metrics successfully rendered
//! - `503 Service Unavailable`: Metrics recorder not initialized

#![cfg(feature = "prometheus")]

use http_body_util::Full;
use hyper::Response;
use hyper::body::Bytes;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Render handle for the installed recorder; `None` until `install` has
/// succeeded.
static PROM_HANDLE: std::sync::OnceLock<PrometheusHandle> = std::sync::OnceLock::new();

/// Interval between recorder upkeep passes. Histograms and summaries
/// accumulate samples until drained; without upkeep they grow unbounded.
const UPKEEP_PERIOD: std::time::Duration = std::time::Duration::from_secs(30);

/// Make this process's `metrics::counter!` et al. land in a Prometheus
/// registry and keep a handle for the scrape endpoint. A failed install
/// (another global recorder already present) leaves `/metrics` serving
/// 503 rather than aborting startup.
pub(crate) fn install() {
    let recorder = match PrometheusBuilder::new().install_recorder() {
        Ok(recorder) => recorder,
        Err(e) => {
            tracing::warn!("Prometheus recorder not installed: {}", e);
            return;
        }
    };
    if PROM_HANDLE.set(recorder.clone()).is_err() {
        return;
    }
    tokio::spawn(run_upkeep(recorder));
}

async fn run_upkeep(recorder: PrometheusHandle) {
    let mut period = tokio::time::interval(UPKEEP_PERIOD);
    loop {
        period.tick().await;
        recorder.run_upkeep();
    }
}

/// `GET /metrics` — Prometheus text exposition (version 0.0.4).
pub async fn metrics_handler() -> Response<Full<Bytes>> {
    match PROM_HANDLE.get() {
        Some(recorder) => Response::builder()
            .status(200)
            .header("content-type", "text/plain; version=0.0.4; charset=utf-8")
            .body(Full::new(Bytes::from(recorder.render())))
            .expect("static response parts are valid"),
        None => Response::builder()
            .status(503)
            .body(Full::new(Bytes::from_static(
                b"metrics recorder not initialized",
            )))
            .expect("static response parts are valid"),
    }
}
