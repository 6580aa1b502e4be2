//! # Metrics Collection Module

pub mod handler;

/// Installs the Prometheus recorder when the `prometheus` feature is
/// enabled; a no-op otherwise. Must run inside a Tokio runtime so the
/// recorder's upkeep task can be spawned.
pub fn init() {
    #[cfg(feature = "prometheus")]
    handler::install();
}
