/// Nexus configuration defaults module.
///
/// Default value helpers shared between the config structs, the session
/// layer, and tests. Timeouts that belong to a single component live next
/// to that component in `server/constants.rs`.

/// Default session cookie name.
pub(crate) fn default_session_cookie_name() -> &'static str {
    "nexus_session"
}

/// Default session cookie lifetime in seconds (one hour).
pub(crate) fn default_session_ttl_secs() -> i64 {
    3600
}

/// Largest text/html response body the composer will buffer (8 MiB).
pub(crate) fn default_html_buffer_cap() -> usize {
    8 * 1024 * 1024
}
