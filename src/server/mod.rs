//! HTTP server: routing, TLS termination, token validation, and handlers.

pub mod auth;
pub mod constants;
pub mod handlers;
pub mod service;

use std::net::SocketAddr;

/// Remote peer address of the accepted connection, injected per-connection
/// so handlers can extend `X-Forwarded-For`.
#[derive(Debug, Clone, Copy)]
pub struct PeerAddr(pub SocketAddr);
