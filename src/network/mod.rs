//! Network module - Handles TCP communication for the relay
//!
//! Provides:
//! - Server accepting peers and fanning bytes out between them
//! - Registry of open connections
//! - Client sending and receiving framed events

mod client;
mod connection;
mod registry;
mod server;

pub use client::*;
pub use connection::*;
pub use registry::*;
pub use server::*;

use std::net::SocketAddr;

/// Resolve a hostname to a socket address
pub async fn resolve_host(host: &str, port: u16) -> std::io::Result<SocketAddr> {
    use tokio::net::lookup_host;

    let addr_string = format!("{}:{}", host, port);
    let mut addrs = lookup_host(&addr_string).await?;

    addrs.next().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("Could not resolve host: {}", host),
        )
    })
}
