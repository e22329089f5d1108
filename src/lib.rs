//! mTLS Workload Library
//!
//! SPIFFE-style workload identity for service-to-service mutual TLS.
//!
//! # Features
//!
//! - **Rotating identity**: `IdentitySource` publishes each SVID + trust
//!   bundle atomically; every new handshake sees the latest one
//! - **Authorization policies**: exact ID, path prefix, trust domain, or any,
//!   composable with OR
//! - **Authenticated server**: TLS 1.3 with per-handshake certificate and
//!   trust resolution; the peer identity is attached to each request
//! - **Authenticated client**: outbound calls that pin the server's identity
//!   and report a wrong peer as its own error
//! - **File-based identity**: watches a PEM directory kept current by a
//!   SPIFFE helper or agent sidecar

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod identity;
pub mod mtls;
pub mod service;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => {
            subscriber.with(fmt::layer().json()).init();
        }
        _ => {
            subscriber.with(fmt::layer()).init();
        }
    }

    Ok(())
}
