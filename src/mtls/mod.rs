//! Identity-aware mutual TLS.
//!
//! # Architecture
//!
//! ```text
//! TCP connection
//!   → TLS 1.3 handshake
//!       SvidResolver        presents the current SVID (per handshake)
//!       PeerCertVerifier    chain vs current trust bundle, then policy
//!   → PeerIdentity extracted from the validated leaf
//!   → Injected into request extensions
//!   → handlers
//! ```
//!
//! The outbound side mirrors this: [`AuthenticatedClient`] presents the same
//! SVID and pins the server's identity with an [`AuthorizationPolicy`].
//!
//! # Modules
//!
//! - [`policy`] — `AuthorizationPolicy`, `Decision`, config rules
//! - [`verifier`] — rustls resolver and verifiers reading the identity source
//! - [`server`] — `server_config`, `IdentityAcceptor`, `PeerIdentity`
//! - [`client`] — `client_config`, `AuthenticatedClient`
//! - [`cert_manager`] — PEM loading and development SVID issuance

use std::sync::Arc;

use rustls::crypto::CryptoProvider;

pub mod cert_manager;
pub mod client;
pub mod policy;
pub mod server;
pub mod verifier;

pub use cert_manager::{DevAuthority, IssuedSvid, SvidParams, load_certs, load_private_key};
pub use client::{AuthenticatedClient, client_config};
pub use policy::{AuthorizationPolicy, Decision, Outcome, PolicyRuleConfig};
pub use server::{AcceptStats, IdentityAcceptor, PeerIdentity, server_config};
pub use verifier::{PeerCertVerifier, PeerServerVerifier, PolicyRejection, SvidResolver};

/// The process-wide crypto provider, or `aws-lc-rs` when none is installed.
#[must_use]
pub fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}
