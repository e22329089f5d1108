//! Authenticated server: TLS configuration and connection acceptor.
//!
//! [`server_config`] builds a `rustls::ServerConfig` whose certificate and
//! trust anchors are resolved per handshake from the identity source.
//! [`IdentityAcceptor`] plugs into `axum-server`, completes the handshake,
//! and attaches a [`PeerIdentity`] to every request on the connection.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Extension;
use axum::middleware::AddExtension;
use axum_server::accept::{Accept, DefaultAcceptor};
use axum_server::tls_rustls::{RustlsAcceptor, RustlsConfig};
use futures::future::BoxFuture;
use rustls::ServerConfig;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tower::Layer;
use tracing::{debug, warn};

use super::crypto_provider;
use super::policy::AuthorizationPolicy;
use super::verifier::{PeerCertVerifier, PolicyRejection, SvidResolver};
use crate::identity::x509::{IdExtraction, extract_spiffe_id};
use crate::identity::{IdentitySource, SpiffeId};
use crate::{Error, Result};

/// Upper bound on a single TLS handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ─────────────────────────────────────────────────────────────────────────────
// Peer identity claim
// ─────────────────────────────────────────────────────────────────────────────

/// Who is on the other end of a connection, as established at handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerIdentity {
    /// Peer presented a validated, authorized SVID.
    Authenticated(SpiffeId),
    /// Peer presented no certificate (auth-optional mode), or a validated
    /// certificate that names no workload.
    Unauthenticated,
}

impl PeerIdentity {
    /// Derive the claim from the peer chain of a completed handshake.
    #[must_use]
    pub fn from_peer_chain(chain: Option<&[rustls::pki_types::CertificateDer<'_>]>) -> Self {
        match chain.and_then(<[_]>::first).map(|leaf| extract_spiffe_id(leaf)) {
            Some(IdExtraction::Present(id)) => Self::Authenticated(id),
            _ => Self::Unauthenticated,
        }
    }

    /// The authenticated ID, if any.
    #[must_use]
    pub fn spiffe_id(&self) -> Option<&SpiffeId> {
        match self {
            Self::Authenticated(id) => Some(id),
            Self::Unauthenticated => None,
        }
    }

    /// `true` for [`PeerIdentity::Authenticated`].
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated(_))
    }
}

impl fmt::Display for PeerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Authenticated(id) => write!(f, "{id}"),
            Self::Unauthenticated => f.write_str("unauthenticated"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server config
// ─────────────────────────────────────────────────────────────────────────────

/// Build a TLS 1.3 server config bound to `source`.
///
/// With `require_client_cert`, a client without a certificate fails the
/// handshake. Without it, such a client is served as
/// [`PeerIdentity::Unauthenticated`]. A presented certificate is always
/// validated and run through `policy`.
///
/// # Errors
///
/// Returns `Error::Config` if the crypto provider does not support TLS 1.3.
pub fn server_config(
    source: &IdentitySource,
    policy: Arc<AuthorizationPolicy>,
    require_client_cert: bool,
) -> Result<ServerConfig> {
    let provider = crypto_provider();
    let verifier = PeerCertVerifier::new(
        source.clone(),
        Arc::clone(&policy),
        require_client_cert,
        Arc::clone(&provider),
    );

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Config(format!("TLS protocol setup failed: {e}")))?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_cert_resolver(Arc::new(SvidResolver::new(source.clone())));

    // Prefer HTTP/2, fall back to HTTP/1.1
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(%policy, require_client_cert, "mTLS server config built");
    Ok(config)
}

/// Map a failed server-side handshake onto the error taxonomy.
#[must_use]
pub fn classify_handshake_error(error: &io::Error) -> Error {
    match PolicyRejection::from_io_error(error) {
        Some(rejection) => Error::PolicyRejected {
            name: rejection.name.describe(),
        },
        None => Error::HandshakeFailed(error.to_string()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Acceptor
// ─────────────────────────────────────────────────────────────────────────────

/// Connection-level counters kept by an [`IdentityAcceptor`].
#[derive(Debug, Default)]
pub struct AcceptStats {
    accepted: AtomicU64,
    handshake_failures: AtomicU64,
    policy_rejections: AtomicU64,
}

impl AcceptStats {
    /// Connections that completed the handshake.
    #[must_use]
    pub fn accepted(&self) -> u64 {
        self.accepted.load(Ordering::Relaxed)
    }

    /// Handshakes that failed for transport or chain-validation reasons.
    #[must_use]
    pub fn handshake_failures(&self) -> u64 {
        self.handshake_failures.load(Ordering::Relaxed)
    }

    /// Handshakes aborted because the peer's identity was not permitted.
    #[must_use]
    pub fn policy_rejections(&self) -> u64 {
        self.policy_rejections.load(Ordering::Relaxed)
    }
}

/// `axum-server` acceptor that terminates TLS and tags requests with the
/// peer's [`PeerIdentity`].
#[derive(Clone)]
pub struct IdentityAcceptor {
    inner: RustlsAcceptor<DefaultAcceptor>,
    stats: Arc<AcceptStats>,
}

impl fmt::Debug for IdentityAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityAcceptor")
            .field("stats", &self.stats)
            .finish_non_exhaustive()
    }
}

impl IdentityAcceptor {
    /// Wrap a server config built by [`server_config`].
    #[must_use]
    pub fn new(config: ServerConfig) -> Self {
        let rustls = RustlsConfig::from_config(Arc::new(config));
        Self {
            inner: RustlsAcceptor::new(rustls).handshake_timeout(HANDSHAKE_TIMEOUT),
            stats: Arc::new(AcceptStats::default()),
        }
    }

    /// Shared counters, live for the acceptor's lifetime.
    #[must_use]
    pub fn stats(&self) -> Arc<AcceptStats> {
        Arc::clone(&self.stats)
    }

    fn record_failure(&self, error: &io::Error) {
        match classify_handshake_error(error) {
            Error::PolicyRejected { name } => {
                let outcome = PolicyRejection::from_io_error(error)
                    .map_or("rejected", |r| r.outcome().as_str());
                warn!(presented = %name, outcome, "Client identity rejected by policy");
                telemetry_metrics::counter!(
                    "mtls_policy_rejections_total",
                    "side" => "server",
                    "outcome" => outcome
                )
                .increment(1);
                self.stats.policy_rejections.fetch_add(1, Ordering::Relaxed);
            }
            other => {
                warn!(error = %other, "TLS handshake failed");
                telemetry_metrics::counter!("mtls_handshake_failures_total").increment(1);
                self.stats.handshake_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl<I, S> Accept<I, S> for IdentityAcceptor
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    S: Send + 'static,
{
    type Stream = TlsStream<I>;
    type Service = AddExtension<S, PeerIdentity>;
    type Future = BoxFuture<'static, io::Result<(Self::Stream, Self::Service)>>;

    fn accept(&self, stream: I, service: S) -> Self::Future {
        let this = self.clone();
        Box::pin(async move {
            let (stream, service) = match this.inner.accept(stream, service).await {
                Ok(accepted) => accepted,
                Err(e) => {
                    this.record_failure(&e);
                    return Err(e);
                }
            };

            let peer = PeerIdentity::from_peer_chain(stream.get_ref().1.peer_certificates());
            debug!(%peer, "TLS connection established");
            this.stats.accepted.fetch_add(1, Ordering::Relaxed);

            Ok((stream, Extension(peer).layer(service)))
        })
    }
}
