//! Per-handshake rustls hooks backed by the identity source.
//!
//! Nothing here captures identity material at build time. Every handshake
//! loads the current [`IdentityBundle`](crate::identity::IdentityBundle),
//! so a rotation is picked up by the next connection without rebuilding any
//! `ServerConfig` or `ClientConfig`.
//!
//! Peer verification is two-stage:
//!
//! 1. The chain is validated against the current trust bundle (WebPKI).
//! 2. The leaf's SPIFFE ID is run through the [`AuthorizationPolicy`].
//!
//! A stage-2 failure is returned as a [`PolicyRejection`] wrapped in
//! `rustls::Error::InvalidCertificate(CertificateError::Other(..))`, so
//! callers holding the handshake error can tell it apart from a stage-1
//! failure with [`PolicyRejection::from_tls_error`].

use std::sync::Arc;

use parking_lot::Mutex;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::{ResolvesClientCert, verify_server_cert_signed_by_trust_anchor};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::server::{ClientHello, ParsedCertificate, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, OtherError, SignatureScheme,
};
use tracing::{debug, warn};

use super::policy::{AuthorizationPolicy, Decision, Outcome};
use crate::identity::IdentitySource;
use crate::identity::x509::IdExtraction;

// ─────────────────────────────────────────────────────────────────────────────
// Policy rejection
// ─────────────────────────────────────────────────────────────────────────────

/// A peer whose chain validated but whose identity the policy denied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("peer identity {} not permitted by policy '{policy}'", .name.describe())]
pub struct PolicyRejection {
    /// What the peer's leaf carried.
    pub name: IdExtraction,
    /// Display form of the policy that denied it.
    pub policy: String,
}

impl PolicyRejection {
    fn new(decision: Decision, policy: &AuthorizationPolicy) -> Self {
        Self {
            name: decision.name,
            policy: policy.to_string(),
        }
    }

    /// Metrics label: `rejected`, `missing_id` or `malformed_id`.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        match self.name {
            IdExtraction::Present(_) => Outcome::Rejected,
            IdExtraction::Missing => Outcome::MissingId,
            IdExtraction::Malformed(_) => Outcome::MalformedId,
        }
    }

    /// Recover a rejection from a handshake error, if that is what it was.
    #[must_use]
    pub fn from_tls_error(error: &rustls::Error) -> Option<&Self> {
        match error {
            rustls::Error::InvalidCertificate(CertificateError::Other(other)) => {
                other.0.downcast_ref::<Self>()
            }
            _ => None,
        }
    }

    /// Recover a rejection from an I/O error produced by a TLS stream.
    #[must_use]
    pub fn from_io_error(error: &std::io::Error) -> Option<&Self> {
        error
            .get_ref()
            .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            .and_then(Self::from_tls_error)
    }
}

impl From<PolicyRejection> for rustls::Error {
    fn from(rejection: PolicyRejection) -> Self {
        Self::InvalidCertificate(CertificateError::Other(OtherError(Arc::new(rejection))))
    }
}

fn source_unavailable(error: &crate::Error) -> rustls::Error {
    rustls::Error::General(format!("identity unavailable: {error}"))
}

// ─────────────────────────────────────────────────────────────────────────────
// Own certificate
// ─────────────────────────────────────────────────────────────────────────────

/// Presents the current SVID on both sides of a handshake.
#[derive(Debug)]
pub struct SvidResolver {
    source: IdentitySource,
}

impl SvidResolver {
    /// Resolve from `source` on every handshake.
    #[must_use]
    pub fn new(source: IdentitySource) -> Self {
        Self { source }
    }

    fn current_key(&self) -> Option<Arc<CertifiedKey>> {
        match self.source.current() {
            Ok(bundle) => Some(Arc::clone(bundle.certified_key())),
            Err(e) => {
                warn!(error = %e, "No SVID to present");
                None
            }
        }
    }
}

impl ResolvesServerCert for SvidResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.current_key()
    }
}

impl ResolvesClientCert for SvidResolver {
    fn resolve(
        &self,
        _root_hint_subjects: &[&[u8]],
        _sigschemes: &[SignatureScheme],
    ) -> Option<Arc<CertifiedKey>> {
        self.current_key()
    }

    fn has_certs(&self) -> bool {
        !self.source.is_closed()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server side: verifying clients
// ─────────────────────────────────────────────────────────────────────────────

/// Verifies client chains against the current trust bundle, then the policy.
#[derive(Debug)]
pub struct PeerCertVerifier {
    source: IdentitySource,
    policy: Arc<AuthorizationPolicy>,
    require_client_cert: bool,
    provider: Arc<CryptoProvider>,
}

impl PeerCertVerifier {
    /// Build a verifier.
    ///
    /// With `require_client_cert == false`, a client that sends no
    /// certificate completes the handshake unauthenticated; a client that
    /// does send one is verified in full either way.
    #[must_use]
    pub fn new(
        source: IdentitySource,
        policy: Arc<AuthorizationPolicy>,
        require_client_cert: bool,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            source,
            policy,
            require_client_cert,
            provider,
        }
    }
}

impl ClientCertVerifier for PeerCertVerifier {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        self.require_client_cert
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        // SVID clients do not pick a certificate by CA name.
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let bundle = self.source.current().map_err(|e| source_unavailable(&e))?;
        bundle
            .trust_bundle()
            .client_verifier()
            .verify_client_cert(end_entity, intermediates, now)?;

        let decision = self.policy.evaluate(std::slice::from_ref(end_entity));
        if decision.accepted {
            debug!(peer = %decision.name.describe(), "Client identity authorized");
            Ok(ClientCertVerified::assertion())
        } else {
            Err(PolicyRejection::new(decision, &self.policy).into())
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client side: verifying servers
// ─────────────────────────────────────────────────────────────────────────────

/// Verifies server chains against the current trust bundle, then the policy.
///
/// Hostnames are not checked: SVIDs name workloads, not hosts, and the
/// expected identity is what the policy pins. The most recent policy
/// rejection is kept so the caller can report it precisely after the
/// connection error has been flattened by the HTTP stack.
#[derive(Debug)]
pub struct PeerServerVerifier {
    source: IdentitySource,
    policy: Arc<AuthorizationPolicy>,
    provider: Arc<CryptoProvider>,
    last_rejection: Mutex<Option<PolicyRejection>>,
}

impl PeerServerVerifier {
    /// Build a verifier expecting a server that satisfies `policy`.
    #[must_use]
    pub fn new(
        source: IdentitySource,
        policy: Arc<AuthorizationPolicy>,
        provider: Arc<CryptoProvider>,
    ) -> Self {
        Self {
            source,
            policy,
            provider,
            last_rejection: Mutex::new(None),
        }
    }

    /// Take the rejection recorded by the most recent failed handshake.
    pub fn take_rejection(&self) -> Option<PolicyRejection> {
        self.last_rejection.lock().take()
    }
}

impl ServerCertVerifier for PeerServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let bundle = self.source.current().map_err(|e| source_unavailable(&e))?;
        let parsed = ParsedCertificate::try_from(end_entity)?;
        verify_server_cert_signed_by_trust_anchor(
            &parsed,
            bundle.trust_bundle().roots(),
            intermediates,
            now,
            self.provider.signature_verification_algorithms.all,
        )?;

        let decision = self.policy.evaluate(std::slice::from_ref(end_entity));
        if decision.accepted {
            debug!(peer = %decision.name.describe(), "Server identity authorized");
            return Ok(ServerCertVerified::assertion());
        }

        let rejection = PolicyRejection::new(decision, &self.policy);
        warn!(
            presented = %rejection.name.describe(),
            expected = %rejection.policy,
            "Server identity rejected"
        );
        telemetry_metrics::counter!(
            "mtls_policy_rejections_total",
            "side" => "client",
            "outcome" => rejection.outcome().as_str()
        )
        .increment(1);
        *self.last_rejection.lock() = Some(rejection.clone());
        Err(rejection.into())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::identity::{OpenOptions, SpiffeId, identity_channel};
    use crate::mtls::cert_manager::DevAuthority;
    use crate::mtls::crypto_provider;

    const HOUR: Duration = Duration::from_secs(3600);

    async fn source_for(authority: &DevAuthority, path: &str) -> IdentitySource {
        let (publisher, stream) = identity_channel(1);
        publisher
            .publish(
                authority
                    .issue_svid(path, HOUR)
                    .unwrap()
                    .into_full_update(authority.trust_bundle()),
            )
            .await
            .unwrap();
        // The source keeps serving its last bundle once the publisher is dropped.
        IdentitySource::open(stream, OpenOptions::default(), &CancellationToken::new())
            .await
            .unwrap()
    }

    fn exact(raw: &str) -> Arc<AuthorizationPolicy> {
        Arc::new(AuthorizationPolicy::Exact(SpiffeId::parse(raw).unwrap()))
    }

    #[test]
    fn rejection_round_trips_through_tls_error() {
        let rejection = PolicyRejection {
            name: IdExtraction::Missing,
            policy: "any".into(),
        };
        let tls: rustls::Error = rejection.clone().into();
        assert_eq!(PolicyRejection::from_tls_error(&tls), Some(&rejection));

        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, tls);
        assert_eq!(PolicyRejection::from_io_error(&io), Some(&rejection));
    }

    #[test]
    fn other_tls_errors_are_not_rejections() {
        let tls = rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer);
        assert!(PolicyRejection::from_tls_error(&tls).is_none());
        let io = std::io::Error::other("connection reset");
        assert!(PolicyRejection::from_io_error(&io).is_none());
    }

    #[tokio::test]
    async fn client_verifier_accepts_matching_identity() {
        let authority = DevAuthority::new("example.org").unwrap();
        let source = source_for(&authority, "server").await;
        let peer = authority.issue_svid("svc-a", HOUR).unwrap();
        let verifier = PeerCertVerifier::new(
            source,
            exact("spiffe://example.org/svc-a"),
            true,
            crypto_provider(),
        );

        let result = verifier.verify_client_cert(&peer.chain[0], &[], UnixTime::now());

        assert!(result.is_ok());
        assert!(verifier.client_auth_mandatory());
        assert!(verifier.root_hint_subjects().is_empty());
    }

    #[tokio::test]
    async fn client_verifier_rejects_other_identity_with_name() {
        // GIVEN: a valid chain for svc-b and a policy for svc-a
        let authority = DevAuthority::new("example.org").unwrap();
        let source = source_for(&authority, "server").await;
        let peer = authority.issue_svid("svc-b", HOUR).unwrap();
        let verifier = PeerCertVerifier::new(
            source,
            exact("spiffe://example.org/svc-a"),
            false,
            crypto_provider(),
        );

        // WHEN: verifying
        let err = verifier
            .verify_client_cert(&peer.chain[0], &[], UnixTime::now())
            .unwrap_err();

        // THEN: it is a policy rejection naming svc-b
        let rejection = PolicyRejection::from_tls_error(&err).unwrap();
        assert_eq!(rejection.outcome(), Outcome::Rejected);
        assert!(rejection.to_string().contains("spiffe://example.org/svc-b"));
        assert!(!verifier.client_auth_mandatory());
    }

    #[tokio::test]
    async fn client_verifier_rejects_foreign_ca_before_policy() {
        let ours = DevAuthority::new("example.org").unwrap();
        let theirs = DevAuthority::new("example.org").unwrap();
        let source = source_for(&ours, "server").await;
        let peer = theirs.issue_svid("svc-a", HOUR).unwrap();
        let verifier = PeerCertVerifier::new(
            source,
            Arc::new(AuthorizationPolicy::Any),
            true,
            crypto_provider(),
        );

        let err = verifier
            .verify_client_cert(&peer.chain[0], &[], UnixTime::now())
            .unwrap_err();

        assert!(PolicyRejection::from_tls_error(&err).is_none());
    }

    #[tokio::test]
    async fn server_verifier_records_rejection() {
        let authority = DevAuthority::new("example.org").unwrap();
        let source = source_for(&authority, "client").await;
        let server = authority.issue_svid("svc-a", HOUR).unwrap();
        let verifier = PeerServerVerifier::new(
            source,
            exact("spiffe://example.org/svc-b"),
            crypto_provider(),
        );
        let name = ServerName::try_from("svc-b.internal").unwrap();

        let result =
            verifier.verify_server_cert(&server.chain[0], &[], &name, &[], UnixTime::now());

        assert!(result.is_err());
        let rejection = verifier.take_rejection().unwrap();
        assert_eq!(
            rejection.name.id().map(ToString::to_string).as_deref(),
            Some("spiffe://example.org/svc-a")
        );
        assert!(verifier.take_rejection().is_none());
    }

    #[tokio::test]
    async fn server_verifier_ignores_hostname() {
        let authority = DevAuthority::new("example.org").unwrap();
        let source = source_for(&authority, "client").await;
        let server = authority.issue_svid("svc-a", HOUR).unwrap();
        let verifier = PeerServerVerifier::new(
            source,
            exact("spiffe://example.org/svc-a"),
            crypto_provider(),
        );
        let name = ServerName::try_from("unrelated.example.com").unwrap();

        let result =
            verifier.verify_server_cert(&server.chain[0], &[], &name, &[], UnixTime::now());

        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn verifiers_fail_closed_after_source_close() {
        let authority = DevAuthority::new("example.org").unwrap();
        let source = source_for(&authority, "server").await;
        let peer = authority.issue_svid("svc-a", HOUR).unwrap();
        let verifier = PeerCertVerifier::new(
            source.clone(),
            Arc::new(AuthorizationPolicy::Any),
            true,
            crypto_provider(),
        );
        let resolver = SvidResolver::new(source.clone());

        source.close();

        assert!(
            verifier
                .verify_client_cert(&peer.chain[0], &[], UnixTime::now())
                .is_err()
        );
        assert!(!ResolvesClientCert::has_certs(&resolver));
    }
}
