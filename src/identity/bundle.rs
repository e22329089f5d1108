//! Identity material: SVIDs, trust bundles and the combined identity bundle.
//!
//! Every value in this module is immutable once built. Construction performs
//! all validation and derives the rustls key material up front, so a bundle
//! that reaches the [`IdentitySource`](super::IdentitySource) slot is always
//! internally consistent: the leaf certificate matches the private key and
//! the trust anchors are already loaded into a root store.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use rustls::sign::CertifiedKey;

use super::spiffe_id::SpiffeId;
use super::x509::{CertInfo, IdExtraction};
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Updates delivered by the identity authority
// ─────────────────────────────────────────────────────────────────────────────

/// One message from the external identity stream.
///
/// The authority rotates leaf certificates and trust anchors on independent
/// schedules, so either half may arrive alone.
#[derive(Debug)]
pub enum IdentityUpdate {
    /// New leaf-first certificate chain and its private key.
    Svid {
        /// Leaf-first chain.
        chain: Vec<CertificateDer<'static>>,
        /// Private key matching the leaf.
        key: PrivateKeyDer<'static>,
    },
    /// New set of trust anchors.
    TrustBundle(Vec<CertificateDer<'static>>),
    /// Both halves at once.
    Full {
        /// Leaf-first chain.
        chain: Vec<CertificateDer<'static>>,
        /// Private key matching the leaf.
        key: PrivateKeyDer<'static>,
        /// Trust anchors.
        trust_bundle: Vec<CertificateDer<'static>>,
    },
}

// ─────────────────────────────────────────────────────────────────────────────
// SVID
// ─────────────────────────────────────────────────────────────────────────────

/// A validated X.509 SVID: chain, key and the identity they assert.
pub struct Svid {
    spiffe_id: SpiffeId,
    leaf: CertInfo,
    certified_key: Arc<CertifiedKey>,
}

impl Svid {
    /// Validate a chain/key pair and load the key into rustls.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentity` for an empty chain, a leaf without a
    /// usable SPIFFE ID, or a key the provider cannot load. Returns
    /// `Error::Tls` when the key does not belong to the leaf certificate.
    pub fn new(
        chain: Vec<CertificateDer<'static>>,
        key: &PrivateKeyDer<'static>,
        provider: &CryptoProvider,
    ) -> Result<Self> {
        let leaf_der = chain
            .first()
            .ok_or_else(|| Error::InvalidIdentity("SVID chain is empty".into()))?;
        let leaf = CertInfo::from_der(leaf_der)?;

        let spiffe_id = match &leaf.spiffe_id {
            IdExtraction::Present(id) => id.clone(),
            other => {
                return Err(Error::InvalidIdentity(format!(
                    "SVID leaf does not carry a usable SPIFFE ID: {}",
                    other.describe()
                )));
            }
        };

        let signing_key = provider
            .key_provider
            .load_private_key(key.clone_key())
            .map_err(|e| Error::InvalidIdentity(format!("Unusable SVID private key: {e}")))?;

        let certified_key = CertifiedKey::new(chain, signing_key);
        certified_key.keys_match()?;

        Ok(Self {
            spiffe_id,
            leaf,
            certified_key: Arc::new(certified_key),
        })
    }

    /// The identity this SVID asserts.
    #[must_use]
    pub fn spiffe_id(&self) -> &SpiffeId {
        &self.spiffe_id
    }

    /// Parsed leaf certificate fields.
    #[must_use]
    pub fn leaf(&self) -> &CertInfo {
        &self.leaf
    }

    /// Leaf-first certificate chain.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.certified_key.cert
    }

    /// Chain and signing key as presented in handshakes.
    #[must_use]
    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        &self.certified_key
    }
}

impl fmt::Debug for Svid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Svid")
            .field("spiffe_id", &self.spiffe_id.to_string())
            .field("serial_number", &self.leaf.serial_number)
            .field("not_after", &self.leaf.not_after)
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Trust bundle
// ─────────────────────────────────────────────────────────────────────────────

/// Trust anchors for validating peers, with the verifier prebuilt from them.
pub struct TrustBundle {
    certs: Vec<CertificateDer<'static>>,
    roots: Arc<RootCertStore>,
    client_verifier: Arc<dyn ClientCertVerifier>,
}

impl TrustBundle {
    /// Load trust anchors into a root store.
    ///
    /// Unparseable certificates are skipped; at least one must load.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentity` when no anchor is usable.
    pub fn new(certs: Vec<CertificateDer<'static>>, provider: &Arc<CryptoProvider>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        let (added, ignored) = roots.add_parsable_certificates(certs.iter().cloned());
        if added == 0 {
            return Err(Error::InvalidIdentity(format!(
                "Trust bundle has no usable anchors ({ignored} ignored)"
            )));
        }
        if ignored > 0 {
            tracing::warn!(added, ignored, "Some trust bundle certificates were unusable");
        }

        let roots = Arc::new(roots);
        let client_verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::clone(&roots), Arc::clone(provider))
                .build()
                .map_err(|e| {
                    Error::InvalidIdentity(format!("Failed to build peer verifier: {e}"))
                })?;

        Ok(Self {
            certs,
            roots,
            client_verifier,
        })
    }

    /// Raw anchor certificates as delivered.
    #[must_use]
    pub fn certs(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    /// Root store built from the anchors.
    #[must_use]
    pub fn roots(&self) -> &Arc<RootCertStore> {
        &self.roots
    }

    /// WebPKI verifier for client chains, built from [`Self::roots`].
    #[must_use]
    pub fn client_verifier(&self) -> &Arc<dyn ClientCertVerifier> {
        &self.client_verifier
    }
}

impl fmt::Debug for TrustBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustBundle")
            .field("anchors", &self.roots.len())
            .finish_non_exhaustive()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Identity bundle
// ─────────────────────────────────────────────────────────────────────────────

/// The workload's current identity: SVID plus the trust bundle for peers.
///
/// Superseded as a whole on rotation, never mutated.
#[derive(Debug, Clone)]
pub struct IdentityBundle {
    svid: Arc<Svid>,
    trust_bundle: Arc<TrustBundle>,
    generation: u64,
}

impl IdentityBundle {
    /// Combine an SVID and a trust bundle.
    #[must_use]
    pub fn new(svid: Arc<Svid>, trust_bundle: Arc<TrustBundle>, generation: u64) -> Self {
        Self {
            svid,
            trust_bundle,
            generation,
        }
    }

    /// The workload's own identity.
    #[must_use]
    pub fn spiffe_id(&self) -> &SpiffeId {
        self.svid.spiffe_id()
    }

    /// The SVID half.
    #[must_use]
    pub fn svid(&self) -> &Arc<Svid> {
        &self.svid
    }

    /// The trust bundle half.
    #[must_use]
    pub fn trust_bundle(&self) -> &Arc<TrustBundle> {
        &self.trust_bundle
    }

    /// Leaf-first certificate chain.
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        self.svid.chain()
    }

    /// Chain and signing key for handshakes.
    #[must_use]
    pub fn certified_key(&self) -> &Arc<CertifiedKey> {
        self.svid.certified_key()
    }

    /// Start of the leaf validity window.
    #[must_use]
    pub fn not_before(&self) -> DateTime<Utc> {
        self.svid.leaf().not_before
    }

    /// End of the leaf validity window.
    #[must_use]
    pub fn not_after(&self) -> DateTime<Utc> {
        self.svid.leaf().not_after
    }

    /// Monotonic publish counter assigned by the identity source.
    #[must_use]
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtls::cert_manager::DevAuthority;
    use crate::mtls::crypto_provider;
    use std::time::Duration;

    const HOUR: Duration = Duration::from_secs(3600);

    #[test]
    fn svid_requires_non_empty_chain() {
        let authority = DevAuthority::new("example.org").unwrap();
        let issued = authority.issue_svid("svc-a", HOUR).unwrap();
        let result = Svid::new(Vec::new(), &issued.key, &crypto_provider());
        assert!(matches!(result, Err(Error::InvalidIdentity(_))));
    }

    #[test]
    fn svid_rejects_key_from_another_leaf() {
        // GIVEN: two SVIDs from the same authority
        let authority = DevAuthority::new("example.org").unwrap();
        let a = authority.issue_svid("svc-a", HOUR).unwrap();
        let b = authority.issue_svid("svc-b", HOUR).unwrap();
        // WHEN: pairing a's chain with b's key
        let result = Svid::new(a.chain, &b.key, &crypto_provider());
        // THEN: the torn pair is refused
        assert!(result.is_err());
    }

    #[test]
    fn svid_exposes_identity_and_validity() {
        let authority = DevAuthority::new("example.org").unwrap();
        let issued = authority.issue_svid("svc-a", HOUR).unwrap();
        let svid = Svid::new(issued.chain, &issued.key, &crypto_provider()).unwrap();
        assert_eq!(svid.spiffe_id().to_string(), "spiffe://example.org/svc-a");
        assert!(svid.leaf().not_after > Utc::now());
        assert!(svid.certified_key().keys_match().is_ok());
    }

    #[test]
    fn svid_without_spiffe_id_is_rejected() {
        let authority = DevAuthority::new("example.org").unwrap();
        let issued = authority.issue_plain_leaf("not-a-workload").unwrap();
        let result = Svid::new(issued.chain, &issued.key, &crypto_provider());
        assert!(matches!(result, Err(Error::InvalidIdentity(ref m)) if m.contains("no spiffe id")));
    }

    #[test]
    fn trust_bundle_rejects_garbage_only() {
        let result = TrustBundle::new(
            vec![CertificateDer::from(b"garbage".to_vec())],
            &crypto_provider(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn trust_bundle_loads_authority_root() {
        let authority = DevAuthority::new("example.org").unwrap();
        let bundle = TrustBundle::new(authority.trust_bundle(), &crypto_provider()).unwrap();
        assert_eq!(bundle.roots().len(), 1);
        assert_eq!(bundle.certs().len(), 1);
    }
}
