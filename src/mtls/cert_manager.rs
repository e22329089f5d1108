//! Certificate management — PEM loading and development SVID issuance.
//!
//! Provides:
//! - [`load_certs`] / [`load_private_key`] — PEM file loading for the file-backed identity stream
//! - [`DevAuthority`] — `rcgen`-backed trust domain CA for `mtls-workload dev-certs` and tests
//!
//! # File format
//!
//! All certificate and key files are expected in **PEM format**, laid out the
//! way SPIFFE helpers write them: `svid.pem` (leaf-first chain),
//! `svid_key.pem` (PKCS#8 key) and `bundle.pem` (trust anchors).
//!
//! `DevAuthority` is a local convenience for development and tests. It does
//! not speak any issuance protocol.

use std::fs;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rcgen::string::Ia5String;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
    Issuer, KeyPair, KeyUsagePurpose, SanType,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use time::OffsetDateTime;

use crate::identity::{IdentityUpdate, SpiffeId};
use crate::{Error, Result};

/// Default file name of the leaf-first SVID chain.
pub const SVID_FILE: &str = "svid.pem";
/// Default file name of the SVID private key.
pub const SVID_KEY_FILE: &str = "svid_key.pem";
/// Default file name of the trust bundle.
pub const BUNDLE_FILE: &str = "bundle.pem";

/// Clock skew allowance applied to `not_before` of issued SVIDs.
const BACKDATE_SECS: i64 = 60;

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::InvalidIdentity(format!(
                "Failed to parse certs from '{}': {e}",
                path.display()
            ))
        })?;

    if certs.is_empty() {
        return Err(Error::InvalidIdentity(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports PKCS#8 (`PRIVATE KEY`), SEC1 (`EC PRIVATE KEY`) and RSA keys.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no private key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| {
            Error::InvalidIdentity(format!(
                "Failed to parse private key from '{}': {e}",
                path.display()
            ))
        })?
        .ok_or_else(|| {
            Error::InvalidIdentity(format!("No private key found in '{}'", path.display()))
        })
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: development authority
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for issuing an SVID.
#[derive(Debug, Clone)]
pub struct SvidParams<'a> {
    /// Workload path below the trust domain, e.g. `"ns/prod/svc-a"`.
    pub path: &'a str,
    /// Subject Alternative Names — DNS entries.
    pub dns_names: Vec<String>,
    /// Offset of `not_before` from now, in seconds (negative = past).
    pub not_before_offset: i64,
    /// Offset of `not_after` from now, in seconds (negative = already expired).
    pub not_after_offset: i64,
}

impl<'a> SvidParams<'a> {
    /// Valid from slightly before now until `ttl` from now.
    #[must_use]
    pub fn new(path: &'a str, ttl: Duration) -> Self {
        Self {
            path,
            dns_names: Vec::new(),
            not_before_offset: -BACKDATE_SECS,
            not_after_offset: i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX),
        }
    }
}

/// An issued SVID in both DER and PEM form.
#[derive(Debug)]
pub struct IssuedSvid {
    /// Identity embedded in the leaf.
    pub spiffe_id: SpiffeId,
    /// Leaf-first chain (just the leaf; the CA is the trust anchor).
    pub chain: Vec<CertificateDer<'static>>,
    /// PKCS#8 private key.
    pub key: PrivateKeyDer<'static>,
    /// PEM-encoded leaf.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

impl IssuedSvid {
    /// Turn into a stream update carrying the SVID half only.
    #[must_use]
    pub fn into_svid_update(self) -> IdentityUpdate {
        IdentityUpdate::Svid {
            chain: self.chain,
            key: self.key,
        }
    }

    /// Turn into a full stream update with the given trust anchors.
    #[must_use]
    pub fn into_full_update(self, trust_bundle: Vec<CertificateDer<'static>>) -> IdentityUpdate {
        IdentityUpdate::Full {
            chain: self.chain,
            key: self.key,
            trust_bundle,
        }
    }

    /// Write `svid.pem`, `svid_key.pem` and `bundle.pem` under `dir`.
    ///
    /// The key is written before the chain so a watcher that reacts to the
    /// chain file sees a matching key.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the files
    /// cannot be written.
    pub fn write_to_dir(&self, dir: &Path, bundle_pem: &str) -> Result<()> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Config(format!("Cannot create dir '{}': {e}", dir.display())))?;

        write_file(&dir.join(SVID_KEY_FILE), &self.key_pem)?;
        write_file(&dir.join(BUNDLE_FILE), bundle_pem)?;
        write_file(&dir.join(SVID_FILE), &self.cert_pem)?;
        Ok(())
    }
}

/// Self-signed trust domain CA issuing short-lived SVIDs.
pub struct DevAuthority {
    trust_domain: String,
    ca_der: CertificateDer<'static>,
    ca_pem: String,
    issuer: Issuer<'static, KeyPair>,
}

impl DevAuthority {
    /// Generate a fresh CA for `trust_domain`, valid for one year.
    ///
    /// # Errors
    ///
    /// Returns an error if the trust domain is invalid or key generation fails.
    pub fn new(trust_domain: &str) -> Result<Self> {
        let td_id = SpiffeId::parse(&format!("spiffe://{trust_domain}"))?;

        let ca_key = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate CA key: {e}")))?;

        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{trust_domain} development CA"));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.subject_alt_names = vec![uri_san(&td_id.to_string())?];
        params.not_before = offset_from_now(-BACKDATE_SECS)?;
        params.not_after = offset_from_now(365 * 86_400)?;

        let ca_cert = params
            .self_signed(&ca_key)
            .map_err(|e| Error::Config(format!("CA cert generation failed: {e}")))?;

        Ok(Self {
            trust_domain: trust_domain.to_owned(),
            ca_der: ca_cert.der().clone(),
            ca_pem: ca_cert.pem(),
            issuer: Issuer::new(params, ca_key),
        })
    }

    /// Trust domain this authority issues for.
    #[must_use]
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// Trust anchors peers need to validate SVIDs from this authority.
    #[must_use]
    pub fn trust_bundle(&self) -> Vec<CertificateDer<'static>> {
        vec![self.ca_der.clone()]
    }

    /// PEM-encoded CA certificate (contents of `bundle.pem`).
    #[must_use]
    pub fn bundle_pem(&self) -> &str {
        &self.ca_pem
    }

    /// Issue an SVID for `path` valid for `ttl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not form a valid SPIFFE ID or
    /// signing fails.
    pub fn issue_svid(&self, path: &str, ttl: Duration) -> Result<IssuedSvid> {
        self.issue(&SvidParams::new(path, ttl))
    }

    /// Issue an SVID with explicit parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if the path does not form a valid SPIFFE ID, a SAN is
    /// not IA5, or signing fails.
    pub fn issue(&self, params: &SvidParams<'_>) -> Result<IssuedSvid> {
        let spiffe_id = SpiffeId::from_segments(
            &self.trust_domain,
            params.path.split('/').filter(|s| !s.is_empty()),
        )?;

        let mut leaf = leaf_params(
            spiffe_id.segments().last().unwrap_or(self.trust_domain.as_str()),
            params.not_before_offset,
            params.not_after_offset,
        )?;
        let mut sans = vec![uri_san(&spiffe_id.to_string())?];
        for dns in &params.dns_names {
            let ia5 = Ia5String::try_from(dns.as_str())
                .map_err(|e| Error::Config(format!("Invalid DNS SAN '{dns}': {e}")))?;
            sans.push(SanType::DnsName(ia5));
        }
        leaf.subject_alt_names = sans;

        self.sign(spiffe_id, &leaf)
    }

    /// Issue a CA-signed leaf that carries no SPIFFE ID.
    ///
    /// Models a certificate that chains to the trust bundle but names no
    /// workload. `spiffe_id` on the result names the issuing trust domain.
    ///
    /// # Errors
    ///
    /// Returns an error if signing fails.
    pub fn issue_plain_leaf(&self, common_name: &str) -> Result<IssuedSvid> {
        let mut leaf = leaf_params(common_name, -BACKDATE_SECS, 3600)?;
        leaf.subject_alt_names = vec![SanType::DnsName(
            Ia5String::try_from(format!("{common_name}.{}", self.trust_domain))
                .map_err(|e| Error::Config(format!("Invalid DNS SAN: {e}")))?,
        )];
        let td_id = SpiffeId::parse(&format!("spiffe://{}", self.trust_domain))?;
        self.sign(td_id, &leaf)
    }

    fn sign(&self, spiffe_id: SpiffeId, leaf: &CertificateParams) -> Result<IssuedSvid> {
        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Config(format!("Failed to generate leaf key: {e}")))?;
        let cert = leaf
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| Error::Config(format!("Leaf cert signing failed: {e}")))?;

        Ok(IssuedSvid {
            spiffe_id,
            chain: vec![cert.der().clone()],
            key: PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
            cert_pem: cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn leaf_params(
    common_name: &str,
    not_before_offset: i64,
    not_after_offset: i64,
) -> Result<CertificateParams> {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    params.distinguished_name = dn;
    params.is_ca = IsCa::NoCa;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![
        ExtendedKeyUsagePurpose::ServerAuth,
        ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.not_before = offset_from_now(not_before_offset)?;
    params.not_after = offset_from_now(not_after_offset)?;
    Ok(params)
}

fn uri_san(uri: &str) -> Result<SanType> {
    Ia5String::try_from(uri)
        .map(SanType::URI)
        .map_err(|e| Error::Config(format!("Invalid URI SAN '{uri}': {e}")))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{}': {e}", path.display())))
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents)
        .map_err(|e| Error::Config(format!("Cannot write '{}': {e}", path.display())))
}

/// `now + offset_secs` as the `OffsetDateTime` rcgen expects.
fn offset_from_now(offset_secs: i64) -> Result<OffsetDateTime> {
    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Config(format!("System time error: {e}")))?
        .as_secs();
    let target = i64::try_from(now_secs)
        .unwrap_or(i64::MAX)
        .saturating_add(offset_secs);

    OffsetDateTime::from_unix_timestamp(target)
        .map_err(|e| Error::Config(format!("Date calculation error: {e}")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
