//! X.509 SVID inspection.
//!
//! Parses a DER-encoded certificate and extracts the fields the workload
//! needs: the embedded SPIFFE ID (URI SAN), the serial number, the validity
//! window and the DNS SANs.
//!
//! An X.509 SVID carries exactly one `spiffe://` URI SAN. Zero such URIs is
//! reported as [`IdExtraction::Missing`]; several, or one that does not parse,
//! as [`IdExtraction::Malformed`]. Callers keep the two apart so a policy
//! rejection and an extraction failure show up differently in logs.

use chrono::{DateTime, Utc};
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::FromDer;

use super::spiffe_id::SpiffeId;
use crate::{Error, Result};

/// Outcome of looking for a SPIFFE ID inside a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdExtraction {
    /// Exactly one valid SPIFFE ID was found.
    Present(SpiffeId),
    /// The certificate has no `spiffe://` URI SAN.
    Missing,
    /// A SPIFFE URI was present but unusable.
    Malformed(String),
}

impl IdExtraction {
    /// The extracted ID, if any.
    #[must_use]
    pub fn id(&self) -> Option<&SpiffeId> {
        match self {
            Self::Present(id) => Some(id),
            Self::Missing | Self::Malformed(_) => None,
        }
    }

    /// Label for logs: the ID itself, or why there is none.
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::Present(id) => id.to_string(),
            Self::Missing => "<no spiffe id>".to_owned(),
            Self::Malformed(reason) => format!("<malformed spiffe id: {reason}>"),
        }
    }
}

/// Identity-relevant fields of a leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertInfo {
    /// Embedded SPIFFE ID extraction result.
    pub spiffe_id: IdExtraction,
    /// Serial number in decimal.
    pub serial_number: String,
    /// Start of the validity window.
    pub not_before: DateTime<Utc>,
    /// End of the validity window.
    pub not_after: DateTime<Utc>,
    /// Subject Alternative Name DNS entries.
    pub dns_names: Vec<String>,
}

impl CertInfo {
    /// Parse a DER certificate and extract its identity fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentity` if the bytes are not a certificate or
    /// the validity timestamps are out of range.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let cert = parse(der)?;
        let validity = cert.validity();
        Ok(Self {
            spiffe_id: extract_id(&cert),
            serial_number: cert.serial.to_string(),
            not_before: to_utc(validity.not_before.timestamp())?,
            not_after: to_utc(validity.not_after.timestamp())?,
            dns_names: extract_dns(&cert),
        })
    }

    /// `true` when `now` is past the end of the validity window.
    #[must_use]
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.not_after
    }
}

/// Extract only the SPIFFE ID from a DER certificate.
///
/// An unparseable certificate is reported as [`IdExtraction::Malformed`].
#[must_use]
pub fn extract_spiffe_id(der: &[u8]) -> IdExtraction {
    match parse(der) {
        Ok(cert) => extract_id(&cert),
        Err(e) => IdExtraction::Malformed(e.to_string()),
    }
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::InvalidIdentity(format!("Failed to parse certificate: {e}")))?;
    Ok(cert)
}

fn extract_id(cert: &X509Certificate<'_>) -> IdExtraction {
    let spiffe_uris: Vec<&str> = san_entries(cert)
        .into_iter()
        .filter_map(|name| match name {
            GeneralName::URI(uri)
                if uri
                    .get(..7)
                    .is_some_and(|scheme| scheme.eq_ignore_ascii_case("spiffe:")) =>
            {
                Some(*uri)
            }
            _ => None,
        })
        .collect();

    match spiffe_uris.as_slice() {
        [] => IdExtraction::Missing,
        [uri] => match SpiffeId::parse(uri) {
            Ok(id) => IdExtraction::Present(id),
            Err(e) => IdExtraction::Malformed(e.to_string()),
        },
        many => IdExtraction::Malformed(format!(
            "{} SPIFFE URI SANs present, expected exactly one",
            many.len()
        )),
    }
}

fn extract_dns(cert: &X509Certificate<'_>) -> Vec<String> {
    san_entries(cert)
        .into_iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some((*dns).to_owned()),
            _ => None,
        })
        .collect()
}

fn san_entries<'a>(cert: &'a X509Certificate<'_>) -> Vec<&'a GeneralName<'a>> {
    match cert.subject_alternative_name() {
        Ok(Some(san)) => san.value.general_names.iter().collect(),
        _ => Vec::new(),
    }
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| Error::InvalidIdentity(format!("Timestamp {timestamp} out of range")))
}
