//! SPIFFE ID parsing and comparison.
//!
//! A SPIFFE ID is the structured workload name carried in an X.509 SVID's
//! URI SAN: `spiffe://<trust-domain>/<segment>/<segment>...`.
//!
//! # Syntax accepted
//!
//! | Part | Allowed |
//! |------|---------|
//! | scheme | exactly `spiffe` (lowercase) |
//! | trust domain | `a-z 0-9 . - _`, non-empty |
//! | path segment | `a-z A-Z 0-9 . - _`, non-empty, not `.` or `..` |
//!
//! Ports, userinfo, query strings, fragments and trailing slashes are rejected.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

const SCHEME_PREFIX: &str = "spiffe://";

/// A validated SPIFFE ID.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SpiffeId {
    trust_domain: String,
    /// Path including the leading `/`, or empty for the trust domain ID.
    path: String,
}

impl SpiffeId {
    /// Parse and validate a SPIFFE ID string.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentity` describing the first violation found.
    pub fn parse(raw: &str) -> Result<Self> {
        let rest = raw
            .strip_prefix(SCHEME_PREFIX)
            .ok_or_else(|| invalid(raw, "scheme must be spiffe://"))?;

        let (trust_domain, path) = match rest.find('/') {
            Some(idx) => rest.split_at(idx),
            None => (rest, ""),
        };

        validate_trust_domain(raw, trust_domain)?;
        validate_path(raw, path)?;

        Ok(Self {
            trust_domain: trust_domain.to_owned(),
            path: path.to_owned(),
        })
    }

    /// Build an ID from a trust domain and path segments.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidIdentity` if any component is invalid.
    pub fn from_segments<I, S>(trust_domain: &str, segments: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut raw = format!("{SCHEME_PREFIX}{trust_domain}");
        for segment in segments {
            raw.push('/');
            raw.push_str(segment.as_ref());
        }
        Self::parse(&raw)
    }

    /// The trust domain name (authority component).
    #[must_use]
    pub fn trust_domain(&self) -> &str {
        &self.trust_domain
    }

    /// The path, including its leading `/`; empty for a trust domain ID.
    #[must_use]
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Path segments in order.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.path.split('/').filter(|s| !s.is_empty())
    }

    /// `true` when `self` is `prefix` or sits below it in the same trust domain.
    ///
    /// Matching is segment-aware: `/ns/prod` covers `/ns/prod/api` but not
    /// `/ns/production`.
    #[must_use]
    pub fn is_under(&self, prefix: &SpiffeId) -> bool {
        if self.trust_domain != prefix.trust_domain {
            return false;
        }
        let mut ours = self.segments();
        prefix.segments().all(|p| ours.next() == Some(p))
    }

    /// `true` when `self` belongs to the given trust domain.
    #[must_use]
    pub fn is_member_of(&self, trust_domain: &str) -> bool {
        self.trust_domain == trust_domain
    }
}

impl fmt::Display for SpiffeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{SCHEME_PREFIX}{}{}", self.trust_domain, self.path)
    }
}

impl FromStr for SpiffeId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl Serialize for SpiffeId {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SpiffeId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

fn invalid(raw: &str, reason: &str) -> Error {
    Error::InvalidIdentity(format!("'{raw}': {reason}"))
}

fn validate_trust_domain(raw: &str, td: &str) -> Result<()> {
    if td.is_empty() {
        return Err(invalid(raw, "trust domain is empty"));
    }
    if td.contains(':') {
        return Err(invalid(raw, "port is not allowed"));
    }
    if td.contains('@') {
        return Err(invalid(raw, "userinfo is not allowed"));
    }
    if !td
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || matches!(b, b'.' | b'-' | b'_'))
    {
        return Err(invalid(raw, "trust domain has invalid characters"));
    }
    Ok(())
}

fn validate_path(raw: &str, path: &str) -> Result<()> {
    if path.is_empty() {
        return Ok(());
    }
    if path.contains('?') {
        return Err(invalid(raw, "query is not allowed"));
    }
    if path.contains('#') {
        return Err(invalid(raw, "fragment is not allowed"));
    }
    if path.ends_with('/') {
        return Err(invalid(raw, "trailing slash is not allowed"));
    }
    // `path` starts with '/', so the first split element is always empty.
    for segment in path.split('/').skip(1) {
        match segment {
            "" => return Err(invalid(raw, "empty path segment")),
            "." | ".." => return Err(invalid(raw, "dot segment")),
            _ => {}
        }
        if !segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'-' | b'_'))
        {
            return Err(invalid(raw, "path segment has invalid characters"));
        }
    }
    Ok(())
}
