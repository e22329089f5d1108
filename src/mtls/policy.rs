//! Identity-based peer authorization.
//!
//! Authorization runs *after* the peer chain has been validated against the
//! trust bundle: a CA-valid certificate is necessary but not sufficient. The
//! policy looks only at the SPIFFE ID embedded in the leaf.
//!
//! # Variants
//!
//! | Policy | Accepts |
//! |--------|---------|
//! | `Any` | every validated chain, with or without a SPIFFE ID |
//! | `Exact(id)` | exactly `id` |
//! | `Prefix(id)` | `id` and every ID below it (segment-aware) |
//! | `MemberOf(td)` | every ID in trust domain `td` |
//! | `AnyOf([..])` | first member that accepts wins; empty accepts nothing |
//!
//! A [`Decision`] always carries the extraction result, so a rejected name,
//! a missing name and a malformed name stay distinguishable in logs.

use std::fmt;

use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Serialize};

use crate::identity::SpiffeId;
use crate::identity::x509::{IdExtraction, extract_spiffe_id};
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Decision
// ─────────────────────────────────────────────────────────────────────────────

/// Result of running a policy against a peer chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    /// Whether the peer is permitted.
    pub accepted: bool,
    /// What was found in the leaf, reported even on rejection.
    pub name: IdExtraction,
}

/// Coarse classification of a [`Decision`], used as a metrics label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Policy accepted the peer.
    Accepted,
    /// Valid SPIFFE ID, but the policy denied it.
    Rejected,
    /// Leaf carries no SPIFFE ID.
    MissingId,
    /// Leaf carries an unusable SPIFFE ID.
    MalformedId,
}

impl Outcome {
    /// Stable snake-case label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::MissingId => "missing_id",
            Self::MalformedId => "malformed_id",
        }
    }
}

impl Decision {
    /// Classify the decision.
    #[must_use]
    pub fn outcome(&self) -> Outcome {
        if self.accepted {
            return Outcome::Accepted;
        }
        match self.name {
            IdExtraction::Present(_) => Outcome::Rejected,
            IdExtraction::Missing => Outcome::MissingId,
            IdExtraction::Malformed(_) => Outcome::MalformedId,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Policy
// ─────────────────────────────────────────────────────────────────────────────

/// Predicate over a validated peer's SPIFFE ID.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorizationPolicy {
    /// Accept any chain that validated against the trust bundle.
    Any,
    /// Accept only this exact ID.
    Exact(SpiffeId),
    /// Accept this ID and any ID below it.
    Prefix(SpiffeId),
    /// Accept any ID in this trust domain.
    MemberOf(String),
    /// Logical OR, evaluated in order.
    AnyOf(Vec<AuthorizationPolicy>),
}

impl AuthorizationPolicy {
    /// Evaluate against a leaf-first peer chain.
    ///
    /// The chain must already have been validated; an empty chain is
    /// treated as a leaf without a SPIFFE ID.
    #[must_use]
    pub fn evaluate(&self, chain: &[CertificateDer<'_>]) -> Decision {
        let name = chain
            .first()
            .map_or(IdExtraction::Missing, |leaf| extract_spiffe_id(leaf));
        self.decide(name)
    }

    /// Evaluate against an already-extracted name.
    #[must_use]
    pub fn decide(&self, name: IdExtraction) -> Decision {
        Decision {
            accepted: self.permits(&name),
            name,
        }
    }

    /// `true` when `name` satisfies this policy.
    #[must_use]
    pub fn permits(&self, name: &IdExtraction) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(expected) => name.id() == Some(expected),
            Self::Prefix(prefix) => name.id().is_some_and(|id| id.is_under(prefix)),
            Self::MemberOf(trust_domain) => {
                name.id().is_some_and(|id| id.is_member_of(trust_domain))
            }
            Self::AnyOf(policies) => policies.iter().any(|p| p.permits(name)),
        }
    }

    /// Compile the configured rule list. An empty list means [`Self::Any`].
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for a rule that sets zero or several matchers.
    pub fn from_config(rules: &[PolicyRuleConfig]) -> Result<Self> {
        let mut compiled = rules
            .iter()
            .map(PolicyRuleConfig::compile)
            .collect::<Result<Vec<_>>>()?;

        Ok(match compiled.len() {
            0 => Self::Any,
            1 => compiled.remove(0),
            _ => Self::AnyOf(compiled),
        })
    }
}

impl fmt::Display for AuthorizationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Any => f.write_str("any"),
            Self::Exact(id) => write!(f, "exact {id}"),
            Self::Prefix(id) => write!(f, "prefix {id}"),
            Self::MemberOf(td) => write!(f, "member of {td}"),
            Self::AnyOf(policies) => {
                f.write_str("any of [")?;
                for (i, p) in policies.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{p}")?;
                }
                f.write_str("]")
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// One entry in the `authorization:` list. Exactly one field must be set.
///
/// ```yaml
/// authorization:
///   - exact: spiffe://example.org/ns/prod/sa/frontend
///   - prefix: spiffe://example.org/ns/batch
///   - member_of: partner.example.com
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PolicyRuleConfig {
    /// Accept any validated peer.
    pub any: Option<bool>,
    /// Accept exactly this ID.
    pub exact: Option<SpiffeId>,
    /// Accept this ID and its descendants.
    pub prefix: Option<SpiffeId>,
    /// Accept any ID in this trust domain.
    pub member_of: Option<String>,
}

impl PolicyRuleConfig {
    fn compile(&self) -> Result<AuthorizationPolicy> {
        let mut matchers = Vec::with_capacity(1);
        if self.any == Some(true) {
            matchers.push(AuthorizationPolicy::Any);
        }
        if let Some(id) = &self.exact {
            matchers.push(AuthorizationPolicy::Exact(id.clone()));
        }
        if let Some(id) = &self.prefix {
            matchers.push(AuthorizationPolicy::Prefix(id.clone()));
        }
        if let Some(td) = &self.member_of {
            // Validate the trust domain through the ID parser.
            let td_id = SpiffeId::parse(&format!("spiffe://{td}"))?;
            matchers.push(AuthorizationPolicy::MemberOf(td_id.trust_domain().to_owned()));
        }

        match matchers.len() {
            1 => Ok(matchers.remove(0)),
            0 => Err(Error::Config(
                "authorization rule must set one of any/exact/prefix/member_of".into(),
            )),
            _ => Err(Error::Config(
                "authorization rule sets more than one matcher; use separate list entries".into(),
            )),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
