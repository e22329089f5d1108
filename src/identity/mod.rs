//! Workload identity: SPIFFE IDs, SVIDs, trust bundles and the rotating
//! identity source.
//!
//! - [`spiffe_id`] — `SpiffeId` parsing and comparison
//! - [`x509`] — SPIFFE ID and validity extraction from DER certificates
//! - [`bundle`] — immutable `IdentityBundle` and the updates that build it
//! - [`source`] — `IdentitySource`: atomic slot fed by a background task
//! - [`stream`] — update streams: in-process channel and PEM directory watch

pub mod bundle;
pub mod source;
pub mod spiffe_id;
pub mod stream;
pub mod x509;

pub use bundle::{IdentityBundle, IdentityUpdate, Svid, TrustBundle};
pub use source::{IdentitySource, OpenOptions, StalePolicy, UpdateCallback};
pub use spiffe_id::SpiffeId;
pub use stream::{
    IdentityPaths, IdentityPublisher, IdentityStream, identity_channel, watch_identity_dir,
};
pub use x509::{CertInfo, IdExtraction, extract_spiffe_id};
