//! The identity source: holds the workload's current identity bundle.
//!
//! # Design
//!
//! A single [`ArcSwapOption`] slot holds an immutable [`IdentityBundle`]. A
//! background task drains the external [`IdentityStream`], builds each new
//! bundle completely (key/leaf match, root store, verifiers), then publishes
//! it with one atomic store. Readers load the slot without locking and see
//! either the old bundle or the new one, never a mix.
//!
//! Failures after the first publish never interrupt service: the rejected
//! update is logged and counted, and the previous bundle keeps serving until
//! a good one arrives.
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use tokio_util::sync::CancellationToken;
//! use mtls_workload::identity::{IdentityPaths, IdentitySource, OpenOptions, watch_identity_dir};
//!
//! # tokio_test::block_on(async {
//! let stream = watch_identity_dir(
//!     IdentityPaths::in_dir("/run/spiffe/certs"),
//!     Duration::from_millis(250),
//! )?;
//! let source = IdentitySource::open(stream, OpenOptions::default(), &CancellationToken::new())
//!     .await?;
//! source.on_update(|bundle| {
//!     println!("rotated to {}", bundle.spiffe_id());
//!     Ok(())
//! });
//! println!("serving as {}", source.current()?.spiffe_id());
//! source.close();
//! # Ok::<(), mtls_workload::Error>(())
//! # });
//! ```

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use futures::StreamExt;
use parking_lot::{Mutex, RwLock};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bundle::{IdentityBundle, IdentityUpdate, Svid, TrustBundle};
use super::stream::IdentityStream;
use crate::mtls::crypto_provider;
use crate::{Error, Result};

/// What to do with an SVID whose validity window has already ended.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StalePolicy {
    /// Publish it anyway; handshakes reject it once peers check expiry.
    #[default]
    Accept,
    /// Refuse it at ingestion and keep the previous bundle.
    Reject,
}

/// Startup behavior of [`IdentitySource::open`].
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// How long to wait for the first complete bundle.
    pub startup_timeout: Duration,
    /// Handling of already-expired SVIDs.
    pub stale_bundles: StalePolicy,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            startup_timeout: Duration::from_secs(30),
            stale_bundles: StalePolicy::default(),
        }
    }
}

/// Hook run after every successful rotation.
pub type UpdateCallback = Arc<dyn Fn(&Arc<IdentityBundle>) -> Result<()> + Send + Sync>;

/// Startup progress reported by the update task.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Phase {
    /// Waiting for the first bundle; carries the last ingestion error, if any.
    Starting(Option<String>),
    Ready,
}

struct Shared {
    current: ArcSwapOption<IdentityBundle>,
    shutdown: CancellationToken,
    callbacks: RwLock<Vec<UpdateCallback>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Continuously refreshed workload identity.
///
/// Cheap to clone; all clones share one slot and one subscription.
#[derive(Clone)]
pub struct IdentitySource {
    shared: Arc<Shared>,
}

impl fmt::Debug for IdentitySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let current = self.shared.current.load();
        f.debug_struct("IdentitySource")
            .field(
                "spiffe_id",
                &current.as_ref().map(|b| b.spiffe_id().to_string()),
            )
            .field("closed", &self.shared.shutdown.is_cancelled())
            .finish_non_exhaustive()
    }
}

impl IdentitySource {
    /// Subscribe to `stream` and wait for the first complete bundle.
    ///
    /// `cancel` governs the startup wait only; once open, the source runs
    /// until [`close`](Self::close).
    ///
    /// # Errors
    ///
    /// - `Error::IdentitySourceUnavailable` if no bundle arrives within
    ///   `options.startup_timeout`, or the stream ends before one does.
    /// - `Error::SourceClosed` if `cancel` fires first.
    pub async fn open(
        stream: IdentityStream,
        options: OpenOptions,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let shared = Arc::new(Shared {
            current: ArcSwapOption::empty(),
            shutdown: CancellationToken::new(),
            callbacks: RwLock::new(Vec::new()),
            task: Mutex::new(None),
        });

        let (phase_tx, mut phase_rx) = watch::channel(Phase::Starting(None));
        let ingest = Ingest::new(crypto_provider(), options.stale_bundles);
        let task = tokio::spawn(run_updates(Arc::clone(&shared), stream, ingest, phase_tx));
        *shared.task.lock() = Some(task);

        let source = Self { shared };

        let ready = async { phase_rx.wait_for(|p| *p == Phase::Ready).await.map(|_| ()) };
        let waited = tokio::select! {
            () = cancel.cancelled() => {
                source.close();
                return Err(Error::SourceClosed);
            }
            waited = tokio::time::timeout(options.startup_timeout, ready) => waited,
        };

        match waited {
            Ok(Ok(())) => Ok(source),
            Ok(Err(_)) => {
                let reason = last_error(&phase_rx);
                source.close();
                Err(Error::IdentitySourceUnavailable(format!(
                    "identity stream ended before the first bundle{reason}"
                )))
            }
            Err(_) => {
                let reason = last_error(&phase_rx);
                source.close();
                Err(Error::IdentitySourceUnavailable(format!(
                    "no identity within {:?}{reason}",
                    options.startup_timeout
                )))
            }
        }
    }

    /// The latest published bundle. Never blocks.
    ///
    /// # Errors
    ///
    /// Returns `Error::SourceClosed` after [`close`](Self::close).
    pub fn current(&self) -> Result<Arc<IdentityBundle>> {
        if self.shared.shutdown.is_cancelled() {
            return Err(Error::SourceClosed);
        }
        self.shared.current.load_full().ok_or(Error::SourceClosed)
    }

    /// Register a hook run after each successful rotation.
    ///
    /// Errors and panics from the hook are logged and otherwise ignored. A hook
    /// may register further hooks; they run from the next rotation on.
    pub fn on_update<F>(&self, callback: F)
    where
        F: Fn(&Arc<IdentityBundle>) -> Result<()> + Send + Sync + 'static,
    {
        self.shared.callbacks.write().push(Arc::new(callback));
    }

    /// Stop the subscription and release the bundle. Idempotent.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
        self.shared.current.store(None);
        if self.shared.task.lock().take().is_some() {
            info!("Identity source closed");
        }
    }

    /// `true` once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Resolves when the source is closed.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await;
    }
}

fn last_error(phase_rx: &watch::Receiver<Phase>) -> String {
    match &*phase_rx.borrow() {
        Phase::Starting(Some(e)) => format!(" (last error: {e})"),
        _ => String::new(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Update task
// ─────────────────────────────────────────────────────────────────────────────

async fn run_updates(
    shared: Arc<Shared>,
    mut stream: IdentityStream,
    mut ingest: Ingest,
    phase_tx: watch::Sender<Phase>,
) {
    loop {
        let next = tokio::select! {
            () = shared.shutdown.cancelled() => break,
            next = stream.next() => next,
        };

        match next {
            Some(Ok(update)) => match ingest.apply(update) {
                Ok(Some(bundle)) => {
                    publish(&shared, bundle);
                    phase_tx.send_replace(Phase::Ready);
                }
                Ok(None) => debug!("Buffered partial identity update"),
                Err(e) => {
                    warn!(error = %e, "Rejected identity update; keeping current bundle");
                    telemetry_metrics::counter!("identity_update_errors_total").increment(1);
                    record_startup_error(&phase_tx, &e);
                }
            },
            Some(Err(e)) => {
                warn!(error = %e, "Identity stream reported an error; keeping current bundle");
                telemetry_metrics::counter!("identity_update_errors_total").increment(1);
                record_startup_error(&phase_tx, &e);
            }
            None => {
                if ingest.generation > 0 {
                    error!("Identity stream ended; serving the last bundle until it expires");
                } else {
                    warn!("Identity stream ended before delivering an identity");
                }
                break;
            }
        }
    }
    debug!("Identity update task stopped");
}

fn record_startup_error(phase_tx: &watch::Sender<Phase>, error: &Error) {
    phase_tx.send_if_modified(|phase| match phase {
        Phase::Starting(last) => {
            *last = Some(error.to_string());
            true
        }
        Phase::Ready => false,
    });
}

fn publish(shared: &Shared, bundle: IdentityBundle) {
    if shared.shutdown.is_cancelled() {
        return;
    }
    let bundle = Arc::new(bundle);
    shared.current.store(Some(Arc::clone(&bundle)));
    // close() may have cleared the slot between the check and the store.
    if shared.shutdown.is_cancelled() {
        shared.current.store(None);
        return;
    }

    info!(
        spiffe_id = %bundle.spiffe_id(),
        generation = bundle.generation(),
        not_after = %bundle.not_after(),
        "Identity bundle published"
    );
    telemetry_metrics::counter!("identity_rotations_total").increment(1);

    // Snapshot so hooks can call on_update without deadlocking.
    let callbacks: Vec<UpdateCallback> = shared.callbacks.read().clone();
    for callback in &callbacks {
        match catch_unwind(AssertUnwindSafe(|| callback(&bundle))) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Identity update callback failed"),
            Err(_) => error!("Identity update callback panicked"),
        }
    }
}

/// Turns raw updates into complete bundles, merging partial updates with the
/// halves already published.
struct Ingest {
    provider: Arc<CryptoProvider>,
    stale: StalePolicy,
    svid: Option<Arc<Svid>>,
    trust_bundle: Option<Arc<TrustBundle>>,
    generation: u64,
}

impl Ingest {
    fn new(provider: Arc<CryptoProvider>, stale: StalePolicy) -> Self {
        Self {
            provider,
            stale,
            svid: None,
            trust_bundle: None,
            generation: 0,
        }
    }

    /// Returns the bundle to publish, or `None` while one half is still missing.
    fn apply(&mut self, update: IdentityUpdate) -> Result<Option<IdentityBundle>> {
        // Both halves of a full update are built before either is committed.
        let (svid, trust_bundle) = match update {
            IdentityUpdate::Svid { chain, key } => (Some(self.build_svid(chain, &key)?), None),
            IdentityUpdate::TrustBundle(certs) => (None, Some(self.build_trust_bundle(certs)?)),
            IdentityUpdate::Full {
                chain,
                key,
                trust_bundle,
            } => (
                Some(self.build_svid(chain, &key)?),
                Some(self.build_trust_bundle(trust_bundle)?),
            ),
        };

        if let Some(svid) = svid {
            self.svid = Some(svid);
        }
        if let Some(trust_bundle) = trust_bundle {
            self.trust_bundle = Some(trust_bundle);
        }

        match (&self.svid, &self.trust_bundle) {
            (Some(svid), Some(trust_bundle)) => {
                self.generation += 1;
                Ok(Some(IdentityBundle::new(
                    Arc::clone(svid),
                    Arc::clone(trust_bundle),
                    self.generation,
                )))
            }
            _ => Ok(None),
        }
    }

    fn build_svid(
        &self,
        chain: Vec<CertificateDer<'static>>,
        key: &PrivateKeyDer<'static>,
    ) -> Result<Arc<Svid>> {
        let svid = Svid::new(chain, key, &self.provider)?;
        if svid.leaf().is_expired_at(Utc::now()) {
            match self.stale {
                StalePolicy::Reject => {
                    return Err(Error::InvalidIdentity(format!(
                        "SVID for {} expired at {}",
                        svid.spiffe_id(),
                        svid.leaf().not_after
                    )));
                }
                StalePolicy::Accept => warn!(
                    spiffe_id = %svid.spiffe_id(),
                    not_after = %svid.leaf().not_after,
                    "Accepting SVID whose validity window has already ended"
                ),
            }
        }
        Ok(Arc::new(svid))
    }

    fn build_trust_bundle(&self, certs: Vec<CertificateDer<'static>>) -> Result<Arc<TrustBundle>> {
        TrustBundle::new(certs, &self.provider).map(Arc::new)
    }
}
