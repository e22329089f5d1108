//! Identity update streams.
//!
//! The identity source consumes an opaque [`IdentityStream`]. Two producers
//! ship with the crate:
//!
//! - [`identity_channel`] — an in-process channel; the publisher side is
//!   handed to whatever talks to the identity authority (and to tests).
//! - [`watch_identity_dir`] — watches a PEM directory maintained by an
//!   external helper and emits a full update whenever the files change.
//!
//! Dropping the producer ends the stream, which the source treats as the
//! authority going away.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use futures::StreamExt;
use futures::stream::BoxStream;
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

use super::bundle::IdentityUpdate;
use crate::mtls::cert_manager::{BUNDLE_FILE, SVID_FILE, SVID_KEY_FILE, load_certs, load_private_key};
use crate::{Error, Result};

/// Stream of identity updates (or delivery errors) from the authority.
pub type IdentityStream = BoxStream<'static, Result<IdentityUpdate>>;

// ─────────────────────────────────────────────────────────────────────────────
// Channel stream
// ─────────────────────────────────────────────────────────────────────────────

/// Producer half of [`identity_channel`].
#[derive(Debug, Clone)]
pub struct IdentityPublisher {
    tx: mpsc::Sender<Result<IdentityUpdate>>,
}

impl IdentityPublisher {
    /// Deliver an update.
    ///
    /// # Errors
    ///
    /// Returns `Error::SourceClosed` once the consuming source has gone away.
    pub async fn publish(&self, update: IdentityUpdate) -> Result<()> {
        self.tx
            .send(Ok(update))
            .await
            .map_err(|_| Error::SourceClosed)
    }

    /// Report a failed fetch/rotation attempt.
    ///
    /// # Errors
    ///
    /// Returns `Error::SourceClosed` once the consuming source has gone away.
    pub async fn publish_error(&self, error: Error) -> Result<()> {
        self.tx
            .send(Err(error))
            .await
            .map_err(|_| Error::SourceClosed)
    }

    /// Resolves when the consuming side has been dropped.
    pub async fn closed(&self) {
        self.tx.closed().await;
    }
}

/// Create an in-process identity stream with a bounded buffer.
#[must_use]
pub fn identity_channel(capacity: usize) -> (IdentityPublisher, IdentityStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (IdentityPublisher { tx }, ReceiverStream::new(rx).boxed())
}

// ─────────────────────────────────────────────────────────────────────────────
// PEM directory stream
// ─────────────────────────────────────────────────────────────────────────────

/// Locations of the SVID chain, key and trust bundle on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPaths {
    /// Directory holding the three files; this is what gets watched.
    pub dir: PathBuf,
    /// Leaf-first chain file.
    pub cert: PathBuf,
    /// Private key file.
    pub key: PathBuf,
    /// Trust bundle file.
    pub bundle: PathBuf,
}

impl IdentityPaths {
    /// Standard file names inside `dir`.
    #[must_use]
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            cert: dir.join(SVID_FILE),
            key: dir.join(SVID_KEY_FILE),
            bundle: dir.join(BUNDLE_FILE),
            dir,
        }
    }

    fn contains(&self, path: &Path) -> bool {
        path == self.cert || path == self.key || path == self.bundle
    }

    /// Read all three files into a full update.
    ///
    /// # Errors
    ///
    /// Returns an error if any file is missing or unparseable.
    pub fn read_update(&self) -> Result<IdentityUpdate> {
        Ok(IdentityUpdate::Full {
            chain: load_certs(&self.cert)?,
            key: load_private_key(&self.key)?,
            trust_bundle: load_certs(&self.bundle)?,
        })
    }
}

/// Watch an identity directory and stream its contents on every change.
///
/// The current contents are emitted immediately. Bursts of filesystem events
/// (a helper rewriting all three files) are collapsed into one read once the
/// directory has been quiet for `debounce`. Read failures are delivered as
/// stream errors; the watcher keeps running.
///
/// The watcher stops when the returned stream is dropped.
///
/// # Errors
///
/// Returns an error if the `notify` watcher cannot be created.
pub fn watch_identity_dir(paths: IdentityPaths, debounce: Duration) -> Result<IdentityStream> {
    let (event_tx, event_rx) = mpsc::channel(32);
    let watcher = create_notify_watcher(event_tx, &paths)?;
    let (publisher, stream) = identity_channel(4);

    tokio::spawn(run_dir_watch(paths, debounce, watcher, event_rx, publisher));

    Ok(stream)
}

fn create_notify_watcher(
    event_tx: mpsc::Sender<()>,
    paths: &IdentityPaths,
) -> Result<RecommendedWatcher> {
    let paths_for_closure = paths.clone();

    let mut watcher = RecommendedWatcher::new(
        move |result: std::result::Result<Event, notify::Error>| {
            let is_relevant = result
                .as_ref()
                .is_ok_and(|e| is_identity_event(e, &paths_for_closure));
            if is_relevant {
                let _ = event_tx.try_send(());
            }
        },
        NotifyConfig::default().with_poll_interval(Duration::from_secs(2)),
    )
    .map_err(|e| Error::Config(format!("Failed to create identity watcher: {e}")))?;

    watcher
        .watch(&paths.dir, RecursiveMode::NonRecursive)
        .map_err(|e| {
            Error::Config(format!(
                "Failed to watch identity dir '{}': {e}",
                paths.dir.display()
            ))
        })?;

    Ok(watcher)
}

async fn run_dir_watch(
    paths: IdentityPaths,
    debounce: Duration,
    // Dropping the watcher stops OS notifications, so the task owns it.
    _watcher: RecommendedWatcher,
    mut event_rx: mpsc::Receiver<()>,
    publisher: IdentityPublisher,
) {
    info!(dir = %paths.dir.display(), "Watching identity directory");

    if deliver(&paths, &publisher).await.is_err() {
        return;
    }

    let mut last_event: Option<Instant> = None;
    // interval() panics on a zero period
    let tick = Duration::from_millis(50).min(debounce).max(Duration::from_millis(1));
    let mut ticker = tokio::time::interval(tick);

    loop {
        tokio::select! {
            Some(()) = event_rx.recv() => {
                last_event = Some(Instant::now());
            }
            _ = ticker.tick() => {
                if last_event.is_some_and(|t| t.elapsed() >= debounce) {
                    last_event = None;
                    if deliver(&paths, &publisher).await.is_err() {
                        break;
                    }
                }
            }
            () = publisher.closed() => break,
        }
    }

    debug!(dir = %paths.dir.display(), "Identity directory watcher stopped");
}

/// Read the directory and push the result; `Err` means the consumer is gone.
async fn deliver(paths: &IdentityPaths, publisher: &IdentityPublisher) -> Result<()> {
    match paths.read_update() {
        Ok(update) => publisher.publish(update).await,
        Err(e) => {
            warn!(dir = %paths.dir.display(), error = %e, "Failed to read identity files");
            publisher.publish_error(e).await
        }
    }
}

/// Returns `true` for create/modify/rename events touching one of the identity files.
fn is_identity_event(event: &Event, paths: &IdentityPaths) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
        && event.paths.iter().any(|p| paths.contains(p))
}
