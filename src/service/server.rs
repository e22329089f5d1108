//! Workload server

use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;

use axum_server::Handle;
use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::router::{AppState, create_plain_router, create_router};
use crate::config::Config;
use crate::identity::{IdentityBundle, IdentitySource, watch_identity_dir};
use crate::mtls::{AuthenticatedClient, IdentityAcceptor, server_config};
use crate::{Error, Result};

/// mTLS workload: identity source plus the plain and mTLS listeners.
pub struct Workload {
    /// Configuration
    config: Config,
    /// Cancelled on SIGINT/SIGTERM or by the embedder
    shutdown: CancellationToken,
}

impl Workload {
    /// Create a new workload
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Token that stops the workload when cancelled.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Open the identity source and serve until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is unusable, no identity is
    /// available within the startup timeout, or a listener fails to bind.
    pub async fn run(self) -> Result<()> {
        let server = &self.config.server;
        let http_addr = server.http_addr()?;
        let https_addr = server.https_addr()?;
        let policy = Arc::new(self.config.authorization_policy()?);

        // Identity first: nothing is served without one
        let paths = self.config.identity.paths();
        info!(dir = %paths.dir.display(), "Waiting for workload identity");
        let stream = watch_identity_dir(paths, self.config.identity.debounce)?;
        let source =
            IdentitySource::open(stream, self.config.identity.open_options(), &self.shutdown)
                .await?;

        log_identity(&*source.current()?);
        source.on_update(|bundle| {
            log_identity(bundle);
            Ok(())
        });

        let state = Arc::new(AppState {
            service_name: self.config.service_name.clone(),
            source: source.clone(),
            client: AuthenticatedClient::new(source.clone(), self.config.client.timeout),
        });

        let tls = server_config(&source, Arc::clone(&policy), server.require_client_cert)?;
        let acceptor = IdentityAcceptor::new(tls);
        let listener = TcpListener::bind(http_addr).await?;

        info!("============================================================");
        info!("MTLS WORKLOAD v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(service = %self.config.service_name, "Service");
        info!(addr = %http_addr, "HTTP listening");
        info!("  GET  http://{http_addr}/health");
        info!("  GET  http://{http_addr}/identity");
        info!(addr = %https_addr, policy = %policy, "mTLS listening");
        info!("  GET  https://{https_addr}/health");
        info!("  GET  https://{https_addr}/identity");
        info!("  GET  https://{https_addr}/secure");
        info!("  GET  https://{https_addr}/call-external?target_url=...&target_spiffe_id=...");
        if server.require_client_cert {
            info!("CLIENT CERTIFICATES required");
        } else {
            warn!("CLIENT CERTIFICATES optional - clients without one are served as unauthenticated");
        }
        info!("============================================================");

        tokio::spawn(shutdown_signal(self.shutdown.clone(), source.clone()));

        // The mTLS listener drains on the same token
        let handle: Handle<SocketAddr> = Handle::new();
        let grace = server.shutdown_timeout;
        tokio::spawn({
            let handle = handle.clone();
            let shutdown = self.shutdown.clone();
            async move {
                shutdown.cancelled().await;
                handle.graceful_shutdown(Some(grace));
            }
        });

        let https = axum_server::bind(https_addr)
            .acceptor(acceptor)
            .handle(handle)
            .serve(create_router(Arc::clone(&state)).into_make_service());
        let http = axum::serve(listener, create_plain_router(state))
            .with_graceful_shutdown(self.shutdown.clone().cancelled_owned())
            .into_future();

        let (http_result, https_result) = tokio::join!(http, https);

        info!("Closing identity source...");
        source.close();

        http_result.map_err(Error::Io)?;
        https_result.map_err(Error::Io)?;
        Ok(())
    }
}

/// Log the identity a workload is about to serve with.
pub fn log_identity(bundle: &IdentityBundle) {
    let leaf = bundle.svid().leaf();
    info!(
        spiffe_id = %bundle.spiffe_id(),
        generation = bundle.generation(),
        "Workload identity"
    );
    info!(
        not_before = %leaf.not_before,
        not_after = %leaf.not_after,
        serial = %leaf.serial_number,
        "SVID validity"
    );
    if !leaf.dns_names.is_empty() {
        info!(dns_names = ?leaf.dns_names, "SVID DNS names");
    }
}

/// Shutdown signal handler
async fn shutdown_signal(shutdown: CancellationToken, source: IdentitySource) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Shutdown signal received"),
        () = terminate => info!("Shutdown signal received"),
        () = source.closed() => warn!("Identity source closed, stopping listeners"),
        () = shutdown.cancelled() => return,
    }

    shutdown.cancel();
}
