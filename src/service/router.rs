//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Extension, Json, Router,
    extract::{Query, State},
    routing::get,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::{catch_panic::CatchPanicLayer, trace::TraceLayer};
use tracing::{debug, info};

use crate::identity::{IdentitySource, SpiffeId};
use crate::mtls::{AuthenticatedClient, AuthorizationPolicy, PeerIdentity};
use crate::{Error, Result};

/// Body of a successful `/secure` response.
pub const SECURE_MESSAGE: &str = "Secure endpoint accessed successfully";

/// Shared application state
pub struct AppState {
    /// Name reported by `/health`
    pub service_name: String,
    /// This workload's identity
    pub source: IdentitySource,
    /// Outbound client used by `/call-external`
    pub client: AuthenticatedClient,
}

/// Router for the mTLS listener: every endpoint.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/identity", get(identity_handler))
        .route("/secure", get(secure_handler))
        .route("/call-external", get(call_external_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Router for the plain HTTP listener: introspection only.
pub fn create_plain_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/identity", get(identity_handler))
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ─────────────────────────────────────────────────────────────────────────────
// Response bodies
// ─────────────────────────────────────────────────────────────────────────────

/// `/health` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Always `"healthy"` when served
    pub status: String,
    /// Configured service name
    pub service: String,
    /// This workload's SPIFFE ID
    pub spiffe_id: String,
    /// Time of the response
    pub timestamp: DateTime<Utc>,
}

/// `/identity` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityResponse {
    /// This workload's SPIFFE ID
    pub spiffe_id: String,
    /// SVID serial number, decimal
    pub serial_number: String,
    /// SVID validity start
    pub not_before: DateTime<Utc>,
    /// SVID validity end
    pub not_after: DateTime<Utc>,
    /// DNS SANs on the SVID
    pub dns_names: Vec<String>,
}

/// `/secure` body, also what `/call-external` relays from the remote peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecureResponse {
    /// Fixed greeting
    pub message: String,
    /// Caller's SPIFFE ID, or `"unauthenticated"`
    pub client_id: String,
    /// Serving workload's SPIFFE ID
    pub server_id: String,
    /// Time of the response
    pub timestamp: DateTime<Utc>,
    /// Whether the caller presented an authorized SVID
    pub authenticated: bool,
}

/// `/call-external` query parameters.
#[derive(Debug, Default, Deserialize)]
pub struct CallExternalParams {
    /// `https://` URL of the remote endpoint
    pub target_url: Option<String>,
    /// SPIFFE ID the remote server must present
    pub target_spiffe_id: Option<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>> {
    let bundle = state.source.current()?;
    Ok(Json(HealthResponse {
        status: "healthy".to_string(),
        service: state.service_name.clone(),
        spiffe_id: bundle.spiffe_id().to_string(),
        timestamp: Utc::now(),
    }))
}

async fn identity_handler(State(state): State<Arc<AppState>>) -> Result<Json<IdentityResponse>> {
    let bundle = state.source.current()?;
    let leaf = bundle.svid().leaf();
    Ok(Json(IdentityResponse {
        spiffe_id: bundle.spiffe_id().to_string(),
        serial_number: leaf.serial_number.clone(),
        not_before: leaf.not_before,
        not_after: leaf.not_after,
        dns_names: leaf.dns_names.clone(),
    }))
}

async fn secure_handler(
    State(state): State<Arc<AppState>>,
    peer: Option<Extension<PeerIdentity>>,
) -> Result<Json<SecureResponse>> {
    let peer = peer.map_or(PeerIdentity::Unauthenticated, |Extension(p)| p);
    let bundle = state.source.current()?;
    debug!(%peer, "Secure endpoint called");

    Ok(Json(SecureResponse {
        message: SECURE_MESSAGE.to_string(),
        client_id: peer.to_string(),
        server_id: bundle.spiffe_id().to_string(),
        timestamp: Utc::now(),
        authenticated: peer.is_authenticated(),
    }))
}

async fn call_external_handler(
    State(state): State<Arc<AppState>>,
    Query(params): Query<CallExternalParams>,
) -> Result<Json<SecureResponse>> {
    let (Some(target_url), Some(target_id)) = (
        params.target_url.filter(|s| !s.is_empty()),
        params.target_spiffe_id.filter(|s| !s.is_empty()),
    ) else {
        return Err(Error::InvalidRequest(
            "target_url and target_spiffe_id parameters are required".to_string(),
        ));
    };

    let expected = SpiffeId::parse(&target_id)
        .map_err(|e| Error::InvalidRequest(format!("Invalid target_spiffe_id: {e}")))?;
    info!(%target_url, expected = %expected, "Calling external workload");

    let response: SecureResponse = state
        .client
        .get_json(&target_url, AuthorizationPolicy::Exact(expected))
        .await?;
    Ok(Json(response))
}
