//! End-to-end mTLS tests over loopback
//!
//! Tests the full handshake path including:
//! - Inbound authorization policy (accept, reject)
//! - Auth-required vs auth-optional listeners
//! - Outbound server identity pinning
//! - Identity rotation without restarting the listener
//! - The `/call-external` relay between two workloads

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use rustls::pki_types::{CertificateDer, ServerName};
use serde_json::Value;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use mtls_workload::Error;
use mtls_workload::identity::{
    IdentityPublisher, IdentitySource, IdentityUpdate, OpenOptions, SpiffeId, identity_channel,
};
use mtls_workload::mtls::{
    AcceptStats, AuthenticatedClient, AuthorizationPolicy, DevAuthority, IdentityAcceptor,
    PeerServerVerifier, client_config, crypto_provider, server_config,
};
use mtls_workload::service::{AppState, IdentityResponse, SECURE_MESSAGE, SecureResponse, create_router};

const TTL: Duration = Duration::from_secs(3600);

fn id(raw: &str) -> SpiffeId {
    SpiffeId::parse(raw).unwrap()
}

/// Open a source for `path`, keeping the publisher for later rotations.
async fn workload_source(
    authority: &DevAuthority,
    path: &str,
    roots: Vec<CertificateDer<'static>>,
) -> (IdentitySource, IdentityPublisher) {
    let (publisher, stream) = identity_channel(4);
    publisher
        .publish(authority.issue_svid(path, TTL).unwrap().into_full_update(roots))
        .await
        .unwrap();
    let source = IdentitySource::open(stream, OpenOptions::default(), &CancellationToken::new())
        .await
        .unwrap();
    (source, publisher)
}

struct RunningServer {
    addr: SocketAddr,
    stats: Arc<AcceptStats>,
    handle: Handle<SocketAddr>,
}

impl RunningServer {
    fn url(&self, path: &str) -> String {
        format!("https://{}{path}", self.addr)
    }
}

impl Drop for RunningServer {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}

async fn serve(
    source: &IdentitySource,
    policy: AuthorizationPolicy,
    require_client_cert: bool,
) -> RunningServer {
    let tls = server_config(source, Arc::new(policy), require_client_cert).unwrap();
    let acceptor = IdentityAcceptor::new(tls);
    let stats = acceptor.stats();
    let state = Arc::new(AppState {
        service_name: "it-workload".into(),
        source: source.clone(),
        client: AuthenticatedClient::new(source.clone(), Duration::from_secs(5)),
    });

    let handle: Handle<SocketAddr> = Handle::new();
    let server = axum_server::bind("127.0.0.1:0".parse().unwrap())
        .acceptor(acceptor)
        .handle(handle.clone())
        .serve(create_router(state).into_make_service());
    tokio::spawn(server);

    let addr = handle.listening().await.unwrap();
    RunningServer {
        addr,
        stats,
        handle,
    }
}

/// Client that validates the server against `source`'s bundle but presents
/// no certificate of its own.
fn anonymous_client(source: &IdentitySource) -> reqwest::Client {
    let provider = crypto_provider();
    let verifier = Arc::new(PeerServerVerifier::new(
        source.clone(),
        Arc::new(AuthorizationPolicy::Any),
        Arc::clone(&provider),
    ));
    let tls = rustls::ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .unwrap()
        .dangerous()
        .with_custom_certificate_verifier(verifier)
        .with_no_client_auth();
    reqwest::Client::builder()
        .use_preconfigured_tls(tls)
        .http1_only()
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap()
}

/// Wait until `check` holds, for at most two seconds.
async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}

// =====================================================================
// Inbound policy
// =====================================================================

#[tokio::test]
async fn exact_policy_accepts_matching_client() {
    // GIVEN: svc-a only accepts svc-b
    let authority = DevAuthority::new("example.org").unwrap();
    let (server_source, _p1) = workload_source(&authority, "svc-a", authority.trust_bundle()).await;
    let (client_source, _p2) = workload_source(&authority, "svc-b", authority.trust_bundle()).await;
    let server = serve(
        &server_source,
        AuthorizationPolicy::Exact(id("spiffe://example.org/svc-b")),
        true,
    )
    .await;

    // WHEN: svc-b calls /secure expecting svc-a
    let client = AuthenticatedClient::new(client_source, Duration::from_secs(5));
    let secure: SecureResponse = client
        .get_json(
            &server.url("/secure"),
            AuthorizationPolicy::Exact(id("spiffe://example.org/svc-a")),
        )
        .await
        .unwrap();

    // THEN: both sides see each other's identity
    assert_eq!(secure.message, SECURE_MESSAGE);
    assert_eq!(secure.client_id, "spiffe://example.org/svc-b");
    assert_eq!(secure.server_id, "spiffe://example.org/svc-a");
    assert!(secure.authenticated);
    assert_eq!(server.stats.accepted(), 1);
}

#[tokio::test]
async fn exact_policy_rejects_other_client() {
    // GIVEN: svc-a only accepts svc-b
    let authority = DevAuthority::new("example.org").unwrap();
    let (server_source, _p1) = workload_source(&authority, "svc-a", authority.trust_bundle()).await;
    let (client_source, _p2) = workload_source(&authority, "svc-c", authority.trust_bundle()).await;
    let server = serve(
        &server_source,
        AuthorizationPolicy::Exact(id("spiffe://example.org/svc-b")),
        true,
    )
    .await;

    // WHEN: svc-c calls
    let client = AuthenticatedClient::new(client_source, Duration::from_secs(5));
    let result = client
        .get(&server.url("/secure"), AuthorizationPolicy::Any)
        .await;

    // THEN: the call fails and the server counts a policy rejection
    assert!(result.is_err());
    assert!(!matches!(result, Err(Error::PeerAuthorizationFailed { .. })));
    assert!(eventually(|| server.stats.policy_rejections() == 1).await);
    assert_eq!(server.stats.accepted(), 0);
}

#[tokio::test]
async fn prefix_policy_accepts_descendants() {
    let authority = DevAuthority::new("example.org").unwrap();
    let (server_source, _p1) = workload_source(&authority, "svc-a", authority.trust_bundle()).await;
    let (client_source, _p2) =
        workload_source(&authority, "ns/batch/worker", authority.trust_bundle()).await;
    let server = serve(
        &server_source,
        AuthorizationPolicy::AnyOf(vec![
            AuthorizationPolicy::Exact(id("spiffe://example.org/admin")),
            AuthorizationPolicy::Prefix(id("spiffe://example.org/ns/batch")),
        ]),
        true,
    )
    .await;

    let client = AuthenticatedClient::new(client_source, Duration::from_secs(5));
    let secure: SecureResponse = client
        .get_json(&server.url("/secure"), AuthorizationPolicy::Any)
        .await
        .unwrap();
    assert_eq!(secure.client_id, "spiffe://example.org/ns/batch/worker");
}

#[tokio::test]
async fn foreign_ca_client_fails_handshake_not_policy() {
    // GIVEN: a client whose SVID comes from another CA, but which trusts ours
    let authority = DevAuthority::new("example.org").unwrap();
    let foreign = DevAuthority::new("example.org").unwrap();
    let (server_source, _p1) = workload_source(&authority, "svc-a", authority.trust_bundle()).await;
    let mut roots = foreign.trust_bundle();
    roots.extend(authority.trust_bundle());
    let (client_source, _p2) = workload_source(&foreign, "svc-b", roots).await;
    let server = serve(&server_source, AuthorizationPolicy::Any, true).await;

    // WHEN: it calls
    let client = AuthenticatedClient::new(client_source, Duration::from_secs(5));
    let result = client
        .get(&server.url("/secure"), AuthorizationPolicy::Any)
        .await;

    // THEN: chain validation fails; the policy is never consulted
    assert!(result.is_err());
    assert!(eventually(|| server.stats.handshake_failures() >= 1).await);
    assert_eq!(server.stats.policy_rejections(), 0);
}

// =====================================================================
// Auth-required vs auth-optional
// =====================================================================

#[tokio::test]
async fn auth_optional_serves_anonymous_client_as_unauthenticated() {
    let authority = DevAuthority::new("example.org").unwrap();
    let (server_source, _p1) = workload_source(&authority, "svc-a", authority.trust_bundle()).await;
    let server = serve(&server_source, AuthorizationPolicy::Any, false).await;

    let response = anonymous_client(&server_source)
        .get(server.url("/secure"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let secure: SecureResponse = response.json().await.unwrap();
    assert_eq!(secure.client_id, "unauthenticated");
    assert!(!secure.authenticated);
}

#[tokio::test]
async fn auth_required_rejects_anonymous_client() {
    let authority = DevAuthority::new("example.org").unwrap();
    let (server_source, _p1) = workload_source(&authority, "svc-a", authority.trust_bundle()).await;
    let server = serve(&server_source, AuthorizationPolicy::Any, true).await;

    let result = anonymous_client(&server_source)
        .get(server.url("/secure"))
        .send()
        .await;
    assert!(result.is_err());
    assert!(eventually(|| server.stats.handshake_failures() >= 1).await);
    assert_eq!(server.stats.accepted(), 0);
}

// =====================================================================
// Outbound pinning
// =====================================================================

#[tokio::test]
async fn call_reports_wrong_server_identity() {
    // GIVEN: the server is svc-a
    let authority = DevAuthority::new("example.org").unwrap();
    let (server_source, _p1) = workload_source(&authority, "svc-a", authority.trust_bundle()).await;
    let (client_source, _p2) = workload_source(&authority, "svc-b", authority.trust_bundle()).await;
    let server = serve(&server_source, AuthorizationPolicy::Any, true).await;

    // WHEN: the client expects svc-x
    let client = AuthenticatedClient::new(client_source, Duration::from_secs(5));
    let err = client
        .get(
            &server.url("/secure"),
            AuthorizationPolicy::Exact(id("spiffe://example.org/svc-x")),
        )
        .await
        .unwrap_err();

    // THEN: a peer authorization failure naming what was presented
    match err {
        Error::PeerAuthorizationFailed {
            expected,
            presented,
        } => {
            assert_eq!(expected, "exact spiffe://example.org/svc-x");
            assert_eq!(presented, "spiffe://example.org/svc-a");
        }
        other => panic!("expected PeerAuthorizationFailed, got {other:?}"),
    }
    assert_eq!(server.stats.accepted(), 0);
}

// =====================================================================
// Rotation
// =====================================================================

#[tokio::test]
async fn rotation_applies_to_new_handshakes_only() {
    // GIVEN: a running server and one established connection
    let authority = DevAuthority::new("example.org").unwrap();
    let (server_source, publisher) =
        workload_source(&authority, "svc-a", authority.trust_bundle()).await;
    let (client_source, _p2) = workload_source(&authority, "svc-b", authority.trust_bundle()).await;
    let server = serve(&server_source, AuthorizationPolicy::Any, true).await;
    let client = AuthenticatedClient::new(client_source.clone(), Duration::from_secs(5));

    let before: IdentityResponse = client
        .get_json(&server.url("/identity"), AuthorizationPolicy::Any)
        .await
        .unwrap();

    let (tls, _verifier) = client_config(&client_source, Arc::new(AuthorizationPolicy::Any)).unwrap();
    let connector = tokio_rustls::TlsConnector::from(Arc::new(tls));
    let tcp = tokio::net::TcpStream::connect(server.addr).await.unwrap();
    let mut held = connector
        .connect(ServerName::try_from("localhost").unwrap(), tcp)
        .await
        .unwrap();
    let held_leaf = held.get_ref().1.peer_certificates().unwrap()[0].clone();

    // WHEN: the server's SVID rotates
    let generation = server_source.current().unwrap().generation();
    publisher
        .publish(authority.issue_svid("svc-a", TTL).unwrap().into_svid_update())
        .await
        .unwrap();
    assert!(
        eventually(|| server_source.current().unwrap().generation() > generation).await,
        "rotation was not published"
    );

    // THEN: new handshakes see the new SVID
    let after: IdentityResponse = client
        .get_json(&server.url("/identity"), AuthorizationPolicy::Any)
        .await
        .unwrap();
    assert_eq!(after.spiffe_id, before.spiffe_id);
    assert_ne!(after.serial_number, before.serial_number);
    assert_ne!(
        server_source.current().unwrap().chain()[0],
        held_leaf,
        "new bundle should carry a new leaf"
    );

    // AND: the connection established before rotation keeps working
    held.write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut raw = Vec::new();
    let mut buf = [0u8; 1024];
    while !raw.windows(4).any(|w| w == b"\r\n\r\n") {
        match held.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => raw.extend_from_slice(&buf[..n]),
        }
    }
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200"), "unexpected response: {text}");
}

#[tokio::test]
async fn trust_bundle_rotation_admits_new_ca_on_next_handshake() {
    // GIVEN: the server trusts only its own CA; the client's SVID is from another
    let authority = DevAuthority::new("example.org").unwrap();
    let foreign = DevAuthority::new("example.org").unwrap();
    let (server_source, publisher) =
        workload_source(&authority, "svc-a", authority.trust_bundle()).await;
    let mut both = authority.trust_bundle();
    both.extend(foreign.trust_bundle());
    let (client_source, _p2) = workload_source(&foreign, "svc-b", both.clone()).await;
    let server = serve(&server_source, AuthorizationPolicy::Any, true).await;
    let client = AuthenticatedClient::new(client_source, Duration::from_secs(5));

    let rejected = client
        .get(&server.url("/secure"), AuthorizationPolicy::Any)
        .await;
    assert!(rejected.is_err());
    assert!(eventually(|| server.stats.handshake_failures() >= 1).await);

    // WHEN: only the server's trust bundle rotates to include the foreign CA
    let before = server_source.current().unwrap();
    publisher
        .publish(IdentityUpdate::TrustBundle(both))
        .await
        .unwrap();
    assert!(
        eventually(|| server_source.current().unwrap().generation() > before.generation()).await,
        "trust bundle rotation was not published"
    );

    // THEN: the SVID half is carried over unchanged
    let after = server_source.current().unwrap();
    assert_eq!(after.generation(), before.generation() + 1);
    assert!(Arc::ptr_eq(before.svid(), after.svid()));
    assert!(!Arc::ptr_eq(before.trust_bundle(), after.trust_bundle()));

    // AND: the next handshake validates against the new roots
    let secure: SecureResponse = client
        .get_json(&server.url("/secure"), AuthorizationPolicy::Any)
        .await
        .unwrap();
    assert_eq!(secure.client_id, "spiffe://example.org/svc-b");
    assert_eq!(server.stats.accepted(), 1);
}

// =====================================================================
// /call-external relay
// =====================================================================

#[tokio::test]
async fn call_external_relays_remote_secure_response() {
    // GIVEN: svc-a and svc-b both serving, and a caller svc-c
    let authority = DevAuthority::new("example.org").unwrap();
    let (a_source, _pa) = workload_source(&authority, "svc-a", authority.trust_bundle()).await;
    let (b_source, _pb) = workload_source(&authority, "svc-b", authority.trust_bundle()).await;
    let (c_source, _pc) = workload_source(&authority, "svc-c", authority.trust_bundle()).await;
    let a = serve(&a_source, AuthorizationPolicy::Any, true).await;
    let b = serve(&b_source, AuthorizationPolicy::Any, true).await;
    let caller = AuthenticatedClient::new(c_source, Duration::from_secs(5));

    // WHEN: svc-c asks svc-a to call svc-b
    let target = b.url("/secure");
    let url = reqwest::Url::parse_with_params(
        &a.url("/call-external"),
        &[
            ("target_url", target.as_str()),
            ("target_spiffe_id", "spiffe://example.org/svc-b"),
        ],
    )
    .unwrap();
    let relayed: SecureResponse = caller
        .get_json(url.as_str(), AuthorizationPolicy::Exact(id("spiffe://example.org/svc-a")))
        .await
        .unwrap();

    // THEN: svc-b saw svc-a as its caller
    assert_eq!(relayed.client_id, "spiffe://example.org/svc-a");
    assert_eq!(relayed.server_id, "spiffe://example.org/svc-b");
    assert!(relayed.authenticated);
}

#[tokio::test]
async fn call_external_with_wrong_target_id_is_bad_gateway() {
    let authority = DevAuthority::new("example.org").unwrap();
    let (a_source, _pa) = workload_source(&authority, "svc-a", authority.trust_bundle()).await;
    let (b_source, _pb) = workload_source(&authority, "svc-b", authority.trust_bundle()).await;
    let (c_source, _pc) = workload_source(&authority, "svc-c", authority.trust_bundle()).await;
    let a = serve(&a_source, AuthorizationPolicy::Any, true).await;
    let b = serve(&b_source, AuthorizationPolicy::Any, true).await;

    let target = b.url("/secure");
    let url = reqwest::Url::parse_with_params(
        &a.url("/call-external"),
        &[
            ("target_url", target.as_str()),
            ("target_spiffe_id", "spiffe://example.org/svc-z"),
        ],
    )
    .unwrap();
    let response = AuthenticatedClient::new(c_source, Duration::from_secs(5))
        .get(url.as_str(), AuthorizationPolicy::Any)
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_GATEWAY);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["kind"], "peer_authorization_failed");
}
