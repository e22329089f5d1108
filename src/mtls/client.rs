//! Authenticated client: outbound mTLS with a pinned server identity.
//!
//! A server certificate that chains to the trust bundle is not enough: the
//! SPIFFE ID in it must also satisfy the caller's expected-peer policy. That
//! keeps one trusted workload from being mistaken for another.
//!
//! Each [`AuthenticatedClient::call`] builds its own `reqwest::Client` around
//! a fresh verifier, so a policy rejection can be attributed to that call and
//! returned as `Error::PeerAuthorizationFailed` rather than a generic
//! connection error.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, Request, Response, Url};
use rustls::ClientConfig;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use super::crypto_provider;
use super::policy::AuthorizationPolicy;
use super::verifier::{PeerServerVerifier, SvidResolver};
use crate::identity::IdentitySource;
use crate::{Error, Result};

/// Build a TLS 1.3 client config that presents the current SVID and only
/// accepts servers satisfying `expected`.
///
/// The returned verifier records the last policy rejection for diagnostics.
///
/// # Errors
///
/// Returns `Error::Config` if the crypto provider does not support TLS 1.3.
pub fn client_config(
    source: &IdentitySource,
    expected: Arc<AuthorizationPolicy>,
) -> Result<(ClientConfig, Arc<PeerServerVerifier>)> {
    let provider = crypto_provider();
    let verifier = Arc::new(PeerServerVerifier::new(
        source.clone(),
        expected,
        Arc::clone(&provider),
    ));

    let mut config = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| Error::Config(format!("TLS protocol setup failed: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier.clone())
        .with_client_cert_resolver(Arc::new(SvidResolver::new(source.clone())));
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok((config, verifier))
}

/// Outbound HTTP client authenticated by the workload's SVID.
#[derive(Debug, Clone)]
pub struct AuthenticatedClient {
    source: IdentitySource,
    timeout: Duration,
}

impl AuthenticatedClient {
    /// Client presenting `source`'s identity; every call is bounded by `timeout`.
    #[must_use]
    pub fn new(source: IdentitySource, timeout: Duration) -> Self {
        Self { source, timeout }
    }

    /// Per-call timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Perform `request` against a server that must satisfy `expected`.
    ///
    /// The connection is dropped on return, including on timeout or when the
    /// caller cancels the future.
    ///
    /// # Errors
    ///
    /// - `Error::PeerAuthorizationFailed` if the server's chain is valid but
    ///   its identity does not satisfy `expected`.
    /// - `Error::RequestFailed` if the call exceeds the timeout.
    /// - `Error::Http` for any other transport failure.
    /// - `Error::SourceClosed` if the identity source has been closed.
    pub async fn call(&self, request: Request, expected: AuthorizationPolicy) -> Result<Response> {
        if self.source.is_closed() {
            return Err(Error::SourceClosed);
        }

        let expected = Arc::new(expected);
        let (tls, verifier) = client_config(&self.source, Arc::clone(&expected))?;
        let client = reqwest::Client::builder()
            .use_preconfigured_tls(tls)
            .http1_only()
            .timeout(self.timeout)
            .build()?;

        let url = request.url().clone();
        debug!(%url, %expected, "Outbound mTLS call");

        match client.execute(request).await {
            Ok(response) => Ok(response),
            Err(e) => {
                if let Some(rejection) = verifier.take_rejection() {
                    warn!(
                        %url,
                        expected = %expected,
                        presented = %rejection.name.describe(),
                        "Peer authorization failed"
                    );
                    return Err(Error::PeerAuthorizationFailed {
                        expected: expected.to_string(),
                        presented: rejection.name.describe(),
                    });
                }
                if e.is_timeout() {
                    return Err(Error::RequestFailed(format!(
                        "request to {url} timed out after {:?}",
                        self.timeout
                    )));
                }
                Err(Error::Http(e))
            }
        }
    }

    /// `GET url` from a server that must satisfy `expected`.
    ///
    /// # Errors
    ///
    /// As [`call`](Self::call), plus `Error::InvalidRequest` for an
    /// unparseable URL.
    pub async fn get(&self, url: &str, expected: AuthorizationPolicy) -> Result<Response> {
        let url = Url::parse(url)
            .map_err(|e| Error::InvalidRequest(format!("Invalid target URL '{url}': {e}")))?;
        self.call(Request::new(Method::GET, url), expected).await
    }

    /// `GET url` and decode a successful JSON response.
    ///
    /// # Errors
    ///
    /// As [`get`](Self::get); a non-2xx status or undecodable body is
    /// `Error::RequestFailed`.
    pub async fn get_json<T: DeserializeOwned>(
        &self,
        url: &str,
        expected: AuthorizationPolicy,
    ) -> Result<T> {
        let response = self.get(url, expected).await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::RequestFailed(format!(
                "{url} responded with status {status}"
            )));
        }
        response
            .json::<T>()
            .await
            .map_err(|e| Error::RequestFailed(format!("Invalid JSON from {url}: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::identity::{OpenOptions, identity_channel};
    use crate::mtls::cert_manager::DevAuthority;

    async fn open_source() -> IdentitySource {
        let authority = DevAuthority::new("example.org").unwrap();
        let (publisher, stream) = identity_channel(1);
        publisher
            .publish(
                authority
                    .issue_svid("client", Duration::from_secs(3600))
                    .unwrap()
                    .into_full_update(authority.trust_bundle()),
            )
            .await
            .unwrap();
        IdentitySource::open(stream, OpenOptions::default(), &CancellationToken::new())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn client_config_is_tls13_with_client_cert() {
        let source = open_source().await;
        let (config, _verifier) =
            client_config(&source, Arc::new(AuthorizationPolicy::Any)).unwrap();
        assert!(config.client_auth_cert_resolver.has_certs());
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[tokio::test]
    async fn get_rejects_invalid_url() {
        let client = AuthenticatedClient::new(open_source().await, Duration::from_secs(1));
        let result = client.get("not a url", AuthorizationPolicy::Any).await;
        assert!(matches!(result, Err(Error::InvalidRequest(_))));
    }

    #[tokio::test]
    async fn call_after_close_is_source_closed() {
        let source = open_source().await;
        let client = AuthenticatedClient::new(source.clone(), Duration::from_secs(1));
        source.close();
        let result = client
            .get("https://127.0.0.1:1/secure", AuthorizationPolicy::Any)
            .await;
        assert!(matches!(result, Err(Error::SourceClosed)));
    }

    #[tokio::test]
    async fn unreachable_server_is_not_an_authorization_failure() {
        // GIVEN: nothing listening on the target port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let client = AuthenticatedClient::new(open_source().await, Duration::from_secs(2));

        // WHEN: calling it
        let result = client
            .get(&format!("https://{addr}/secure"), AuthorizationPolicy::Any)
            .await;

        // THEN: a transport error, distinct from PeerAuthorizationFailed
        let err = result.unwrap_err();
        assert!(!matches!(err, Error::PeerAuthorizationFailed { .. }));
        assert_ne!(err.kind(), "peer_authorization_failed");
    }
}
