//! Configuration management

use std::{net::SocketAddr, path::Path, path::PathBuf, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};

use crate::identity::{IdentityPaths, OpenOptions, StalePolicy};
use crate::mtls::{AuthorizationPolicy, PolicyRuleConfig};
use crate::{Error, Result};

/// Environment variable prefix; nested keys are separated by `__`.
pub const ENV_PREFIX: &str = "MTLS_WORKLOAD_";

/// Main configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Name reported by `/health`
    pub service_name: String,
    /// Listener configuration
    pub server: ServerConfig,
    /// Where the workload identity comes from
    pub identity: IdentityConfig,
    /// Inbound authorization rules, OR-combined. Empty accepts any
    /// validated peer.
    pub authorization: Vec<PolicyRuleConfig>,
    /// Outbound client configuration
    pub client: ClientConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_name: "example-workload".to_string(),
            server: ServerConfig::default(),
            identity: IdentityConfig::default(),
            authorization: Vec::new(),
            client: ClientConfig::default(),
        }
    }
}

/// Listener configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address for both listeners
    pub host: String,
    /// Plain HTTP port (health and identity only)
    pub http_port: u16,
    /// mTLS port (all endpoints)
    pub https_port: u16,
    /// Fail handshakes from clients that present no certificate
    pub require_client_cert: bool,
    /// How long in-flight requests get to finish on shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8080,
            https_port: 8443,
            require_client_cert: false,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Plain HTTP socket address.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `host` is not an IP address.
    pub fn http_addr(&self) -> Result<SocketAddr> {
        self.addr(self.http_port)
    }

    /// mTLS socket address.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if `host` is not an IP address.
    pub fn https_addr(&self) -> Result<SocketAddr> {
        self.addr(self.https_port)
    }

    fn addr(&self, port: u16) -> Result<SocketAddr> {
        format!("{}:{port}", self.host)
            .parse()
            .map_err(|e| Error::Config(format!("Invalid address {}:{port}: {e}", self.host)))
    }
}

/// Identity directory configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Directory holding the SVID, key and bundle PEM files. Only this
    /// directory is watched for changes.
    pub dir: PathBuf,
    /// Override for the SVID chain file, relative to `dir` unless absolute
    pub cert_file: Option<PathBuf>,
    /// Override for the private key file
    pub key_file: Option<PathBuf>,
    /// Override for the trust bundle file
    pub bundle_file: Option<PathBuf>,
    /// How long to wait for the first identity at startup
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    /// Handling of SVIDs that are already expired when delivered
    pub stale_bundles: StalePolicy,
    /// Quiet period before re-reading changed identity files
    #[serde(with = "humantime_serde")]
    pub debounce: Duration,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("/run/spiffe/certs"),
            cert_file: None,
            key_file: None,
            bundle_file: None,
            startup_timeout: Duration::from_secs(30),
            stale_bundles: StalePolicy::default(),
            debounce: Duration::from_millis(250),
        }
    }
}

impl IdentityConfig {
    /// File locations with overrides applied.
    #[must_use]
    pub fn paths(&self) -> IdentityPaths {
        let mut paths = IdentityPaths::in_dir(&self.dir);
        if let Some(cert) = &self.cert_file {
            paths.cert = self.dir.join(cert);
        }
        if let Some(key) = &self.key_file {
            paths.key = self.dir.join(key);
        }
        if let Some(bundle) = &self.bundle_file {
            paths.bundle = self.dir.join(bundle);
        }
        paths
    }

    /// Options for `IdentitySource::open`.
    #[must_use]
    pub fn open_options(&self) -> OpenOptions {
        OpenOptions {
            startup_timeout: self.startup_timeout,
            stale_bundles: self.stale_bundles,
        }
    }
}

/// Outbound client configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Per-call timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then the YAML file, then
    /// `MTLS_WORKLOAD_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file is missing, a value fails to
    /// deserialize, or an authorization rule is invalid.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints that serde cannot express.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first violation.
    pub fn validate(&self) -> Result<()> {
        if self.server.http_port != 0 && self.server.http_port == self.server.https_port {
            return Err(Error::Config(format!(
                "http_port and https_port must differ (both {})",
                self.server.http_port
            )));
        }
        if self.client.timeout.is_zero() {
            return Err(Error::Config("client.timeout must be non-zero".into()));
        }
        self.authorization_policy().map(|_| ())
    }

    /// Compile the inbound authorization rules.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if a rule sets no matcher or several.
    pub fn authorization_policy(&self) -> Result<AuthorizationPolicy> {
        AuthorizationPolicy::from_config(&self.authorization)
    }
}
