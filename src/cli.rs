//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

/// Identity-aware mTLS workload
#[derive(Parser, Debug)]
#[command(name = "mtls-workload")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "MTLS_WORKLOAD_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Host to bind both listeners to
    #[arg(long, env = "MTLS_WORKLOAD_HOST")]
    pub host: Option<String>,

    /// Plain HTTP port
    #[arg(long, env = "PORT")]
    pub http_port: Option<u16>,

    /// mTLS port
    #[arg(long, env = "MTLS_WORKLOAD_HTTPS_PORT")]
    pub https_port: Option<u16>,

    /// Service name reported by /health
    #[arg(long, env = "SERVICE_NAME")]
    pub service_name: Option<String>,

    /// Identity directory holding svid.pem, svid_key.pem and bundle.pem
    #[arg(long, env = "MTLS_WORKLOAD_IDENTITY_DIR")]
    pub identity_dir: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "MTLS_WORKLOAD_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "MTLS_WORKLOAD_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the workload (default)
    Serve,

    /// Issue a development CA and SVIDs for local runs
    DevCerts {
        /// Trust domain of the generated CA
        #[arg(long, default_value = "example.org")]
        trust_domain: String,

        /// Workload path below the trust domain; one SVID directory each
        #[arg(long = "workload", required = true)]
        workloads: Vec<String>,

        /// Output directory
        #[arg(short, long, default_value = "certs")]
        out: PathBuf,

        /// DNS SAN added to every SVID
        #[arg(long = "dns")]
        dns_names: Vec<String>,

        /// SVID lifetime (e.g. "1h", "30m")
        #[arg(long, default_value = "1h", value_parser = parse_duration)]
        ttl: Duration,
    },
}

fn parse_duration(raw: &str) -> Result<Duration, String> {
    humantime_serde::re::humantime::parse_duration(raw)
        .map_err(|e| format!("invalid duration '{raw}': {e}"))
}
