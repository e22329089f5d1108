//! mTLS Workload - identity-aware service-to-service mutual TLS
//!
//! Serves its SPIFFE identity over mTLS and calls peers that must present an
//! expected one.

use std::path::Path;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use mtls_workload::{
    cli::{Cli, Command},
    config::Config,
    mtls::{DevAuthority, SvidParams},
    service::Workload,
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup tracing
    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    match cli.command {
        Some(Command::DevCerts {
            trust_domain,
            workloads,
            out,
            dns_names,
            ttl,
        }) => run_dev_certs(&trust_domain, &workloads, &out, &dns_names, ttl),
        Some(Command::Serve) | None => run_server(cli).await,
    }
}

/// Issue a development CA and one SVID directory per workload
fn run_dev_certs(
    trust_domain: &str,
    workloads: &[String],
    out: &Path,
    dns_names: &[String],
    ttl: Duration,
) -> ExitCode {
    let authority = match DevAuthority::new(trust_domain) {
        Ok(a) => a,
        Err(e) => {
            eprintln!("❌ Failed to create CA: {e}");
            return ExitCode::FAILURE;
        }
    };

    for workload in workloads {
        let mut params = SvidParams::new(workload.trim_matches('/'), ttl);
        params.dns_names = dns_names.to_vec();

        let dir = out.join(workload.trim_matches('/').replace('/', "_"));
        let result = authority
            .issue(&params)
            .and_then(|svid| svid.write_to_dir(&dir, authority.bundle_pem()).map(|()| svid));
        match result {
            Ok(svid) => println!("✅ {} → {}", svid.spiffe_id, dir.display()),
            Err(e) => {
                eprintln!("❌ {workload}: {e}");
                return ExitCode::FAILURE;
            }
        }
    }

    println!();
    println!("Trust domain: {}", authority.trust_domain());
    println!("💡 Tip: run with --identity-dir {}/<workload>", out.display());
    ExitCode::SUCCESS
}

/// Run the workload
async fn run_server(cli: Cli) -> ExitCode {
    // Load configuration
    let config = match Config::load(cli.config.as_deref()) {
        Ok(mut config) => {
            // Apply CLI overrides
            if let Some(ref host) = cli.host {
                config.server.host.clone_from(host);
            }
            if let Some(port) = cli.http_port {
                config.server.http_port = port;
            }
            if let Some(port) = cli.https_port {
                config.server.https_port = port;
            }
            if let Some(ref name) = cli.service_name {
                config.service_name.clone_from(name);
            }
            if let Some(ref dir) = cli.identity_dir {
                config.identity.dir.clone_from(dir);
            }
            config
        }
        Err(e) => {
            error!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = config.validate() {
        error!("Invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        service = %config.service_name,
        http_port = config.server.http_port,
        https_port = config.server.https_port,
        "Starting mTLS workload"
    );

    if let Err(e) = Workload::new(config).run().await {
        error!(kind = e.kind(), "Workload error: {e}");
        return ExitCode::FAILURE;
    }

    info!("Workload shutdown complete");
    ExitCode::SUCCESS
}
