use std::process;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use plimni::artifacts::{ArtifactFs, LocalFs};
use plimni::cli::{format_dry_run, Args};
use plimni::config::{load_settings_file, ConfigError, Settings, SettingsLayer};
use plimni::discovery::build_client;
use plimni::reconcile::{resolve_records, CycleConfig, Reconciler};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let args = Args::parse();

    // Initialize logging
    let filter = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter)),
        )
        .init();

    // Load .env file if specified, then parse again so its variables reach
    // the flags' environment fallbacks
    let args = match args.env_file {
        Some(ref env_file) => {
            if let Err(e) = dotenvy::from_path(env_file) {
                error!("Failed to load env file {}: {}", env_file.display(), e);
                process::exit(1);
            }
            Args::parse()
        }
        None => args,
    };

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            error!("{}", e);
            process::exit(1);
        }
    };

    if let Err(e) = run(&args, settings).await {
        error!("{:#}", e);
        process::exit(1);
    }
}

fn load_settings(args: &Args) -> Result<Settings, ConfigError> {
    let file = match args.config {
        Some(ref path) => load_settings_file(path)?,
        None => SettingsLayer::default(),
    };
    Settings::from_layer(args.layer().merge(file))
}

async fn run(args: &Args, settings: Settings) -> anyhow::Result<()> {
    let discovery = build_client(&settings.discovery())
        .await
        .with_context(|| format!("Failed to set up {} discovery", settings.orchestrator))?;

    // Dry-run mode: show what one cycle would resolve and exit
    if args.dry_run {
        let records = discovery
            .list_services(&settings.cluster_branch, &settings.cluster_domain)
            .await
            .context("Failed to list services")?;
        let resolution = resolve_records(&records, &settings.cluster_branch, &settings.cluster_domain);
        println!(
            "{}",
            format_dry_run(&settings, &resolution.services, &resolution.rejected)
        );
        return Ok(());
    }

    let issuance_endpoint = discovery
        .issuance_endpoint(settings.private_ip.as_deref())
        .context("Failed to locate the certificate issuance service")?;

    LocalFs
        .create_dir_all(&settings.sanitize_dir)
        .with_context(|| format!("Failed to create {}", settings.sanitize_dir.display()))?;

    info!(
        "Watching {} services for {} (branch {})",
        settings.orchestrator, settings.cluster_domain, settings.cluster_branch
    );
    info!("Services file: {}", settings.services_conf_file.display());
    info!("Issuance endpoint: {}", issuance_endpoint);

    let reconciler = Reconciler::new(
        discovery,
        CycleConfig::from_settings(&settings, &issuance_endpoint),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        let _ = shutdown_tx.send(true);
    });

    reconciler
        .run(shutdown_rx)
        .await
        .context("Configuration cycle failed")
}

/// Resolve on SIGTERM or SIGINT
async fn wait_for_signal() {
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            return std::future::pending().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => info!("Received SIGINT"),
            Err(e) => {
                error!("Failed to listen for SIGINT: {}", e);
                std::future::pending::<()>().await;
            }
        },
    }
}
