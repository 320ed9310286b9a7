//! `versyncd`: the replication daemon. Loads a [`settings::Settings`] file
//! and a replication-rules file, opens the durable store, and runs every
//! configured collection's worker alongside the pre-auth export server
//! until told to stop.

mod auth;

use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;
use versync::settings::Settings;
use versync::{chroot, VersionedSystem};
use versync_config::ReplicatorConfig;
use versync_core::SledStore;

#[derive(Parser)]
#[clap(name = "versyncd", about = "Versioned document collection replication daemon")]
struct Cli {
    /// Path to the daemon's TOML settings file.
    settings: std::path::PathBuf,
}

fn init_tracing() {
    tracing_log::LogTracer::init().ok();
    let env = std::env::var(EnvFilter::DEFAULT_ENV).unwrap_or_else(|_| "info".to_owned());
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(env))
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).ok();
    log_panics::init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let settings = Settings::load(&cli.settings).with_context(|| format!("loading settings from {}", cli.settings.display()))?;
    let rules = ReplicatorConfig::load(&settings.rules_path).with_context(|| format!("loading rules from {}", settings.rules_path.display()))?;

    if let Some(drop) = &settings.chroot {
        chroot::chroot(&drop.user, &drop.path)?;
        tracing::info!(user = %drop.user, path = %drop.path.display(), "dropped privileges");
    }

    let store = Arc::new(SledStore::open(&settings.data_dir).with_context(|| format!("opening store at {}", settings.data_dir.display()))?);
    let verifier = Arc::new(auth::StoreAuthVerifier::new(store.clone()));
    let exports = Arc::new(auth::ConfigExports(rules.clone()));

    let system = Arc::new(VersionedSystem::new(store, rules));
    system.init_vcs(settings.vcs.clone()).await?;

    let listen_system = system.clone();
    let bind = settings.bind.clone();
    let listener = tokio::spawn(async move {
        if let Err(e) = listen_system.listen(bind, verifier, exports).await {
            tracing::error!(error = %e, "pre-auth server exited with an error");
        }
    });

    wait_for_shutdown(&system).await;
    listener.abort();
    Ok(())
}

/// Graceful-then-forceful shutdown per spec §5: the first SIGINT/SIGTERM
/// drains in-flight batches before stopping every worker; a second signal
/// aborts immediately.
async fn wait_for_shutdown<S: versync_core::Store + 'static>(system: &Arc<VersionedSystem<S>>) {
    let mut term = signal(SignalKind::terminate()).expect("installing SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("installing SIGINT handler");

    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
    tracing::info!("shutdown signal received, draining workers");

    let graceful = {
        let system = system.clone();
        tokio::spawn(async move { system.stop().await })
    };

    tokio::select! {
        _ = graceful => {
            tracing::info!("shutdown complete");
        }
        _ = term.recv() => {
            tracing::warn!("second signal received, aborting immediately");
            system.stop_term();
        }
        _ = int.recv() => {
            tracing::warn!("second signal received, aborting immediately");
            system.stop_term();
        }
    }
}
