use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::fmt;
use versync_config::ReplicatorConfig;

/// Validates a replication rules file against the checks `versyncd` runs at
/// startup, without actually starting a daemon.
#[derive(Parser)]
struct Cli {
    /// Path to the replication rules TOML file.
    rules: PathBuf,
}

fn main() -> Result<()> {
    fmt::init();
    let cli = Cli::parse();
    let cfg = ReplicatorConfig::load(&cli.rules)?;
    let (imports, exports) = cfg.split_import_export();
    info!(
        rules = cfg.rules.len(),
        imports = imports.len(),
        exports = exports.len(),
        "replication rules valid"
    );
    Ok(())
}
