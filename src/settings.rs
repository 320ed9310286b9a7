//! Ambient daemon configuration (spec §4.9/§6), loaded once at startup from
//! a TOML file: per-collection size/merge-policy knobs, the pre-auth
//! server's bind address, and the privilege-drop target for [`crate::chroot`].

use serde::Deserialize;
use std::path::PathBuf;
use versync_core::TombstonePolicy;

fn default_batch() -> usize {
    256
}

fn default_high_water() -> usize {
    1024
}

fn default_low_water() -> usize {
    128
}

/// One `[[vc]]` table: a collection this node maintains a versioned DAG for.
#[derive(Clone, Debug, Deserialize)]
pub struct VcSettings {
    pub db: String,
    pub collection: String,
    /// Byte budget for the collection's capped oplog mirror.
    pub size_bytes: u64,
    #[serde(default = "default_batch")]
    pub batch: usize,
    #[serde(default)]
    pub merge_policy: MergePolicySetting,
    #[serde(default = "default_high_water")]
    pub inbound_high_water: usize,
    #[serde(default = "default_low_water")]
    pub inbound_low_water: usize,
}

#[derive(Clone, Copy, Debug, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergePolicySetting {
    #[default]
    Conflict,
    DeleteWins,
    EditWins,
}

impl From<MergePolicySetting> for TombstonePolicy {
    fn from(value: MergePolicySetting) -> Self {
        match value {
            MergePolicySetting::Conflict => TombstonePolicy::Conflict,
            MergePolicySetting::DeleteWins => TombstonePolicy::DeleteWins,
            MergePolicySetting::EditWins => TombstonePolicy::EditWins,
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Bind {
    Tcp { host: String, port: u16 },
    Unix { path: PathBuf },
}

#[derive(Clone, Debug, Deserialize)]
pub struct ChrootSettings {
    pub user: String,
    pub path: PathBuf,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Settings {
    #[serde(default, rename = "vc")]
    pub vcs: Vec<VcSettings>,
    pub bind: Bind,
    pub chroot: Option<ChrootSettings>,
    /// Path to the replication rules file `versync-config` loads.
    pub rules_path: PathBuf,
    /// Directory backing the durable `sled` store.
    pub data_dir: PathBuf,
}

impl Settings {
    pub fn load(path: impl AsRef<std::path::Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_minimal_settings_file() {
        let toml = r#"
            rules_path = "rules.toml"
            data_dir = "/var/lib/versyncd"

            [bind]
            type = "tcp"
            host = "0.0.0.0"
            port = 27018

            [[vc]]
            db = "app"
            collection = "todos"
            size_bytes = 16777216
        "#;
        let settings: Settings = toml::from_str(toml).unwrap();
        assert_eq!(settings.vcs.len(), 1);
        assert_eq!(settings.vcs[0].batch, default_batch());
        assert!(matches!(settings.bind, Bind::Tcp { port: 27018, .. }));
    }
}
