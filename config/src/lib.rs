//! Replication rule configuration (spec §4.9, component C9): which
//! collections get pushed to or pulled from which peers, with which size
//! budget, and through which merge hooks.

use fnv::FnvHashMap;
use serde::Deserialize;
use std::path::Path;
use versync_core::{ConfigError, MergeHook, OplogReaderOptions};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Import,
    Export,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Rule {
    pub db: String,
    pub collection: String,
    pub direction: Direction,
    pub peer: String,
    /// Byte budget for the capped oplog backing this rule. Required for
    /// `export` rules (the side that owns the capped collection a peer
    /// tails); meaningless for `import`.
    pub size_bytes: Option<u64>,
    #[serde(default)]
    pub hooks: Vec<String>,
    #[serde(default = "default_tailable")]
    pub tailable: bool,
}

fn default_tailable() -> bool {
    true
}

impl Rule {
    fn ns(&self) -> String {
        format!("{}.{}", self.db, self.collection)
    }
}

#[derive(Clone, Debug, Deserialize, Default)]
pub struct ReplicatorConfig {
    #[serde(default, rename = "rules")]
    pub rules: Vec<Rule>,
}

impl ReplicatorConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let cfg: Self = toml::from_str(&text)?;
        cfg.verify_import_export()?;
        Ok(cfg)
    }

    pub fn from_str(text: &str) -> anyhow::Result<Self> {
        let cfg: Self = toml::from_str(text)?;
        cfg.verify_import_export()?;
        Ok(cfg)
    }

    /// True if `(db, collection, peer)` has both an import and an export
    /// rule — the bidirectional-replication configuration spec §4.9
    /// rejects, since a peer that both pushes and pulls the same
    /// collection can't make forward progress without risking a merge
    /// loop with itself.
    pub fn bidir_from(&self, db: &str, collection: &str, peer: &str) -> bool {
        let has_import = self
            .rules
            .iter()
            .any(|r| r.db == db && r.collection == collection && r.peer == peer && r.direction == Direction::Import);
        let has_export = self
            .rules
            .iter()
            .any(|r| r.db == db && r.collection == collection && r.peer == peer && r.direction == Direction::Export);
        has_import && has_export
    }

    /// Every export rule for `db.collection`, across all configured peers —
    /// the fan-out list the replicator pushes a new local revision to.
    pub fn replicate_to(&self, db: &str, collection: &str) -> Vec<&Rule> {
        self.rules
            .iter()
            .filter(|r| r.db == db && r.collection == collection && r.direction == Direction::Export)
            .collect()
    }

    pub fn split_import_export(&self) -> (Vec<&Rule>, Vec<&Rule>) {
        let imports = self.rules.iter().filter(|r| r.direction == Direction::Import).collect();
        let exports = self.rules.iter().filter(|r| r.direction == Direction::Export).collect();
        (imports, exports)
    }

    /// Static validation run once at load time: rejects bidirectional
    /// configurations and export rules missing their size budget.
    pub fn verify_import_export(&self) -> Result<(), ConfigError> {
        for rule in &self.rules {
            if rule.db.is_empty() || rule.collection.is_empty() {
                return Err(ConfigError::MissingNamespace);
            }
            if rule.direction == Direction::Export && rule.size_bytes.is_none() {
                return Err(ConfigError::MissingSize(rule.ns()));
            }
            if self.bidir_from(&rule.db, &rule.collection, &rule.peer) {
                return Err(ConfigError::Bidirectional(rule.ns(), rule.peer.clone()));
            }
        }
        Ok(())
    }

    /// Builds the [`OplogReaderOptions`] an export rule's reader should use.
    pub fn get_tail_options(&self, db: &str, collection: &str, peer: &str) -> Option<OplogReaderOptions> {
        let rule = self.find(db, collection, peer, Direction::Export)?;
        Some(OplogReaderOptions {
            offset: 0,
            include_offset: false,
            tailable: rule.tailable,
            tailable_retry_interval: std::time::Duration::from_millis(200),
        })
    }

    /// Resolves a rule's `hooks` names against the built-in hook registry.
    /// Hooks are applied in the order listed.
    pub fn load_hooks(&self, db: &str, collection: &str, peer: &str, direction: Direction) -> Result<Vec<MergeHook>, ConfigError> {
        let rule = self
            .find(db, collection, peer, direction)
            .ok_or(ConfigError::MissingNamespace)?;
        let registry = builtin_hooks();
        rule.hooks
            .iter()
            .map(|name| registry.get(name.as_str()).copied().ok_or_else(|| ConfigError::UnknownHook(name.clone())))
            .map(|f| f.map(|f| Box::new(f) as MergeHook))
            .collect()
    }

    /// Looks up the export rule serving `peer`'s pull request for
    /// `db.collection`. Returns [`ConfigError::MissingExport`] if this node
    /// hasn't configured an export for that specific peer — the runtime
    /// counterpart to [`Self::verify_import_export`]'s static checks.
    pub fn fetch_from_db(&self, db: &str, collection: &str, peer: &str) -> Result<&Rule, ConfigError> {
        self.find(db, collection, peer, Direction::Export).ok_or_else(|| ConfigError::MissingExport {
            db: db.to_string(),
            coll: collection.to_string(),
            peer: peer.to_string(),
        })
    }

    fn find(&self, db: &str, collection: &str, peer: &str, direction: Direction) -> Option<&Rule> {
        self.rules
            .iter()
            .find(|r| r.db == db && r.collection == collection && r.peer == peer && r.direction == direction)
    }
}

type HookFn = fn(&versync_core::RevBody) -> Option<versync_core::RevBody>;

/// Hooks are named in configuration and resolved here rather than loaded as
/// dynamic code, keeping the replicator's behavior fully determined by what
/// ships in the binary.
fn builtin_hooks() -> FnvHashMap<&'static str, HookFn> {
    let mut m: FnvHashMap<&'static str, HookFn> = FnvHashMap::default();
    m.insert("redact_secrets", redact_secrets as HookFn);
    m.insert("strip_internal_fields", strip_internal_fields as HookFn);
    m
}

fn redact_secrets(body: &versync_core::RevBody) -> Option<versync_core::RevBody> {
    let mut out = body.clone();
    for key in ["password", "secret", "token"] {
        if out.contains_key(key) {
            out.insert(key.to_string(), serde_json::Value::String("[redacted]".to_string()));
        }
    }
    Some(out)
}

fn strip_internal_fields(body: &versync_core::RevBody) -> Option<versync_core::RevBody> {
    let mut out = body.clone();
    out.retain(|k, _| !k.starts_with('_') || k == "_id");
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const TWO_PEER_TOML: &str = r#"
        [[rules]]
        db = "app"
        collection = "todos"
        direction = "export"
        peer = "peer-a"
        size_bytes = 16777216
        hooks = ["redact_secrets"]

        [[rules]]
        db = "app"
        collection = "todos"
        direction = "import"
        peer = "peer-b"
    "#;

    #[test]
    fn loads_and_verifies_a_valid_config() {
        let cfg = ReplicatorConfig::from_str(TWO_PEER_TOML).unwrap();
        assert_eq!(cfg.rules.len(), 2);
    }

    #[test]
    fn bidirectional_same_peer_is_rejected() {
        let toml = r#"
            [[rules]]
            db = "app"
            collection = "todos"
            direction = "export"
            peer = "peer-a"
            size_bytes = 1024

            [[rules]]
            db = "app"
            collection = "todos"
            direction = "import"
            peer = "peer-a"
        "#;
        let err = ReplicatorConfig::from_str(toml).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test]
    fn export_without_size_is_rejected() {
        let toml = r#"
            [[rules]]
            db = "app"
            collection = "todos"
            direction = "export"
            peer = "peer-a"
        "#;
        let err = ReplicatorConfig::from_str(toml).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ConfigError>(),
            Some(ConfigError::MissingSize(_))
        ));
    }

    #[test]
    fn replicate_to_lists_export_peers_only() {
        let cfg = ReplicatorConfig::from_str(TWO_PEER_TOML).unwrap();
        let exports = cfg.replicate_to("app", "todos");
        assert_eq!(exports.len(), 1);
        assert_eq!(exports[0].peer, "peer-a");
    }

    #[test]
    fn fetch_from_db_fails_for_unconfigured_peer() {
        let cfg = ReplicatorConfig::from_str(TWO_PEER_TOML).unwrap();
        let err = cfg.fetch_from_db("app", "todos", "peer-z").unwrap_err();
        assert!(matches!(err, ConfigError::MissingExport { .. }));
    }

    #[test]
    fn unknown_hook_name_is_rejected() {
        let toml = r#"
            [[rules]]
            db = "app"
            collection = "todos"
            direction = "export"
            peer = "peer-a"
            size_bytes = 1024
            hooks = ["does_not_exist"]
        "#;
        let cfg = ReplicatorConfig::from_str(toml).unwrap();
        let err = cfg.load_hooks("app", "todos", "peer-a", Direction::Export).unwrap_err();
        assert!(matches!(err, ConfigError::UnknownHook(_)));
    }
}
