//! Reference auth and export-lookup adapters (spec §6's "persisted state
//! layout" mention of a `users` collection holding credential records).
//!
//! Neither of these is mandated by spec — the pre-auth server only depends
//! on the [`AuthVerifier`]/[`ExportLookup`] traits — but a daemon has to
//! ship with something wired to real storage to be runnable at all.

use async_trait::async_trait;
use std::sync::Arc;
use versync_config::ReplicatorConfig;
use versync_core::{RevBody, Store};
use versync_net::{AuthVerifier, ExportLookup};

/// Namespace holding one document per user: `{"_id": username, "password": ...}`.
pub const USERS_NS: &str = "users";

/// Verifies credentials against a `users` document in the backing store.
/// Passwords are stored and compared as plain strings; a production
/// deployment would swap this for a hashed-credential adapter without
/// touching the pre-auth server, since it only talks to the trait.
pub struct StoreAuthVerifier<S> {
    store: Arc<S>,
}

impl<S: Store> StoreAuthVerifier<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl<S: Store + Send + Sync> AuthVerifier for StoreAuthVerifier<S> {
    async fn verify(&self, username: &str, password: &str, _realm: &str) -> bool {
        let mut key = RevBody::new();
        key.insert("_id".into(), serde_json::json!(username));
        match self.store.get(USERS_NS, &key).await {
            Ok(Some(doc)) => doc.get("password").and_then(|v| v.as_str()) == Some(password),
            _ => false,
        }
    }
}

/// Adapts [`ReplicatorConfig`] to the pre-auth server's export-rule lookup:
/// a peer authenticating as `username` gets the hooks of its export rule,
/// if this node has configured one.
pub struct ConfigExports(pub ReplicatorConfig);

#[async_trait]
impl ExportLookup for ConfigExports {
    async fn hooks_for(&self, username: &str, db: &str, collection: &str) -> Option<Vec<String>> {
        self.0.fetch_from_db(db, collection, username).ok().map(|r| r.hooks.clone())
    }
}
