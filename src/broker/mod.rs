//! Host-broker collaborators: subject space, routing, accounts, auth.

pub mod auth;
pub mod router;
pub mod subject;

use crate::core::config::Config;
use crate::stream::StreamStore;
use anyhow::Result;
use parking_lot::RwLock;
use router::SubjectRouter;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// An isolated subject space with its own router and stream store.
pub struct Account {
    pub name: String,
    pub router: Arc<SubjectRouter>,
    pub streams: Arc<StreamStore>,
    /// Whether the durable-stream subsystem is enabled for this account.
    /// MQTT sessions cannot be created without it.
    pub streams_enabled: bool,
}

pub struct AccountRegistry {
    accounts: RwLock<HashMap<String, Arc<Account>>>,
}

impl AccountRegistry {
    /// Build every configured account (plus the default account) eagerly so
    /// lookups during CONNECT never create state.
    pub fn from_config(cfg: &Config, data_dir: &Path) -> Result<Self> {
        let mut accounts = HashMap::new();
        let mut names: Vec<(String, bool)> = cfg
            .accounts
            .iter()
            .map(|a| (a.name.clone(), a.streams_enabled))
            .collect();
        if !names.iter().any(|(n, _)| *n == cfg.auth.default_account) {
            names.push((cfg.auth.default_account.clone(), true));
        }
        for (name, streams_enabled) in names {
            let router = Arc::new(SubjectRouter::new());
            let streams = Arc::new(StreamStore::new(
                data_dir.join("accounts").join(&name),
                Arc::clone(&router),
            ));
            info!(account = %name, streams_enabled, "registered account");
            accounts.insert(
                name.clone(),
                Arc::new(Account {
                    name,
                    router,
                    streams,
                    streams_enabled,
                }),
            );
        }
        Ok(Self {
            accounts: RwLock::new(accounts),
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<Account>> {
        self.accounts.read().get(name).cloned()
    }
}
