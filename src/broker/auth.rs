//! Static authentication and publish-permission evaluation.
//!
//! Users come from the configuration file. Each user binds to an account and
//! optionally carries publish allow/deny subject pattern lists. Permission
//! evaluation is allow-first: an empty allow list means "everything", then
//! the deny list is applied on top.

use crate::broker::subject;
use crate::core::config::{AuthConfig, UserConfig};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("authentication required")]
    CredentialsRequired,
    #[error("unknown user or bad password")]
    BadCredentials,
}

/// Resolved identity of an authenticated connection.
#[derive(Debug, Clone)]
pub struct Identity {
    pub username: Option<String>,
    pub account: String,
}

#[derive(Debug, Clone, Default)]
struct PublishPermissions {
    /// `None` means every subject is allowed.
    allow: Option<Vec<String>>,
    deny: Vec<String>,
}

#[derive(Debug, Clone)]
struct UserEntry {
    password: String,
    account: String,
    permissions: PublishPermissions,
}

pub struct AuthManager {
    users: HashMap<String, UserEntry>,
    default_account: String,
}

impl AuthManager {
    pub fn from_config(cfg: &AuthConfig) -> Self {
        let users = cfg
            .users
            .iter()
            .map(|u| (u.username.clone(), UserEntry::from_config(u, cfg)))
            .collect();
        Self {
            users,
            default_account: cfg.default_account.clone(),
        }
    }

    /// Authenticate a connection. With no configured users, every connection
    /// lands on the default account; otherwise credentials are mandatory.
    pub fn authenticate(
        &self,
        username: Option<&str>,
        password: Option<&str>,
    ) -> Result<Identity, AuthError> {
        if self.users.is_empty() {
            return Ok(Identity {
                username: username.map(str::to_string),
                account: self.default_account.clone(),
            });
        }
        let name = username.ok_or(AuthError::CredentialsRequired)?;
        let entry = self.users.get(name).ok_or(AuthError::BadCredentials)?;
        if entry.password != password.unwrap_or_default() {
            return Err(AuthError::BadCredentials);
        }
        Ok(Identity {
            username: Some(name.to_string()),
            account: entry.account.clone(),
        })
    }

    /// Whether the named user may currently publish on the given subject.
    /// Unknown users may not; this is what retires their retained messages
    /// after a configuration change removed them.
    pub fn can_publish(&self, username: &str, subject: &str) -> bool {
        if self.users.is_empty() {
            return true;
        }
        let Some(entry) = self.users.get(username) else {
            return false;
        };
        entry.permissions.allows(subject)
    }
}

impl UserEntry {
    fn from_config(cfg: &UserConfig, auth: &AuthConfig) -> Self {
        Self {
            password: cfg.password.clone(),
            account: cfg
                .account
                .clone()
                .unwrap_or_else(|| auth.default_account.clone()),
            permissions: PublishPermissions {
                allow: cfg.allow_publish.clone(),
                deny: cfg.deny_publish.clone().unwrap_or_default(),
            },
        }
    }
}

impl PublishPermissions {
    fn allows(&self, subj: &str) -> bool {
        let allowed = match &self.allow {
            None => true,
            Some(patterns) => patterns.iter().any(|p| subject::matches(p, subj)),
        };
        allowed && !self.deny.iter().any(|p| subject::matches(p, subj))
    }
}
