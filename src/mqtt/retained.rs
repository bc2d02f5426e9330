//! Retained-message store.
//!
//! One per account. Keeps the last retained publication per subject behind a
//! readers/writer lock, with a wildcard-capable reverse index so a new
//! subscription can collect every retained message its filter matches. The
//! read guard is exposed so callers can hold the lock across match +
//! subscription registration, closing the window where a concurrent retained
//! publish would be neither replayed nor delivered.

use crate::broker::auth::AuthManager;
use crate::broker::subject::SubjectTree;
use bytes::Bytes;
use parking_lot::{RwLock, RwLockReadGuard};
use std::collections::HashMap;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RetainedMessage {
    pub subject: String,
    pub payload: Bytes,
    /// PUBLISH fixed-header flags the message was stored with.
    pub flags: u8,
    /// Username of the publisher, for permission rechecks.
    pub source: String,
}

#[derive(Default)]
struct RetainedState {
    /// Literal subjects, reverse-matched by subscription filters.
    index: SubjectTree<String>,
    msgs: HashMap<String, RetainedMessage>,
}

#[derive(Default)]
pub struct RetainedStore {
    state: RwLock<RetainedState>,
}

pub struct RetainedReader<'a>(RwLockReadGuard<'a, RetainedState>);

impl RetainedStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a retained message, or remove the stored one when the payload
    /// is empty. The index holds exactly one node per stored subject.
    pub fn store_or_remove(&self, subject: &str, payload: &Bytes, flags: u8, source: &str) {
        let mut state = self.state.write();
        if payload.is_empty() {
            if state.msgs.remove(subject).is_some() {
                state.index.remove(subject, |s| s == subject);
            }
            return;
        }
        let msg = RetainedMessage {
            subject: subject.to_string(),
            payload: payload.clone(),
            flags,
            source: source.to_string(),
        };
        if state.msgs.insert(subject.to_string(), msg).is_none() {
            state.index.insert(subject, subject.to_string());
        }
    }

    /// Take the read lock for match + serialize work.
    pub fn reader(&self) -> RetainedReader<'_> {
        RetainedReader(self.state.read())
    }

    /// Drop retained messages whose source is no longer allowed to publish
    /// on their subject under the current permission table.
    pub fn recheck_permissions(&self, auth: &AuthManager) {
        let mut state = self.state.write();
        let revoked: Vec<String> = state
            .msgs
            .values()
            .filter(|m| !m.source.is_empty() && !auth.can_publish(&m.source, &m.subject))
            .map(|m| m.subject.clone())
            .collect();
        for subject in revoked {
            debug!(%subject, "removing retained message after permission change");
            state.msgs.remove(&subject);
            state.index.remove(&subject, |s| *s == subject);
        }
    }

    pub fn num_messages(&self) -> usize {
        self.state.read().msgs.len()
    }
}

impl RetainedReader<'_> {
    /// All retained messages a subscription on `filter_subject` would match.
    pub fn matches(&self, filter_subject: &str) -> Vec<&RetainedMessage> {
        self.0
            .index
            .reverse_matching(filter_subject)
            .into_iter()
            .filter_map(|subject| self.0.msgs.get(subject))
            .collect()
    }
}
