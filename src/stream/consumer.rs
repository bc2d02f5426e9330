//! Durable stream consumers.
//!
//! A consumer is a persistent cursor into a stream: ack-explicit, starting
//! at new messages only. Push consumers carry a deliver subject (an internal
//! inbox); pull consumers have none and simply hold retention interest.
//! Unacknowledged sequences are redelivered when the deliver subject is
//! rebound after a reconnect or restart.

use crate::stream::log::StreamLog;
use crate::stream::ACK_PREFIX;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Weak;

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub durable_name: String,
    /// Subject filter; `None` registers interest in every record.
    pub filter_subject: Option<String>,
    /// Deliver (push) subject; `None` makes this a pull consumer.
    pub deliver_subject: Option<String>,
}

/// Image of a consumer written into the stream manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerManifest {
    pub name: String,
    pub filter_subject: Option<String>,
    pub pending: Vec<u64>,
}

pub struct DurableConsumer {
    name: String,
    filter: Option<String>,
    log: Weak<StreamLog>,
    state: Mutex<ConsumerState>,
}

#[derive(Debug, Default)]
struct ConsumerState {
    deliver_subject: Option<String>,
    pending: BTreeSet<u64>,
}

impl DurableConsumer {
    pub(crate) fn new(
        log: Weak<StreamLog>,
        name: String,
        filter: Option<String>,
        deliver_subject: Option<String>,
    ) -> Self {
        Self {
            name,
            filter,
            log,
            state: Mutex::new(ConsumerState {
                deliver_subject,
                pending: BTreeSet::new(),
            }),
        }
    }

    pub(crate) fn from_manifest(log: Weak<StreamLog>, manifest: &ConsumerManifest) -> Self {
        Self {
            name: manifest.name.clone(),
            filter: manifest.filter_subject.clone(),
            log,
            state: Mutex::new(ConsumerState {
                deliver_subject: None,
                pending: manifest.pending.iter().copied().collect(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn filter_subject(&self) -> Option<&str> {
        self.filter.as_deref()
    }

    /// Whether this consumer registers interest in a record at `subject`.
    pub(crate) fn interested_in(&self, subject: &str) -> bool {
        match &self.filter {
            None => true,
            Some(filter) => crate::broker::subject::matches(filter, subject),
        }
    }

    pub fn num_pending(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub(crate) fn deliver_subject(&self) -> Option<String> {
        self.state.lock().deliver_subject.clone()
    }

    pub(crate) fn add_pending(&self, seq: u64) {
        self.state.lock().pending.insert(seq);
    }

    pub(crate) fn remove_pending(&self, seq: u64) -> bool {
        self.state.lock().pending.remove(&seq)
    }

    pub(crate) fn has_pending(&self, seq: u64) -> bool {
        self.state.lock().pending.contains(&seq)
    }

    pub(crate) fn pending_snapshot(&self) -> Vec<u64> {
        self.state.lock().pending.iter().copied().collect()
    }

    pub(crate) fn set_deliver_subject(&self, subject: Option<String>) {
        self.state.lock().deliver_subject = subject;
    }

    pub(crate) fn manifest(&self) -> ConsumerManifest {
        ConsumerManifest {
            name: self.name.clone(),
            filter_subject: self.filter.clone(),
            pending: self.pending_snapshot(),
        }
    }

    /// The acknowledgement subject for one delivered sequence.
    pub fn ack_subject(&self, stream: &str, seq: u64) -> String {
        format!("{ACK_PREFIX}{stream}.{}.{seq}", self.name)
    }

    /// Process an acknowledgement previously handed out as a reply subject.
    /// Unknown or stale ack subjects are ignored.
    pub fn ack(&self, ack_subject: &str) {
        let Some(seq) = parse_ack_sequence(ack_subject) else {
            return;
        };
        if let Some(log) = self.log.upgrade() {
            log.ack_consumer(&self.name, seq);
        }
    }
}

/// Extract the sequence from an ack subject; `None` if malformed.
pub fn parse_ack_sequence(ack_subject: &str) -> Option<u64> {
    let rest = ack_subject.strip_prefix(ACK_PREFIX)?;
    rest.rsplit('.').next()?.parse().ok()
}
