//! Per-account subject router.
//!
//! Subscriptions register a delivery callback under a subject pattern and a
//! subscription identifier. Publishing fans a payload out to every matching
//! subscription, carrying metadata about the publish origin so protocol
//! adapters can derive per-delivery semantics (QoS, retain, ack reply).

use crate::broker::subject::{self, SubjectTree};
use anyhow::Result;
use bytes::Bytes;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Where a published message entered the subject space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOrigin {
    /// A native (non-MQTT) publisher.
    Native,
    /// An MQTT client; carries the PUBLISH fixed-header flags.
    Mqtt { flags: u8 },
    /// A durable consumer delivering a stored stream message.
    Stream,
}

/// Metadata attached to every publish, the header channel of the router.
#[derive(Debug, Clone)]
pub struct PublishMeta {
    pub origin: PublishOrigin,
    /// Reply subject; set by stream deliveries to the per-message ack subject.
    pub reply: Option<String>,
}

impl PublishMeta {
    pub fn native() -> Self {
        Self {
            origin: PublishOrigin::Native,
            reply: None,
        }
    }

    pub fn mqtt(flags: u8) -> Self {
        Self {
            origin: PublishOrigin::Mqtt { flags },
            reply: None,
        }
    }

    pub fn stream(reply: String) -> Self {
        Self {
            origin: PublishOrigin::Stream,
            reply: Some(reply),
        }
    }
}

/// A single matched delivery handed to a subscription callback.
pub struct Delivery<'a> {
    pub subject: &'a str,
    pub payload: &'a Bytes,
    pub meta: &'a PublishMeta,
}

pub type DeliverFn = Arc<dyn Fn(&Delivery<'_>) + Send + Sync>;

/// Handle returned by [`SubjectRouter::subscribe`]; used to unsubscribe.
#[derive(Debug, Clone)]
pub struct SubHandle {
    id: u64,
    pub subject: String,
    pub sid: String,
}

struct Entry {
    id: u64,
    sid: String,
    deliver: DeliverFn,
}

pub struct SubjectRouter {
    tree: RwLock<SubjectTree<Entry>>,
    next_id: AtomicU64,
}

impl Default for SubjectRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl SubjectRouter {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(SubjectTree::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscription. A subscription with the same identifier on
    /// the same subject is replaced in place under the write lock, so the
    /// flow of publications is never interrupted by a re-subscribe.
    pub fn subscribe(&self, subject: &str, sid: &str, deliver: DeliverFn) -> Result<SubHandle> {
        subject::validate(subject)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut tree = self.tree.write();
        tree.remove(subject, |e| e.sid == sid);
        tree.insert(
            subject,
            Entry {
                id,
                sid: sid.to_string(),
                deliver,
            },
        );
        Ok(SubHandle {
            id,
            subject: subject.to_string(),
            sid: sid.to_string(),
        })
    }

    pub fn unsubscribe(&self, handle: &SubHandle) {
        self.tree.write().remove(&handle.subject, |e| e.id == handle.id);
    }

    /// Fan a payload out to all matching subscriptions. Callbacks are invoked
    /// after the match lock is released; they must not block.
    pub fn publish(&self, subject: &str, meta: &PublishMeta, payload: &Bytes) {
        let callbacks: Vec<DeliverFn> = {
            let tree = self.tree.read();
            tree.matching(subject)
                .into_iter()
                .map(|e| Arc::clone(&e.deliver))
                .collect()
        };
        if callbacks.is_empty() {
            return;
        }
        let delivery = Delivery {
            subject,
            payload,
            meta,
        };
        for deliver in callbacks {
            deliver(&delivery);
        }
    }

    pub fn num_subscriptions(&self) -> usize {
        self.tree.read().len()
    }
}
