//! Append-only stream logs and the per-account stream store.
//!
//! Storage layout per stream, under `<data>/streams/<name>/`:
//! - `log`: length-prefixed bincode frames, `Append{seq, subject, payload}`
//!   or `Delete{seq}`, replayed on open
//! - `manifest.json`: last assigned sequence plus the durable-consumer images
//!
//! Retention is interest-based. An appended record registers as pending on
//! every consumer whose filter matches; the last consumer to acknowledge it
//! removes it. A record matched by no consumer is never stored.

use crate::broker::router::{PublishMeta, SubjectRouter};
use crate::stream::consumer::{ConsumerConfig, ConsumerManifest, DurableConsumer};
use anyhow::{bail, Context, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::warn;

const LOG_FILE: &str = "log";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub name: String,
}

/// A record read back out of a stream.
#[derive(Debug, Clone)]
pub struct StoredMessage {
    pub seq: u64,
    pub subject: String,
    pub payload: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
enum Frame {
    Append {
        seq: u64,
        subject: String,
        payload: Vec<u8>,
    },
    Delete {
        seq: u64,
    },
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Manifest {
    last_seq: u64,
    consumers: Vec<ConsumerManifest>,
}

struct Entry {
    subject: String,
    payload: Bytes,
}

struct Inner {
    entries: BTreeMap<u64, Entry>,
    last_seq: u64,
    file: File,
    consumers: HashMap<String, Arc<DurableConsumer>>,
}

pub struct StreamLog {
    name: String,
    dir: PathBuf,
    router: Arc<SubjectRouter>,
    /// Handed to consumers so acks can reach back into the log.
    self_ref: Weak<StreamLog>,
    inner: Mutex<Inner>,
}

struct OutboundDelivery {
    deliver_subject: String,
    ack_subject: String,
    #[allow(dead_code)]
    subject: String,
    payload: Bytes,
}

impl StreamLog {
    fn open(dir: PathBuf, name: &str, router: Arc<SubjectRouter>) -> Result<Arc<Self>> {
        fs::create_dir_all(&dir).with_context(|| format!("create stream dir {}", dir.display()))?;
        let manifest = read_manifest(&dir.join(MANIFEST_FILE))?;
        let (entries, replayed_last) = replay(&dir.join(LOG_FILE), name)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join(LOG_FILE))
            .with_context(|| format!("open log for stream {name}"))?;
        let last_seq = manifest.last_seq.max(replayed_last);
        let log = Arc::new_cyclic(|weak: &Weak<StreamLog>| {
            let consumers = manifest
                .consumers
                .iter()
                .map(|cm| {
                    (
                        cm.name.clone(),
                        Arc::new(DurableConsumer::from_manifest(weak.clone(), cm)),
                    )
                })
                .collect();
            Self {
                name: name.to_string(),
                dir,
                router,
                self_ref: weak.clone(),
                inner: Mutex::new(Inner {
                    entries,
                    last_seq,
                    file,
                    consumers,
                }),
            }
        });
        Ok(log)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Append a record. Returns its sequence. Records with no interested
    /// consumer advance the sequence but are not stored.
    pub fn append(&self, subject: &str, payload: &[u8]) -> Result<u64> {
        let mut deliveries = Vec::new();
        let seq;
        {
            let mut inner = self.inner.lock();
            seq = inner.last_seq + 1;
            inner.last_seq = seq;
            let interested: Vec<Arc<DurableConsumer>> = inner
                .consumers
                .values()
                .filter(|c| c.interested_in(subject))
                .cloned()
                .collect();
            if !interested.is_empty() {
                write_frame(
                    &mut inner.file,
                    &Frame::Append {
                        seq,
                        subject: subject.to_string(),
                        payload: payload.to_vec(),
                    },
                )?;
                inner.entries.insert(
                    seq,
                    Entry {
                        subject: subject.to_string(),
                        payload: Bytes::copy_from_slice(payload),
                    },
                );
                for cons in &interested {
                    cons.add_pending(seq);
                    if let Some(deliver_subject) = cons.deliver_subject() {
                        deliveries.push(OutboundDelivery {
                            deliver_subject,
                            ack_subject: cons.ack_subject(&self.name, seq),
                            subject: subject.to_string(),
                            payload: Bytes::copy_from_slice(payload),
                        });
                    }
                }
            }
            self.persist_manifest(&inner)?;
        }
        self.dispatch(deliveries);
        Ok(seq)
    }

    /// Delete a record by sequence, regardless of remaining interest.
    pub fn delete_message(&self, seq: u64) -> Result<bool> {
        let mut inner = self.inner.lock();
        if inner.entries.remove(&seq).is_none() {
            return Ok(false);
        }
        write_frame(&mut inner.file, &Frame::Delete { seq })?;
        for cons in inner.consumers.values() {
            cons.remove_pending(seq);
        }
        self.persist_manifest(&inner)?;
        Ok(true)
    }

    /// Records in `[from, to]`, in sequence order.
    pub fn scan(&self, from: u64, to: u64) -> Vec<StoredMessage> {
        let inner = self.inner.lock();
        inner
            .entries
            .range(from..=to)
            .map(|(seq, e)| StoredMessage {
                seq: *seq,
                subject: e.subject.clone(),
                payload: e.payload.clone(),
            })
            .collect()
    }

    pub fn first_seq(&self) -> u64 {
        self.inner
            .lock()
            .entries
            .keys()
            .next()
            .copied()
            .unwrap_or(0)
    }

    pub fn last_seq(&self) -> u64 {
        self.inner.lock().last_seq
    }

    pub fn num_messages(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Add a durable consumer, or rebind an existing one by durable name.
    /// Rebinding a push consumer redelivers every pending record to the new
    /// deliver subject, in sequence order.
    pub fn add_consumer(&self, cfg: ConsumerConfig) -> Result<Arc<DurableConsumer>> {
        let mut deliveries = Vec::new();
        let cons = {
            let mut inner = self.inner.lock();
            if let Some(existing) = inner.consumers.get(&cfg.durable_name).cloned() {
                existing.set_deliver_subject(cfg.deliver_subject.clone());
                if let Some(deliver_subject) = cfg.deliver_subject {
                    for seq in existing.pending_snapshot() {
                        if let Some(entry) = inner.entries.get(&seq) {
                            deliveries.push(OutboundDelivery {
                                deliver_subject: deliver_subject.clone(),
                                ack_subject: existing.ack_subject(&self.name, seq),
                                subject: entry.subject.clone(),
                                payload: entry.payload.clone(),
                            });
                        }
                    }
                }
                existing
            } else {
                let cons = Arc::new(DurableConsumer::new(
                    self.self_ref.clone(),
                    cfg.durable_name.clone(),
                    cfg.filter_subject,
                    cfg.deliver_subject,
                ));
                inner.consumers.insert(cfg.durable_name, Arc::clone(&cons));
                self.persist_manifest(&inner)?;
                cons
            }
        };
        self.dispatch(deliveries);
        Ok(cons)
    }

    pub fn lookup_consumer(&self, name: &str) -> Option<Arc<DurableConsumer>> {
        self.inner.lock().consumers.get(name).cloned()
    }

    /// Remove a consumer; records whose only remaining interest it held are
    /// deleted.
    pub fn delete_consumer(&self, name: &str) -> Result<()> {
        let mut inner = self.inner.lock();
        let Some(cons) = inner.consumers.remove(name) else {
            return Ok(());
        };
        for seq in cons.pending_snapshot() {
            let orphaned = !inner.consumers.values().any(|c| c.has_pending(seq));
            if orphaned && inner.entries.remove(&seq).is_some() {
                write_frame(&mut inner.file, &Frame::Delete { seq })?;
            }
        }
        self.persist_manifest(&inner)?;
        Ok(())
    }

    /// Acknowledge one sequence for one consumer; drops the record once no
    /// consumer holds it pending.
    pub(crate) fn ack_consumer(&self, name: &str, seq: u64) {
        let mut inner = self.inner.lock();
        let Some(cons) = inner.consumers.get(name).cloned() else {
            return;
        };
        if !cons.remove_pending(seq) {
            return;
        }
        let retained = inner.consumers.values().any(|c| c.has_pending(seq));
        if !retained && inner.entries.remove(&seq).is_some() {
            if let Err(err) = write_frame(&mut inner.file, &Frame::Delete { seq }) {
                warn!("stream {}: failed to tombstone seq {seq}: {err:#}", self.name);
            }
        }
        if let Err(err) = self.persist_manifest(&inner) {
            warn!("stream {}: failed to persist manifest: {err:#}", self.name);
        }
    }

    fn persist_manifest(&self, inner: &Inner) -> Result<()> {
        let manifest = Manifest {
            last_seq: inner.last_seq,
            consumers: inner.consumers.values().map(|c| c.manifest()).collect(),
        };
        let bytes = serde_json::to_vec_pretty(&manifest)?;
        let path = self.dir.join(MANIFEST_FILE);
        fs::write(&path, bytes).with_context(|| format!("write manifest {}", path.display()))
    }

    fn dispatch(&self, deliveries: Vec<OutboundDelivery>) {
        for d in deliveries {
            let meta = PublishMeta::stream(d.ack_subject);
            self.router.publish(&d.deliver_subject, &meta, &d.payload);
        }
    }
}

fn write_frame(file: &mut File, frame: &Frame) -> Result<()> {
    let body = bincode::serialize(frame).context("encode log frame")?;
    let len = u32::try_from(body.len()).context("log frame too large")?;
    file.write_all(&len.to_le_bytes())?;
    file.write_all(&body)?;
    Ok(())
}

fn replay(path: &Path, stream: &str) -> Result<(BTreeMap<u64, Entry>, u64)> {
    let mut entries = BTreeMap::new();
    let mut last_seq = 0;
    let Ok(buf) = fs::read(path) else {
        return Ok((entries, last_seq));
    };
    let mut pos = 0usize;
    while pos < buf.len() {
        if pos + 4 > buf.len() {
            warn!("stream {stream}: truncated frame header at byte {pos}, ignoring tail");
            break;
        }
        let len = u32::from_le_bytes([buf[pos], buf[pos + 1], buf[pos + 2], buf[pos + 3]]) as usize;
        pos += 4;
        if pos + len > buf.len() {
            warn!("stream {stream}: truncated frame body at byte {pos}, ignoring tail");
            break;
        }
        let frame: Frame = bincode::deserialize(&buf[pos..pos + len])
            .with_context(|| format!("decode log frame for stream {stream}"))?;
        pos += len;
        match frame {
            Frame::Append {
                seq,
                subject,
                payload,
            } => {
                last_seq = last_seq.max(seq);
                entries.insert(
                    seq,
                    Entry {
                        subject,
                        payload: Bytes::from(payload),
                    },
                );
            }
            Frame::Delete { seq } => {
                entries.remove(&seq);
            }
        }
    }
    Ok((entries, last_seq))
}

fn read_manifest(path: &Path) -> Result<Manifest> {
    match fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("decode manifest {}", path.display())),
        Err(_) => Ok(Manifest::default()),
    }
}

/// Per-account registry of stream logs.
pub struct StreamStore {
    dir: PathBuf,
    router: Arc<SubjectRouter>,
    streams: Mutex<HashMap<String, Arc<StreamLog>>>,
}

impl StreamStore {
    pub fn new(dir: PathBuf, router: Arc<SubjectRouter>) -> Self {
        Self {
            dir,
            router,
            streams: Mutex::new(HashMap::new()),
        }
    }

    fn stream_dir(&self, name: &str) -> PathBuf {
        self.dir.join("streams").join(name)
    }

    /// Find a stream by name, reopening it from disk if a previous process
    /// left state behind.
    pub fn lookup(&self, name: &str) -> Result<Option<Arc<StreamLog>>> {
        let mut streams = self.streams.lock();
        if let Some(log) = streams.get(name) {
            return Ok(Some(Arc::clone(log)));
        }
        let dir = self.stream_dir(name);
        if !dir.exists() {
            return Ok(None);
        }
        let log = StreamLog::open(dir, name, Arc::clone(&self.router))?;
        streams.insert(name.to_string(), Arc::clone(&log));
        Ok(Some(log))
    }

    /// Create a stream (file-backed, interest retention). Creating an
    /// existing stream is an error; use [`StreamStore::lookup`] first.
    pub fn create(&self, cfg: &StreamConfig) -> Result<Arc<StreamLog>> {
        let mut streams = self.streams.lock();
        if streams.contains_key(&cfg.name) {
            bail!("stream {:?} already exists", cfg.name);
        }
        let log = StreamLog::open(
            self.stream_dir(&cfg.name),
            &cfg.name,
            Arc::clone(&self.router),
        )?;
        streams.insert(cfg.name.clone(), Arc::clone(&log));
        Ok(log)
    }
}
