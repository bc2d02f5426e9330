//! MQTT session management.
//!
//! One [`AccountSessionManager`] per account, created lazily by the first
//! CONNECT that binds to it. It owns the account's sessions and messages
//! streams, the in-memory session map, and the retained-message store, and
//! implements duplicate-client-ID takeover, durable-subscription
//! restoration, and persistence of session records.

use crate::broker::Account;
use crate::mqtt::codec::MqttFilter;
use crate::mqtt::conn::{CloseReason, MqttConn};
use crate::mqtt::retained::RetainedStore;
use crate::mqtt::SUBACK_FAILURE;
use anyhow::{bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::stream::{ConsumerConfig, DurableConsumer, StreamConfig, StreamLog};

/// Stream holding one record per durable session.
pub const SESSIONS_STREAM_NAME: &str = "$MQTT_sessions";
/// Stream holding QoS ≥ 1 publications.
pub const MESSAGES_STREAM_NAME: &str = "$MQTT_messages";
/// Durable pull consumer whose interest keeps session records retained.
pub const SESSIONS_CONSUMER_NAME: &str = "mqtt_sessions";
const SESSIONS_RECORD_SUBJECT: &str = "sessions";

/// Serialized image of a session, one effective record per client ID.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistedSession {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub clean: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub subs: HashMap<String, u8>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub cons: HashMap<String, String>,
}

/// In-memory session state.
pub struct Session {
    pub clean: bool,
    /// Translated filter subject → granted QoS.
    pub subs: HashMap<String, u8>,
    /// Durable consumers parked here while no connection is bound.
    pub cons: HashMap<String, Arc<DurableConsumer>>,
    /// Back-link to the bound connection; `None` once it closes.
    pub conn: Option<Arc<MqttConn>>,
    /// Sequence of the persisted record, 0 when none.
    pub sseq: u64,
}

/// What a CONNECT learns from binding to its session.
pub struct BindOutcome {
    pub session_present: bool,
    /// Consumer handles transferred from the session to the connection.
    pub consumers: HashMap<String, Arc<DurableConsumer>>,
    /// Durable subscriptions to restore, as translated filters.
    pub resume_subs: Vec<MqttFilter>,
}

pub struct AccountSessionManager {
    account: Arc<Account>,
    pub sessions_log: Arc<StreamLog>,
    pub messages_log: Arc<StreamLog>,
    pub retained: RetainedStore,
    sessions: Mutex<HashMap<String, Session>>,
}

impl AccountSessionManager {
    /// Create the streams/consumer for this account (or re-open what a
    /// previous process left on disk) and replay the sessions stream.
    fn init(account: Arc<Account>, client_id: &str) -> Result<Self> {
        if !account.streams_enabled {
            bail!(
                "durable streams must be enabled for account {:?} used by MQTT client ID {:?}",
                account.name,
                client_id
            );
        }
        let sessions_log = match account.streams.lookup(SESSIONS_STREAM_NAME)? {
            Some(log) => log,
            None => account
                .streams
                .create(&StreamConfig {
                    name: SESSIONS_STREAM_NAME.to_string(),
                })
                .with_context(|| {
                    format!("unable to create sessions stream for account {:?}", account.name)
                })?,
        };
        if sessions_log.lookup_consumer(SESSIONS_CONSUMER_NAME).is_none() {
            sessions_log
                .add_consumer(ConsumerConfig {
                    durable_name: SESSIONS_CONSUMER_NAME.to_string(),
                    filter_subject: None,
                    deliver_subject: None,
                })
                .with_context(|| {
                    format!(
                        "unable to create sessions consumer for account {:?}",
                        account.name
                    )
                })?;
        }
        let messages_log = match account.streams.lookup(MESSAGES_STREAM_NAME)? {
            Some(log) => log,
            None => account
                .streams
                .create(&StreamConfig {
                    name: MESSAGES_STREAM_NAME.to_string(),
                })
                .with_context(|| {
                    format!("unable to create messages stream for account {:?}", account.name)
                })?,
        };

        let mut sessions: HashMap<String, Session> = HashMap::new();
        let first = sessions_log.first_seq();
        let last = sessions_log.last_seq();
        if first > 0 {
            for record in sessions_log.scan(first, last) {
                let ps: PersistedSession = match serde_json::from_slice(&record.payload) {
                    Ok(ps) => ps,
                    Err(err) => {
                        warn!(seq = record.seq, "skipping undecodable session record: {err}");
                        continue;
                    }
                };
                if let Some(stale) = sessions.get(&ps.id) {
                    if stale.sseq != 0 {
                        let _ = sessions_log.delete_message(stale.sseq);
                    }
                }
                let mut cons = HashMap::new();
                for (sid, name) in &ps.cons {
                    if let Some(consumer) = messages_log.lookup_consumer(name) {
                        cons.insert(sid.clone(), consumer);
                    }
                }
                sessions.insert(
                    ps.id.clone(),
                    Session {
                        clean: ps.clean,
                        subs: ps.subs,
                        cons,
                        conn: None,
                        sseq: record.seq,
                    },
                );
            }
            debug!(
                account = %account.name,
                restored = sessions.len(),
                "replayed sessions stream"
            );
        }

        Ok(Self {
            account,
            sessions_log,
            messages_log,
            retained: RetainedStore::new(),
            sessions: Mutex::new(sessions),
        })
    }

    pub fn account(&self) -> &Arc<Account> {
        &self.account
    }

    /// Bind a connection to its session, creating one when no record exists.
    /// A prior bound connection is closed with its Will suppressed and its
    /// subscriptions and consumer handles reclaimed first.
    pub fn bind_connection(
        &self,
        client_id: &str,
        conn: &Arc<MqttConn>,
        clean: bool,
    ) -> Result<BindOutcome> {
        let mut sessions = self.sessions.lock();
        let session = match sessions.entry(client_id.to_string()) {
            std::collections::hash_map::Entry::Vacant(entry) => {
                let mut session = Session {
                    clean,
                    subs: HashMap::new(),
                    cons: HashMap::new(),
                    conn: Some(Arc::clone(conn)),
                    sseq: 0,
                };
                // No stored state: persist the fresh record right away.
                self.save_session(client_id, &mut session, conn)?;
                entry.insert(session);
                return Ok(BindOutcome {
                    session_present: false,
                    consumers: HashMap::new(),
                    resume_subs: Vec::new(),
                });
            }
            std::collections::hash_map::Entry::Occupied(entry) => entry.into_mut(),
        };

        if let Some(prior) = session.conn.take() {
            // Duplicate client ID: the server must disconnect the existing
            // connection, without delivering its Will.
            prior.clear_will();
            {
                let mut state = prior.state();
                for slot in state.subs.values() {
                    self.account.router.unsubscribe(&slot.handle);
                }
                state.subs.clear();
                for (sid, binding) in state.consumers.drain() {
                    self.account.router.unsubscribe(&binding.inbox_sub);
                    binding.consumer.set_deliver_subject(None);
                    session.cons.insert(sid, binding.consumer);
                }
                state.acks.clear();
            }
            info!(conn = prior.id, %client_id, "closing connection replaced by new CONNECT");
            prior.close(CloseReason::DuplicateClientId);
        }

        let session_present = if clean || session.clean {
            // Either side asking for a clean session discards all state and
            // never reports the session as present.
            self.clear_session(session);
            false
        } else {
            true
        };
        session.conn = Some(Arc::clone(conn));
        session.clean = clean;
        let consumers = std::mem::take(&mut session.cons);
        let resume_subs = session
            .subs
            .iter()
            .map(|(subject, qos)| MqttFilter {
                subject: subject.clone(),
                qos: *qos,
            })
            .collect();
        Ok(BindOutcome {
            session_present,
            consumers,
            resume_subs,
        })
    }

    /// Fold accepted filter changes into the session and persist a fresh
    /// record if anything changed. A session taken over by another
    /// connection is left untouched.
    pub fn update_session(
        &self,
        client_id: &str,
        conn: &Arc<MqttConn>,
        filters: &[MqttFilter],
        add: bool,
    ) -> Result<()> {
        let mut sessions = self.sessions.lock();
        let Some(session) = sessions.get_mut(client_id) else {
            return Ok(());
        };
        if !session.conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            return Ok(());
        }
        let mut need_update = false;
        for f in filters {
            if f.qos == SUBACK_FAILURE {
                continue;
            }
            if add {
                if session.subs.get(&f.subject) != Some(&f.qos) {
                    session.subs.insert(f.subject.clone(), f.qos);
                    need_update = true;
                }
            } else if session.subs.remove(&f.subject).is_some() {
                need_update = true;
            }
        }
        if need_update {
            self.save_session(client_id, session, conn)?;
        }
        Ok(())
    }

    /// Handle a closed connection: reclaim its subscriptions and consumer
    /// handles, then either clean the session up or just detach it.
    pub fn handle_close(&self, conn: &Arc<MqttConn>) {
        let Some(client_id) = conn.client_id() else {
            return;
        };
        let mut sessions = self.sessions.lock();

        let mut reclaimed = HashMap::new();
        {
            let mut state = conn.state();
            for slot in state.subs.values() {
                self.account.router.unsubscribe(&slot.handle);
            }
            state.subs.clear();
            for (sid, binding) in state.consumers.drain() {
                self.account.router.unsubscribe(&binding.inbox_sub);
                binding.consumer.set_deliver_subject(None);
                reclaimed.insert(sid, binding.consumer);
            }
            state.acks.clear();
        }

        let Some(session) = sessions.get_mut(&client_id) else {
            return;
        };
        if !session.conn.as_ref().is_some_and(|c| Arc::ptr_eq(c, conn)) {
            // Already replaced by a takeover.
            return;
        }
        session.cons.extend(reclaimed);
        if session.clean {
            self.clear_session(session);
            sessions.remove(&client_id);
        } else {
            session.conn = None;
        }
    }

    fn save_session(
        &self,
        client_id: &str,
        session: &mut Session,
        conn: &Arc<MqttConn>,
    ) -> Result<()> {
        let cons = conn
            .state()
            .consumers
            .iter()
            .map(|(sid, b)| (sid.clone(), b.consumer.name().to_string()))
            .collect();
        let ps = PersistedSession {
            id: client_id.to_string(),
            clean: session.clean,
            subs: session.subs.clone(),
            cons,
        };
        let payload = serde_json::to_vec(&ps)?;
        let new_seq = self
            .sessions_log
            .append(SESSIONS_RECORD_SUBJECT, &payload)
            .context("persist session record")?;
        if session.sseq != 0 {
            let _ = self.sessions_log.delete_message(session.sseq);
        }
        session.sseq = new_seq;
        Ok(())
    }

    /// Delete the session's durable consumers and its persisted record.
    fn clear_session(&self, session: &mut Session) {
        for (_, consumer) in session.cons.drain() {
            if let Err(err) = self.messages_log.delete_consumer(consumer.name()) {
                warn!("failed to delete consumer {}: {err:#}", consumer.name());
            }
        }
        session.subs.clear();
        if session.sseq != 0 {
            let _ = self.sessions_log.delete_message(session.sseq);
            session.sseq = 0;
        }
    }

    /// Granted QoS per filter subject, for inspection and tests.
    pub fn session_subscriptions(&self, client_id: &str) -> Option<HashMap<String, u8>> {
        self.sessions.lock().get(client_id).map(|s| s.subs.clone())
    }

    pub fn num_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}

/// Global registry: account name → account session manager.
#[derive(Default)]
pub struct SessionRegistry {
    managers: RwLock<HashMap<String, Arc<AccountSessionManager>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session manager for an account, created on first use. Creation
    /// runs under the registry write lock so exactly one manager ever
    /// initializes the account's streams.
    pub fn account_manager(
        &self,
        account: &Arc<Account>,
        client_id: &str,
    ) -> Result<Arc<AccountSessionManager>> {
        if let Some(asm) = self.managers.read().get(&account.name) {
            return Ok(Arc::clone(asm));
        }
        let mut managers = self.managers.write();
        if let Some(asm) = managers.get(&account.name) {
            return Ok(Arc::clone(asm));
        }
        let asm = Arc::new(AccountSessionManager::init(Arc::clone(account), client_id)?);
        info!(account = %account.name, "created MQTT session manager");
        managers.insert(account.name.clone(), Arc::clone(&asm));
        Ok(asm)
    }

    pub fn get(&self, account_name: &str) -> Option<Arc<AccountSessionManager>> {
        self.managers.read().get(account_name).cloned()
    }

    /// Re-evaluate publish permissions of every retained message's source.
    pub fn recheck_retained_permissions(&self, auth: &crate::broker::auth::AuthManager) {
        for asm in self.managers.read().values() {
            asm.retained.recheck_permissions(auth);
        }
    }
}
