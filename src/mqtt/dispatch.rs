//! Per-connection packet dispatcher.
//!
//! A connection starts in `AwaitingConnect`: the first packet must be a
//! CONNECT, and it must arrive within the authentication window. Once
//! `Connected`, packets are read under the keep-alive deadline (1.5× the
//! client's keep-alive) and routed to their handlers. Every close path other
//! than a graceful DISCONNECT delivers the Will (if any) before the session
//! manager detaches the connection.

use crate::broker::auth::AuthManager;
use crate::broker::router::PublishMeta;
use crate::broker::AccountRegistry;
use crate::core::config::Config;
use crate::mqtt::bridge;
use crate::mqtt::codec::{
    self, ConnectPacket, MqttFilter, PublishPacket, CONNACK_ACCEPTED, CONNACK_NOT_AUTHORIZED,
    CONNACK_SERVER_UNAVAILABLE, PACKET_CONNECT, PACKET_DISCONNECT, PACKET_PINGREQ, PACKET_PUBACK,
    PACKET_PUBCOMP, PACKET_PUBLISH, PACKET_PUBREC, PACKET_PUBREL, PACKET_SUBSCRIBE,
    PACKET_TYPE_MASK, PACKET_UNSUBSCRIBE, PUBLISH_FLAG_RETAIN, SUBACK_FAILURE,
};
use crate::mqtt::conn::{CloseReason, MqttConn, Outbound, SubscriptionSlot};
use crate::mqtt::session::{AccountSessionManager, SessionRegistry};
use crate::mqtt::MULTI_LEVEL_SID_SUFFIX;
use crate::stream::DurableConsumer;
use anyhow::{anyhow, bail, Context, Result};
use bytes::BytesMut;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

/// Shared state of the MQTT adapter.
pub struct MqttServer {
    auth: AuthManager,
    accounts: AccountRegistry,
    sessions: SessionRegistry,
    auth_timeout: Duration,
    next_conn_id: AtomicU64,
}

impl MqttServer {
    pub fn new(cfg: &Config) -> Result<Self> {
        Ok(Self {
            auth: AuthManager::from_config(&cfg.auth),
            accounts: AccountRegistry::from_config(cfg, &cfg.storage.data_dir)?,
            sessions: SessionRegistry::new(),
            auth_timeout: Duration::from_secs(cfg.mqtt.auth_timeout_secs),
            next_conn_id: AtomicU64::new(1),
        })
    }

    pub fn auth(&self) -> &AuthManager {
        &self.auth
    }

    pub fn accounts(&self) -> &AccountRegistry {
        &self.accounts
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    /// Drive one client connection to completion.
    pub async fn handle_connection<S>(self: Arc<Self>, stream: S, peer: SocketAddr)
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let conn_id = self.next_conn_id.fetch_add(1, Ordering::Relaxed);
        let (reader, writer) = tokio::io::split(stream);
        let (conn, outbound_rx) = MqttConn::new(conn_id);
        debug!(conn = conn_id, %peer, "accepted MQTT connection");

        let writer_task = tokio::spawn(write_loop(writer, outbound_rx, conn_id));

        let mut driver = ConnectionDriver {
            server: &self,
            conn: Arc::clone(&conn),
            asm: None,
            read_deadline: None,
        };
        let outcome = driver.run(reader).await;

        let graceful = match outcome {
            Ok(graceful) => graceful,
            Err(err) => {
                debug!(conn = conn_id, "connection error: {err:#}");
                false
            }
        };
        if !graceful {
            driver.deliver_will();
        }
        if let Some(asm) = &driver.asm {
            asm.handle_close(&conn);
        }
        conn.close(if graceful {
            CloseReason::ClientDisconnect
        } else {
            CloseReason::SocketError
        });
        let _ = writer_task.await;
        debug!(conn = conn_id, %peer, "MQTT connection closed");
    }
}

async fn write_loop<W>(
    mut writer: WriteHalf<W>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
    conn_id: u64,
) where
    W: AsyncWrite,
{
    while let Some(event) = rx.recv().await {
        match event {
            Outbound::Frame(frame) => {
                if let Err(err) = writer.write_all(&frame).await {
                    debug!(conn = conn_id, "write failed: {err}");
                    break;
                }
            }
            Outbound::Close(reason) => {
                debug!(conn = conn_id, ?reason, "closing connection");
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

struct ConnectionDriver<'a> {
    server: &'a Arc<MqttServer>,
    conn: Arc<MqttConn>,
    asm: Option<Arc<AccountSessionManager>>,
    read_deadline: Option<Duration>,
}

impl ConnectionDriver<'_> {
    /// Returns `Ok(true)` for a graceful DISCONNECT close.
    async fn run<S>(&mut self, mut reader: ReadHalf<S>) -> Result<bool>
    where
        S: AsyncRead + AsyncWrite,
    {
        // AwaitingConnect: one packet, within the auth window.
        let (first, body) = match timeout(self.server.auth_timeout, codec::read_frame(&mut reader))
            .await
        {
            Ok(frame) => frame?,
            Err(_) => {
                self.conn.close(CloseReason::AuthTimeout);
                bail!("no CONNECT within authentication window");
            }
        };
        if first & PACKET_TYPE_MASK != PACKET_CONNECT {
            bail!("not connected");
        }
        self.handle_connect(&body)?;

        // Connected.
        loop {
            let frame = tokio::select! {
                // Server-initiated close (takeover, shutdown). The Will, if
                // still present, goes out through the ungraceful path; a
                // takeover has already discarded it.
                () = self.conn.closed.notified() => return Ok(false),
                frame = read_with_deadline(&mut reader, self.read_deadline) => frame,
            };
            let (first, body) = match frame {
                Ok(frame) => frame,
                Err(err) => {
                    // Keep-alive expiry and network errors take the same
                    // close path.
                    return Err(err);
                }
            };
            match first & PACKET_TYPE_MASK {
                PACKET_PUBLISH => {
                    let mut pp = codec::parse_publish(first, &body)?;
                    debug!(conn = self.conn.id, "<<- [PUBLISH {}]", publish_trace(&pp));
                    self.process_publish(&mut pp)?;
                    if pp.pid > 0 {
                        debug!(conn = self.conn.id, "->> [PUBACK pi={}]", pp.pid);
                        self.conn.enqueue_frame(codec::puback(pp.pid));
                    }
                }
                PACKET_PUBACK => {
                    let pid = codec::parse_puback(&body)?;
                    debug!(conn = self.conn.id, "<<- [PUBACK pi={pid}]");
                    self.conn.process_puback(pid);
                }
                PACKET_SUBSCRIBE => {
                    let (pid, mut filters) = codec::parse_subscribe(first, &body)?;
                    debug!(
                        conn = self.conn.id,
                        "<<- [SUBSCRIBE {}]",
                        filters_trace(&filters)
                    );
                    let mut transferred = HashMap::new();
                    self.process_subs(&mut filters, &mut transferred, true)?;
                    let results: Vec<u8> = filters.iter().map(|f| f.qos).collect();
                    debug!(
                        conn = self.conn.id,
                        "->> [SUBACK pi={pid} {}]",
                        filters_trace(&filters)
                    );
                    self.conn.enqueue_frame(codec::suback(pid, &results));
                    self.flush_retained(&filters);
                }
                PACKET_UNSUBSCRIBE => {
                    let (pid, filters) = codec::parse_unsubscribe(first, &body)?;
                    debug!(
                        conn = self.conn.id,
                        "<<- [UNSUBSCRIBE {}]",
                        filters_trace(&filters)
                    );
                    self.process_unsubs(&filters)?;
                    debug!(conn = self.conn.id, "->> [UNSUBACK pi={pid}]");
                    self.conn.enqueue_frame(codec::unsuback(pid));
                }
                PACKET_PINGREQ => {
                    debug!(conn = self.conn.id, "<<- [PINGREQ] ->> [PINGRESP]");
                    self.conn.enqueue_frame(codec::pingresp());
                }
                PACKET_CONNECT => bail!("second connect packet"),
                PACKET_DISCONNECT => {
                    debug!(conn = self.conn.id, "<<- [DISCONNECT]");
                    // Normal disconnect discards the Will.
                    self.conn.clear_will();
                    return Ok(true);
                }
                pt @ (PACKET_PUBREC | PACKET_PUBREL | PACKET_PUBCOMP) => {
                    bail!("protocol {} not supported", pt >> 4);
                }
                pt => bail!("received unknown packet type {}", pt >> 4),
            }
        }
    }

    fn handle_connect(&mut self, body: &bytes::Bytes) -> Result<()> {
        let cp = match codec::parse_connect(body) {
            Ok(cp) => cp,
            Err(err) => {
                if let Some(rc) = err.return_code {
                    debug!(conn = self.conn.id, "->> [CONNACK sp=false rc={rc}]");
                    self.conn.enqueue_frame(codec::connack(rc, false));
                }
                return Err(err.reason.context("CONNECT rejected"));
            }
        };
        debug!(conn = self.conn.id, "<<- [CONNECT {}]", connect_trace(&cp));

        let identity = match self
            .server
            .auth
            .authenticate(cp.username.as_deref(), cp.password.as_deref())
        {
            Ok(identity) => identity,
            Err(err) => {
                debug!(
                    conn = self.conn.id,
                    "->> [CONNACK sp=false rc={CONNACK_NOT_AUTHORIZED}]"
                );
                self.conn
                    .enqueue_frame(codec::connack(CONNACK_NOT_AUTHORIZED, false));
                self.conn.close(CloseReason::AuthenticationFailure);
                return Err(anyhow!(err).context("authentication failed"));
            }
        };
        let Some(account) = self.server.accounts.get(&identity.account) else {
            self.conn
                .enqueue_frame(codec::connack(CONNACK_SERVER_UNAVAILABLE, false));
            bail!("unknown account {:?}", identity.account);
        };
        let asm = match self.server.sessions.account_manager(&account, &cp.client_id) {
            Ok(asm) => asm,
            Err(err) => {
                self.conn
                    .enqueue_frame(codec::connack(CONNACK_SERVER_UNAVAILABLE, false));
                return Err(err.context("session manager unavailable"));
            }
        };
        let outcome = asm.bind_connection(&cp.client_id, &self.conn, cp.clean_session())?;

        self.read_deadline = cp.read_deadline;
        {
            let mut state = self.conn.state();
            state.connect = Some(cp);
            state.account = Some(account.name.clone());
            state.username = identity.username;
            state.messages = Some(Arc::clone(&asm.messages_log));
        }
        self.asm = Some(Arc::clone(&asm));
        debug!(
            conn = self.conn.id,
            "->> [CONNACK sp={} rc={CONNACK_ACCEPTED}]", outcome.session_present
        );
        self.conn
            .enqueue_frame(codec::connack(CONNACK_ACCEPTED, outcome.session_present));

        // Restore durable subscriptions; transferred consumers are rebound
        // by name, so redeliveries start flowing right after the CONNACK.
        if !outcome.resume_subs.is_empty() {
            let mut transferred = outcome.consumers;
            let mut filters = outcome.resume_subs;
            self.process_subs(&mut filters, &mut transferred, false)
                .context("restore durable subscriptions")?;
        }
        Ok(())
    }

    fn asm(&self) -> Result<&Arc<AccountSessionManager>> {
        self.asm.as_ref().ok_or_else(|| anyhow!("not connected"))
    }

    /// Retained state first (so it updates even with no subscribers), then
    /// subject fan-out, then durable capture for QoS ≥ 1; the caller sends
    /// PUBACK only after the append returned.
    fn process_publish(&self, pp: &mut PublishPacket) -> Result<()> {
        let asm = self.asm()?;
        if pp.flags & PUBLISH_FLAG_RETAIN != 0 {
            let source = self.conn.state().username.clone().unwrap_or_default();
            asm.retained
                .store_or_remove(&pp.subject, &pp.payload, pp.flags, &source);
            // Retain means "for future subscribers": the copy delivered to
            // current subscribers goes out with the flag cleared.
            pp.flags &= !PUBLISH_FLAG_RETAIN;
        }
        asm.account()
            .router
            .publish(&pp.subject, &PublishMeta::mqtt(pp.flags), &pp.payload);
        if pp.qos() > 0 {
            let messages = self.conn.state().messages.clone();
            if let Some(log) = messages {
                log.append(&pp.subject, &pp.payload)
                    .context("store QoS-1 message")?;
            }
        }
        Ok(())
    }

    /// Process SUBSCRIBE filters (or a session restore when
    /// `update_session` is false). Failed filters are marked `0x80` and
    /// their partial artifacts rolled back; the rest proceed.
    fn process_subs(
        &self,
        filters: &mut [MqttFilter],
        transferred: &mut HashMap<String, Arc<DurableConsumer>>,
        update_session: bool,
    ) -> Result<()> {
        let asm = Arc::clone(self.asm()?);
        for f in filters.iter_mut() {
            // Grant is capped at QoS 1.
            if f.qos > 1 {
                f.qos = 1;
            }
            let sid = f.subject.clone();
            if let Err(err) =
                self.subscribe_one(&asm, &f.subject, &sid, f.qos, transferred, update_session)
            {
                error!(conn = self.conn.id, "error subscribing to {:?}: {err:#}", f.subject);
                f.qos = SUBACK_FAILURE;
                continue;
            }
            if needs_level_up(&f.subject) {
                let parent = &f.subject[..f.subject.len() - 2];
                let fwc_sid = format!("{parent}{MULTI_LEVEL_SID_SUFFIX}");
                if let Err(err) =
                    self.subscribe_one(&asm, parent, &fwc_sid, f.qos, transferred, update_session)
                {
                    error!(conn = self.conn.id, "error subscribing to {parent:?}: {err:#}");
                    f.qos = SUBACK_FAILURE;
                    self.unsubscribe_one(&asm, &f.subject, &sid);
                }
            }
        }
        if update_session {
            let client_id = self
                .conn
                .client_id()
                .ok_or_else(|| anyhow!("not connected"))?;
            asm.update_session(&client_id, &self.conn, filters, true)?;
        }
        Ok(())
    }

    /// One host-broker subscription plus, for QoS 1, its durable consumer.
    /// Retained messages are collected only for genuinely new subscriptions
    /// (session restores are not new); the retained read lock spans matching
    /// and registration so a concurrent retained publish is either replayed
    /// or delivered, never lost.
    fn subscribe_one(
        &self,
        asm: &Arc<AccountSessionManager>,
        subject: &str,
        sid: &str,
        qos: u8,
        transferred: &mut HashMap<String, Arc<DurableConsumer>>,
        collect_retained: bool,
    ) -> Result<()> {
        let router = &asm.account().router;
        let (handle, retained_msgs) = {
            let reader = asm.retained.reader();
            let handle = router.subscribe(
                subject,
                sid,
                bridge::topic_deliver_fn(Arc::clone(&self.conn), sid.to_string(), qos),
            )?;
            let msgs: Vec<_> = if collect_retained {
                reader.matches(subject).into_iter().cloned().collect()
            } else {
                Vec::new()
            };
            (handle, msgs)
        };

        let mut prm = BytesMut::new();
        for msg in &retained_msgs {
            let frame =
                self.conn
                    .serialize_publish(&msg.subject, None, &msg.payload, msg.flags, qos, sid);
            prm.extend_from_slice(&frame);
        }
        self.conn.state().subs.insert(
            sid.to_string(),
            SubscriptionSlot {
                handle,
                qos,
                prm: (!prm.is_empty()).then_some(prm),
            },
        );

        if let Err(err) = bridge::ensure_consumer(
            &self.conn,
            &asm.messages_log,
            router,
            transferred,
            subject,
            sid,
            qos,
        ) {
            self.unsubscribe_one(asm, subject, sid);
            return Err(err);
        }
        Ok(())
    }

    /// Remove one subscription slot and its consumer binding, if present.
    fn unsubscribe_one(&self, asm: &Arc<AccountSessionManager>, subject: &str, sid: &str) {
        let router = &asm.account().router;
        let (slot, binding) = {
            let mut state = self.conn.state();
            (state.subs.remove(sid), state.consumers.remove(sid))
        };
        if let Some(slot) = slot {
            router.unsubscribe(&slot.handle);
        }
        if let Some(binding) = binding {
            router.unsubscribe(&binding.inbox_sub);
            if let Err(err) = asm.messages_log.delete_consumer(binding.consumer.name()) {
                warn!(
                    conn = self.conn.id,
                    "error deleting consumer for {subject:?}: {err:#}"
                );
            }
        }
    }

    fn process_unsubs(&self, filters: &[MqttFilter]) -> Result<()> {
        let asm = Arc::clone(self.asm()?);
        for f in filters {
            self.unsubscribe_one(&asm, &f.subject, &f.subject);
            if needs_level_up(&f.subject) {
                let parent = &f.subject[..f.subject.len() - 2];
                let fwc_sid = format!("{parent}{MULTI_LEVEL_SID_SUFFIX}");
                self.unsubscribe_one(&asm, parent, &fwc_sid);
            }
        }
        let client_id = self
            .conn
            .client_id()
            .ok_or_else(|| anyhow!("not connected"))?;
        asm.update_session(&client_id, &self.conn, filters, false)
    }

    /// Queue the pending retained buffers accumulated for the filters of a
    /// SUBSCRIBE, after its SUBACK.
    fn flush_retained(&self, filters: &[MqttFilter]) {
        for f in filters {
            if f.qos == SUBACK_FAILURE {
                continue;
            }
            self.conn.flush_pending_retained(&f.subject);
            if needs_level_up(&f.subject) {
                let parent = &f.subject[..f.subject.len() - 2];
                self.conn
                    .flush_pending_retained(&format!("{parent}{MULTI_LEVEL_SID_SUFFIX}"));
            }
        }
    }

    /// Publish the Will as an ordinary publication through the account.
    fn deliver_will(&self) {
        if self.asm.is_none() {
            return;
        }
        let Some(will) = self.conn.take_will() else {
            return;
        };
        let mut flags = will.qos << 1;
        if will.retain {
            flags |= PUBLISH_FLAG_RETAIN;
        }
        info!(conn = self.conn.id, subject = %will.subject, "delivering Will");
        let mut pp = PublishPacket {
            subject: will.subject,
            payload: will.payload,
            flags,
            pid: 0,
        };
        if let Err(err) = self.process_publish(&mut pp) {
            warn!(conn = self.conn.id, "failed to deliver Will: {err:#}");
        }
    }
}

async fn read_with_deadline<S>(
    reader: &mut ReadHalf<S>,
    deadline: Option<Duration>,
) -> Result<(u8, bytes::Bytes)>
where
    S: AsyncRead + AsyncWrite,
{
    match deadline {
        Some(deadline) => match timeout(deadline, codec::read_frame(reader)).await {
            Ok(frame) => frame,
            Err(_) => Err(anyhow!("keep-alive deadline expired")),
        },
        None => codec::read_frame(reader).await,
    }
}

/// Subjects of more than one token ending in `.>` also need the parent
/// subject subscribed, so a publish on the parent reaches the subscriber.
fn needs_level_up(subject: &str) -> bool {
    subject.len() > 2 && subject.ends_with(".>")
}

fn connect_trace(cp: &ConnectPacket) -> String {
    let mut trace = format!("clientID={}", cp.client_id);
    if let Some(rd) = cp.read_deadline {
        trace.push_str(&format!(" keepAlive={rd:?}"));
    }
    if let Some(will) = &cp.will {
        trace.push_str(&format!(
            " will=(topic={} QoS={} retain={})",
            will.subject, will.qos, will.retain
        ));
    }
    if let Some(username) = &cp.username {
        trace.push_str(&format!(" username={username}"));
    }
    if cp.password.is_some() {
        trace.push_str(" password=****");
    }
    trace
}

fn publish_trace(pp: &PublishPacket) -> String {
    let mut trace = format!(
        "{} dup={} QoS={} retain={} size={}",
        pp.subject,
        pp.dup(),
        pp.qos(),
        pp.retain(),
        pp.payload.len()
    );
    if pp.pid > 0 {
        trace.push_str(&format!(" pi={}", pp.pid));
    }
    trace
}

fn filters_trace(filters: &[MqttFilter]) -> String {
    let parts: Vec<String> = filters
        .iter()
        .map(|f| format!("{} QoS={}", f.subject, f.qos))
        .collect();
    format!("[{}]", parts.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_needs_level_up() {
        assert!(needs_level_up("foo.>"));
        assert!(needs_level_up("foo.bar.>"));
        assert!(!needs_level_up(">"));
        assert!(!needs_level_up("foo.*"));
        assert!(!needs_level_up("foo"));
    }

    #[test]
    fn test_trace_rendering() {
        let pp = PublishPacket {
            subject: "foo.bar".into(),
            payload: bytes::Bytes::from_static(b"xyz"),
            flags: codec::PUBLISH_QOS1,
            pid: 9,
        };
        assert_eq!(
            publish_trace(&pp),
            "foo.bar dup=false QoS=1 retain=false size=3 pi=9"
        );
    }
}
