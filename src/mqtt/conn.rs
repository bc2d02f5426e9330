//! Per-connection MQTT state.
//!
//! Each accepted connection gets one [`MqttConn`]: the connect parameters,
//! the outbound packet-identifier counter, the pending-ack table, the bound
//! durable-consumer map and subscription slots, plus the channel the write
//! task drains. Mutation is serialized by the connection's own lock, which
//! is never held while blocking.

use crate::broker::router::SubHandle;
use crate::mqtt::codec::{self, publish_qos, ConnectPacket, Will, PUBLISH_FLAG_RETAIN, PUBLISH_QOS1};
use crate::stream::{DurableConsumer, StreamLog};
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// Why the server is closing a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnect,
    DuplicateClientId,
    AuthenticationFailure,
    AuthTimeout,
    SocketError,
}

/// Commands consumed by the connection's write task.
#[derive(Debug)]
pub enum Outbound {
    Frame(Bytes),
    Close(CloseReason),
}

/// A QoS-1 delivery waiting for its PUBACK.
#[derive(Debug, Clone)]
pub struct PendingAck {
    pub ack_subject: String,
    /// Key into the connection's consumer map.
    pub consumer_key: String,
}

/// A durable consumer bound to this connection, with the router
/// subscription on its deliver inbox.
pub struct ConsumerBinding {
    pub consumer: Arc<DurableConsumer>,
    pub inbox_sub: SubHandle,
}

/// One host-broker subscription owned by this connection.
pub struct SubscriptionSlot {
    pub handle: SubHandle,
    pub qos: u8,
    /// Retained messages serialized for this subscription, flushed to the
    /// wire after the SUBACK (or by the first matching delivery).
    pub prm: Option<BytesMut>,
}

#[derive(Default)]
pub struct ConnState {
    pub connect: Option<ConnectPacket>,
    pub account: Option<String>,
    pub username: Option<String>,
    next_pid: u16,
    pub acks: HashMap<u16, PendingAck>,
    pub consumers: HashMap<String, ConsumerBinding>,
    pub subs: HashMap<String, SubscriptionSlot>,
    pub messages: Option<Arc<StreamLog>>,
}

pub struct MqttConn {
    pub id: u64,
    out: mpsc::UnboundedSender<Outbound>,
    /// Signalled when the server decides to close (takeover, shutdown); the
    /// read loop selects on it.
    pub closed: Notify,
    state: Mutex<ConnState>,
}

impl MqttConn {
    pub fn new(id: u64) -> (Arc<Self>, mpsc::UnboundedReceiver<Outbound>) {
        let (out, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                id,
                out,
                closed: Notify::new(),
                state: Mutex::new(ConnState::default()),
            }),
            rx,
        )
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ConnState> {
        self.state.lock()
    }

    pub fn enqueue_frame(&self, frame: Bytes) {
        let _ = self.out.send(Outbound::Frame(frame));
    }

    /// Ask the write task to flush and close, and wake the read loop.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.out.send(Outbound::Close(reason));
        self.closed.notify_one();
    }

    pub fn client_id(&self) -> Option<String> {
        self.state.lock().connect.as_ref().map(|cp| cp.client_id.clone())
    }

    /// Discard the Will so the close path cannot deliver it.
    pub fn clear_will(&self) {
        if let Some(cp) = self.state.lock().connect.as_mut() {
            cp.will = None;
        }
    }

    /// Take the Will for delivery on an ungraceful close.
    pub fn take_will(&self) -> Option<Will> {
        self.state
            .lock()
            .connect
            .as_mut()
            .and_then(|cp| cp.will.take())
    }

    fn next_pid(state: &mut ConnState) -> u16 {
        // Never 0; wraps to 1 after 65535.
        state.next_pid = if state.next_pid == u16::MAX {
            1
        } else {
            state.next_pid + 1
        };
        state.next_pid
    }

    /// Serialize an outbound PUBLISH. The frame goes out as QoS 1, with a
    /// freshly allocated packet identifier, only when both the published
    /// message and the subscription are QoS ≥ 1; a reply subject then
    /// records the pending ack for PUBACK correlation.
    pub fn serialize_publish(
        &self,
        subject: &str,
        reply: Option<&str>,
        payload: &[u8],
        pub_flags: u8,
        sub_qos: u8,
        consumer_key: &str,
    ) -> Bytes {
        let mut flags = pub_flags & PUBLISH_FLAG_RETAIN;
        let pub_qos = publish_qos(pub_flags);
        let mut pid = 0;
        if sub_qos > 0 && pub_qos > 0 {
            let mut state = self.state.lock();
            pid = Self::next_pid(&mut state);
            if let Some(ack_subject) = reply {
                state.acks.insert(
                    pid,
                    PendingAck {
                        ack_subject: ack_subject.to_string(),
                        consumer_key: consumer_key.to_string(),
                    },
                );
            }
            flags |= PUBLISH_QOS1;
        }
        codec::publish_frame(subject, pid, flags, payload)
    }

    /// Correlate a PUBACK with its pending delivery and forward the ack to
    /// the durable consumer. Unknown identifiers are silently ignored.
    pub fn process_puback(&self, pid: u16) {
        let forwarded = {
            let mut state = self.state.lock();
            state.acks.remove(&pid).and_then(|ack| {
                state
                    .consumers
                    .get(&ack.consumer_key)
                    .map(|binding| (Arc::clone(&binding.consumer), ack.ack_subject))
            })
        };
        if let Some((consumer, ack_subject)) = forwarded {
            consumer.ack(&ack_subject);
        }
    }

    /// Flush the pending-retained buffer of one subscription slot, if any.
    pub fn flush_pending_retained(&self, sid: &str) {
        let prm = {
            let mut state = self.state.lock();
            state.subs.get_mut(sid).and_then(|slot| slot.prm.take())
        };
        if let Some(prm) = prm {
            self.enqueue_frame(prm.freeze());
        }
    }
}
