//! QoS-1 delivery bridge.
//!
//! Every subscription granted QoS 1 owns a durable consumer on the
//! account's messages stream, filtered to the translated subject and
//! delivering into a fresh internal inbox. The connection subscribes to
//! that inbox; the callback serializes a QoS-1 PUBLISH with an allocated
//! packet identifier and records the pending ack, which a later PUBACK
//! forwards to the consumer. The inbox-prefix gate keeps a wildcard
//! subscription and its durable consumer from delivering the same stored
//! message twice.

use crate::broker::router::{DeliverFn, Delivery, PublishOrigin, SubjectRouter};
use crate::mqtt::codec::{publish_qos, PUBLISH_QOS1};
use crate::mqtt::conn::{ConsumerBinding, MqttConn};
use crate::mqtt::DELIVER_PREFIX;
use crate::stream::{ConsumerConfig, DurableConsumer, StreamLog};
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::trace;
use uuid::Uuid;

/// Deliver one matched message to an MQTT connection.
///
/// The effective wire QoS is `min(subscriber granted, publisher)`: stored
/// stream messages enter at QoS 1, native publishes at QoS 0, MQTT
/// publishes at whatever their flags carry.
pub fn deliver_to_conn(
    conn: &Arc<MqttConn>,
    consumer_key: &str,
    sub_qos: u8,
    is_inbox: bool,
    delivery: &Delivery<'_>,
) {
    let pub_flags = match delivery.meta.origin {
        PublishOrigin::Stream => {
            // Stored messages are only sent through the durable consumer's
            // inbox; a plain subscription that also matched stays quiet.
            if !is_inbox {
                return;
            }
            PUBLISH_QOS1
        }
        PublishOrigin::Mqtt { flags } => {
            if publish_qos(flags) > 0 && sub_qos > 0 {
                // The durable consumer delivers this one.
                return;
            }
            flags
        }
        PublishOrigin::Native => 0,
    };
    let frame = conn.serialize_publish(
        delivery.subject,
        delivery.meta.reply.as_deref(),
        delivery.payload,
        pub_flags,
        sub_qos,
        consumer_key,
    );
    trace!(
        conn = conn.id,
        subject = delivery.subject,
        size = delivery.payload.len(),
        "->> PUBLISH"
    );
    conn.flush_pending_retained(consumer_key);
    conn.enqueue_frame(frame);
}

/// Delivery callback for a plain subject subscription.
pub fn topic_deliver_fn(conn: Arc<MqttConn>, sid: String, qos: u8) -> DeliverFn {
    Arc::new(move |delivery: &Delivery<'_>| {
        deliver_to_conn(&conn, &sid, qos, false, delivery);
    })
}

/// Delivery callback for a durable consumer's inbox subscription.
pub fn inbox_deliver_fn(conn: Arc<MqttConn>, consumer_key: String, qos: u8) -> DeliverFn {
    Arc::new(move |delivery: &Delivery<'_>| {
        deliver_to_conn(&conn, &consumer_key, qos, true, delivery);
    })
}

/// Create, resume, or tear down the durable consumer for one subscription.
///
/// - granted QoS 0 with an existing consumer: downgrade, delete both the
///   consumer and its inbox subscription
/// - granted QoS 1: reuse the durable name of an existing or transferred
///   consumer (resume), otherwise mint a fresh name; bind a new inbox
/// - anything partially created is rolled back by the caller via the error
pub fn ensure_consumer(
    conn: &Arc<MqttConn>,
    messages_log: &Arc<StreamLog>,
    router: &SubjectRouter,
    transferred: &mut HashMap<String, Arc<DurableConsumer>>,
    subject: &str,
    sid: &str,
    qos: u8,
) -> Result<()> {
    let existing = conn.state().consumers.remove(sid);
    if let Some(binding) = &existing {
        router.unsubscribe(&binding.inbox_sub);
    }
    if qos == 0 {
        if let Some(binding) = existing {
            messages_log
                .delete_consumer(binding.consumer.name())
                .with_context(|| format!("delete downgraded consumer for {subject:?}"))?;
        } else if let Some(consumer) = transferred.remove(sid) {
            messages_log
                .delete_consumer(consumer.name())
                .with_context(|| format!("delete downgraded consumer for {subject:?}"))?;
        }
        return Ok(());
    }

    let durable_name = existing
        .as_ref()
        .map(|b| b.consumer.name().to_string())
        .or_else(|| transferred.remove(sid).map(|c| c.name().to_string()))
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());

    let inbox = format!("{DELIVER_PREFIX}{}", Uuid::new_v4().simple());
    let inbox_sub = router
        .subscribe(
            &inbox,
            &inbox,
            inbox_deliver_fn(Arc::clone(conn), sid.to_string(), qos),
        )
        .with_context(|| format!("subscribe deliver inbox for {subject:?}"))?;
    let consumer = match messages_log.add_consumer(ConsumerConfig {
        durable_name,
        filter_subject: Some(subject.to_string()),
        deliver_subject: Some(inbox),
    }) {
        Ok(consumer) => consumer,
        Err(err) => {
            router.unsubscribe(&inbox_sub);
            return Err(err.context(format!("add durable consumer for {subject:?}")));
        }
    };
    conn.state().consumers.insert(
        sid.to_string(),
        ConsumerBinding {
            consumer,
            inbox_sub,
        },
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::router::PublishMeta;
    use crate::mqtt::codec::{PACKET_PUBLISH, PUBLISH_FLAG_QOS_MASK};
    use crate::mqtt::conn::Outbound;
    use bytes::Bytes;

    fn recv_frame(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Outbound>) -> Bytes {
        match rx.try_recv().expect("frame queued") {
            Outbound::Frame(frame) => frame,
            Outbound::Close(reason) => panic!("unexpected close: {reason:?}"),
        }
    }

    #[test]
    fn test_stream_origin_requires_inbox() {
        let (conn, mut rx) = MqttConn::new(1);
        let payload = Bytes::from_static(b"m");
        let meta = PublishMeta::stream("$LOG.ack.m.c.1".into());
        let delivery = Delivery {
            subject: "foo",
            payload: &payload,
            meta: &meta,
        };
        deliver_to_conn(&conn, "foo", 1, false, &delivery);
        assert!(rx.try_recv().is_err());

        deliver_to_conn(&conn, "foo", 1, true, &delivery);
        let frame = recv_frame(&mut rx);
        assert_eq!(frame[0] & 0xf0, PACKET_PUBLISH);
        assert_eq!(frame[0] & PUBLISH_FLAG_QOS_MASK, PUBLISH_QOS1);
        assert_eq!(conn.state().acks.len(), 1);
    }

    #[test]
    fn test_mqtt_qos1_to_qos1_sub_suppressed_on_plain_sub() {
        let (conn, mut rx) = MqttConn::new(1);
        let payload = Bytes::from_static(b"m");
        let meta = PublishMeta::mqtt(PUBLISH_QOS1);
        let delivery = Delivery {
            subject: "foo",
            payload: &payload,
            meta: &meta,
        };
        // QoS-1 publish, QoS-1 subscription: plain path defers to the bridge.
        deliver_to_conn(&conn, "foo", 1, false, &delivery);
        assert!(rx.try_recv().is_err());
        // QoS-0 subscription receives it downgraded right away.
        deliver_to_conn(&conn, "foo", 0, false, &delivery);
        let frame = recv_frame(&mut rx);
        assert_eq!(frame[0] & PUBLISH_FLAG_QOS_MASK, 0);
    }

    #[test]
    fn test_native_origin_is_qos0() {
        let (conn, mut rx) = MqttConn::new(1);
        let payload = Bytes::from_static(b"m");
        let meta = PublishMeta::native();
        let delivery = Delivery {
            subject: "foo",
            payload: &payload,
            meta: &meta,
        };
        deliver_to_conn(&conn, "foo", 1, false, &delivery);
        let frame = recv_frame(&mut rx);
        assert_eq!(frame[0] & PUBLISH_FLAG_QOS_MASK, 0);
        assert!(conn.state().acks.is_empty());
    }
}
