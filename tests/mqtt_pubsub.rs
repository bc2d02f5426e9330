//! Publish/subscribe behavior over the real wire protocol: topic
//! translation, wildcard handling, retained messages, and the QoS-1
//! acknowledgement pipeline.

mod common;

use common::{eventually, start_server, ConnectOpts, TestClient};
use photon::router::PublishMeta;
use std::time::Duration;

#[tokio::test]
async fn leading_slash_topic_roundtrips_to_subscriber() {
    let (server, _dir) = start_server().await;
    let addr = server.mqtt_addr();

    let (mut sub, _) = TestClient::handshake(addr, ConnectOpts::new("sub", true)).await;
    assert_eq!(sub.subscribe(1, &[("/foo/bar", 0)]).await, vec![0]);

    let (mut publisher, _) = TestClient::handshake(addr, ConnectOpts::new("pub", true)).await;
    publisher.publish("/foo/bar", b"hello", 0, false, 0).await;

    let msg = sub.expect_publish().await;
    assert_eq!(msg.topic, "/foo/bar");
    assert_eq!(msg.payload, b"hello");
    assert_eq!(msg.qos, 0);
    server.shutdown().await;
}

#[tokio::test]
async fn wildcard_subscription_also_matches_parent_topic() {
    let (server, _dir) = start_server().await;
    let addr = server.mqtt_addr();

    let (mut sub, _) = TestClient::handshake(addr, ConnectOpts::new("sub", true)).await;
    assert_eq!(sub.subscribe(1, &[("foo/#", 0)]).await, vec![0]);

    // Native (non-MQTT) publishes enter through the account router.
    let account = server.server().accounts().get("default").unwrap();
    account
        .router
        .publish("foo", &PublishMeta::native(), &bytes::Bytes::from_static(b"p"));
    let msg = sub.expect_publish().await;
    assert_eq!(msg.topic, "foo");

    account.router.publish(
        "foo.bar",
        &PublishMeta::native(),
        &bytes::Bytes::from_static(b"c"),
    );
    let msg = sub.expect_publish().await;
    assert_eq!(msg.topic, "foo/bar");

    // Exactly one delivery each.
    sub.expect_silence(Duration::from_millis(200)).await;
    server.shutdown().await;
}

#[tokio::test]
async fn retained_message_replayed_to_new_subscription() {
    let (server, _dir) = start_server().await;
    let addr = server.mqtt_addr();

    let (mut publisher, _) = TestClient::handshake(addr, ConnectOpts::new("pub", true)).await;
    publisher.publish("foo", b"retained", 0, true, 0).await;
    // A ping round-trip confirms the publish was processed.
    publisher.ping().await;

    let (mut sub, _) = TestClient::handshake(addr, ConnectOpts::new("sub", true)).await;
    assert_eq!(sub.subscribe(1, &[("foo/#", 0)]).await, vec![0]);
    let msg = sub.expect_publish().await;
    assert!(msg.retain, "retained replay must carry the retain flag");
    assert_eq!(msg.topic, "foo");
    assert_eq!(msg.payload, b"retained");
    server.shutdown().await;
}

#[tokio::test]
async fn retained_message_removed_by_empty_payload() {
    let (server, _dir) = start_server().await;
    let addr = server.mqtt_addr();

    let (mut publisher, _) = TestClient::handshake(addr, ConnectOpts::new("pub", true)).await;
    publisher.publish("foo", b"retained", 0, true, 0).await;
    publisher.publish("foo", b"", 0, true, 0).await;
    publisher.ping().await;

    let (mut sub, _) = TestClient::handshake(addr, ConnectOpts::new("sub", true)).await;
    assert_eq!(sub.subscribe(1, &[("foo", 0)]).await, vec![0]);
    sub.expect_silence(Duration::from_millis(200)).await;
    server.shutdown().await;
}

#[tokio::test]
async fn retained_flag_cleared_for_live_subscribers() {
    let (server, _dir) = start_server().await;
    let addr = server.mqtt_addr();

    let (mut sub, _) = TestClient::handshake(addr, ConnectOpts::new("sub", true)).await;
    assert_eq!(sub.subscribe(1, &[("foo", 0)]).await, vec![0]);

    let (mut publisher, _) = TestClient::handshake(addr, ConnectOpts::new("pub", true)).await;
    publisher.publish("foo", b"live", 0, true, 0).await;

    let msg = sub.expect_publish().await;
    assert!(!msg.retain, "live delivery must not carry the retain flag");
    server.shutdown().await;
}

#[tokio::test]
async fn qos1_publish_acknowledged_end_to_end() {
    let (server, _dir) = start_server().await;
    let addr = server.mqtt_addr();

    let (mut sub, _) = TestClient::handshake(addr, ConnectOpts::new("sub", true)).await;
    assert_eq!(sub.subscribe(1, &[("a", 1)]).await, vec![1]);

    let (mut publisher, _) = TestClient::handshake(addr, ConnectOpts::new("pub", true)).await;
    publisher.publish_qos1("a", b"msg", 7).await;

    let msg = sub.expect_publish().await;
    assert_eq!(msg.qos, 1);
    assert_eq!(msg.payload, b"msg");
    assert_ne!(msg.pid, 0);

    // The stored message survives until the subscriber acknowledges it.
    let asm = server.server().sessions().get("default").unwrap();
    assert_eq!(asm.messages_log.num_messages(), 1);
    sub.puback(msg.pid).await;
    eventually("stored message dropped after PUBACK", || {
        asm.messages_log.num_messages() == 0
    })
    .await;
    server.shutdown().await;
}

#[tokio::test]
async fn subscribe_qos2_granted_qos1() {
    let (server, _dir) = start_server().await;
    let addr = server.mqtt_addr();
    let (mut sub, _) = TestClient::handshake(addr, ConnectOpts::new("sub", true)).await;
    assert_eq!(sub.subscribe(1, &[("b", 2)]).await, vec![1]);
    server.shutdown().await;
}

#[tokio::test]
async fn qos1_wildcard_delivers_stored_message_once() {
    let (server, _dir) = start_server().await;
    let addr = server.mqtt_addr();

    let (mut sub, _) = TestClient::handshake(addr, ConnectOpts::new("sub", true)).await;
    assert_eq!(sub.subscribe(1, &[("foo/#", 1)]).await, vec![1]);

    let (mut publisher, _) = TestClient::handshake(addr, ConnectOpts::new("pub", true)).await;
    publisher.publish_qos1("foo/bar", b"one", 3).await;
    let msg = sub.expect_publish().await;
    assert_eq!(msg.topic, "foo/bar");
    assert_eq!(msg.qos, 1);
    sub.puback(msg.pid).await;

    // A publish on the parent topic reaches the subscriber too, once.
    publisher.publish_qos1("foo", b"two", 4).await;
    let msg = sub.expect_publish().await;
    assert_eq!(msg.topic, "foo");
    sub.puback(msg.pid).await;

    sub.expect_silence(Duration::from_millis(200)).await;
    server.shutdown().await;
}

#[tokio::test]
async fn unsubscribe_stops_delivery() {
    let (server, _dir) = start_server().await;
    let addr = server.mqtt_addr();

    let (mut sub, _) = TestClient::handshake(addr, ConnectOpts::new("sub", true)).await;
    assert_eq!(sub.subscribe(1, &[("t", 0)]).await, vec![0]);

    let (mut publisher, _) = TestClient::handshake(addr, ConnectOpts::new("pub", true)).await;
    publisher.publish("t", b"first", 0, false, 0).await;
    assert_eq!(sub.expect_publish().await.payload, b"first");

    sub.unsubscribe(2, &["t"]).await;
    publisher.publish("t", b"second", 0, false, 0).await;
    publisher.ping().await;
    sub.expect_silence(Duration::from_millis(200)).await;
    server.shutdown().await;
}

#[tokio::test]
async fn qos0_delivery_downgraded_from_qos1_publish() {
    let (server, _dir) = start_server().await;
    let addr = server.mqtt_addr();

    let (mut sub, _) = TestClient::handshake(addr, ConnectOpts::new("sub", true)).await;
    assert_eq!(sub.subscribe(1, &[("d", 0)]).await, vec![0]);

    let (mut publisher, _) = TestClient::handshake(addr, ConnectOpts::new("pub", true)).await;
    publisher.publish_qos1("d", b"m", 9).await;

    let msg = sub.expect_publish().await;
    assert_eq!(msg.qos, 0, "granted QoS 0 caps the delivery QoS");
    assert_eq!(msg.pid, 0);
    server.shutdown().await;
}
