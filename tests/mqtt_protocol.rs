//! Protocol-error handling and CONNECT refusal codes.

mod common;

use common::{start_server, start_server_with, test_config, ConnectOpts, TestClient};
use photon::config::{AccountConfig, UserConfig};

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u16).to_be_bytes());
    buf.extend_from_slice(s.as_bytes());
}

#[tokio::test]
async fn first_packet_must_be_connect() {
    let (server, _dir) = start_server().await;
    let mut client = TestClient::connect(server.mqtt_addr()).await;
    client.send_packet(0xc0, &[]).await; // PINGREQ before CONNECT
    client.expect_close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn second_connect_is_fatal() {
    let (server, _dir) = start_server().await;
    let (mut client, _) =
        TestClient::handshake(server.mqtt_addr(), ConnectOpts::new("c", true)).await;
    client.send_connect(&ConnectOpts::new("c", true)).await;
    client.expect_close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn qos2_publish_is_fatal() {
    let (server, _dir) = start_server().await;
    let (mut client, _) =
        TestClient::handshake(server.mqtt_addr(), ConnectOpts::new("c", true)).await;
    let mut body = Vec::new();
    push_str(&mut body, "foo");
    body.extend_from_slice(&1u16.to_be_bytes());
    client.send_packet(0x34, &body).await; // PUBLISH with QoS 2
    client.expect_close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn pubrel_is_fatal() {
    let (server, _dir) = start_server().await;
    let (mut client, _) =
        TestClient::handshake(server.mqtt_addr(), ConnectOpts::new("c", true)).await;
    client.send_packet(0x62, &[0, 1]).await;
    client.expect_close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn publish_topic_with_wildcard_is_fatal() {
    let (server, _dir) = start_server().await;
    let (mut client, _) =
        TestClient::handshake(server.mqtt_addr(), ConnectOpts::new("c", true)).await;
    client.publish("foo/#", b"x", 0, false, 0).await;
    client.expect_close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn qos1_publish_with_zero_pid_is_fatal() {
    let (server, _dir) = start_server().await;
    let (mut client, _) =
        TestClient::handshake(server.mqtt_addr(), ConnectOpts::new("c", true)).await;
    client.publish("foo", b"x", 1, false, 0).await;
    client.expect_close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn subscribe_with_wrong_reserved_flags_is_fatal() {
    let (server, _dir) = start_server().await;
    let (mut client, _) =
        TestClient::handshake(server.mqtt_addr(), ConnectOpts::new("c", true)).await;
    let mut body = Vec::new();
    body.extend_from_slice(&1u16.to_be_bytes());
    push_str(&mut body, "foo");
    body.push(0);
    client.send_packet(0x80, &body).await; // reserved flags must be 0x2
    client.expect_close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn unacceptable_protocol_level_gets_connack_rc1() {
    let (server, _dir) = start_server().await;
    let mut client = TestClient::connect(server.mqtt_addr()).await;
    let mut body = Vec::new();
    push_str(&mut body, "MQTT");
    body.push(3); // bad level
    body.push(0x02);
    body.extend_from_slice(&0u16.to_be_bytes());
    push_str(&mut body, "c");
    client.send_packet(0x10, &body).await;
    let (present, rc) = client.expect_connack().await;
    assert!(!present);
    assert_eq!(rc, 1);
    client.expect_close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn empty_client_id_without_clean_session_rejected() {
    let (server, _dir) = start_server().await;
    let mut client = TestClient::connect(server.mqtt_addr()).await;
    client.send_connect(&ConnectOpts::new("", false)).await;
    let (present, rc) = client.expect_connack().await;
    assert!(!present);
    assert_eq!(rc, 2);
    client.expect_close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn empty_client_id_with_clean_session_gets_generated_id() {
    let (server, _dir) = start_server().await;
    let mut client = TestClient::connect(server.mqtt_addr()).await;
    client.send_connect(&ConnectOpts::new("", true)).await;
    let (present, rc) = client.expect_connack().await;
    assert!(!present);
    assert_eq!(rc, 0);
    server.shutdown().await;
}

#[tokio::test]
async fn connect_must_arrive_within_auth_window() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.mqtt.auth_timeout_secs = 1;
    let server = start_server_with(config).await;

    let mut client = TestClient::connect(server.mqtt_addr()).await;
    // Say nothing; the server hangs up once the window passes.
    client.expect_close().await;
    server.shutdown().await;
}

#[tokio::test]
async fn bad_credentials_refused_with_rc5() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.auth.users.push(UserConfig {
        username: "alice".into(),
        password: "secret".into(),
        account: None,
        allow_publish: None,
        deny_publish: None,
    });
    let server = start_server_with(config).await;

    let mut client = TestClient::connect(server.mqtt_addr()).await;
    client
        .send_connect(&ConnectOpts::new("c", true).with_credentials("alice", "wrong"))
        .await;
    let (_, rc) = client.expect_connack().await;
    assert_eq!(rc, 5);
    client.expect_close().await;

    let (_client, _) = TestClient::handshake(
        server.mqtt_addr(),
        ConnectOpts::new("c", true).with_credentials("alice", "secret"),
    )
    .await;
    server.shutdown().await;
}

#[tokio::test]
async fn streams_disabled_account_refused_with_rc3() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = test_config(dir.path());
    config.accounts.push(AccountConfig {
        name: "nostreams".into(),
        streams_enabled: false,
    });
    config.auth.users.push(UserConfig {
        username: "bob".into(),
        password: "pw".into(),
        account: Some("nostreams".into()),
        allow_publish: None,
        deny_publish: None,
    });
    let server = start_server_with(config).await;

    let mut client = TestClient::connect(server.mqtt_addr()).await;
    client
        .send_connect(&ConnectOpts::new("c", true).with_credentials("bob", "pw"))
        .await;
    let (_, rc) = client.expect_connack().await;
    assert_eq!(rc, 3);
    client.expect_close().await;
    server.shutdown().await;
}
