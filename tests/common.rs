//! Common test harness for the integration tests.
//!
//! Boots a server on an ephemeral port over a temporary data directory and
//! provides a minimal MQTT 3.1.1 client speaking the real wire protocol
//! over TCP.

// Not every test file uses every helper.
#![allow(dead_code)]

use photon::config::Config;
use photon::runtime::{Runtime, RuntimeHandle};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

pub fn test_config(data_dir: &Path) -> Config {
    let mut config = Config::default();
    config.mqtt.port = 0;
    config.storage.data_dir = data_dir.to_path_buf();
    config
}

/// Start a server over a fresh temporary data directory.
pub async fn start_server() -> (RuntimeHandle, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let handle = start_server_at(dir.path()).await;
    (handle, dir)
}

/// Start (or restart) a server over an existing data directory.
pub async fn start_server_at(data_dir: &Path) -> RuntimeHandle {
    Runtime::start(test_config(data_dir))
        .await
        .expect("start runtime")
}

pub async fn start_server_with(config: Config) -> RuntimeHandle {
    Runtime::start(config).await.expect("start runtime")
}

#[derive(Debug, Clone)]
pub struct ConnectOpts {
    pub client_id: String,
    pub clean: bool,
    pub keep_alive: u16,
    /// (topic, payload, qos, retain)
    pub will: Option<(String, Vec<u8>, u8, bool)>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectOpts {
    pub fn new(client_id: &str, clean: bool) -> Self {
        Self {
            client_id: client_id.to_string(),
            clean,
            keep_alive: 0,
            will: None,
            username: None,
            password: None,
        }
    }

    pub fn with_keep_alive(mut self, secs: u16) -> Self {
        self.keep_alive = secs;
        self
    }

    pub fn with_will(mut self, topic: &str, payload: &[u8], qos: u8, retain: bool) -> Self {
        self.will = Some((topic.to_string(), payload.to_vec(), qos, retain));
        self
    }

    pub fn with_credentials(mut self, username: &str, password: &str) -> Self {
        self.username = Some(username.to_string());
        self.password = Some(password.to_string());
        self
    }
}

/// A received PUBLISH.
#[derive(Debug, Clone)]
pub struct ReceivedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: u8,
    pub retain: bool,
    pub pid: u16,
}

pub struct TestClient {
    stream: TcpStream,
}

impl TestClient {
    pub async fn connect(addr: SocketAddr) -> Self {
        let stream = TcpStream::connect(addr).await.expect("tcp connect");
        Self { stream }
    }

    /// CONNECT + CONNACK, returning the session-present flag.
    pub async fn handshake(addr: SocketAddr, opts: ConnectOpts) -> (Self, bool) {
        let mut client = Self::connect(addr).await;
        client.send_connect(&opts).await;
        let (session_present, rc) = client.expect_connack().await;
        assert_eq!(rc, 0, "CONNECT refused with rc={rc}");
        (client, session_present)
    }

    pub async fn send_connect(&mut self, opts: &ConnectOpts) {
        let mut flags = 0u8;
        if opts.clean {
            flags |= 0x02;
        }
        if let Some((_, _, qos, retain)) = &opts.will {
            flags |= 0x04 | (qos << 3);
            if *retain {
                flags |= 0x20;
            }
        }
        if opts.username.is_some() {
            flags |= 0x80;
        }
        if opts.password.is_some() {
            flags |= 0x40;
        }
        let mut body = Vec::new();
        push_str(&mut body, "MQTT");
        body.push(4);
        body.push(flags);
        body.extend_from_slice(&opts.keep_alive.to_be_bytes());
        push_str(&mut body, &opts.client_id);
        if let Some((topic, payload, _, _)) = &opts.will {
            push_str(&mut body, topic);
            push_bytes(&mut body, payload);
        }
        if let Some(username) = &opts.username {
            push_str(&mut body, username);
        }
        if let Some(password) = &opts.password {
            push_str(&mut body, password);
        }
        self.send_packet(0x10, &body).await;
    }

    /// Returns (session_present, return_code).
    pub async fn expect_connack(&mut self) -> (bool, u8) {
        let (first, body) = self.read_packet().await;
        assert_eq!(first & 0xf0, 0x20, "expected CONNACK, got {first:#x}");
        (body[0] & 0x01 != 0, body[1])
    }

    pub async fn subscribe(&mut self, pid: u16, filters: &[(&str, u8)]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&pid.to_be_bytes());
        for (filter, qos) in filters {
            push_str(&mut body, filter);
            body.push(*qos);
        }
        self.send_packet(0x82, &body).await;
        let (first, body) = self.read_packet().await;
        assert_eq!(first & 0xf0, 0x90, "expected SUBACK, got {first:#x}");
        assert_eq!(u16::from_be_bytes([body[0], body[1]]), pid);
        body[2..].to_vec()
    }

    pub async fn unsubscribe(&mut self, pid: u16, filters: &[&str]) {
        let mut body = Vec::new();
        body.extend_from_slice(&pid.to_be_bytes());
        for filter in filters {
            push_str(&mut body, filter);
        }
        self.send_packet(0xa2, &body).await;
        let (first, body) = self.read_packet().await;
        assert_eq!(first & 0xf0, 0xb0, "expected UNSUBACK, got {first:#x}");
        assert_eq!(u16::from_be_bytes([body[0], body[1]]), pid);
    }

    pub async fn publish(&mut self, topic: &str, payload: &[u8], qos: u8, retain: bool, pid: u16) {
        let mut first = 0x30;
        first |= qos << 1;
        if retain {
            first |= 0x01;
        }
        let mut body = Vec::new();
        push_str(&mut body, topic);
        if qos > 0 {
            body.extend_from_slice(&pid.to_be_bytes());
        }
        body.extend_from_slice(payload);
        self.send_packet(first, &body).await;
    }

    /// QoS-1 publish followed by its PUBACK.
    pub async fn publish_qos1(&mut self, topic: &str, payload: &[u8], pid: u16) {
        self.publish(topic, payload, 1, false, pid).await;
        assert_eq!(self.expect_puback().await, pid);
    }

    pub async fn expect_puback(&mut self) -> u16 {
        let (first, body) = self.read_packet().await;
        assert_eq!(first & 0xf0, 0x40, "expected PUBACK, got {first:#x}");
        u16::from_be_bytes([body[0], body[1]])
    }

    pub async fn expect_publish(&mut self) -> ReceivedPublish {
        let (first, body) = self.read_packet().await;
        assert_eq!(first & 0xf0, 0x30, "expected PUBLISH, got {first:#x}");
        let qos = (first & 0x06) >> 1;
        let retain = first & 0x01 != 0;
        let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
        let topic = String::from_utf8(body[2..2 + topic_len].to_vec()).expect("utf8 topic");
        let mut pos = 2 + topic_len;
        let pid = if qos > 0 {
            let pid = u16::from_be_bytes([body[pos], body[pos + 1]]);
            pos += 2;
            pid
        } else {
            0
        };
        ReceivedPublish {
            topic,
            payload: body[pos..].to_vec(),
            qos,
            retain,
            pid,
        }
    }

    pub async fn puback(&mut self, pid: u16) {
        let mut body = Vec::new();
        body.extend_from_slice(&pid.to_be_bytes());
        self.send_packet(0x40, &body).await;
    }

    pub async fn ping(&mut self) {
        self.send_packet(0xc0, &[]).await;
        let (first, _) = self.read_packet().await;
        assert_eq!(first & 0xf0, 0xd0, "expected PINGRESP, got {first:#x}");
    }

    pub async fn disconnect(mut self) {
        self.send_packet(0xe0, &[]).await;
        // Give the server a beat to process before the socket drops.
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Send a raw packet, for protocol-error scenarios.
    pub async fn send_packet(&mut self, first: u8, body: &[u8]) {
        let mut frame = vec![first];
        push_var_int(&mut frame, body.len());
        frame.extend_from_slice(body);
        self.stream.write_all(&frame).await.expect("write frame");
    }

    /// Expect the server to close the connection.
    pub async fn expect_close(&mut self) {
        let mut buf = [0u8; 64];
        loop {
            match timeout(READ_TIMEOUT, self.stream.read(&mut buf)).await {
                Ok(Ok(0) | Err(_)) => return,
                Ok(Ok(_)) => continue,
                Err(_) => panic!("server did not close the connection"),
            }
        }
    }

    /// Assert nothing arrives for the given window.
    pub async fn expect_silence(&mut self, window: Duration) {
        let mut buf = [0u8; 1];
        match timeout(window, self.stream.read(&mut buf)).await {
            Ok(Ok(0)) => panic!("connection closed during silence window"),
            Ok(Ok(_)) => panic!("unexpected data during silence window"),
            Ok(Err(err)) => panic!("read error during silence window: {err}"),
            Err(_) => {}
        }
    }

    async fn read_packet(&mut self) -> (u8, Vec<u8>) {
        timeout(READ_TIMEOUT, async {
            let first = self.stream.read_u8().await.expect("read packet type");
            let mut len = 0usize;
            let mut multiplier = 1usize;
            loop {
                let b = self.stream.read_u8().await.expect("read length");
                len += (b & 0x7f) as usize * multiplier;
                if b & 0x80 == 0 {
                    break;
                }
                multiplier *= 0x80;
            }
            let mut body = vec![0u8; len];
            self.stream
                .read_exact(&mut body)
                .await
                .expect("read packet body");
            (first, body)
        })
        .await
        .expect("timed out waiting for packet")
    }
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    push_bytes(buf, s.as_bytes());
}

fn push_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    buf.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
    buf.extend_from_slice(bytes);
}

fn push_var_int(buf: &mut Vec<u8>, mut value: usize) {
    loop {
        let mut b = (value & 0x7f) as u8;
        value >>= 7;
        if value > 0 {
            b |= 0x80;
        }
        buf.push(b);
        if value == 0 {
            break;
        }
    }
}

/// Poll an assertion until it holds or the deadline passes.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition never held: {what}");
}
