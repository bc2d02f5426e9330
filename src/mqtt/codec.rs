//! MQTT 3.1.1 control-packet codec.
//!
//! Stateless framing and field primitives: the fixed header with its 1–4
//! byte variable-length remaining length, big-endian 16-bit lengths,
//! length-prefixed byte strings, and per-packet parse/encode functions.
//! UTF-8 is enforced where the protocol requires it (client ID, topic names,
//! topic filters, username).

use crate::mqtt::topic;
use anyhow::{anyhow, bail, Context, Result};
use bytes::{Bytes, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use uuid::Uuid;

// Packet types, in the high nibble of the first byte.
pub const PACKET_CONNECT: u8 = 0x10;
pub const PACKET_CONNACK: u8 = 0x20;
pub const PACKET_PUBLISH: u8 = 0x30;
pub const PACKET_PUBACK: u8 = 0x40;
pub const PACKET_PUBREC: u8 = 0x50;
pub const PACKET_PUBREL: u8 = 0x60;
pub const PACKET_PUBCOMP: u8 = 0x70;
pub const PACKET_SUBSCRIBE: u8 = 0x80;
pub const PACKET_SUBACK: u8 = 0x90;
pub const PACKET_UNSUBSCRIBE: u8 = 0xa0;
pub const PACKET_UNSUBACK: u8 = 0xb0;
pub const PACKET_PINGREQ: u8 = 0xc0;
pub const PACKET_PINGRESP: u8 = 0xd0;
pub const PACKET_DISCONNECT: u8 = 0xe0;
pub const PACKET_TYPE_MASK: u8 = 0xf0;
pub const PACKET_FLAGS_MASK: u8 = 0x0f;

pub const PROTO_LEVEL: u8 = 4;

// CONNECT flags.
pub const CONNECT_FLAG_RESERVED: u8 = 0x01;
pub const CONNECT_FLAG_CLEAN_SESSION: u8 = 0x02;
pub const CONNECT_FLAG_WILL: u8 = 0x04;
pub const CONNECT_FLAG_WILL_QOS: u8 = 0x18;
pub const CONNECT_FLAG_WILL_RETAIN: u8 = 0x20;
pub const CONNECT_FLAG_PASSWORD: u8 = 0x40;
pub const CONNECT_FLAG_USERNAME: u8 = 0x80;

// PUBLISH flags.
pub const PUBLISH_FLAG_RETAIN: u8 = 0x01;
pub const PUBLISH_FLAG_QOS_MASK: u8 = 0x06;
pub const PUBLISH_FLAG_DUP: u8 = 0x08;
pub const PUBLISH_QOS1: u8 = 0x02;

pub const SUBSCRIBE_FLAGS: u8 = 0x02;
pub const UNSUBSCRIBE_FLAGS: u8 = 0x02;
pub const SUBACK_FAILURE: u8 = 0x80;

// CONNACK return codes.
pub const CONNACK_ACCEPTED: u8 = 0x00;
pub const CONNACK_BAD_PROTO_VERSION: u8 = 0x01;
pub const CONNACK_IDENTIFIER_REJECTED: u8 = 0x02;
pub const CONNACK_SERVER_UNAVAILABLE: u8 = 0x03;
pub const CONNACK_BAD_USER_OR_PASSWORD: u8 = 0x04;
pub const CONNACK_NOT_AUTHORIZED: u8 = 0x05;

const PROTO_NAME: &[u8] = b"MQTT";
const OLD_PROTO_NAME: &[u8] = b"MQIsdp";
const KEEP_ALIVE_GRACE: f64 = 1.5;

/// The QoS carried in PUBLISH fixed-header flags.
pub fn publish_qos(flags: u8) -> u8 {
    (flags & PUBLISH_FLAG_QOS_MASK) >> 1
}

/// Read one control packet off the stream: first byte, then the
/// variable-length remaining length, then the declared body.
pub async fn read_frame<S: AsyncRead + Unpin>(stream: &mut S) -> Result<(u8, Bytes)> {
    let mut first = [0u8; 1];
    stream
        .read_exact(&mut first)
        .await
        .context("error reading packet type")?;
    let len = read_packet_len(stream).await?;
    let mut body = vec![0u8; len];
    if len > 0 {
        stream
            .read_exact(&mut body)
            .await
            .context("unexpected end of input")?;
    }
    Ok((first[0], Bytes::from(body)))
}

async fn read_packet_len<S: AsyncRead + Unpin>(stream: &mut S) -> Result<usize> {
    let mut multiplier = 1usize;
    let mut value = 0usize;
    loop {
        let mut buf = [0u8; 1];
        stream
            .read_exact(&mut buf)
            .await
            .context("unexpected end of input")?;
        value += (buf[0] & 0x7f) as usize * multiplier;
        if buf[0] & 0x80 == 0 {
            return Ok(value);
        }
        multiplier *= 0x80;
        if multiplier > 0x20_0000 {
            bail!("malformed variable int");
        }
    }
}

/// Cursor over a packet body.
pub struct Cursor<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn has_more(&self) -> bool {
        self.pos < self.buf.len()
    }

    pub fn read_u8(&mut self, field: &str) -> Result<u8> {
        let Some(&b) = self.buf.get(self.pos) else {
            bail!("error reading {field}: unexpected end of input");
        };
        self.pos += 1;
        Ok(b)
    }

    pub fn read_u16(&mut self, field: &str) -> Result<u16> {
        if self.buf.len() - self.pos < 2 {
            bail!("error reading {field}: unexpected end of input");
        }
        let v = u16::from_be_bytes([self.buf[self.pos], self.buf[self.pos + 1]]);
        self.pos += 2;
        Ok(v)
    }

    /// Length-prefixed byte string.
    pub fn read_bytes(&mut self, field: &str) -> Result<&'a [u8]> {
        let len = self.read_u16(field)? as usize;
        if self.buf.len() - self.pos < len {
            bail!("error reading {field}: unexpected end of input");
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Length-prefixed UTF-8 string.
    pub fn read_string(&mut self, field: &str) -> Result<&'a str> {
        let raw = self.read_bytes(field)?;
        std::str::from_utf8(raw).map_err(|_| anyhow!("invalid utf8 for {field}: {raw:?}"))
    }
}

/// Encoder for outbound packets.
#[derive(Default)]
pub struct PacketWriter {
    buf: BytesMut,
}

impl PacketWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_u8(&mut self, b: u8) {
        self.buf.extend_from_slice(&[b]);
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_var_int(&mut self, mut value: usize) {
        loop {
            let mut b = (value & 0x7f) as u8;
            value >>= 7;
            if value > 0 {
                b |= 0x80;
            }
            self.write_u8(b);
            if value == 0 {
                break;
            }
        }
    }

    /// Length-prefixed byte string.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_u16(bytes.len() as u16);
        self.buf.extend_from_slice(bytes);
    }

    pub fn write_slice(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn into_bytes(self) -> Bytes {
        self.buf.freeze()
    }
}

// ---------------------------------------------------------------------------
// CONNECT
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct Will {
    pub subject: String,
    pub payload: Bytes,
    pub qos: u8,
    pub retain: bool,
}

/// Parameters carried by a CONNECT packet, with the topic of the Will
/// already translated to subject form.
#[derive(Debug, Clone)]
pub struct ConnectPacket {
    pub client_id: String,
    /// Read deadline derived from a non-zero keep-alive (1.5×).
    pub read_deadline: Option<Duration>,
    pub will: Option<Will>,
    pub flags: u8,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl ConnectPacket {
    pub fn clean_session(&self) -> bool {
        self.flags & CONNECT_FLAG_CLEAN_SESSION != 0
    }
}

/// A CONNECT that could not be accepted. When `return_code` is set, a
/// CONNACK carrying it is still sent before the connection closes.
#[derive(Debug)]
pub struct ConnectError {
    pub return_code: Option<u8>,
    pub reason: anyhow::Error,
}

impl ConnectError {
    fn fatal(reason: anyhow::Error) -> Self {
        Self {
            return_code: None,
            reason,
        }
    }

    fn refused(return_code: u8, reason: anyhow::Error) -> Self {
        Self {
            return_code: Some(return_code),
            reason,
        }
    }
}

pub fn parse_connect(body: &Bytes) -> Result<ConnectPacket, ConnectError> {
    let mut r = Cursor::new(body);
    let fatal = ConnectError::fatal;

    let proto = r.read_bytes("protocol name").map_err(fatal)?;
    if proto != PROTO_NAME {
        if proto == OLD_PROTO_NAME {
            return Err(fatal(anyhow!("older protocol \"MQIsdp\" not supported")));
        }
        return Err(fatal(anyhow!(
            "expected connect packet with protocol name {PROTO_NAME:?}, got {proto:?}"
        )));
    }
    let level = r.read_u8("protocol level").map_err(fatal)?;
    if level != PROTO_LEVEL {
        return Err(ConnectError::refused(
            CONNACK_BAD_PROTO_VERSION,
            anyhow!("unacceptable protocol version of {level}"),
        ));
    }
    let flags = r.read_u8("flags").map_err(fatal)?;
    if flags & CONNECT_FLAG_RESERVED != 0 {
        return Err(fatal(anyhow!("connect flags reserved bit not set to 0")));
    }
    let will_qos = (flags & CONNECT_FLAG_WILL_QOS) >> 3;
    let will_retain = flags & CONNECT_FLAG_WILL_RETAIN != 0;
    let has_will = flags & CONNECT_FLAG_WILL != 0;
    if !has_will {
        if will_qos != 0 {
            return Err(fatal(anyhow!(
                "if Will flag is set to 0, Will QoS must be 0 too, got {will_qos}"
            )));
        }
        if will_retain {
            return Err(fatal(anyhow!(
                "if Will flag is set to 0, Will Retain flag must be 0 too"
            )));
        }
    } else if will_qos == 3 {
        return Err(fatal(anyhow!(
            "if Will flag is set to 1, Will QoS can be 0, 1 or 2, got {will_qos}"
        )));
    }
    let has_username = flags & CONNECT_FLAG_USERNAME != 0;
    let has_password = flags & CONNECT_FLAG_PASSWORD != 0;
    if !has_username && has_password {
        return Err(fatal(anyhow!("password flag set but username flag is not")));
    }

    let keep_alive = r.read_u16("keep alive").map_err(fatal)?;
    let read_deadline =
        (keep_alive > 0).then(|| Duration::from_secs_f64(f64::from(keep_alive) * KEEP_ALIVE_GRACE));

    // Payload order is mandated: client ID, will topic, will message,
    // username, password.
    let client_id_raw = r.read_bytes("client ID").map_err(fatal)?;
    let client_id = match std::str::from_utf8(client_id_raw) {
        Ok(s) => s.to_string(),
        Err(_) => {
            return Err(ConnectError::refused(
                CONNACK_IDENTIFIER_REJECTED,
                anyhow!("invalid utf8 for client ID: {client_id_raw:?}"),
            ))
        }
    };
    let client_id = if client_id.is_empty() {
        if flags & CONNECT_FLAG_CLEAN_SESSION == 0 {
            return Err(ConnectError::refused(
                CONNACK_IDENTIFIER_REJECTED,
                anyhow!("when client ID is empty, clean session flag must be set to 1"),
            ));
        }
        Uuid::new_v4().simple().to_string()
    } else {
        client_id
    };

    let will = if has_will {
        let topic_raw = r.read_bytes("Will topic").map_err(fatal)?;
        if topic_raw.is_empty() {
            return Err(fatal(anyhow!("empty Will topic not allowed")));
        }
        let topic = std::str::from_utf8(topic_raw)
            .map_err(|_| fatal(anyhow!("invalid utf8 for Will topic {topic_raw:?}")))?;
        let subject = topic::topic_to_subject(topic).map_err(fatal)?.into_owned();
        let message = r.read_bytes("Will message").map_err(fatal)?;
        Some(Will {
            subject,
            payload: Bytes::copy_from_slice(message),
            qos: will_qos,
            retain: will_retain,
        })
    } else {
        None
    };

    let username = if has_username {
        let raw = r.read_bytes("user name").map_err(fatal)?;
        if raw.is_empty() {
            return Err(ConnectError::refused(
                CONNACK_BAD_USER_OR_PASSWORD,
                anyhow!("empty user name not allowed"),
            ));
        }
        match std::str::from_utf8(raw) {
            Ok(s) => Some(s.to_string()),
            Err(_) => {
                return Err(ConnectError::refused(
                    CONNACK_BAD_USER_OR_PASSWORD,
                    anyhow!("invalid utf8 for user name {raw:?}"),
                ))
            }
        }
    } else {
        None
    };
    let password = if has_password {
        let raw = r.read_bytes("password").map_err(fatal)?;
        Some(String::from_utf8_lossy(raw).into_owned())
    } else {
        None
    };

    Ok(ConnectPacket {
        client_id,
        read_deadline,
        will,
        flags,
        username,
        password,
    })
}

// ---------------------------------------------------------------------------
// PUBLISH / PUBACK
// ---------------------------------------------------------------------------

/// A parsed PUBLISH with the topic already translated to subject form.
#[derive(Debug, Clone)]
pub struct PublishPacket {
    pub subject: String,
    pub payload: Bytes,
    pub flags: u8,
    pub pid: u16,
}

impl PublishPacket {
    pub fn qos(&self) -> u8 {
        publish_qos(self.flags)
    }

    pub fn retain(&self) -> bool {
        self.flags & PUBLISH_FLAG_RETAIN != 0
    }

    pub fn dup(&self) -> bool {
        self.flags & PUBLISH_FLAG_DUP != 0
    }
}

pub fn parse_publish(first_byte: u8, body: &Bytes) -> Result<PublishPacket> {
    let flags = first_byte & PACKET_FLAGS_MASK;
    let qos = publish_qos(flags);
    if qos > 1 {
        bail!("publish QoS={qos} not supported");
    }
    let mut r = Cursor::new(body);
    let topic_raw = r.read_bytes("topic")?;
    if topic_raw.is_empty() {
        bail!("topic cannot be empty");
    }
    let topic = std::str::from_utf8(topic_raw)
        .map_err(|_| anyhow!("invalid utf8 for topic {topic_raw:?}"))?;
    // Also rejects MQTT wildcards, which must not appear in a topic name.
    let subject = topic::topic_to_subject(topic)?.into_owned();
    let pid = if qos > 0 {
        let pid = r.read_u16("packet identifier")?;
        if pid == 0 {
            bail!("with QoS={qos}, packet identifier cannot be 0");
        }
        pid
    } else {
        0
    };
    let payload = body.slice(r.position()..);
    Ok(PublishPacket {
        subject,
        payload,
        flags,
        pid,
    })
}

pub fn parse_puback(body: &Bytes) -> Result<u16> {
    let mut r = Cursor::new(body);
    let pid = r.read_u16("packet identifier")?;
    if pid == 0 {
        bail!("packet identifier cannot be 0");
    }
    Ok(pid)
}

// ---------------------------------------------------------------------------
// SUBSCRIBE / UNSUBSCRIBE
// ---------------------------------------------------------------------------

/// One filter of a (UN)SUBSCRIBE, translated to subject form. During
/// processing `qos` is updated to the granted value, or to `SUBACK_FAILURE`.
#[derive(Debug, Clone)]
pub struct MqttFilter {
    pub subject: String,
    pub qos: u8,
}

pub fn parse_subscribe(first_byte: u8, body: &Bytes) -> Result<(u16, Vec<MqttFilter>)> {
    parse_subs_or_unsubs(first_byte, body, true)
}

pub fn parse_unsubscribe(first_byte: u8, body: &Bytes) -> Result<(u16, Vec<MqttFilter>)> {
    parse_subs_or_unsubs(first_byte, body, false)
}

fn parse_subs_or_unsubs(
    first_byte: u8,
    body: &Bytes,
    sub: bool,
) -> Result<(u16, Vec<MqttFilter>)> {
    let (expected, action) = if sub {
        (SUBSCRIBE_FLAGS, "")
    } else {
        (UNSUBSCRIBE_FLAGS, "un")
    };
    let flags = first_byte & PACKET_FLAGS_MASK;
    if flags != expected {
        bail!("wrong {action}subscribe reserved flags: {flags:x}");
    }
    let mut r = Cursor::new(body);
    let pid = r.read_u16("packet identifier")?;
    let mut filters = Vec::new();
    while r.has_more() {
        let raw = r.read_bytes("topic filter")?;
        if raw.is_empty() {
            bail!("topic filter cannot be empty");
        }
        let filter = std::str::from_utf8(raw)
            .map_err(|_| anyhow!("invalid utf8 for topic filter {raw:?}"))?;
        let subject = topic::filter_to_subject(filter)?.into_owned();
        let qos = if sub {
            let qos = r.read_u8("QoS")?;
            if qos > 2 {
                bail!("subscribe QoS value must be 0, 1 or 2, got {qos}");
            }
            qos
        } else {
            0
        };
        filters.push(MqttFilter { subject, qos });
    }
    if filters.is_empty() {
        bail!("{action}subscribe protocol must contain at least 1 topic filter");
    }
    Ok((pid, filters))
}

// ---------------------------------------------------------------------------
// Outbound packets
// ---------------------------------------------------------------------------

pub fn connack(return_code: u8, session_present: bool) -> Bytes {
    // Session present must be 0 unless the connection was accepted.
    let sp = u8::from(return_code == CONNACK_ACCEPTED && session_present);
    Bytes::copy_from_slice(&[PACKET_CONNACK, 2, sp, return_code])
}

pub fn puback(pid: u16) -> Bytes {
    let [hi, lo] = pid.to_be_bytes();
    Bytes::copy_from_slice(&[PACKET_PUBACK, 2, hi, lo])
}

pub fn suback(pid: u16, results: &[u8]) -> Bytes {
    let mut w = PacketWriter::new();
    w.write_u8(PACKET_SUBACK);
    w.write_var_int(2 + results.len());
    w.write_u16(pid);
    w.write_slice(results);
    w.into_bytes()
}

pub fn unsuback(pid: u16) -> Bytes {
    let mut w = PacketWriter::new();
    w.write_u8(PACKET_UNSUBACK);
    w.write_var_int(2);
    w.write_u16(pid);
    w.into_bytes()
}

pub fn pingresp() -> Bytes {
    Bytes::from_static(&[PACKET_PINGRESP, 0])
}

/// Serialize a PUBLISH frame. The subject is translated back to an MQTT
/// topic; a non-zero packet identifier marks the frame as QoS 1.
pub fn publish_frame(subject: &str, pid: u16, flags: u8, payload: &[u8]) -> Bytes {
    let topic = topic::subject_to_topic(subject);
    let mut len = 2 + topic.len() + payload.len();
    if pid > 0 {
        len += 2;
    }
    let mut w = PacketWriter::new();
    w.write_u8(PACKET_PUBLISH | flags);
    w.write_var_int(len);
    w.write_bytes(topic.as_bytes());
    if pid > 0 {
        w.write_u16(pid);
    }
    w.write_slice(payload);
    w.into_bytes()
}
