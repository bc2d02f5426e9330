//! MQTT topic ↔ subject translation.
//!
//! MQTT separates levels with `/` and uses `+`/`#` wildcards; subjects
//! separate tokens with `.` and use `*`/`>`. The mapping is a lossless,
//! character-by-character rewrite:
//!
//! - `/` becomes `.`, except a leading `/` becomes `/.`, a trailing `/`
//!   becomes `./`, and the lone topic `/` is preserved
//! - `.` becomes `/` (so the round trip is exact)
//! - space becomes `_`
//! - `+` and `#` become `*` and `>` in filters, and are rejected in topic
//!   names
//!
//! A `Cow::Borrowed` return means no rewrite occurred and the caller can
//! keep referencing the decode buffer.

use anyhow::{bail, Result};
use std::borrow::Cow;

/// Convert an MQTT topic name to a subject. Wildcards are not allowed in
/// topic names.
pub fn topic_to_subject(topic: &str) -> Result<Cow<'_, str>> {
    convert(topic, false)
}

/// Convert an MQTT topic filter to a subject pattern; wildcards allowed.
pub fn filter_to_subject(filter: &str) -> Result<Cow<'_, str>> {
    convert(filter, true)
}

fn convert(topic: &str, wildcards_ok: bool) -> Result<Cow<'_, str>> {
    if topic == "/" {
        return Ok(Cow::Borrowed(topic));
    }
    if !wildcards_ok && topic.bytes().any(|b| b == b'+' || b == b'#') {
        bail!("wildcards not allowed in publish's topic: {topic:?}");
    }
    if !topic
        .bytes()
        .any(|b| matches!(b, b'/' | b'.' | b' ' | b'+' | b'#'))
    {
        return Ok(Cow::Borrowed(topic));
    }
    let last = topic.chars().count() - 1;
    let mut out = String::with_capacity(topic.len() + 2);
    for (i, ch) in topic.chars().enumerate() {
        match ch {
            '.' => out.push('/'),
            '/' if i == 0 => out.push_str("/."),
            '/' if i == last => out.push_str("./"),
            '/' => out.push('.'),
            ' ' => out.push('_'),
            '+' => out.push('*'),
            '#' => out.push('>'),
            other => out.push(other),
        }
    }
    Ok(Cow::Owned(out))
}

/// Convert a subject back to an MQTT topic name, undoing every rewrite of
/// [`topic_to_subject`] including the leading/trailing slash encodings.
pub fn subject_to_topic(subject: &str) -> Cow<'_, str> {
    if subject == "/" {
        return Cow::Borrowed(subject);
    }
    if !subject
        .bytes()
        .any(|b| matches!(b, b'.' | b'/' | b'_'))
    {
        return Cow::Borrowed(subject);
    }
    let mut body = subject;
    let mut leading = false;
    let mut trailing = false;
    if subject.len() > 2 {
        if let Some(rest) = body.strip_prefix("/.") {
            leading = true;
            body = rest;
        }
        if let Some(rest) = body.strip_suffix("./") {
            trailing = true;
            body = rest;
        }
    }
    let mut out = String::with_capacity(subject.len());
    if leading {
        out.push('/');
    }
    for ch in body.chars() {
        match ch {
            '.' => out.push('/'),
            '/' => out.push('.'),
            '_' => out.push(' '),
            other => out.push(other),
        }
    }
    if trailing {
        out.push('/');
    }
    Cow::Owned(out)
}
