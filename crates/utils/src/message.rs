//! Core message types used throughout the relay pipeline.
//!
//! This module defines [`Envelope`], the read-only view of one inbound
//! record the routing decision is made on, and [`RawMessage`], a raw
//! [RFC 5322](https://www.rfc-editor.org/rfc/rfc5322) message with ordered
//! headers that can be edited and re-serialized.

use crate::{event::EmailRecord, parse_address, parse_raw_headers, VerdictSet};

/// Headers and verdicts of one inbound record, as supplied by the platform.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    /// Platform message identifier, also the storage key of the raw message.
    pub message_id: String,

    /// `Message-ID` header of the message, brackets trimmed.
    pub header_message_id: String,

    /// Raw `From` header entries.
    pub from: Vec<String>,

    /// Raw `To` header entries.
    pub to: Vec<String>,

    pub subject: String,

    /// `Date` header as sent.
    pub date: String,

    /// Reception time reported by the platform.
    pub timestamp: String,

    /// Envelope recipients the platform accepted the message for.
    pub recipients: Vec<String>,

    pub verdicts: VerdictSet,
}

impl Envelope {
    /// Builds the envelope of an inbound record.
    pub fn from_record(record: &EmailRecord) -> Self {
        let mail = &record.ses.mail;
        let headers = &mail.common_headers;
        Self {
            message_id: mail.message_id.clone(),
            header_message_id: trim_brackets(&headers.message_id).to_string(),
            from: headers.from.clone(),
            to: headers.to.clone(),
            subject: headers.subject.clone(),
            date: headers.date.clone(),
            timestamp: mail.timestamp.clone(),
            recipients: record.ses.receipt.recipients.clone(),
            verdicts: VerdictSet::classify(&record.ses.receipt),
        }
    }

    /// Returns the address-only part of the first `From` entry, or an
    /// empty string when it is missing or malformed.
    pub fn from_address(&self) -> String {
        self.from
            .first()
            .and_then(|from| parse_address(from).ok())
            .map(|addr| addr.address)
            .unwrap_or_default()
    }

    /// Returns the display name of the first `From` entry, if any.
    pub fn from_name(&self) -> Option<String> {
        self.from
            .first()
            .and_then(|from| parse_address(from).ok())
            .and_then(|addr| addr.name)
    }

    /// Returns the address-only part of every well-formed `To` entry.
    pub fn to_addresses(&self) -> Vec<String> {
        self.to
            .iter()
            .filter_map(|to| parse_address(to).ok())
            .map(|addr| addr.address)
            .collect()
    }
}

/// Strips surrounding angle brackets from message identifiers.
pub fn trim_brackets(value: &str) -> &str {
    value.trim().trim_matches(|c| c == '<' || c == '>')
}

/// A raw message with editable headers.
///
/// Headers are stored as an ordered `Vec` (preserving RFC 5322 order and
/// supporting duplicate headers such as `Received`). Folded header values
/// keep their continuation lines. Call [`rebuild`](Self::rebuild) after
/// modifying headers so that [`raw`](Self::raw) reflects the changes.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Ordered list of headers (case-preserved keys, trimmed values).
    headers: Vec<(String, String)>,

    /// Message body after the blank-line separator.
    body: String,

    /// Cached full serialization (headers + blank line + body).
    raw: String,
}

impl RawMessage {
    pub fn new(raw: String) -> Self {
        let (headers, content) = parse_raw_headers(&raw);
        Self {
            headers,
            body: content.to_string(),
            raw,
        }
    }

    pub fn from_bytes(raw: &[u8]) -> Self {
        Self::new(String::from_utf8_lossy(raw).into_owned())
    }

    /// Returns the first header value matching `name` (case-insensitive),
    /// with folded continuation lines joined.
    pub fn header(&self, name: &str) -> Option<String> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| unfold(v))
    }

    /// Returns a reference to the ordered header list.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    /// Returns the cached serialization, see [`rebuild`](Self::rebuild).
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Prepends a header to the beginning of the header list.
    pub fn prepend_header(&mut self, name: &str, value: &str) {
        self.headers
            .insert(0, (name.to_string(), value.to_string()));
    }

    /// Removes every header matching `name` (case-insensitive).
    pub fn remove_header(&mut self, name: &str) {
        self.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(name));
    }

    /// Rebuilds the cached [`raw`](Self::raw) field from the headers and body.
    ///
    /// Pre-computes the exact byte length, allocates once, and writes all
    /// parts via `push_str`.
    pub fn rebuild(&mut self) {
        let headers_len: usize = self
            .headers
            .iter()
            .map(|(k, v)| k.len() + 2 + v.len() + 2)
            .sum();

        let capacity = headers_len + if self.headers.is_empty() { 0 } else { 2 } + self.body.len();

        let mut raw = String::with_capacity(capacity);

        for (key, value) in &self.headers {
            raw.push_str(key);
            raw.push_str(": ");
            raw.push_str(value);
            raw.push_str("\r\n");
        }

        if !self.headers.is_empty() {
            raw.push_str("\r\n");
        }

        raw.push_str(&self.body);

        self.raw = raw;
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.raw.into_bytes()
    }
}

fn unfold(value: &str) -> String {
    value
        .split("\r\n")
        .flat_map(|l| l.split('\n'))
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}
