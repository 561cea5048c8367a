//! MIME parsing and construction.
//!
//! Parsing is delegated to `mail-parser` and construction to the `lettre`
//! message builder; this module only maps between their types and the
//! [`ParsedMessage`] / [`OutgoingMessage`] pair the relay works with.

use std::fmt::Display;

use lettre::{
    message::{
        header::{ContentDisposition, ContentType, HeaderName, HeaderValue},
        Attachment, Mailbox, MultiPart, SinglePart,
    },
    Address, Message,
};
use mail_parser::{MessageParser, MessagePart, MimeHeaders, PartType};

use crate::{trim_brackets, MailAddress, RawMessage};

/// Result type for MIME operations.
pub type MimeResult<T> = Result<T, MimeError>;

/// Errors that can occur while parsing or building messages.
#[derive(Debug)]
pub enum MimeError {
    /// The raw bytes are not a parseable message.
    Parse,
    /// An address could not be used in a header.
    Address(String),
    /// The message could not be assembled.
    Build(String),
}

impl Display for MimeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MimeError::Parse => write!(f, "Unable to parse message"),
            MimeError::Address(msg) => write!(f, "Invalid address: {msg}"),
            MimeError::Build(msg) => write!(f, "Unable to build message: {msg}"),
        }
    }
}

impl std::error::Error for MimeError {}

/// Parses headers from a raw email, returning an ordered list of headers
/// and a reference to the content after the blank-line separator.
///
/// Headers are preserved in their original order with case-preserved keys
/// and trimmed values. This supports duplicate headers (e.g. `Received`).
/// Folded continuation lines are kept, joined to their header with `\r\n`.
///
/// # Examples
///
/// ```rust
/// let (headers, content) = mailrelay_utils::parse_raw_headers(
///     "From: alice@example.com\r\nTo: bob@example.com\r\n\r\nHello!"
/// );
/// assert_eq!(headers.len(), 2);
/// assert_eq!(headers[0], ("From".to_string(), "alice@example.com".to_string()));
/// assert_eq!(content, "Hello!");
/// ```
pub fn parse_raw_headers(raw: &str) -> (Vec<(String, String)>, &str) {
    let mut headers: Vec<(String, String)> = Vec::new();
    let mut pos = 0;

    for line in raw.lines() {
        let line_len = line.len();
        let end = pos + line_len;
        let consumed = if raw[end..].starts_with("\r\n") {
            end + 2
        } else if raw[end..].starts_with('\n') {
            end + 1
        } else {
            end
        };

        if line.trim().is_empty() {
            pos = consumed;
            break;
        }

        if line.starts_with([' ', '\t']) {
            match headers.last_mut() {
                Some((_, value)) => {
                    value.push_str("\r\n");
                    value.push_str(line);
                }
                None => break,
            }
        } else if let Some((key, value)) = line.split_once(':') {
            headers.push((key.trim().to_string(), value.trim().to_string()));
        } else {
            // Line is not a header (no colon) and not blank, treat as start of content
            break;
        }

        pos = consumed;
    }

    (headers, &raw[pos..])
}

/// A body part carried through from one message to another.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MimePart {
    pub content: Vec<u8>,
    pub content_type: String,
    pub file_name: Option<String>,
    pub content_id: Option<String>,
}

impl MimePart {
    fn from_part(part: &MessagePart) -> Self {
        let content_type = part
            .content_type()
            .map(|ct| match ct.subtype() {
                Some(subtype) => format!("{}/{}", ct.ctype(), subtype),
                None => ct.ctype().to_string(),
            })
            .unwrap_or_else(|| "application/octet-stream".to_string());
        Self {
            content: part.contents().to_vec(),
            content_type,
            file_name: part.attachment_name().map(str::to_string),
            content_id: part
                .content_id()
                .map(|id| trim_brackets(id).to_string())
                .filter(|id| !id.is_empty()),
        }
    }

    fn to_single_part(&self, inline: bool) -> MimeResult<SinglePart> {
        let content_type = ContentType::parse(&self.content_type)
            .or_else(|_| ContentType::parse("application/octet-stream"))
            .map_err(|e| MimeError::Build(e.to_string()))?;
        let part = match (&self.content_id, inline) {
            (Some(content_id), true) => {
                Attachment::new_inline(content_id.clone()).body(self.content.clone(), content_type)
            }
            (None, true) => {
                let disposition = match &self.file_name {
                    Some(name) => ContentDisposition::inline_with_name(name),
                    None => ContentDisposition::inline(),
                };
                SinglePart::builder()
                    .header(content_type)
                    .header(disposition)
                    .body(self.content.clone())
            }
            (_, false) => Attachment::new(
                self.file_name
                    .clone()
                    .unwrap_or_else(|| "attachment".to_string()),
            )
            .body(self.content.clone(), content_type),
        };
        Ok(part)
    }
}

/// The structured form of a stored raw message.
#[derive(Debug, Clone)]
pub struct ParsedMessage {
    raw: RawMessage,
    /// Decoded `From` mailboxes, unusable entries skipped.
    pub from: Vec<MailAddress>,
    pub reply_to: Vec<MailAddress>,
    pub to: Vec<MailAddress>,
    /// Decoded `Subject`.
    pub subject: Option<String>,
    pub text: Option<String>,
    pub html: Option<String>,
    /// Parts with an explicit `attachment` disposition.
    pub attachments: Vec<MimePart>,
    /// Parts displayed inline, by disposition or by `Content-ID`.
    pub inlines: Vec<MimePart>,
    /// Any other non-body part.
    pub others: Vec<MimePart>,
}

impl ParsedMessage {
    /// Returns the first header named `name` (case-insensitive), unfolded.
    ///
    /// The value is returned as written, encoded words included. Use the
    /// decoded fields for addresses and the subject.
    pub fn header(&self, name: &str) -> Option<String> {
        self.raw.header(name).filter(|value| !value.is_empty())
    }

    /// Whether any non-body part is present.
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty() || !self.inlines.is_empty() || !self.others.is_empty()
    }

    pub fn has_other_attachments(&self) -> bool {
        !self.others.is_empty()
    }

    /// Returns whom an answer to this message goes to, `Reply-To` first
    /// and `From` otherwise.
    pub fn correspondent(&self) -> Option<&MailAddress> {
        self.reply_to.first().or_else(|| self.from.first())
    }
}

fn mailboxes(address: Option<&mail_parser::Address>) -> Vec<MailAddress> {
    address
        .map(|address| {
            address
                .iter()
                .filter_map(|addr| {
                    let email = addr.address()?;
                    email.parse::<Address>().ok()?;
                    Some(MailAddress::new(
                        addr.name().map(str::to_string),
                        email.to_string(),
                    ))
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Parses a raw message into its bodies and parts.
pub fn parse_message(raw: &[u8]) -> MimeResult<ParsedMessage> {
    let message = MessageParser::default().parse(raw).ok_or(MimeError::Parse)?;

    let text = message
        .text_body
        .first()
        .and_then(|id| message.part(*id))
        .and_then(|part| match &part.body {
            PartType::Text(text) => Some(text.to_string()),
            _ => None,
        })
        .or_else(|| message.body_text(0).map(|text| text.into_owned()));
    let html = message
        .html_body
        .first()
        .and_then(|id| message.part(*id))
        .and_then(|part| match &part.body {
            PartType::Html(html) => Some(html.to_string()),
            _ => None,
        });

    let mut attachments = Vec::new();
    let mut inlines = Vec::new();
    let mut others = Vec::new();
    for part in message.attachments() {
        let disposition = part
            .content_disposition()
            .map(|d| d.ctype().to_ascii_lowercase());
        let mime_part = MimePart::from_part(part);
        match disposition.as_deref() {
            Some("attachment") => attachments.push(mime_part),
            Some("inline") => inlines.push(mime_part),
            _ if mime_part.content_id.is_some() => inlines.push(mime_part),
            _ => others.push(mime_part),
        }
    }

    Ok(ParsedMessage {
        raw: RawMessage::from_bytes(raw),
        from: mailboxes(message.from()),
        reply_to: mailboxes(message.reply_to()),
        to: mailboxes(message.to()),
        subject: message.subject().map(str::to_string),
        text: text.filter(|t| !t.is_empty()),
        html: html.filter(|h| !h.is_empty()),
        attachments,
        inlines,
        others,
    })
}

/// A message to be assembled into raw bytes.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub from: Option<MailAddress>,
    pub to: Vec<MailAddress>,
    pub cc: Vec<MailAddress>,
    pub bcc: Vec<MailAddress>,
    pub subject: String,
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<MimePart>,
    pub inlines: Vec<MimePart>,
    /// Identifier both `In-Reply-To` and `References` point at, brackets
    /// included.
    pub in_reply_to: Option<String>,
    pub headers: Vec<(&'static str, String)>,
}

impl OutgoingMessage {
    pub fn new(from: MailAddress, subject: &str) -> Self {
        Self {
            from: Some(from),
            subject: subject.to_string(),
            ..Default::default()
        }
    }

    pub fn to(mut self, to: MailAddress) -> Self {
        self.to.push(to);
        self
    }

    pub fn cc(mut self, cc: MailAddress) -> Self {
        self.cc.push(cc);
        self
    }

    pub fn bcc(mut self, bcc: MailAddress) -> Self {
        self.bcc.push(bcc);
        self
    }

    pub fn text(mut self, text: String) -> Self {
        self.text = Some(text);
        self
    }

    pub fn header(mut self, name: &'static str, value: String) -> Self {
        self.headers.push((name, value));
        self
    }

    pub fn in_reply_to(mut self, id: String) -> Self {
        self.in_reply_to = Some(id);
        self
    }

    /// Carries the bodies and every non-empty part of `parsed` over.
    /// Parts that are neither attachments nor inlines travel as inlines,
    /// with an `inline` disposition even when they have no `Content-ID`.
    pub fn with_content_of(mut self, parsed: &ParsedMessage) -> Self {
        self.text = parsed.text.clone();
        self.html = parsed.html.clone();
        self.attachments = non_empty(&parsed.attachments);
        self.inlines = non_empty(&parsed.inlines);
        self.inlines.extend(non_empty(&parsed.others));
        self
    }

    /// Assembles the message into its raw RFC 5322 form.
    pub fn build(&self) -> MimeResult<Vec<u8>> {
        let from = self
            .from
            .as_ref()
            .ok_or_else(|| MimeError::Address("missing sender".to_string()))?;
        let mut builder = Message::builder()
            .from(to_mailbox(from)?)
            .subject(self.subject.clone());
        for to in &self.to {
            builder = builder.to(to_mailbox(to)?);
        }
        for cc in &self.cc {
            builder = builder.cc(to_mailbox(cc)?);
        }
        for bcc in &self.bcc {
            builder = builder.bcc(to_mailbox(bcc)?);
        }
        if let Some(id) = &self.in_reply_to {
            builder = builder.in_reply_to(id.clone()).references(id.clone());
        }
        for (name, value) in &self.headers {
            builder = builder.raw_header(HeaderValue::new(
                HeaderName::new_from_ascii_str(name),
                value.clone(),
            ));
        }

        let body = match (&self.text, &self.html) {
            (Some(text), Some(html)) => {
                Body::Multi(MultiPart::alternative_plain_html(text.clone(), html.clone()))
            }
            (None, Some(html)) => Body::Single(SinglePart::html(html.clone())),
            (Some(text), None) => Body::Single(SinglePart::plain(text.clone())),
            (None, None) => Body::Single(SinglePart::plain(String::new())),
        };

        let mut parts = Vec::with_capacity(self.attachments.len() + self.inlines.len());
        for part in &self.attachments {
            parts.push(part.to_single_part(false)?);
        }
        for part in &self.inlines {
            parts.push(part.to_single_part(true)?);
        }

        let message = if parts.is_empty() {
            match body {
                Body::Single(part) => builder.singlepart(part),
                Body::Multi(multi) => builder.multipart(multi),
            }
        } else {
            let mut mixed = match body {
                Body::Single(part) => MultiPart::mixed().singlepart(part),
                Body::Multi(multi) => MultiPart::mixed().multipart(multi),
            };
            for part in parts {
                mixed = mixed.singlepart(part);
            }
            builder.multipart(mixed)
        }
        .map_err(|e| MimeError::Build(e.to_string()))?;

        Ok(message.formatted())
    }
}

enum Body {
    Single(SinglePart),
    Multi(MultiPart),
}

fn to_mailbox(addr: &MailAddress) -> MimeResult<Mailbox> {
    let email: Address = addr
        .address
        .parse()
        .map_err(|_| MimeError::Address(addr.address.clone()))?;
    Ok(Mailbox::new(addr.name.clone(), email))
}

fn non_empty(parts: &[MimePart]) -> Vec<MimePart> {
    parts
        .iter()
        .filter(|p| !p.content.is_empty())
        .cloned()
        .collect()
}
