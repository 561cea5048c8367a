use std::{
    fmt::Display,
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use lettre::{
    address::Envelope, transport::smtp::authentication::Credentials, Address, AsyncSmtpTransport,
    AsyncTransport, Tokio1Executor,
};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::RawMessage;

/// Result type for mailer operations.
pub type MailerResult<T> = Result<T, MailerError>;

/// Boxed future returned by [`Mailer::send_raw`], resolving to the send id.
pub type MailerFuture<'a> = Pin<Box<dyn Future<Output = MailerResult<String>> + Send + 'a>>;

/// Errors that can occur while submitting a message.
#[derive(Debug)]
pub enum MailerError {
    /// The envelope source or a destination is not a valid address.
    Address(String),
    /// The transport could not be set up.
    Connection(String),
    /// The transport refused or failed to deliver the message.
    Transport(String),
}

impl Display for MailerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MailerError::Address(msg) => write!(f, "Invalid envelope address: {msg}"),
            MailerError::Connection(msg) => write!(f, "Mailer connection error: {msg}"),
            MailerError::Transport(msg) => write!(f, "Mailer transport error: {msg}"),
        }
    }
}

impl std::error::Error for MailerError {}

/// Trait for submitting raw messages for delivery.
pub trait Mailer: Send + Sync {
    /// Submits `raw` with the given envelope and returns the id the
    /// message was sent under.
    fn send_raw<'a>(
        &'a self,
        source: &'a str,
        destinations: &'a [String],
        raw: &'a [u8],
    ) -> MailerFuture<'a>;

    /// Returns the name of this mailer.
    fn name(&self) -> &str;
}

/// Mailer submitting messages to an SMTP relay.
///
/// Every message gets a fresh `Message-ID: <uuid@domain>` before it is
/// sent, the uuid being the returned send id.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    domain: String,
}

impl SmtpMailer {
    /// Creates a new [`SmtpMailer`] for the given relay.
    ///
    /// With `tls` the connection is upgraded through STARTTLS, otherwise
    /// it stays in plain text.
    pub fn new(
        host: &str,
        port: u16,
        credentials: Option<(String, String)>,
        tls: bool,
        domain: &str,
    ) -> MailerResult<Self> {
        let mut builder = if tls {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host).map_err(|e| {
                error!(host = %host, error = %e, "Failed to create SMTP transport");
                MailerError::Connection(e.to_string())
            })?
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(host)
        };
        builder = builder.port(port);
        if let Some((username, password)) = credentials {
            builder = builder.credentials(Credentials::new(username, password));
        }
        info!(host = %host, port = port, tls = tls, "SMTP mailer initialized");
        Ok(Self {
            transport: builder.build(),
            domain: domain.to_string(),
        })
    }

    fn envelope(source: &str, destinations: &[String]) -> MailerResult<Envelope> {
        let parse = |value: &str| {
            value
                .parse::<Address>()
                .map_err(|e| MailerError::Address(format!("{value}: {e}")))
        };
        let from = parse(source)?;
        let to = destinations
            .iter()
            .map(|d| parse(d.as_str()))
            .collect::<MailerResult<Vec<_>>>()?;
        Envelope::new(Some(from), to).map_err(|e| MailerError::Address(e.to_string()))
    }
}

impl Mailer for SmtpMailer {
    fn send_raw<'a>(
        &'a self,
        source: &'a str,
        destinations: &'a [String],
        raw: &'a [u8],
    ) -> MailerFuture<'a> {
        Box::pin(async move {
            let envelope = Self::envelope(source, destinations)?;

            let id = Uuid::new_v4().to_string();
            let mut message = RawMessage::from_bytes(raw);
            message.remove_header("Message-ID");
            message.prepend_header("Message-ID", &format!("<{id}@{}>", self.domain));
            message.rebuild();

            debug!(id = %id, from = %source, to = ?destinations, "Sending message");
            self.transport
                .send_raw(&envelope, message.raw().as_bytes())
                .await
                .map_err(|e| {
                    error!(id = %id, from = %source, error = %e, "Failed to send message");
                    MailerError::Transport(e.to_string())
                })?;

            info!(id = %id, from = %source, to = ?destinations, "Sent message");
            Ok(id)
        })
    }

    fn name(&self) -> &str {
        "smtp"
    }
}

/// A message captured by [`MemoryMailer`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentMessage {
    pub id: String,
    pub source: String,
    pub destinations: Vec<String>,
    pub raw: Vec<u8>,
}

/// In-memory mailer recording every submission.
///
/// Send ids are `sent-1`, `sent-2` and so on. Useful for testing and
/// development.
#[derive(Debug, Default)]
pub struct MemoryMailer {
    sent: Mutex<Vec<SentMessage>>,
    counter: AtomicUsize,
    failing: bool,
}

impl MemoryMailer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a mailer that rejects every submission.
    pub fn failing() -> Self {
        Self {
            failing: true,
            ..Default::default()
        }
    }

    /// Returns a copy of every message sent so far.
    pub fn sent(&self) -> Vec<SentMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }
}

impl Mailer for MemoryMailer {
    fn send_raw<'a>(
        &'a self,
        source: &'a str,
        destinations: &'a [String],
        raw: &'a [u8],
    ) -> MailerFuture<'a> {
        Box::pin(async move {
            if self.failing {
                return Err(MailerError::Transport("rejected".to_string()));
            }
            let id = format!("sent-{}", self.counter.fetch_add(1, Ordering::SeqCst) + 1);
            let mut sent = self
                .sent
                .lock()
                .map_err(|_| MailerError::Transport("memory mailer lock poisoned".to_string()))?;
            sent.push(SentMessage {
                id: id.clone(),
                source: source.to_string(),
                destinations: destinations.to_vec(),
                raw: raw.to_vec(),
            });
            Ok(id)
        })
    }

    fn name(&self) -> &str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_mailer_records_sends() {
        let mailer = MemoryMailer::new();
        let to = vec!["me@private.example.com".to_string()];

        let first = mailer
            .send_raw("a@proxy.example.com", &to, b"Subject: 1\r\n\r\n")
            .await
            .unwrap();
        let second = mailer
            .send_raw("b@proxy.example.com", &to, b"Subject: 2\r\n\r\n")
            .await
            .unwrap();

        assert_eq!(first, "sent-1");
        assert_eq!(second, "sent-2");
        let sent = mailer.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[1].source, "b@proxy.example.com");
        assert_eq!(sent[1].destinations, to);
    }

    #[tokio::test]
    async fn test_failing_mailer() {
        let mailer = MemoryMailer::failing();
        let result = mailer
            .send_raw("a@b.com", &["c@d.com".to_string()], b"")
            .await;
        assert!(matches!(result, Err(MailerError::Transport(_))));
        assert!(mailer.sent().is_empty());
    }

    #[test]
    fn test_envelope_rejects_bad_address() {
        assert!(SmtpMailer::envelope("a@b.com", &["c@d.com".to_string()]).is_ok());
        assert!(matches!(
            SmtpMailer::envelope("not an address", &["c@d.com".to_string()]),
            Err(MailerError::Address(_))
        ));
        assert!(matches!(
            SmtpMailer::envelope("a@b.com", &["bad".to_string()]),
            Err(MailerError::Address(_))
        ));
    }

    #[tokio::test]
    async fn test_smtp_mailer_builds_without_connecting() {
        let mailer = SmtpMailer::new("localhost", 2525, None, false, "proxy.example.com").unwrap();
        assert_eq!(mailer.name(), "smtp");
    }
}
