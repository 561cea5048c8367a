//! The dispatch engine.
//!
//! [`Relay`] takes a batch of inbound records and, for each one, decides
//! its fate with [`decide`] and then carries the decision out: operator
//! notification, route notifications, and one of the dispositions
//! (outbox queueing, forwarding to the private account, reply relaying).
//!
//! Records are processed one after another. A failing record never stops
//! the batch, failures are collected and returned together.

mod decision;
mod forward;
mod operator;
mod reply;

pub use decision::{decide, Disposition, RoutingDecision};

use std::{fmt::Display, sync::Arc};

use tracing::{debug, error, info, warn};

use crate::{
    blob_key, parse_message, AddressError, BlobStore, CorrelationStore, EmailEvent, EmailRecord,
    Envelope, MailAddress, Mailer, MailerError, MimeError, NotificationMessage, PublishError,
    Publisher, RelayConfig, StorageError, VerdictSet,
};

/// Result type for relay operations.
pub type RelayResult<T> = Result<T, RelayError>;

/// Errors that can occur while relaying a record.
#[derive(Debug)]
pub enum RelayError {
    Storage(StorageError),
    Mailer(MailerError),
    Publish(PublishError),
    Mime(MimeError),
    Address(AddressError),
    /// A suspect message matched a route that does not allow it.
    Rejected(String),
    /// None of the recipients is on the proxy domain.
    NoProxyRecipient(String),
    /// A reply carries no `In-Reply-To` header.
    MissingInReplyTo(String),
    /// The original message has no usable `Reply-To` or `From`.
    NoCorrespondent(String),
    /// No forward record exists for the message a reply points at.
    UnknownCorrelation {
        forwarded_id: String,
        error: StorageError,
    },
    /// One or more records of a batch failed.
    Batch(Vec<RecordFailure>),
}

/// A failed record of a batch.
#[derive(Debug)]
pub struct RecordFailure {
    pub message_id: String,
    pub error: RelayError,
}

impl Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Storage(e) => write!(f, "{e}"),
            RelayError::Mailer(e) => write!(f, "{e}"),
            RelayError::Publish(e) => write!(f, "{e}"),
            RelayError::Mime(e) => write!(f, "{e}"),
            RelayError::Address(e) => write!(f, "{e}"),
            RelayError::Rejected(reason) => write!(f, "Rejected: {reason}"),
            RelayError::NoProxyRecipient(id) => {
                write!(f, "No proxy domain recipient for message {id}")
            }
            RelayError::MissingInReplyTo(id) => {
                write!(f, "No In-Reply-To header found in message {id}")
            }
            RelayError::NoCorrespondent(id) => {
                write!(f, "No reply address found in original message {id}")
            }
            RelayError::UnknownCorrelation {
                forwarded_id,
                error,
            } => write!(f, "No forward info for {forwarded_id}: {error}"),
            RelayError::Batch(failures) => {
                write!(f, "{} record(s) failed:", failures.len())?;
                for failure in failures {
                    write!(f, " [{}: {}]", failure.message_id, failure.error)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for RelayError {}

impl From<StorageError> for RelayError {
    fn from(e: StorageError) -> Self {
        RelayError::Storage(e)
    }
}

impl From<MailerError> for RelayError {
    fn from(e: MailerError) -> Self {
        RelayError::Mailer(e)
    }
}

impl From<PublishError> for RelayError {
    fn from(e: PublishError) -> Self {
        RelayError::Publish(e)
    }
}

impl From<MimeError> for RelayError {
    fn from(e: MimeError) -> Self {
        RelayError::Mime(e)
    }
}

impl From<AddressError> for RelayError {
    fn from(e: AddressError) -> Self {
        RelayError::Address(e)
    }
}

/// The relay engine, built once and shared read-only afterwards.
pub struct Relay {
    config: RelayConfig,
    store: Arc<dyn BlobStore>,
    mailer: Arc<dyn Mailer>,
    publisher: Arc<dyn Publisher>,
    correlation: CorrelationStore,
}

impl std::fmt::Debug for Relay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Relay")
            .field("domain", &self.config.domain)
            .field("store", &self.store.name())
            .field("mailer", &self.mailer.name())
            .field("publisher", &self.publisher.name())
            .finish()
    }
}

impl Relay {
    pub fn new(
        config: RelayConfig,
        store: Arc<dyn BlobStore>,
        mailer: Arc<dyn Mailer>,
        publisher: Arc<dyn Publisher>,
    ) -> Self {
        let correlation = CorrelationStore::new(store.clone(), &config.bucket.forward_meta_prefix);
        Self {
            config,
            store,
            mailer,
            publisher,
            correlation,
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Processes every record of the batch, returning the failures
    /// together once all records were attempted.
    pub async fn handle_event(&self, event: &EmailEvent) -> RelayResult<()> {
        let mut failures = Vec::new();

        for record in &event.records {
            let message_id = &record.ses.mail.message_id;
            match self.process_record(record).await {
                Ok(decision) => debug!(message_id = %message_id, decision = ?decision, "Processed record"),
                Err(e) => {
                    error!(message_id = %message_id, error = %e, "Failed to process record");
                    failures.push(RecordFailure {
                        message_id: message_id.clone(),
                        error: e,
                    });
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(RelayError::Batch(failures))
        }
    }

    /// Decides the fate of a single record and carries it out.
    pub async fn process_record(&self, record: &EmailRecord) -> RelayResult<RoutingDecision> {
        let envelope = Envelope::from_record(record);

        info!(
            message_id = %envelope.message_id,
            from = ?envelope.from,
            to = ?envelope.to,
            subject = %envelope.subject,
            "Processing record"
        );

        if envelope.verdicts.suspect() {
            for reason in VerdictSet::reasons(&record.ses.receipt) {
                warn!(
                    message_id = %envelope.message_id,
                    verdict = reason.name,
                    status = %reason.status,
                    "Suspect message"
                );
            }
        }

        let decision = decide(&self.config, &envelope);

        match &decision {
            RoutingDecision::Quarantine(reason) => {
                info!(message_id = %envelope.message_id, reason = %reason, "Quarantined message");
                self.notify_operator(reason, record).await;
            }
            RoutingDecision::Drop => {
                info!(message_id = %envelope.message_id, "Matched drop route");
            }
            RoutingDecision::Reject(reason) => {
                return Err(RelayError::Rejected(reason.clone()));
            }
            RoutingDecision::Route {
                notify,
                disposition,
            } => {
                for topic in notify {
                    self.publish(topic, &envelope).await?;
                }
                match disposition {
                    Some(Disposition::DeliverOutbound) => self.deliver_outbound(&envelope).await?,
                    Some(Disposition::ForwardToPrivate) => {
                        self.forward_to_private(&envelope).await?
                    }
                    Some(Disposition::ReplyRelay) => self.reply_relay(&envelope).await?,
                    None => info!(message_id = %envelope.message_id, "Skipped forwarding"),
                }
            }
        }

        Ok(decision)
    }

    /// Runs a message already in the store through the relay again, as if
    /// it had just arrived with every verdict passing.
    pub async fn replay(&self, message_id: &str) -> RelayResult<RoutingDecision> {
        let raw = self.fetch_message(message_id).await?;
        let parsed = parse_message(&raw)?;
        let mailbox = |addresses: &[MailAddress]| {
            addresses
                .first()
                .map(ToString::to_string)
                .unwrap_or_default()
        };

        let mut record = EmailRecord::synthetic(
            message_id,
            parsed.subject.as_deref().unwrap_or_default(),
            &mailbox(&parsed.from),
            &mailbox(&parsed.to),
            &parsed.header("Message-ID").unwrap_or_default(),
        );
        record.ses.receipt.recipients = parsed.to.iter().map(|to| to.address.clone()).collect();

        self.process_record(&record).await
    }

    async fn publish(&self, topic: &str, envelope: &Envelope) -> RelayResult<()> {
        let key = blob_key(&self.config.bucket.msg_prefix, &envelope.message_id);
        let presigned_url = self.store.presign(&key, self.config.presign_ttl).await?;
        let message = NotificationMessage {
            id: envelope.message_id.clone(),
            from: envelope.from.clone(),
            to: envelope.to.clone(),
            subject: envelope.subject.clone(),
            date: envelope.date.clone(),
            presigned_url,
        };
        info!(message_id = %envelope.message_id, topic = %topic, "Publishing notification");
        self.publisher.publish(topic, &message).await?;
        Ok(())
    }

    async fn deliver_outbound(&self, envelope: &Envelope) -> RelayResult<()> {
        let bucket = &self.config.bucket;
        let src = blob_key(&bucket.msg_prefix, &envelope.message_id);
        let dst = blob_key(&bucket.outbox_prefix, &envelope.message_id);
        self.store.copy(&src, &dst).await?;
        info!(message_id = %envelope.message_id, key = %dst, "Queued message in outbox");
        Ok(())
    }

    async fn fetch_message(&self, message_id: &str) -> RelayResult<Vec<u8>> {
        let key = blob_key(&self.config.bucket.msg_prefix, message_id);
        Ok(self.store.get(&key).await?)
    }

    fn proxy_recipient(&self, envelope: &Envelope) -> RelayResult<String> {
        crate::find_proxy_recipient(&envelope.recipients, &self.config.domain)
            .ok_or_else(|| RelayError::NoProxyRecipient(envelope.message_id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        event::Verdict, Config, MemoryBlobStore, MemoryMailer, MemoryPublisher, RawMessage,
    };

    const ROUTES_NONE: &str = "";

    pub(super) fn config(routes: &str) -> RelayConfig {
        let toml = format!(
            r#"
domain = "proxy.example.com"
private_address = "me@private.example.com"
outbound_address = "outbound@proxy.example.com"

[bucket]
msg_prefix = "email"
forward_meta_prefix = "forward"
outbox_prefix = "outbox"
{routes}
"#
        );
        toml::from_str::<Config>(&toml).unwrap().validate().unwrap()
    }

    pub(super) struct Harness {
        pub relay: Relay,
        pub store: Arc<MemoryBlobStore>,
        pub mailer: Arc<MemoryMailer>,
        pub publisher: Arc<MemoryPublisher>,
    }

    pub(super) fn harness(routes: &str) -> Harness {
        harness_with(routes, MemoryMailer::new(), MemoryPublisher::new())
    }

    pub(super) fn harness_with(
        routes: &str,
        mailer: MemoryMailer,
        publisher: MemoryPublisher,
    ) -> Harness {
        let store = Arc::new(MemoryBlobStore::new());
        let mailer = Arc::new(mailer);
        let publisher = Arc::new(publisher);
        let relay = Relay::new(
            config(routes),
            store.clone(),
            mailer.clone(),
            publisher.clone(),
        );
        Harness {
            relay,
            store,
            mailer,
            publisher,
        }
    }

    pub(super) fn inbound(id: &str, from: &str, to: &str) -> EmailRecord {
        let mut record = EmailRecord::synthetic(id, "hi", from, to, "<orig@mail.example.com>");
        record.ses.mail.timestamp = "2019-03-02T22:38:23.533Z".to_string();
        record.ses.receipt.recipients = vec![crate::parse_address(to).unwrap().address];
        record
    }

    pub(super) fn sent_header(raw: &[u8], name: &str) -> Option<String> {
        RawMessage::from_bytes(raw).header(name)
    }

    #[tokio::test]
    async fn test_outbound_copies_message_to_outbox() {
        let h = harness(ROUTES_NONE);
        let raw = b"From: me@private.example.com\r\nTo: outbound@proxy.example.com\r\nSubject: hi\r\n\r\n\xe9body".to_vec();
        h.store.put("email/out1", raw.clone()).await.unwrap();

        let decision = h
            .relay
            .process_record(&inbound(
                "out1",
                "me@private.example.com",
                "outbound@proxy.example.com",
            ))
            .await
            .unwrap();

        assert_eq!(
            decision,
            RoutingDecision::Route {
                notify: vec![],
                disposition: Some(Disposition::DeliverOutbound)
            }
        );
        assert_eq!(h.store.get("outbox/out1").await.unwrap(), raw);
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_virus_sends_one_operator_message() {
        let h = harness("[[route]]\nsrc = \"/.*/\"\ndst = \"/.*/\"\nnotify = \"all\"\nforward = true\n");
        let mut record = inbound("v1", "bob@example.com", "sales@proxy.example.com");
        record.ses.receipt.virus_verdict = Verdict::new("FAIL");

        let decision = h.relay.process_record(&record).await.unwrap();

        assert!(matches!(decision, RoutingDecision::Quarantine(_)));
        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].source, "error@proxy.example.com");
        assert_eq!(sent[0].destinations, vec!["me@private.example.com".to_string()]);
        assert!(h.publisher.published().is_empty());
        assert!(h.store.keys("forward").is_empty());
        assert!(h.store.keys("outbox").is_empty());
    }

    #[tokio::test]
    async fn test_mailer_daemon_notifies_operator() {
        let h = harness(ROUTES_NONE);
        let record = inbound("d1", "MAILER-DAEMON@amazonses.com", "sales@proxy.example.com");

        let decision = h.relay.process_record(&record).await.unwrap();

        assert!(matches!(decision, RoutingDecision::Quarantine(_)));
        assert_eq!(h.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_operator_failure_is_not_an_error() {
        let h = harness_with(ROUTES_NONE, MemoryMailer::failing(), MemoryPublisher::new());
        let mut record = inbound("v2", "bob@example.com", "sales@proxy.example.com");
        record.ses.receipt.virus_verdict = Verdict::new("FAIL");

        assert!(h.relay.process_record(&record).await.is_ok());
    }

    #[tokio::test]
    async fn test_drop_suppresses_everything() {
        let h = harness(
            "[[route]]\nsrc = \"/.*/\"\ndst = \"/.*/\"\nnotify = \"all\"\nforward = true\n\
             [[route]]\nsrc = \"/spam/\"\ndst = \"/.*/\"\ndrop = true\n",
        );
        let record = inbound("s1", "spam@example.com", "sales@proxy.example.com");

        let decision = h.relay.process_record(&record).await.unwrap();

        assert_eq!(decision, RoutingDecision::Drop);
        assert!(h.mailer.sent().is_empty());
        assert!(h.publisher.published().is_empty());
        assert!(h.store.is_empty());
    }

    #[tokio::test]
    async fn test_suspect_rejected_without_side_effects() {
        let h = harness("[[route]]\nsrc = \"/.*/\"\ndst = \"/.*/\"\nnotify = \"all\"\nforward = true\n");
        let mut record = inbound("x1", "bob@example.com", "sales@proxy.example.com");
        record.ses.receipt.dkim_verdict = Verdict::new("FAIL");

        let result = h.relay.process_record(&record).await;

        assert!(matches!(result, Err(RelayError::Rejected(_))));
        assert!(h.mailer.sent().is_empty());
        assert!(h.publisher.published().is_empty());
    }

    #[tokio::test]
    async fn test_notify_only_route() {
        let h = harness("[[route]]\nsrc = \"/.*/\"\ndst = \"sales@proxy.example.com\"\nnotify = \"sales\"\n");
        h.store
            .put("email/n1", b"Subject: hi\r\n\r\nbody".to_vec())
            .await
            .unwrap();
        let record = inbound("n1", "Bob <bob@example.com>", "sales@proxy.example.com");

        let decision = h.relay.process_record(&record).await.unwrap();

        assert_eq!(
            decision,
            RoutingDecision::Route {
                notify: vec!["sales".to_string()],
                disposition: None
            }
        );
        let published = h.publisher.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "sales");
        assert_eq!(published[0].1.id, "n1");
        assert_eq!(published[0].1.from, vec!["Bob <bob@example.com>".to_string()]);
        assert!(published[0].1.presigned_url.starts_with("memory://email/n1?expires="));
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_fails_record() {
        let h = harness_with(
            "[[route]]\nsrc = \"/.*/\"\ndst = \"/.*/\"\nnotify = \"all\"\nforward = true\n",
            MemoryMailer::new(),
            MemoryPublisher::failing(),
        );
        let record = inbound("p1", "bob@example.com", "sales@proxy.example.com");

        let result = h.relay.process_record(&record).await;

        assert!(matches!(result, Err(RelayError::Publish(_))));
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_batch_continues_after_failure() {
        let h = harness(ROUTES_NONE);
        h.store
            .put(
                "email/ok1",
                b"From: Bob <bob@example.com>\r\nTo: sales@proxy.example.com\r\nSubject: hi\r\n\r\nbody".to_vec(),
            )
            .await
            .unwrap();
        let event = EmailEvent {
            records: vec![
                inbound("missing", "bob@example.com", "sales@proxy.example.com"),
                inbound("ok1", "bob@example.com", "sales@proxy.example.com"),
            ],
        };

        let err = h.relay.handle_event(&event).await.unwrap_err();

        match &err {
            RelayError::Batch(failures) => {
                assert_eq!(failures.len(), 1);
                assert_eq!(failures[0].message_id, "missing");
                assert!(matches!(
                    failures[0].error,
                    RelayError::Storage(StorageError::NotFound(_))
                ));
            }
            other => panic!("Expected batch error, got {other}"),
        }
        assert!(err.to_string().contains("missing"));
        assert_eq!(h.mailer.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_batch() {
        let h = harness(ROUTES_NONE);
        assert!(h.relay.handle_event(&EmailEvent::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_replay_stored_message() {
        let h = harness(ROUTES_NONE);
        h.store
            .put(
                "email/r1",
                b"From: Bob <bob@example.com>\r\nTo: Sales <sales@proxy.example.com>\r\nSubject: =?UTF-8?Q?Caf=C3=A9?=\r\nMessage-ID: <r1@example.com>\r\n\r\nbody".to_vec(),
            )
            .await
            .unwrap();

        let decision = h.relay.replay("r1").await.unwrap();

        assert_eq!(
            decision,
            RoutingDecision::Route {
                notify: vec![],
                disposition: Some(Disposition::ForwardToPrivate)
            }
        );
        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].source, "sales@proxy.example.com");
        assert_eq!(
            sent[0].destinations,
            vec!["me+sales@private.example.com".to_string()]
        );
        let forwarded = parse_message(&sent[0].raw).unwrap();
        assert_eq!(forwarded.subject.as_deref(), Some("Café"));
        assert_eq!(forwarded.from[0].name.as_deref(), Some("Bob"));
    }
}
