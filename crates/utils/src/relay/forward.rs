use tracing::info;

use crate::{
    extract_domain_local_part, parse_message, Envelope, ForwardInfo, MailAddress, OutgoingMessage,
};

use super::{Relay, RelayResult};

impl Relay {
    /// Forwards a third-party message to the private account.
    ///
    /// The copy is sent as the proxy address it was written to, keeping
    /// the sender's display name, to the private mailbox sub-addressed by
    /// the proxy local part. Its send id is recorded so that a reply can
    /// find its way back.
    pub(super) async fn forward_to_private(&self, envelope: &Envelope) -> RelayResult<()> {
        let proxy_address = self.proxy_recipient(envelope)?;
        let (local, _) = extract_domain_local_part(&proxy_address)?;
        let forward_address = self.config.private_account.forward_address(local);

        let raw = self.fetch_message(&envelope.message_id).await?;
        let parsed = parse_message(&raw)?;

        let message = OutgoingMessage::new(
            MailAddress::new(envelope.from_name(), proxy_address.clone()),
            &envelope.subject,
        )
        .to(MailAddress::new(None, forward_address.clone()))
        .with_content_of(&parsed)
        .header("X-Mailrelay-Date", envelope.timestamp.clone())
        .header("X-Mailrelay-From", envelope.from.join(","))
        .header("X-Mailrelay-To", envelope.to.join(","))
        .header("X-Mailrelay-Id", envelope.message_id.clone())
        .header(
            "X-Mailrelay-Has-Attachments",
            parsed.has_attachments().to_string(),
        )
        .header(
            "X-Mailrelay-Has-Other-Attachments",
            parsed.has_other_attachments().to_string(),
        );

        let forwarded_id = self
            .mailer
            .send_raw(&proxy_address, &[forward_address.clone()], &message.build()?)
            .await?;

        info!(
            message_id = %envelope.message_id,
            forwarded_id = %forwarded_id,
            from = %proxy_address,
            to = %forward_address,
            "Forwarded message"
        );

        self.correlation
            .put(&ForwardInfo {
                original_message_id: envelope.header_message_id.clone(),
                ses_id: envelope.message_id.clone(),
                forwarded_id,
            })
            .await?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        event::EmailRecord, parse_message, relay::tests::*, BlobStore, ForwardInfo, RelayError,
        StorageError,
    };

    const INBOUND: &str = "From: Peter Sanford <psanford@example.com>\r\n\
To: Sales Team <sales.team@proxy.example.com>\r\n\
Subject: hi\r\n\
Message-ID: <orig@mail.example.com>\r\n\
MIME-Version: 1.0\r\n\
Content-Type: multipart/mixed; boundary=\"outer\"\r\n\
\r\n\
--outer\r\n\
Content-Type: text/plain; charset=\"UTF-8\"\r\n\
\r\n\
Hello there\r\n\
--outer\r\n\
Content-Type: application/pdf; name=\"doc.pdf\"\r\n\
Content-Disposition: attachment; filename=\"doc.pdf\"\r\n\
Content-Transfer-Encoding: base64\r\n\
\r\n\
JVBERi0xLjQK\r\n\
--outer--\r\n";

    fn record() -> EmailRecord {
        inbound(
            "fwd1",
            "Peter Sanford <psanford@example.com>",
            "Sales Team <sales.team@proxy.example.com>",
        )
    }

    #[tokio::test]
    async fn test_forward_to_private() {
        let h = harness("");
        h.store
            .put("email/fwd1", INBOUND.as_bytes().to_vec())
            .await
            .unwrap();

        h.relay.process_record(&record()).await.unwrap();

        let sent = h.mailer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].source, "sales.team@proxy.example.com");
        assert_eq!(
            sent[0].destinations,
            vec!["me+sales_team@private.example.com".to_string()]
        );

        let raw = &sent[0].raw;
        assert_eq!(sent_header(raw, "X-Mailrelay-Id").as_deref(), Some("fwd1"));
        assert_eq!(
            sent_header(raw, "X-Mailrelay-From").as_deref(),
            Some("Peter Sanford <psanford@example.com>")
        );
        assert_eq!(
            sent_header(raw, "X-Mailrelay-Has-Attachments").as_deref(),
            Some("true")
        );
        assert_eq!(
            sent_header(raw, "X-Mailrelay-Has-Other-Attachments").as_deref(),
            Some("false")
        );

        let forwarded = parse_message(raw).unwrap();
        assert!(forwarded.text.as_deref().unwrap().contains("Hello there"));
        assert_eq!(forwarded.attachments.len(), 1);
        assert_eq!(forwarded.attachments[0].content, b"%PDF-1.4\n");
        assert!(forwarded
            .header("From")
            .unwrap()
            .contains("sales.team@proxy.example.com"));
    }

    #[tokio::test]
    async fn test_forward_records_correlation() {
        let h = harness("");
        h.store
            .put("email/fwd1", INBOUND.as_bytes().to_vec())
            .await
            .unwrap();

        h.relay.process_record(&record()).await.unwrap();

        let data = h.store.get("forward/sent-1").await.unwrap();
        let info: ForwardInfo = serde_json::from_slice(&data).unwrap();
        assert_eq!(
            info,
            ForwardInfo {
                original_message_id: "orig@mail.example.com".to_string(),
                ses_id: "fwd1".to_string(),
                forwarded_id: "sent-1".to_string(),
            }
        );
    }

    #[tokio::test]
    async fn test_forward_fails_when_correlation_write_fails() {
        let h = harness("");
        h.store
            .put("email/fwd1", INBOUND.as_bytes().to_vec())
            .await
            .unwrap();
        h.store.set_read_only(true);

        let result = h.relay.process_record(&record()).await;

        assert!(matches!(
            result,
            Err(RelayError::Storage(StorageError::EngineError(_)))
        ));
        assert_eq!(h.mailer.sent().len(), 1);
        assert!(h.store.keys("forward").is_empty());
    }

    #[tokio::test]
    async fn test_forward_without_proxy_recipient() {
        let h = harness("");
        let mut record = record();
        record.ses.receipt.recipients = vec!["someone@elsewhere.com".to_string()];

        let result = h.relay.process_record(&record).await;

        assert!(matches!(result, Err(RelayError::NoProxyRecipient(_))));
        assert!(h.mailer.sent().is_empty());
    }

    #[tokio::test]
    async fn test_forward_picks_first_proxy_recipient() {
        let h = harness("");
        h.store
            .put("email/fwd1", INBOUND.as_bytes().to_vec())
            .await
            .unwrap();
        let mut record = record();
        record.ses.receipt.recipients = vec![
            "other@elsewhere.com".to_string(),
            "First@Proxy.Example.com".to_string(),
            "second@proxy.example.com".to_string(),
        ];

        h.relay.process_record(&record).await.unwrap();

        let sent = h.mailer.sent();
        assert_eq!(sent[0].source, "first@proxy.example.com");
        assert_eq!(
            sent[0].destinations,
            vec!["me+first@private.example.com".to_string()]
        );
    }

    #[tokio::test]
    async fn test_forward_missing_message() {
        let h = harness("");

        let result = h.relay.process_record(&record()).await;

        assert!(matches!(
            result,
            Err(RelayError::Storage(StorageError::NotFound(_)))
        ));
        assert!(h.mailer.sent().is_empty());
        assert!(h.store.keys("forward").is_empty());
    }
}
