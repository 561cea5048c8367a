//! Inbound event model as delivered by the mail-receiving platform.
//!
//! The shape follows the SES receipt notification: a batch of `Records`,
//! each holding the `mail` block (identifiers and common headers) and the
//! `receipt` block (recipients and verdicts). Unknown fields are ignored
//! and missing ones default, so partial payloads still deserialize.

use serde::{Deserialize, Serialize};

/// A batch of inbound records processed by a single invocation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EmailEvent {
    #[serde(rename = "Records", default)]
    pub records: Vec<EmailRecord>,
}

impl EmailEvent {
    /// Parses an event from its JSON representation.
    pub fn from_json(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailRecord {
    #[serde(default)]
    pub event_source: String,
    #[serde(default)]
    pub event_version: String,
    pub ses: SesRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SesRecord {
    pub mail: MailBlock,
    pub receipt: ReceiptBlock,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailBlock {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub source: String,
    pub message_id: String,
    #[serde(default)]
    pub destination: Vec<String>,
    #[serde(default)]
    pub headers_truncated: bool,
    #[serde(default)]
    pub headers: Vec<RawHeader>,
    #[serde(default)]
    pub common_headers: CommonHeaders,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawHeader {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonHeaders {
    #[serde(default)]
    pub return_path: String,
    #[serde(default)]
    pub from: Vec<String>,
    #[serde(default)]
    pub date: String,
    #[serde(default)]
    pub to: Vec<String>,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub subject: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiptBlock {
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub processing_time_millis: u64,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub spam_verdict: Verdict,
    #[serde(default)]
    pub virus_verdict: Verdict,
    #[serde(default)]
    pub spf_verdict: Verdict,
    #[serde(default)]
    pub dkim_verdict: Verdict,
    #[serde(default)]
    pub dmarc_verdict: Verdict,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<serde_json::Value>,
}

/// A single platform verdict, `PASS` or anything else.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    #[serde(default)]
    pub status: String,
}

impl Verdict {
    pub const PASS: &'static str = "PASS";

    pub fn new(status: &str) -> Self {
        Self {
            status: status.to_string(),
        }
    }

    pub fn pass() -> Self {
        Self::new(Self::PASS)
    }

    /// Anything other than the literal `PASS` counts as failed.
    pub fn passed(&self) -> bool {
        self.status == Self::PASS
    }
}

impl EmailRecord {
    /// Builds a record for a message already stored on the platform, as
    /// used when re-running the relay by hand. All verdicts are `PASS`.
    pub fn synthetic(
        message_id: &str,
        subject: &str,
        from: &str,
        to: &str,
        header_message_id: &str,
    ) -> Self {
        Self {
            event_source: "mailrelay:replay".to_string(),
            event_version: "1.0".to_string(),
            ses: SesRecord {
                mail: MailBlock {
                    message_id: message_id.to_string(),
                    common_headers: CommonHeaders {
                        subject: subject.to_string(),
                        from: vec![from.to_string()],
                        to: vec![to.to_string()],
                        message_id: header_message_id.to_string(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                receipt: ReceiptBlock {
                    recipients: vec![to.to_string()],
                    spam_verdict: Verdict::pass(),
                    virus_verdict: Verdict::pass(),
                    spf_verdict: Verdict::pass(),
                    dkim_verdict: Verdict::pass(),
                    dmarc_verdict: Verdict::pass(),
                    ..Default::default()
                },
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EVENT: &str = r#"{
  "Records": [
    {
      "eventSource": "aws:ses",
      "eventVersion": "1.0",
      "ses": {
        "mail": {
          "timestamp": "2019-03-02T22:38:23.533Z",
          "source": "psanford@example.com",
          "messageId": "8ffg1s10miueo0o4qhb37ss9ilq26akqpo7pr8o1",
          "destination": ["test@my-ses-email-domain.example.com"],
          "headersTruncated": false,
          "headers": [{"name": "Subject", "value": "hi"}],
          "commonHeaders": {
            "returnPath": "psanford@example.com",
            "from": ["Peter Sanford <psanford@example.com>"],
            "date": "Sat, 2 Mar 2019 14:38:12 -0800",
            "to": ["test@my-ses-email-domain.example.com"],
            "messageId": "<5B762F46B550CE2BAB51989E4F9F1280@mail.gmail.com>",
            "subject": "hi"
          }
        },
        "receipt": {
          "timestamp": "2019-03-02T22:38:23.533Z",
          "processingTimeMillis": 412,
          "recipients": ["test@my-ses-email-domain.example.com"],
          "spamVerdict": {"status": "PASS"},
          "virusVerdict": {"status": "PASS"},
          "spfVerdict": {"status": "PASS"},
          "dkimVerdict": {"status": "GRAY"},
          "dmarcVerdict": {"status": "PASS"},
          "action": {"type": "Lambda", "invocationType": "Event"}
        }
      }
    }
  ]
}"#;

    #[test]
    fn test_parse_event() {
        let event = EmailEvent::from_json(EVENT.as_bytes()).unwrap();
        assert_eq!(event.records.len(), 1);
        let mail = &event.records[0].ses.mail;
        assert_eq!(mail.message_id, "8ffg1s10miueo0o4qhb37ss9ilq26akqpo7pr8o1");
        assert_eq!(
            mail.common_headers.from,
            vec!["Peter Sanford <psanford@example.com>".to_string()]
        );
        let receipt = &event.records[0].ses.receipt;
        assert!(receipt.spf_verdict.passed());
        assert!(!receipt.dkim_verdict.passed());
        assert!(receipt.action.is_some());
    }

    #[test]
    fn test_parse_partial_event() {
        let event = EmailEvent::from_json(
            br#"{"Records":[{"ses":{"mail":{"messageId":"abc"},"receipt":{}}}]}"#,
        )
        .unwrap();
        let record = &event.records[0];
        assert_eq!(record.ses.mail.message_id, "abc");
        assert!(!record.ses.receipt.virus_verdict.passed());
        assert!(record.ses.mail.common_headers.to.is_empty());
    }

    #[test]
    fn test_synthetic_record_passes() {
        let record = EmailRecord::synthetic("id", "Subject", "a@b.com", "c@d.com", "<x@y>");
        let receipt = &record.ses.receipt;
        assert!(receipt.dkim_verdict.passed());
        assert!(receipt.spf_verdict.passed());
        assert!(receipt.virus_verdict.passed());
        assert_eq!(receipt.recipients, vec!["c@d.com".to_string()]);
    }
}
