//! Manual delivery of messages the private account queued for sending.
//!
//! Messages written to the outbound address are copied to the outbox by
//! the relay. From there an operator lists them, reviews them and sends
//! them to their final recipients, at which point the sent copy is archived
//! and the outbox entry removed.

use std::sync::Arc;

use tracing::info;

use crate::{
    blob_key, parse_address, parse_message, BlobEntry, BlobStore, BucketConfig, MailAddress,
    Mailer, OutgoingMessage, RelayResult,
};

/// Addresses a queued message is sent with.
#[derive(Debug, Clone, Default)]
pub struct SendRequest {
    pub id: String,
    pub from: String,
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub bcc: Vec<String>,
}

pub struct Outbox {
    store: Arc<dyn BlobStore>,
    mailer: Arc<dyn Mailer>,
    bucket: BucketConfig,
}

impl Outbox {
    pub fn new(store: Arc<dyn BlobStore>, mailer: Arc<dyn Mailer>, bucket: BucketConfig) -> Self {
        Self {
            store,
            mailer,
            bucket,
        }
    }

    /// Lists the pending entries, keys reduced to their message id.
    pub async fn list(&self) -> RelayResult<Vec<BlobEntry>> {
        let entries = self.store.list(&self.bucket.outbox_prefix).await?;
        Ok(entries
            .into_iter()
            .map(|entry| BlobEntry {
                key: entry
                    .key
                    .rsplit_once('/')
                    .map(|(_, id)| id.to_string())
                    .unwrap_or(entry.key),
                last_modified: entry.last_modified,
            })
            .collect())
    }

    /// Returns the stored raw message `id`.
    pub async fn get(&self, id: &str) -> RelayResult<Vec<u8>> {
        Ok(self.store.get(&blob_key(&self.bucket.msg_prefix, id)).await?)
    }

    /// Rebuilds the stored message with the requested addresses, sends it,
    /// archives the sent copy and removes the outbox entry. Returns the
    /// send id.
    pub async fn send(&self, request: &SendRequest) -> RelayResult<String> {
        let parsed = parse_message(&self.get(&request.id).await?)?;
        let from = parse_address(&request.from)?;

        let mut message =
            OutgoingMessage::new(from.clone(), parsed.subject.as_deref().unwrap_or_default())
                .with_content_of(&parsed);
        for to in &request.to {
            message = message.to(MailAddress::new(None, to.clone()));
        }
        for cc in &request.cc {
            message = message.cc(MailAddress::new(None, cc.clone()));
        }
        for bcc in &request.bcc {
            message = message.bcc(MailAddress::new(None, bcc.clone()));
        }
        let destinations: Vec<String> = request
            .to
            .iter()
            .chain(&request.cc)
            .chain(&request.bcc)
            .cloned()
            .collect();
        let raw = message.build()?;

        info!(
            id = %request.id,
            from = %from.address,
            to = ?request.to,
            cc = ?request.cc,
            bcc = ?request.bcc,
            "Sending queued message"
        );
        let sent_id = self
            .mailer
            .send_raw(&from.address, &destinations, &raw)
            .await?;

        let sent_key = blob_key(&self.bucket.sent_prefix, &sent_id);
        self.store.put(&sent_key, raw).await?;
        self.store
            .delete(&blob_key(&self.bucket.outbox_prefix, &request.id))
            .await?;
        info!(id = %request.id, sent_id = %sent_id, key = %sent_key, "Sent queued message");

        Ok(sent_id)
    }
}
