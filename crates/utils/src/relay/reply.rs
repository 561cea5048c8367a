use tracing::info;

use crate::{parse_message, trim_brackets, Envelope, MailAddress, OutgoingMessage};

use super::{Relay, RelayError, RelayResult};

impl Relay {
    /// Relays a reply of the private account back to the third party.
    ///
    /// The reply points at a forwarded copy through `In-Reply-To`. The
    /// copy's forward record leads to the original inbound message, whose
    /// `Reply-To` (or `From`) becomes the recipient. The reply is sent as
    /// the proxy address, so the private address never leaks.
    pub(super) async fn reply_relay(&self, envelope: &Envelope) -> RelayResult<()> {
        let proxy_address = self.proxy_recipient(envelope)?;

        let raw = self.fetch_message(&envelope.message_id).await?;
        let reply = parse_message(&raw)?;

        let in_reply_to = reply.header("In-Reply-To").unwrap_or_default();
        let in_reply_to = trim_brackets(&in_reply_to);
        if in_reply_to.is_empty() {
            return Err(RelayError::MissingInReplyTo(envelope.message_id.clone()));
        }

        let forwarded_id = in_reply_to
            .strip_suffix(self.config.reply_id_suffix.as_str())
            .unwrap_or(in_reply_to);
        let forward_info = self.correlation.get(forwarded_id).await.map_err(|error| {
            RelayError::UnknownCorrelation {
                forwarded_id: forwarded_id.to_string(),
                error,
            }
        })?;

        let original = parse_message(&self.fetch_message(&forward_info.ses_id).await?)?;
        let target = original
            .correspondent()
            .cloned()
            .ok_or_else(|| RelayError::NoCorrespondent(forward_info.ses_id.clone()))?;

        let thread_id = if forward_info.original_message_id.is_empty() {
            format!("<{in_reply_to}>")
        } else {
            format!("<{}>", forward_info.original_message_id)
        };

        let message = OutgoingMessage::new(
            MailAddress::new(envelope.from_name(), proxy_address.clone()),
            &envelope.subject,
        )
        .to(target.clone())
        .with_content_of(&reply)
        .in_reply_to(thread_id);

        let id = self
            .mailer
            .send_raw(&proxy_address, &[target.address.clone()], &message.build()?)
            .await?;

        info!(
            message_id = %envelope.message_id,
            id = %id,
            in_reply_to = %in_reply_to,
            to = %target.address,
            from = %proxy_address,
            "Replied to message"
        );

        Ok(())
    }
}
