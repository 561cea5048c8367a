use tracing::{error, info};

use crate::{EmailRecord, MailAddress, OutgoingMessage};

use super::{Relay, RelayResult};

const OPERATOR_SENDER_NAME: &str = "Mail Relay Error";
const OPERATOR_SUBJECT: &str = "Mail Relay Error";

impl Relay {
    /// Tells the private account why a record was not delivered.
    ///
    /// Best effort, a failure is logged and otherwise ignored.
    pub(super) async fn notify_operator(&self, reason: &str, record: &EmailRecord) {
        if let Err(e) = self.send_operator_message(reason, record).await {
            error!(
                message_id = %record.ses.mail.message_id,
                error = %e,
                "Failed to send operator notification"
            );
        }
    }

    async fn send_operator_message(&self, reason: &str, record: &EmailRecord) -> RelayResult<()> {
        let from = self.config.error_address();
        let to = self.config.private_account.address().to_string();
        let message_id = &record.ses.mail.message_id;

        let payload = serde_json::to_string_pretty(record).unwrap_or_default();
        let body = format!("{reason}\nid: {message_id}\n\n{payload}");

        let raw = OutgoingMessage::new(
            MailAddress::new(Some(OPERATOR_SENDER_NAME.to_string()), from.clone()),
            OPERATOR_SUBJECT,
        )
        .to(MailAddress::new(None, to.clone()))
        .text(body)
        .build()?;

        let id = self.mailer.send_raw(&from, &[to], &raw).await?;
        info!(message_id = %message_id, id = %id, "Sent operator notification");
        Ok(())
    }
}
