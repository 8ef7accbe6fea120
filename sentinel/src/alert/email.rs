//! Direct email alerts over SMTPS.

use crate::alert::{AlertDispatcher, AlertPayload};
use crate::config::{EmailConfig, IncidentContext};
use crate::error::{Result, SentinelError};
use lettre::message::header::ContentType;
use lettre::message::{Attachment, Mailbox, MultiPart, SinglePart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{Message, SmtpTransport, Transport};
use tracing::info;

pub struct EmailDispatcher {
    transport: SmtpTransport,
    from: Mailbox,
    to: Mailbox,
    context: IncidentContext,
}

impl EmailDispatcher {
    /// Builds the dispatcher. No connection is made until the first alert.
    pub fn new(config: &EmailConfig, context: IncidentContext) -> Result<Self> {
        let from: Mailbox = config
            .sender
            .parse()
            .map_err(|e| SentinelError::Config(format!("Invalid sender address '{}': {}", config.sender, e)))?;
        let to: Mailbox = config
            .recipient
            .parse()
            .map_err(|e| SentinelError::Config(format!("Invalid recipient address '{}': {}", config.recipient, e)))?;

        let transport = SmtpTransport::relay(&config.smtp_host)
            .map_err(|e| SentinelError::Config(format!("Invalid SMTP host '{}': {}", config.smtp_host, e)))?
            .port(config.smtp_port)
            .credentials(Credentials::new(config.sender.clone(), config.password.clone()))
            .build();

        Ok(Self {
            transport,
            from,
            to,
            context,
        })
    }

    pub fn subject(alert: &AlertPayload) -> String {
        format!("URGENT PPE VIOLATION: {}", alert.description)
    }

    pub fn attachment_name(alert: &AlertPayload) -> String {
        format!("violation_{}.jpg", alert.incident_id.short())
    }

    pub fn body(&self, alert: &AlertPayload) -> String {
        format!(
            "Safety Violation Detected by Vision Agent (ID: {id})\n\
             --------------------------------------------------\n\
             Person ID: {person}\n\
             Location: {location}\n\
             Missing PPE: {missing}\n\
             Timestamp: {ts}\n\
             \n\
             Action Required: Immediate intervention.\n\
             Evidence image attached below.\n",
            id = alert.incident_id.short(),
            person = self.context.person_id,
            location = self.context.location,
            missing = alert.description,
            ts = alert.raised_at.format("%Y-%m-%d %H:%M:%S"),
        )
    }

    /// Builds the message with the evidence frame attached.
    pub fn compose(&self, alert: &AlertPayload) -> Result<Message> {
        let image = alert
            .frame_jpeg
            .as_ref()
            .ok_or_else(|| SentinelError::Alert("No evidence image available".to_string()))?;

        let jpeg = ContentType::parse("image/jpeg")
            .map_err(|e| SentinelError::Alert(format!("Invalid content type: {}", e)))?;

        Message::builder()
            .from(self.from.clone())
            .to(self.to.clone())
            .subject(Self::subject(alert))
            .multipart(
                MultiPart::mixed()
                    .singlepart(SinglePart::plain(self.body(alert)))
                    .singlepart(Attachment::new(Self::attachment_name(alert)).body(image.clone(), jpeg)),
            )
            .map_err(|e| SentinelError::Alert(format!("Failed to build email: {}", e)))
    }
}

impl AlertDispatcher for EmailDispatcher {
    fn name(&self) -> &str {
        "email"
    }

    fn dispatch(&self, alert: &AlertPayload) -> Result<()> {
        let message = self.compose(alert)?;
        self.transport
            .send(&message)
            .map_err(|e| SentinelError::Alert(format!("SMTP delivery failed: {}", e)))?;
        info!(incident = alert.incident_id.short(), to = %self.to, "Email alert sent");
        Ok(())
    }
}
