//! Outgoing notifications.

use crate::config::MailConfig;
use crate::error::Result;

/// Account activation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationMail {
    /// Recipient address.
    pub to: String,
    /// Recipient display name.
    pub full_name: String,
    /// Link to the activation page.
    pub activation_url: String,
    /// One-time activation code.
    pub code: String,
    /// Subject line.
    pub subject: String,
}

/// Delivery of account notifications.
pub trait Mailer: Send + Sync {
    /// Deliver an activation code.
    fn send_activation(&self, mail: &ActivationMail) -> Result<()>;
}

/// Mailer that writes messages to the log instead of an SMTP relay.
pub struct LogMailer {
    from: String,
}

impl LogMailer {
    /// Create a log mailer.
    pub fn new(config: &MailConfig) -> Self {
        Self {
            from: config.from.clone(),
        }
    }
}

impl Mailer for LogMailer {
    fn send_activation(&self, mail: &ActivationMail) -> Result<()> {
        tracing::info!(
            from = %self.from,
            to = %mail.to,
            subject = %mail.subject,
            url = %mail.activation_url,
            code = %mail.code,
            "Activation mail"
        );
        Ok(())
    }
}
