use lettre::{
    AsyncFileTransport, AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor,
    message::{Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use std::path::Path;
use tracing::warn;

use crate::config::{Config, SmtpConfig};
use crate::notify::NotifyError;

enum DefaultTransport {
    Smtp(AsyncSmtpTransport<Tokio1Executor>),
    File(AsyncFileTransport<Tokio1Executor>),
}

/// SMTP sender with an optional per-clinic override: clinics that configure
/// their own relay get mail from their own address, everyone else falls back
/// to the server-wide transport. A file transport stands in during
/// development.
pub struct EmailService {
    default: DefaultTransport,
    from_email: String,
    from_name: String,
}

impl EmailService {
    /// None when neither SMTP nor a file spool directory is configured.
    pub fn from_config(cfg: &Config) -> anyhow::Result<Option<Self>> {
        if let Some(smtp) = &cfg.smtp {
            return Ok(Some(EmailService {
                default: DefaultTransport::Smtp(build_smtp(smtp)?),
                from_email: smtp.from_email.clone(),
                from_name: smtp.from_name.clone(),
            }));
        }
        if let Some(dir) = &cfg.email_file_dir {
            let spool = Path::new(dir);
            if !spool.exists() {
                std::fs::create_dir_all(spool)?;
            }
            return Ok(Some(EmailService {
                default: DefaultTransport::File(AsyncFileTransport::new(spool)),
                from_email: "noreply@ptms.local".to_string(),
                from_name: "PTMS".to_string(),
            }));
        }
        Ok(None)
    }

    pub async fn send(
        &self,
        clinic_smtp: Option<&SmtpConfig>,
        to_email: &str,
        subject: &str,
        html_body: &str,
    ) -> Result<(), NotifyError> {
        let (from_email, from_name) = match clinic_smtp {
            Some(c) => (c.from_email.as_str(), c.from_name.as_str()),
            None => (self.from_email.as_str(), self.from_name.as_str()),
        };

        let from = format!("{from_name} <{from_email}>")
            .parse::<Mailbox>()
            .map_err(|e| NotifyError::BadAddress(format!("from: {e}")))?;
        let to = to_email
            .parse::<Mailbox>()
            .map_err(|e| NotifyError::BadAddress(format!("to: {e}")))?;

        let message = Message::builder()
            .from(from)
            .to(to)
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(html_body.to_string())
            .map_err(|e| NotifyError::Smtp(format!("build message: {e}")))?;

        match clinic_smtp {
            Some(c) => {
                let transport = build_smtp(c).map_err(|e| NotifyError::Smtp(e.to_string()))?;
                transport
                    .send(message)
                    .await
                    .map_err(|e| NotifyError::Smtp(e.to_string()))?;
            }
            None => match &self.default {
                DefaultTransport::Smtp(smtp) => {
                    smtp.send(message)
                        .await
                        .map_err(|e| NotifyError::Smtp(e.to_string()))?;
                }
                DefaultTransport::File(file) => {
                    file.send(message)
                        .await
                        .map_err(|e| NotifyError::Smtp(e.to_string()))?;
                }
            },
        }
        Ok(())
    }
}

fn build_smtp(cfg: &SmtpConfig) -> anyhow::Result<AsyncSmtpTransport<Tokio1Executor>> {
    if cfg.port == 25 {
        warn!("SMTP on port 25 without TLS is not recommended outside development");
    }
    Ok(AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&cfg.host)?
        .port(cfg.port)
        .credentials(Credentials::new(cfg.username.clone(), cfg.password.clone()))
        .build())
}

/// Shared appointment-reminder body; plain enough for every mail client.
pub fn appointment_email_body(
    patient_name: &str,
    clinic_name: &str,
    when: &str,
    note: Option<&str>,
) -> String {
    let extra = note
        .map(|n| format!("<p>{n}</p>"))
        .unwrap_or_default();
    format!(
        r#"<!DOCTYPE html>
<html>
<body style="font-family: Arial, sans-serif; color: #333;">
    <p>Dear {patient_name},</p>
    <p>Your physiotherapy appointment at {clinic_name} is scheduled for <strong>{when}</strong>.</p>
    {extra}
    <p style="font-size: 12px; color: #666;">This is an automated message, please do not reply.</p>
</body>
</html>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_contains_the_details() {
        let body = appointment_email_body("Somchai", "CL001 Clinic", "2026-03-01 10:00", Some("Bring your referral."));
        assert!(body.contains("Somchai"));
        assert!(body.contains("CL001 Clinic"));
        assert!(body.contains("2026-03-01 10:00"));
        assert!(body.contains("Bring your referral."));
    }

    #[test]
    fn body_without_note_has_no_empty_paragraph() {
        let body = appointment_email_body("Somchai", "Clinic", "tomorrow", None);
        assert!(!body.contains("<p></p>"));
    }
}
