pub mod email;
pub mod gcal;
pub mod line;

use sqlx::PgPool;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::config::{Config, SmtpConfig};
use email::EmailService;
use gcal::CalendarClient;
use line::LineClient;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("smtp: {0}")]
    Smtp(String),
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("line api returned {0}: {1}")]
    Line(u16, String),
    #[error("google auth: {0}")]
    GoogleAuth(String),
    #[error("google calendar returned {0}: {1}")]
    Calendar(u16, String),
    #[error("channel not configured")]
    NotConfigured,
    #[error("bad address: {0}")]
    BadAddress(String),
}

// notification_log.channel
pub const CHANNEL_EMAIL: i16 = 0;
pub const CHANNEL_LINE: i16 = 1;
pub const CHANNEL_CALENDAR: i16 = 2;

// notification_log.status
pub const NOTIFY_SENT: i16 = 0;
pub const NOTIFY_FAILED: i16 = 1;

pub fn channel_to_string(channel: i16) -> String {
    match channel {
        CHANNEL_EMAIL => "EMAIL",
        CHANNEL_LINE => "LINE",
        CHANNEL_CALENDAR => "CALENDAR",
        _ => "UNKNOWN",
    }
    .to_string()
}

/// Contact points a dispatch fans out to. Channels without an address are
/// skipped silently.
#[derive(Debug, Clone)]
pub struct PatientContact {
    pub patient_id: Uuid,
    pub email: Option<String>,
    pub line_user_id: Option<String>,
}

/// Facade over the configured outbound channels. All sends are best-effort:
/// the caller has already committed its transaction and only wants the
/// attempt recorded.
pub struct Notifier {
    email: Option<EmailService>,
    line: Option<LineClient>,
    gcal: Option<CalendarClient>,
}

impl Notifier {
    pub fn from_config(cfg: &Config) -> anyhow::Result<Self> {
        let email = EmailService::from_config(cfg)?;
        let line = cfg
            .line_channel_token
            .as_ref()
            .map(|token| LineClient::new(token.clone()));
        let gcal = cfg.google_sa.as_ref().map(|sa| CalendarClient::new(sa.clone()));
        Ok(Notifier { email, line, gcal })
    }

    pub fn calendar(&self) -> Option<&CalendarClient> {
        self.gcal.as_ref()
    }

    /// Send one message to every contact point the patient has, recording
    /// each attempt in notification_log. Never fails the caller. Email gets
    /// the HTML body, LINE gets the plain-text one.
    pub async fn dispatch_patient(
        &self,
        db: &PgPool,
        clinic_id: Uuid,
        smtp_override: Option<&SmtpConfig>,
        contact: &PatientContact,
        subject: &str,
        html_body: &str,
        line_text: &str,
    ) {
        if let Some(to) = contact.email.as_deref() {
            let result = match &self.email {
                Some(svc) => svc.send(smtp_override, to, subject, html_body).await,
                None => Err(NotifyError::NotConfigured),
            };
            self.log(db, clinic_id, contact.patient_id, CHANNEL_EMAIL, &result)
                .await;
        }

        if let Some(to) = contact.line_user_id.as_deref() {
            let result = match &self.line {
                Some(client) => client.push_text(to, &format!("{subject}\n{line_text}")).await,
                None => Err(NotifyError::NotConfigured),
            };
            self.log(db, clinic_id, contact.patient_id, CHANNEL_LINE, &result)
                .await;
        }
    }

    pub async fn log_calendar(
        &self,
        db: &PgPool,
        clinic_id: Uuid,
        patient_id: Uuid,
        result: &Result<(), NotifyError>,
    ) {
        self.log(db, clinic_id, patient_id, CHANNEL_CALENDAR, result)
            .await;
    }

    async fn log<T>(
        &self,
        db: &PgPool,
        clinic_id: Uuid,
        patient_id: Uuid,
        channel: i16,
        result: &Result<T, NotifyError>,
    ) {
        let (status, detail) = match result {
            Ok(_) => (NOTIFY_SENT, None),
            Err(NotifyError::NotConfigured) => {
                // Address present but channel off: worth a trace, not a row.
                warn!(
                    "{} notification skipped, channel not configured",
                    channel_to_string(channel)
                );
                return;
            }
            Err(e) => {
                warn!("{} notification failed: {e}", channel_to_string(channel));
                (NOTIFY_FAILED, Some(e.to_string()))
            }
        };

        let _ = sqlx::query(
            r#"
            INSERT INTO notification_log (clinic_id, patient_id, channel, status, detail)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(clinic_id)
        .bind(patient_id)
        .bind(channel)
        .bind(status)
        .bind(detail)
        .execute(db)
        .await;
    }
}
