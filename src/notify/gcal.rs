use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use crate::config::GoogleServiceAccount;
use crate::notify::NotifyError;

const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const SCOPE: &str = "https://www.googleapis.com/auth/calendar";
const EVENTS_BASE: &str = "https://www.googleapis.com/calendar/v3/calendars";
const TIME_ZONE: &str = "Asia/Bangkok";

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    token: String,
    good_until: Instant,
}

#[derive(Debug, Clone)]
pub struct EventInput {
    pub summary: String,
    pub description: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// Google Calendar via a service account: self-signed RS256 JWT exchanged
/// for a bearer token, cached until shortly before expiry.
pub struct CalendarClient {
    http: reqwest::Client,
    sa: GoogleServiceAccount,
    cached: Mutex<Option<CachedToken>>,
}

impl CalendarClient {
    pub fn new(sa: GoogleServiceAccount) -> Self {
        CalendarClient {
            http: reqwest::Client::new(),
            sa,
            cached: Mutex::new(None),
        }
    }

    pub async fn insert_event(&self, ev: &EventInput) -> Result<String, NotifyError> {
        let token = self.access_token().await?;
        let res = self
            .http
            .post(self.events_url(""))
            .bearer_auth(&token)
            .json(&event_json(ev))
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            return Err(NotifyError::Calendar(status, res.text().await.unwrap_or_default()));
        }

        #[derive(Deserialize)]
        struct Created {
            id: String,
        }
        let created: Created = res.json().await?;
        Ok(created.id)
    }

    pub async fn patch_event(&self, event_id: &str, ev: &EventInput) -> Result<(), NotifyError> {
        let token = self.access_token().await?;
        let res = self
            .http
            .patch(self.events_url(&format!("/{event_id}")))
            .bearer_auth(&token)
            .json(&event_json(ev))
            .send()
            .await?;

        if res.status().is_success() {
            Ok(())
        } else {
            let status = res.status().as_u16();
            Err(NotifyError::Calendar(status, res.text().await.unwrap_or_default()))
        }
    }

    pub async fn delete_event(&self, event_id: &str) -> Result<(), NotifyError> {
        let token = self.access_token().await?;
        let res = self
            .http
            .delete(self.events_url(&format!("/{event_id}")))
            .bearer_auth(&token)
            .send()
            .await?;

        // Already-deleted events are fine.
        if res.status().is_success() || res.status().as_u16() == 404 || res.status().as_u16() == 410 {
            Ok(())
        } else {
            let status = res.status().as_u16();
            Err(NotifyError::Calendar(status, res.text().await.unwrap_or_default()))
        }
    }

    fn events_url(&self, suffix: &str) -> String {
        format!("{EVENTS_BASE}/{}/events{suffix}", self.sa.calendar_id)
    }

    async fn access_token(&self) -> Result<String, NotifyError> {
        let mut cached = self.cached.lock().await;
        if let Some(c) = cached.as_ref() {
            if c.good_until > Instant::now() {
                return Ok(c.token.clone());
            }
        }

        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &self.sa.client_email,
            scope: SCOPE,
            aud: TOKEN_URL,
            iat: now,
            exp: now + 3600,
        };
        let key = EncodingKey::from_rsa_pem(self.sa.private_key_pem.as_bytes())
            .map_err(|e| NotifyError::GoogleAuth(format!("bad service-account key: {e}")))?;
        let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|e| NotifyError::GoogleAuth(format!("jwt sign: {e}")))?;

        let res = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await?;

        if !res.status().is_success() {
            let status = res.status().as_u16();
            return Err(NotifyError::GoogleAuth(format!(
                "token exchange returned {status}: {}",
                res.text().await.unwrap_or_default()
            )));
        }

        let token: TokenResponse = res.json().await?;
        // Refresh a minute early.
        let good_until = Instant::now() + Duration::from_secs(token.expires_in.saturating_sub(60));
        *cached = Some(CachedToken {
            token: token.access_token.clone(),
            good_until,
        });
        Ok(token.access_token)
    }
}

fn event_json(ev: &EventInput) -> serde_json::Value {
    json!({
        "summary": ev.summary,
        "description": ev.description,
        "start": { "dateTime": ev.start.to_rfc3339(), "timeZone": TIME_ZONE },
        "end": { "dateTime": ev.end.to_rfc3339(), "timeZone": TIME_ZONE },
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_carries_timezone() {
        let ev = EventInput {
            summary: "PT session".into(),
            description: None,
            start: Utc::now(),
            end: Utc::now(),
        };
        let v = event_json(&ev);
        assert_eq!(v["start"]["timeZone"], TIME_ZONE);
        assert_eq!(v["summary"], "PT session");
    }
}
