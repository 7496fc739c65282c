use std::env;

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub session_ttl_hours: i64,
    /// Clinic code whose initial-assessment appointments require a body
    /// annotation before completion (the flagship clinic flow).
    pub initial_assessment_clinic: String,
    pub smtp: Option<SmtpConfig>,
    /// When set and SMTP is absent, outgoing mail is written to this
    /// directory instead (development transport).
    pub email_file_dir: Option<String>,
    pub line_channel_token: Option<String>,
    pub google_sa: Option<GoogleServiceAccount>,
    pub google_oauth: Option<GoogleOAuthConfig>,
}

#[derive(Clone, Debug)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub from_email: String,
    pub from_name: String,
}

#[derive(Clone, Debug)]
pub struct GoogleServiceAccount {
    pub client_email: String,
    pub private_key_pem: String,
    pub calendar_id: String,
}

#[derive(Clone, Debug)]
pub struct GoogleOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_uri: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let database_url = env::var("DATABASE_URL")?;
        let bind_addr = env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
        let session_ttl_hours = env::var("SESSION_TTL_HOURS")
            .ok()
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or(24);
        let initial_assessment_clinic =
            env::var("INITIAL_ASSESSMENT_CLINIC").unwrap_or_else(|_| "CL001".to_string());

        let smtp = match (
            env::var("SMTP_HOST"),
            env::var("SMTP_USERNAME"),
            env::var("SMTP_PASSWORD"),
        ) {
            (Ok(host), Ok(username), Ok(password)) => Some(SmtpConfig {
                host,
                port: env::var("SMTP_PORT")
                    .ok()
                    .and_then(|s| s.parse::<u16>().ok())
                    .unwrap_or(587),
                username,
                password,
                from_email: env::var("SMTP_FROM_EMAIL")
                    .unwrap_or_else(|_| "noreply@ptms.local".to_string()),
                from_name: env::var("SMTP_FROM_NAME").unwrap_or_else(|_| "PTMS".to_string()),
            }),
            _ => None,
        };

        let email_file_dir = env::var("EMAIL_FILE_DIR").ok();

        let line_channel_token = env::var("LINE_CHANNEL_TOKEN").ok();

        let google_sa = match (env::var("GOOGLE_SA_EMAIL"), env::var("GOOGLE_SA_PRIVATE_KEY")) {
            (Ok(client_email), Ok(private_key_pem)) => Some(GoogleServiceAccount {
                client_email,
                // .env files carry the PEM with literal \n escapes
                private_key_pem: private_key_pem.replace("\\n", "\n"),
                calendar_id: env::var("GOOGLE_CALENDAR_ID")
                    .unwrap_or_else(|_| "primary".to_string()),
            }),
            _ => None,
        };

        let google_oauth = match (
            env::var("GOOGLE_OAUTH_CLIENT_ID"),
            env::var("GOOGLE_OAUTH_CLIENT_SECRET"),
            env::var("GOOGLE_OAUTH_REDIRECT_URI"),
        ) {
            (Ok(client_id), Ok(client_secret), Ok(redirect_uri)) => Some(GoogleOAuthConfig {
                client_id,
                client_secret,
                redirect_uri,
            }),
            _ => None,
        };

        Ok(Self {
            database_url,
            bind_addr,
            session_ttl_hours,
            initial_assessment_clinic,
            smtp,
            email_file_dir,
            line_channel_token,
            google_sa,
            google_oauth,
        })
    }
}
